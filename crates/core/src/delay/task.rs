//! Task owning one direction's scheduler.
//!
//! All queue mutation and drain steps for a direction run on this task. Other
//! tasks hand packets over through [`SchedulerHandle`], which only pushes onto
//! an unbounded channel and therefore never blocks or awaits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::time::TimeSource;

use super::errors::{DelayError, SinkError};
use super::scheduler::{
    Accepted, Completion, DelayScheduler, Direction, DrainOutcome, PacketKind, PacketSink,
    SchedulerStatus,
};

pub(crate) enum SchedulerCommand<P> {
    Accept {
        packet: P,
        kind: PacketKind,
        completion: Option<Completion>,
    },
    /// Release everything queued now. Replies with the number of packets
    /// flushed.
    Deactivate { done: Option<oneshot::Sender<usize>> },
    Shutdown,
}

type Timer = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cloneable handle to a running scheduler task.
pub struct SchedulerHandle<P> {
    direction: Direction,
    commands: mpsc::UnboundedSender<SchedulerCommand<P>>,
    status: Arc<SchedulerStatus>,
}

impl<P> Clone for SchedulerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            direction: self.direction,
            commands: self.commands.clone(),
            status: self.status.clone(),
        }
    }
}

impl<P: Send + 'static> SchedulerHandle<P> {
    /// Spawns the task driving `scheduler` on the current tokio runtime.
    ///
    /// The task exits after a [`shutdown`](Self::shutdown) or once every
    /// handle is dropped, flushing whatever is still queued.
    pub fn spawn<S, T>(scheduler: DelayScheduler<S, T>) -> (Self, JoinHandle<()>)
    where
        S: PacketSink<Packet = P>,
        T: TimeSource,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            direction: scheduler.direction(),
            commands,
            status: scheduler.status(),
        };
        let task = tokio::spawn(run_scheduler(scheduler, rx));
        (handle, task)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> &SchedulerStatus {
        &self.status
    }

    /// Hands a packet to the scheduler.
    pub fn accept(&self, packet: P, kind: PacketKind) -> Result<(), DelayError> {
        self.send(SchedulerCommand::Accept {
            packet,
            kind,
            completion: None,
        })
    }

    /// Like [`accept`](Self::accept), returning a receiver resolved with the
    /// sink's result once the packet is released.
    pub fn accept_with_completion(
        &self,
        packet: P,
        kind: PacketKind,
    ) -> Result<oneshot::Receiver<Result<(), SinkError>>, DelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Accept {
            packet,
            kind,
            completion: Some(tx),
        })?;
        Ok(rx)
    }

    /// Requests an immediate flush without waiting for it.
    pub fn deactivate(&self) -> Result<(), DelayError> {
        self.send(SchedulerCommand::Deactivate { done: None })
    }

    /// Flushes the queue and waits until every packet has been released.
    pub async fn flush(&self) -> Result<usize, DelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerCommand::Deactivate { done: Some(tx) })?;
        rx.await.map_err(|_| DelayError::EngineClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SchedulerCommand::Shutdown);
    }

    fn send(&self, command: SchedulerCommand<P>) -> Result<(), DelayError> {
        self.commands
            .send(command)
            .map_err(|_| DelayError::EngineClosed)
    }
}

async fn run_scheduler<S, T>(
    mut scheduler: DelayScheduler<S, T>,
    mut commands: mpsc::UnboundedReceiver<SchedulerCommand<S::Packet>>,
) where
    S: PacketSink,
    T: TimeSource,
{
    let direction = scheduler.direction();
    let mut timer: Option<Timer> = None;
    tracing::debug!(%direction, "Delay scheduler started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SchedulerCommand::Accept { packet, kind, completion }) => {
                    let accepted = scheduler.accept(packet, kind, completion);
                    // An armed timer already covers the head; a new tail entry
                    // cannot be released before it.
                    if matches!(accepted, Accepted::Queued { .. }) && timer.is_none() {
                        timer = step(&mut scheduler);
                    }
                }
                Some(SchedulerCommand::Deactivate { done }) => {
                    timer = None;
                    let flushed = scheduler.flush();
                    if let Some(done) = done {
                        let _ = done.send(flushed);
                    }
                }
                Some(SchedulerCommand::Shutdown) | None => break,
            },
            () = wait_timer(&mut timer), if timer.is_some() => {
                timer = step(&mut scheduler);
            }
        }
    }

    let flushed = scheduler.flush();
    tracing::debug!(%direction, flushed, "Delay scheduler stopped");
}

fn step<S: PacketSink, T: TimeSource>(scheduler: &mut DelayScheduler<S, T>) -> Option<Timer> {
    match scheduler.drain() {
        DrainOutcome::Rearm { wake_at_nanos } => {
            Some(scheduler.time_source().sleep_until(wake_at_nanos))
        }
        DrainOutcome::Idle | DrainOutcome::AlreadyDraining => None,
    }
}

async fn wait_timer(timer: &mut Option<Timer>) {
    match timer.as_mut() {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}
