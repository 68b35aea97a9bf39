//! Time abstraction for the delay engine.
//!
//! This module provides:
//! - `TimeSource` trait for abstracting the monotonic clock, timers and the
//!   bounded busy-wait used by the drain loop
//! - `RealTime` implementation delegating to tokio
//! - `VirtualTime` implementation for deterministic tests and simulations

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use parking_lot::Mutex;

pub(crate) const NANOS_PER_MILLI: u64 = 1_000_000;

/// Abstraction over time operations supporting both real and virtual time.
///
/// All instants are expressed as nanoseconds since an arbitrary, per-source
/// epoch. Only differences between instants of the same source are meaningful.
pub trait TimeSource: Send + Sync + Clone + 'static {
    /// Returns the current time as nanoseconds since the source's epoch.
    fn now_nanos(&self) -> u64;

    /// Returns the current time in whole milliseconds since the source's epoch.
    fn now_millis(&self) -> u64 {
        self.now_nanos() / NANOS_PER_MILLI
    }

    /// Creates a future that completes when the deadline is reached, or
    /// immediately if the deadline has already passed.
    fn sleep_until(&self, deadline_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Busy-waits until the deadline.
    ///
    /// Callers must only use this for waits no longer than the drain
    /// precision window; it blocks the calling thread.
    fn spin_until(&self, deadline_nanos: u64);
}

/// Real-time implementation that delegates to tokio.
#[derive(Clone)]
pub struct RealTime {
    epoch: std::time::Instant,
}

impl Default for RealTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl TimeSource for RealTime {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep_until(&self, deadline_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let now = self.now_nanos();
        if deadline_nanos <= now {
            Box::pin(std::future::ready(()))
        } else {
            let duration = Duration::from_nanos(deadline_nanos - now);
            Box::pin(tokio::time::sleep(duration))
        }
    }

    fn spin_until(&self, deadline_nanos: u64) {
        while self.now_nanos() < deadline_nanos {
            std::hint::spin_loop();
        }
    }
}

/// Internal state for virtual time, shared across clones.
#[derive(Debug, Default)]
struct VirtualTimeState {
    /// Current virtual time in nanoseconds
    current_nanos: AtomicU64,
    /// Sleepers waiting for a deadline, woken by `advance_to`
    sleepers: Mutex<Vec<Sleeper>>,
    /// Source of sleeper ids
    next_sleeper: AtomicU64,
}

#[derive(Debug)]
struct Sleeper {
    id: u64,
    deadline_nanos: u64,
    waker: Waker,
}

/// Virtual time implementation for deterministic testing.
///
/// Time only advances when explicitly stepped via `advance()` or
/// `advance_to()`. A busy-wait (`spin_until`) advances the clock to its
/// deadline, the same way a real spin would consume wall-clock time.
#[derive(Clone, Default)]
pub struct VirtualTime {
    state: Arc<VirtualTimeState>,
}

impl VirtualTime {
    /// Creates a new virtual time starting at 0.
    pub fn new() -> Self {
        Self::with_initial_time(0)
    }

    /// Creates a new virtual time starting at the given nanoseconds.
    pub fn with_initial_time(initial_nanos: u64) -> Self {
        Self {
            state: Arc::new(VirtualTimeState {
                current_nanos: AtomicU64::new(initial_nanos),
                sleepers: Mutex::new(Vec::new()),
                next_sleeper: AtomicU64::new(0),
            }),
        }
    }

    /// Advances time by the given duration, waking all expired sleepers.
    pub fn advance(&self, duration: Duration) {
        let target = self
            .now_nanos()
            .saturating_add(duration.as_nanos() as u64);
        self.advance_to(target);
    }

    /// Advances time to the given absolute nanoseconds, waking all expired
    /// sleepers. Moving backwards is a no-op.
    pub fn advance_to(&self, target_nanos: u64) {
        let previous = self
            .state
            .current_nanos
            .fetch_max(target_nanos, Ordering::SeqCst);
        if target_nanos <= previous {
            return;
        }

        let expired: Vec<Waker> = {
            let mut sleepers = self.state.sleepers.lock();
            let mut expired = Vec::new();
            sleepers.retain(|sleeper| {
                if sleeper.deadline_nanos <= target_nanos {
                    expired.push(sleeper.waker.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };

        // Wake outside the lock
        for waker in expired {
            waker.wake();
        }
    }

    /// Returns the number of sleepers that have registered a waker and are
    /// still waiting.
    pub fn pending_sleepers(&self) -> usize {
        self.state.sleepers.lock().len()
    }
}

impl TimeSource for VirtualTime {
    fn now_nanos(&self) -> u64 {
        self.state.current_nanos.load(Ordering::SeqCst)
    }

    fn sleep_until(&self, deadline_nanos: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        if deadline_nanos <= self.now_nanos() {
            return Box::pin(std::future::ready(()));
        }
        Box::pin(VirtualSleep {
            id: self.state.next_sleeper.fetch_add(1, Ordering::Relaxed),
            deadline_nanos,
            state: self.state.clone(),
        })
    }

    fn spin_until(&self, deadline_nanos: u64) {
        self.advance_to(deadline_nanos);
    }
}

/// Future returned by `VirtualTime::sleep_until()`.
///
/// Dropping it unregisters its waker.
struct VirtualSleep {
    id: u64,
    deadline_nanos: u64,
    state: Arc<VirtualTimeState>,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut sleepers = self.state.sleepers.lock();
        // Checked under the lock so a concurrent `advance_to` cannot slip
        // between the comparison and the waker registration.
        if self.state.current_nanos.load(Ordering::SeqCst) >= self.deadline_nanos {
            return Poll::Ready(());
        }
        let waker = cx.waker();
        match sleepers.iter_mut().find(|sleeper| sleeper.id == self.id) {
            Some(sleeper) => {
                if !sleeper.waker.will_wake(waker) {
                    sleeper.waker = waker.clone();
                }
            }
            None => sleepers.push(Sleeper {
                id: self.id,
                deadline_nanos: self.deadline_nanos,
                waker: waker.clone(),
            }),
        }
        Poll::Pending
    }
}

impl Drop for VirtualSleep {
    fn drop(&mut self) {
        self.state
            .sleepers
            .lock()
            .retain(|sleeper| sleeper.id != self.id);
    }
}
