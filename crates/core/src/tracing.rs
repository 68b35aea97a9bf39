//! Logging setup for binaries and tests.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the host. [`set_logger`] installs the default one at most once per process.

use tracing::level_filters::LevelFilter;

/// Installs the global subscriber. Later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::{AtomicBool, Ordering};

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Err(error) = tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Builds and installs an env-filtered fmt subscriber.
    ///
    /// `RUST_LOG` overrides the default level. `RTT_EQ_LOG_FORMAT=json`
    /// switches to JSON lines, `RTT_EQ_LOG_TO_STDERR` writes to stderr and
    /// `RTT_EQ_DISABLE_LOGS` installs nothing.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("RTT_EQ_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        let to_stderr = std::env::var("RTT_EQ_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("RTT_EQ_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
