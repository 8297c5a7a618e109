//! Tracing subscriber setup shared by binaries and tests.

use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

static TEST_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to install the global tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Installs the global subscriber for the binary named `app_name`.
///
/// Events are written to stdout through a non-blocking writer. The returned guard flushes
/// buffered events when dropped and must be held until the process exits.
pub fn init_tracing(app_name: &str) -> Result<WorkerGuard, TracingError> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{DEFAULT_FILTER},{app_name}=info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(writer))
        .try_init()?;

    ::tracing::info!(app = app_name, "tracing initialized");

    Ok(guard)
}

/// Installs a subscriber that writes through the test harness capture, once per process.
///
/// Silent unless `RUST_LOG` is set.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let Ok(filter) = EnvFilter::try_from_default_env() else {
            return;
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
