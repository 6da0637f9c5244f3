//! Logging and observability
//!
//! Structured logging on `tracing`; the filter honors `ALCATRAZ_LOG` and
//! defaults to `info`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_env("ALCATRAZ_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::debug!("Logging initialized");
    Ok(())
}
