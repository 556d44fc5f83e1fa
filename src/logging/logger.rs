// file: src/logging/logger.rs
// version: 2.0.0
// guid: j0k1l2m3-n4o5-6789-0123-456789jklmno

//! Logger initialization and phase spans

use crate::Result;
use tracing::Instrument;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system
///
/// `RUST_LOG` wins over the verbosity flags when set.
pub fn init_logger(verbose: bool, quiet: bool) -> Result<()> {
    let fallback = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| {
            crate::error::ProvisionError::config(format!("Failed to initialize logger: {}", e))
        })?;

    Ok(())
}

/// Initialize structured JSON logging (for unattended runs)
pub fn init_json_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| {
            crate::error::ProvisionError::config(format!(
                "Failed to initialize JSON logger: {}",
                e
            ))
        })?;

    Ok(())
}

/// Run an async pipeline phase inside its own span
pub async fn with_phase_span<F, Fut, R>(phase: &str, step: usize, total: usize, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let span = tracing::info_span!("phase", name = phase, step, total);
    async move { f().await }.instrument(span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_twice_fails_gracefully() {
        // The global subscriber can only be set once per process; the second
        // call must surface an error instead of panicking.
        let _ = init_logger(false, false);
        let second = init_logger(true, false);
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_with_phase_span_returns_value() {
        let result = with_phase_span("RenderSeed", 5, 11, || async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            42
        })
        .await;

        assert_eq!(result, 42);
    }
}
