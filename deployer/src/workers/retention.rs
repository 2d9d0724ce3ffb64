//! Periodic cleanup of finished deployments

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use crate::deploy::pipeline::PipelineRunner;

/// Retention worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Finished deployments older than this are removed
    pub older_than_days: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            older_than_days: 7,
        }
    }
}

/// Run the retention worker until `shutdown_signal` resolves
pub async fn run<S, F>(
    options: &Options,
    runner: &PipelineRunner,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(
        older_than_days = options.older_than_days,
        "Retention worker starting..."
    );

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Retention worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let removed = runner.cleanup(options.older_than_days).await;
        debug!(removed, "Retention sweep finished");
    }
}
