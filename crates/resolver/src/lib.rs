//! Deferred cross-repository reference resolution
//!
//! Extraction records references it cannot bind inside one file as pending
//! references. The resolver repeatedly claims a batch of them, looks for a
//! target among every indexed repository and either binds the reference to a
//! relation or charges it a failed attempt. References whose target appears
//! later (forward references, dependencies indexed after their dependents)
//! converge on a later pass.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod matching;
mod resolver;

pub use resolver::{ReferenceResolver, ResolutionStats};

use codeweave_core::{LoopHealth, ResolutionConfig, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

/// Run the resolver until shutdown
///
/// Runs one pass of at most `config.batch_size` references every
/// `config.interval_secs`. A pass claims a single batch, so each reference is
/// charged at most one attempt per pass.
///
/// # Graceful Shutdown
/// The flag is checked before each pass and while sleeping. An in-flight batch
/// always completes.
///
/// # Error Handling
/// Storage errors are logged and counted against `health`; the loop keeps going.
pub async fn start_resolver(
    resolver: Arc<ReferenceResolver>,
    config: &ResolutionConfig,
    health: Arc<LoopHealth>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let interval = Duration::from_secs(config.interval_secs.max(1));
    let batch_size = config.batch_size.max(1);
    info!(
        interval_secs = interval.as_secs(),
        batch_size, "Reference resolver started"
    );

    loop {
        if *shutdown_rx.borrow() {
            info!("Reference resolver shutting down gracefully");
            return Ok(());
        }

        match resolver.resolve_batch(batch_size).await {
            Ok(_) => health.record_success(),
            Err(e) => {
                error!("Reference resolution error: {e}");
                health.record_failure();
            }
        }

        tokio::select! {
            _ = sleep(interval) => {},
            _ = shutdown_rx.changed() => {
                info!("Reference resolver shutting down gracefully");
                return Ok(());
            }
        }
    }
}
