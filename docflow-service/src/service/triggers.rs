//! Bundled interval triggers for the dispatcher and the reaper.
//!
//! Each tick invokes exactly the operation the HTTP trigger endpoints do.
//! Intervals are re-read from the runtime config every tick; an interval of
//! zero parks the trigger until it is configured again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::format_error_chain_ref;
use crate::service::DocflowService;

/// How often a disabled trigger checks whether it has been re-enabled
const DISABLED_RECHECK: Duration = Duration::from_secs(30);

impl DocflowService {
    /// Start the dispatch trigger. Each tick drains the queue.
    pub fn start_dispatch_trigger(
        service: Arc<DocflowService>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Dispatch trigger started");
            loop {
                let interval = service.runtime_config.dynamic().queue.dispatch_interval();
                let enabled = interval.is_some();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval.unwrap_or(DISABLED_RECHECK)) => {}
                }
                if enabled {
                    service.drain_queue(&shutdown).await;
                }
            }
            info!("Dispatch trigger stopped");
        })
    }

    /// Start the stuck-job reaper trigger
    pub fn start_reaper_trigger(
        service: Arc<DocflowService>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Reaper trigger started");
            loop {
                let interval = service.runtime_config.dynamic().queue.reaper_interval();
                let enabled = interval.is_some();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval.unwrap_or(DISABLED_RECHECK)) => {}
                }
                if !enabled {
                    continue;
                }
                if let Err(e) = service.sweep_stuck_jobs() {
                    error!(error = %format_error_chain_ref(&e), "Stuck job sweep failed");
                }
            }
            info!("Reaper trigger stopped");
        })
    }

    /// Dispatch jobs until none is claimable or shutdown is requested.
    /// Returns how many jobs were processed.
    pub async fn drain_queue(&self, shutdown: &CancellationToken) -> usize {
        let mut processed = 0;
        while !shutdown.is_cancelled() {
            match self.process_next_job().await {
                Ok(true) => processed += 1,
                Ok(false) => break,
                Err(e) => {
                    error!(error = %format_error_chain_ref(&e), "Dispatch failed");
                    break;
                }
            }
        }
        processed
    }
}
