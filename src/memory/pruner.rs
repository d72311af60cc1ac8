//! Recurring removal of expired memories.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MemoryService, RepositoryId};

/// Handle to a running prune loop.
pub struct PruneJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PruneJob {
    /// Prune on every tick of `interval` until `cancel` fires.
    ///
    /// The first prune runs immediately. A failed prune is logged and tried
    /// again on the next tick.
    pub fn spawn(
        service: MemoryService,
        interval: Duration,
        repository: Option<RepositoryId>,
        cancel: CancellationToken,
    ) -> Self {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match service.prune(repository.as_ref()).await {
                    Ok(removed) => tracing::debug!(removed, "Prune cycle finished"),
                    Err(e) => tracing::warn!(error = %e, "Prune cycle failed; retrying next interval"),
                }
            }
            tracing::debug!("Prune job stopped");
        });
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Prune job ended abnormally");
        }
    }
}
