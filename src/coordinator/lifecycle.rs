//! Start and shutdown.

use tracing::{info, warn};

use crate::cache::spawn_reaper;

use super::{EngineState, RecordSync};

impl RecordSync {
    /// Launch background work (the cache reaper). Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.state() != EngineState::Created {
            warn!(state = %self.state(), "start() ignored");
            return;
        }

        let handle = spawn_reaper(
            self.cache.clone(),
            self.config.cache_reap_interval(),
            self.shutdown_tx.subscribe(),
        );
        *self.reaper.lock() = Some(handle);

        self.set_state(EngineState::Running);
        info!(
            reap_interval_secs = self.config.cache_reap_interval_secs,
            force_offline = self.config.force_offline,
            "record-sync started"
        );
    }

    /// Stop every subscription and the reaper. CRUD calls keep working
    /// afterwards; new subscriptions do not.
    pub async fn shutdown(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        info!("Initiating record-sync shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        let subscriptions = self.subscriptions.active_keys();
        self.subscriptions.close_all();

        let reaper = self.reaper.lock().take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache reaper ended abnormally");
            }
        }

        self.set_state(EngineState::Stopped);
        info!(subscriptions, "record-sync shutdown complete");
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }
}
