//! Runtime configuration and cancellation for pipeline runs.

use tokio::sync::watch;

/// Runtime knobs for the execution driver.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bound on concurrently running `process` tasks.
    pub max_concurrent_tasks: usize,
    /// Backpressure high-water mark: plan advancement pauses while the
    /// component manager holds at least this many live bundles.
    pub live_entity_high_water: usize,
    /// Maximum retries for a failed storage fetch.
    pub max_fetch_retries: u32,
    /// Initial fetch retry backoff in milliseconds; doubled per retry.
    pub retry_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            live_entity_high_water: 256,
            max_fetch_retries: 3,
            retry_backoff_ms: 20,
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.max_concurrent_tasks = tasks.max(1);
        self
    }

    pub fn with_live_entity_high_water(mut self, high_water: usize) -> Self {
        self.live_entity_high_water = high_water.max(1);
        self
    }

    pub fn with_max_fetch_retries(mut self, retries: u32) -> Self {
        self.max_fetch_retries = retries;
        self
    }
}

/// Handle for cancelling a pipeline run from outside it.
///
/// The driver checks the paired receiver at clause boundaries and before
/// every storage fetch; a cancelled task publishes nothing and releases
/// its inputs.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancel_tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel_tx: tx }, rx)
    }

    /// Trip the token.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}
