//! Reconciliation settings the embedding node agent hands to the populator.

use std::time::Duration;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_STATUS_RETRY_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PopulatorConfig {
    /// Sleep between reconciliation ticks.
    pub sync_interval: Duration,
    /// How long transient pod status lookup failures are tolerated before the
    /// pod is reported as stuck.
    pub status_retry_window: Duration,
    /// When set, a terminated pod's volumes are retained until the pod record
    /// itself disappears from the pod source (post-mortem inspection).
    pub keep_terminated_pod_volumes: bool,
}

impl Default for PopulatorConfig {
    fn default() -> Self {
        PopulatorConfig {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            status_retry_window: DEFAULT_STATUS_RETRY_WINDOW,
            keep_terminated_pod_volumes: false,
        }
    }
}
