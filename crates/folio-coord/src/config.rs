use std::time::Duration;

/// Timing knobs of the admission protocol.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on the total time a request may spend waiting for
    /// another one, across every re-admission.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// In-place retries of the executor after a transient failure.
    pub max_transient_retries: u32,
    pub retry_backoff: Duration,
    /// How long a finished stream buffer stays available for reconnects.
    pub stream_grace: Duration,
    /// Registry round-trips happen on every Nth `CancellationChecker::check`.
    pub cancel_check_interval: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(125),
            poll_interval: Duration::from_millis(250),
            max_transient_retries: 2,
            retry_backoff: Duration::from_millis(500),
            stream_grace: Duration::from_secs(60),
            cancel_check_interval: 1,
        }
    }
}
