use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use folio_meta::Registry;

use crate::executor::ExecutorError;

/// Registry-backed cancellation predicate handed to executors.
///
/// Cancellation is advisory: nothing stops the executor, it is expected to
/// poll at safe boundaries and bail out with [`ExecutorError::Cancelled`].
/// Once a flag has been observed the checker stays cancelled.
#[derive(Debug, Clone)]
pub struct CancellationChecker {
    target: Option<Target>,
    check_interval: u32,
    calls: Arc<AtomicU32>,
    observed: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct Target {
    registry: Registry,
    user_id: String,
    owner_token: String,
}

impl CancellationChecker {
    pub fn new(
        registry: Registry,
        user_id: impl Into<String>,
        owner_token: impl Into<String>,
        check_interval: u32,
    ) -> Self {
        Self {
            target: Some(Target {
                registry,
                user_id: user_id.into(),
                owner_token: owner_token.into(),
            }),
            check_interval: check_interval.max(1),
            calls: Arc::new(AtomicU32::new(0)),
            observed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A checker that never reports cancellation, for uncoordinated requests.
    pub fn detached() -> Self {
        Self {
            target: None,
            check_interval: 1,
            calls: Arc::new(AtomicU32::new(0)),
            observed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn owner_token(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.owner_token.as_str())
    }

    /// Ask the registry whether this attempt has been cancelled.
    pub async fn is_cancelled(&self) -> bool {
        if self.observed.load(Ordering::Acquire) {
            return true;
        }
        let Some(t) = self.target.as_ref() else {
            return false;
        };
        match t.registry.is_cancelled(&t.user_id, &t.owner_token).await {
            Ok(true) => {
                self.observed.store(true, Ordering::Release);
                tracing::info!(user=%t.user_id, token=%t.owner_token, "cancellation detected");
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(user=%t.user_id, error=%e, "cancellation check failed, continuing");
                false
            }
        }
    }

    /// Cheap variant for tight loops: only every `check_interval`th call
    /// reaches the registry.
    pub async fn check(&self) -> bool {
        if self.observed.load(Ordering::Acquire) {
            return true;
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if n % self.check_interval != 0 {
            return false;
        }
        self.is_cancelled().await
    }

    pub async fn ensure_active(&self) -> Result<(), ExecutorError> {
        if self.is_cancelled().await {
            return Err(ExecutorError::Cancelled);
        }
        Ok(())
    }
}
