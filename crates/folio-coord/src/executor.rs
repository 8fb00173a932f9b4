use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use folio_common::RequestKey;

use crate::cancel::CancellationChecker;
use crate::stream::FrameSink;

/// Everything an executor gets to know about the request it runs.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub key: RequestKey,
    /// Token of the attempt this execution belongs to.
    pub owner_token: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    pub body: Option<Value>,
}

/// Uniform result shape for every operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub payload: Value,
    pub status_code: u16,
    pub is_stream: bool,
}

impl OperationResult {
    pub fn ok(payload: Value) -> Self {
        Self::with_status(payload, 200)
    }

    pub fn with_status(payload: Value, status_code: u16) -> Self {
        Self {
            payload,
            status_code,
            is_stream: false,
        }
    }

    pub fn stream_summary(frames: u64) -> Self {
        Self {
            payload: json!({ "frames": frames }),
            status_code: 200,
            is_stream: true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    /// The executor saw its cancellation flag and stopped at a safe point.
    #[error("cancelled by higher priority operation")]
    Cancelled,

    /// The automation session was briefly unreachable; safe to retry.
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// Bad parameters or a domain-level failure; never retried.
    #[error("{message}")]
    Logic { status_code: u16, message: String },
}

impl ExecutorError {
    pub fn logic(message: impl Into<String>) -> Self {
        ExecutorError::Logic {
            status_code: 500,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ExecutorError::Logic {
            status_code: 400,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }
}

/// Runs one operation against the user's automation session.
///
/// Implementations should call `cancel.ensure_active()` between discrete
/// sub-steps and return [`ExecutorError::Cancelled`] when it fails.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancellationChecker,
        params: &RequestParams,
    ) -> Result<OperationResult, ExecutorError>;
}

/// Runs an operation whose output is delivered as a sequence of frames.
#[async_trait]
pub trait StreamingExecutor: Send + Sync {
    async fn execute_stream(
        &self,
        cancel: &CancellationChecker,
        params: &RequestParams,
        sink: &mut FrameSink,
    ) -> Result<OperationResult, ExecutorError>;
}
