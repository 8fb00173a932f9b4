use serde_json::{json, Value};

use folio_common::{RecordStatus, RequestRecord};

use crate::executor::{ExecutorError, OperationResult};

pub const CANCELLED_MESSAGE: &str = "cancelled by higher priority operation";
pub const TIMEOUT_MESSAGE: &str = "timed out waiting";

/// How a coordinated request ended, from its caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// This caller ran the executor.
    Executed(OperationResult),
    /// Another caller ran the same key; its recorded result, verbatim.
    Duplicate(OperationResult),
    /// Preempted by a higher priority operation.
    Cancelled,
    /// Gave up waiting for another request.
    TimedOut,
    /// The executor failed with a non-retryable (or exhausted) error.
    Rejected { status_code: u16, message: String },
    /// Coordination itself failed, typically the registry.
    Failed(String),
}

impl Outcome {
    pub fn status_code(&self) -> u16 {
        match self {
            Outcome::Executed(r) | Outcome::Duplicate(r) => r.status_code,
            Outcome::Cancelled => 409,
            Outcome::TimedOut => 408,
            Outcome::Rejected { status_code, .. } => *status_code,
            Outcome::Failed(_) => 500,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Outcome::Executed(r) | Outcome::Duplicate(r) => r.payload.clone(),
            Outcome::Cancelled => json!({ "error": CANCELLED_MESSAGE }),
            Outcome::TimedOut => json!({ "error": TIMEOUT_MESSAGE }),
            Outcome::Rejected { message, .. } | Outcome::Failed(message) => {
                json!({ "error": message })
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Executed(_) => "executed",
            Outcome::Duplicate(_) => "duplicate",
            Outcome::Cancelled => "cancelled",
            Outcome::TimedOut => "timeout",
            Outcome::Rejected { .. } => "rejected",
            Outcome::Failed(_) => "failed",
        }
    }

    /// Outcome of the executor for the caller that ran it.
    pub fn from_execution(result: Result<OperationResult, ExecutorError>) -> Self {
        match result {
            Ok(r) => Outcome::Executed(r),
            Err(ExecutorError::Cancelled) => Outcome::Cancelled,
            Err(ExecutorError::Transient(message)) => Outcome::Rejected {
                status_code: 503,
                message,
            },
            Err(ExecutorError::Logic {
                status_code,
                message,
            }) => Outcome::Rejected {
                status_code,
                message,
            },
        }
    }

    /// Outcome for a duplicate waiter, read back from the owner's terminal
    /// record.
    pub fn from_record(record: &RequestRecord) -> Self {
        match record.status {
            RecordStatus::Cancelled => Outcome::Cancelled,
            _ => Outcome::Duplicate(OperationResult::with_status(
                record.result_payload.clone().unwrap_or(Value::Null),
                record.result_status_code.unwrap_or(200),
            )),
        }
    }

    /// What gets written to the registry for waiters, as
    /// `(status, payload, status_code)`.
    pub fn terminal_entry(&self) -> (RecordStatus, Value, u16) {
        let status = match self {
            Outcome::Executed(_) | Outcome::Duplicate(_) => RecordStatus::Completed,
            Outcome::Cancelled => RecordStatus::Cancelled,
            _ => RecordStatus::Error,
        };
        (status, self.body(), self.status_code())
    }
}

/// Outcome plus the informational request number.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatedResponse {
    pub outcome: Outcome,
    /// Set only when the user had more than one request outstanding.
    pub request_number: Option<u64>,
}

impl CoordinatedResponse {
    pub fn status_code(&self) -> u16 {
        self.outcome.status_code()
    }

    /// JSON body; `request_number` is merged into object payloads.
    pub fn body(&self) -> Value {
        let mut body = self.outcome.body();
        if let (Some(n), Value::Object(map)) = (self.request_number, &mut body) {
            map.insert("request_number".to_string(), json!(n));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_common::{PriorityTier, RequestKey};

    #[test]
    fn test_contention_status_codes() {
        assert_eq!(Outcome::Cancelled.status_code(), 409);
        assert_eq!(Outcome::TimedOut.status_code(), 408);
        assert_eq!(Outcome::Failed("boom".into()).status_code(), 500);
        assert_eq!(
            Outcome::Cancelled.body(),
            json!({"error": "cancelled by higher priority operation"})
        );
        assert_eq!(Outcome::TimedOut.body(), json!({"error": "timed out waiting"}));
    }

    #[test]
    fn test_executor_errors_map_to_outcomes() {
        assert_eq!(
            Outcome::from_execution(Err(ExecutorError::bad_request("no such book"))).status_code(),
            400
        );
        assert_eq!(
            Outcome::from_execution(Err(ExecutorError::Transient("socket hang up".into())))
                .status_code(),
            503
        );
        assert_eq!(
            Outcome::from_execution(Err(ExecutorError::Cancelled)),
            Outcome::Cancelled
        );
    }

    #[test]
    fn test_duplicate_replays_recorded_result() {
        let rec = RequestRecord::pending(RequestKey::new("u1", "/state", "GET"), "t", PriorityTier::Read, 1);
        let done = rec.finished(RecordStatus::Error, Some(json!({"error": "bad"})), Some(400));
        let out = Outcome::from_record(&done);
        assert_eq!(out.status_code(), 400);
        assert_eq!(out.body(), json!({"error": "bad"}));

        let cancelled = rec.finished(RecordStatus::Cancelled, None, Some(409));
        assert_eq!(Outcome::from_record(&cancelled), Outcome::Cancelled);
    }

    #[test]
    fn test_request_number_merged_into_objects_only() {
        let resp = CoordinatedResponse {
            outcome: Outcome::Executed(OperationResult::ok(json!({"page": 1}))),
            request_number: Some(3),
        };
        assert_eq!(resp.body(), json!({"page": 1, "request_number": 3}));

        let list = CoordinatedResponse {
            outcome: Outcome::Executed(OperationResult::ok(json!([1, 2]))),
            request_number: Some(3),
        };
        assert_eq!(list.body(), json!([1, 2]));
    }
}
