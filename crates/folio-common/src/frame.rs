use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::record::RecordStatus;

pub const SENTINEL_EVENT: &str = "end";

/// One frame of a streamed operation, as replayed to reconnecting clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFrame {
    pub event: String,
    pub data: Value,
}

impl StreamFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Final frame of every stream. `status` is the terminal status of the
    /// producing operation, or `"timeout"` when a follower gave up.
    pub fn sentinel(status: &str, error: Option<&str>) -> Self {
        let data = match error {
            Some(e) => json!({ "status": status, "error": e }),
            None => json!({ "status": status }),
        };
        Self::new(SENTINEL_EVENT, data)
    }

    pub fn sentinel_for(status: RecordStatus, error: Option<&str>) -> Self {
        Self::sentinel(status.as_str(), error)
    }

    pub fn is_sentinel(&self) -> bool {
        self.event == SENTINEL_EVENT
    }
}
