use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::RequestKey;

/// Ordered priority tiers, lowest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    /// Screenshots, auth checks.
    Background,
    /// Library enumeration and other listing work.
    Bulk,
    /// Single-shot state reads.
    Read,
    /// Page turns and other interactive actions.
    Navigation,
    /// Opening and closing books.
    Session,
}

impl PriorityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityTier::Background => "background",
            PriorityTier::Bulk => "bulk",
            PriorityTier::Read => "read",
            PriorityTier::Navigation => "navigation",
            PriorityTier::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Error,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordStatus::Completed | RecordStatus::Cancelled | RecordStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Active => "active",
            RecordStatus::Completed => "completed",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::Error => "error",
        }
    }
}

/// The registry's view of one attempt at a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub key: RequestKey,
    pub owner_token: String,
    pub priority: PriorityTier,
    pub status: RecordStatus,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status_code: Option<u16>,
}

impl RequestRecord {
    pub fn pending(
        key: RequestKey,
        owner_token: impl Into<String>,
        priority: PriorityTier,
        sequence_number: u64,
    ) -> Self {
        Self {
            key,
            owner_token: owner_token.into(),
            priority,
            status: RecordStatus::Pending,
            sequence_number,
            created_at: Utc::now(),
            result_payload: None,
            result_status_code: None,
        }
    }

    pub fn activated(mut self) -> Self {
        self.status = RecordStatus::Active;
        self
    }

    /// Terminal copy of this record. Terminal records are never rewritten.
    pub fn finished(
        &self,
        status: RecordStatus,
        payload: Option<Value>,
        status_code: Option<u16>,
    ) -> Self {
        Self {
            status,
            result_payload: payload,
            result_status_code: status_code,
            ..self.clone()
        }
    }

    pub fn is_owned_by(&self, token: &str) -> bool {
        self.owner_token == token
    }
}
