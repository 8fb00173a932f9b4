use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use folio_common::key::normalize_path;
use folio_common::{PriorityTier, RequestKey};

use crate::error::CoordError;

/// What the coordinator does with requests for a route.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Single-flight with priority preemption.
    #[default]
    Coordinated,
    /// A newer request cancels and replaces an in-flight instance of the
    /// same key instead of sharing its result.
    LastOneWins,
    /// Executed directly, never deduplicated or preempted.
    Passthrough,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
    pub path: String,
    pub tier: PriorityTier,
    #[serde(default)]
    pub policy: AdmissionPolicy,
    /// Served through the replay buffer.
    #[serde(default)]
    pub streaming: bool,
}

impl RouteRule {
    fn new(path: &str, tier: PriorityTier) -> Self {
        Self {
            path: path.to_string(),
            tier,
            policy: AdmissionPolicy::Coordinated,
            streaming: false,
        }
    }

    fn policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableFile {
    #[serde(default = "default_tier")]
    default_tier: PriorityTier,
    routes: Vec<RouteRule>,
}

fn default_tier() -> PriorityTier {
    PriorityTier::Background
}

/// Result of classifying one incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub key: RequestKey,
    pub tier: PriorityTier,
    pub policy: AdmissionPolicy,
    pub streaming: bool,
}

/// Path → tier mapping. Lookups are exact on the normalised path; anything
/// not listed gets `default_tier` and the coordinated policy.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    default_tier: PriorityTier,
    rules: HashMap<String, RouteRule>,
}

impl Default for PriorityTable {
    fn default() -> Self {
        use AdmissionPolicy::{LastOneWins, Passthrough};
        use PriorityTier::*;

        let rules = vec![
            RouteRule::new("/open-book", Session),
            RouteRule::new("/open-random-book", Session).policy(LastOneWins),
            RouteRule::new("/close-book", Session),
            RouteRule::new("/navigate", Navigation),
            RouteRule::new("/state", Read),
            RouteRule::new("/books", Bulk),
            RouteRule::new("/books-stream", Bulk).streaming(),
            RouteRule::new("/auth", Background),
            RouteRule::new("/screenshot", Background),
            RouteRule::new("/staff-auth", Background).policy(Passthrough),
            RouteRule::new("/staff-tokens", Background).policy(Passthrough),
        ];

        // built-in paths are already normalised and unique
        Self {
            default_tier: Background,
            rules: rules.into_iter().map(|r| (r.path.clone(), r)).collect(),
        }
    }
}

impl PriorityTable {
    pub fn new(default_tier: PriorityTier, rules: Vec<RouteRule>) -> Result<Self, CoordError> {
        let mut map = HashMap::with_capacity(rules.len());
        for mut rule in rules {
            rule.path = normalize_path(&rule.path);
            if rule.streaming && rule.policy != AdmissionPolicy::Coordinated {
                return Err(CoordError::InvalidTable(format!(
                    "streaming route '{}' must use the coordinated policy",
                    rule.path
                )));
            }
            let path = rule.path.clone();
            if map.insert(path.clone(), rule).is_some() {
                return Err(CoordError::InvalidTable(format!(
                    "route '{path}' is listed more than once"
                )));
            }
        }
        Ok(Self {
            default_tier,
            rules: map,
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CoordError> {
        let file: TableFile =
            serde_json::from_slice(bytes).map_err(|e| CoordError::InvalidTable(e.to_string()))?;
        Self::new(file.default_tier, file.routes)
    }

    pub fn load(path: &Path) -> Result<Self, CoordError> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }

    pub fn rule(&self, path: &str) -> Option<&RouteRule> {
        self.rules.get(&normalize_path(path))
    }

    pub fn classify(&self, user_id: &str, raw_path: &str, method: &str) -> Classification {
        let key = RequestKey::new(user_id, raw_path, method);
        let rule = self.rules.get(&key.path);

        let mut policy = rule.map(|r| r.policy).unwrap_or_default();
        // only reads and actions share one automation session
        if key.method != "GET" && key.method != "POST" {
            policy = AdmissionPolicy::Passthrough;
        }

        Classification {
            tier: rule.map(|r| r.tier).unwrap_or(self.default_tier),
            streaming: rule.map(|r| r.streaming).unwrap_or(false)
                && policy != AdmissionPolicy::Passthrough,
            policy,
            key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_ordering() {
        let t = PriorityTable::default();
        let nav = t.classify("u1", "/navigate", "POST");
        let stream = t.classify("u1", "/books-stream", "GET");
        let state = t.classify("u1", "/state", "GET");
        assert!(nav.tier > state.tier);
        assert!(state.tier > stream.tier);
        assert!(stream.streaming);
        assert_eq!(nav.policy, AdmissionPolicy::Coordinated);
    }

    #[test]
    fn test_unknown_path_gets_default_tier() {
        let t = PriorityTable::default();
        let c = t.classify("u1", "/something-else", "GET");
        assert_eq!(c.tier, PriorityTier::Background);
        assert_eq!(c.policy, AdmissionPolicy::Coordinated);
        assert!(!c.streaming);
    }

    #[test]
    fn test_lookup_uses_normalised_path() {
        let t = PriorityTable::default();
        let c = t.classify("u1", "/open-random-book/?x=1", "post");
        assert_eq!(c.key.path, "/open-random-book");
        assert_eq!(c.key.method, "POST");
        assert_eq!(c.policy, AdmissionPolicy::LastOneWins);
    }

    #[test]
    fn test_passthrough_routes_and_methods() {
        let t = PriorityTable::default();
        assert_eq!(
            t.classify("u1", "/staff-auth", "GET").policy,
            AdmissionPolicy::Passthrough
        );
        let del = t.classify("u1", "/books-stream", "DELETE");
        assert_eq!(del.policy, AdmissionPolicy::Passthrough);
        assert!(!del.streaming);
    }

    #[test]
    fn test_from_json() {
        let json = br#"{
            "default_tier": "read",
            "routes": [
                {"path": "/navigate/", "tier": "navigation"},
                {"path": "/feed", "tier": "bulk", "streaming": true},
                {"path": "/pick", "tier": "session", "policy": "last_one_wins"}
            ]
        }"#;
        let t = PriorityTable::from_json(json).unwrap();
        assert_eq!(t.rule("/navigate").unwrap().tier, PriorityTier::Navigation);
        assert!(t.rule("/feed").unwrap().streaming);
        assert_eq!(t.classify("u1", "/other", "GET").tier, PriorityTier::Read);
        assert_eq!(t.classify("u1", "/pick", "POST").policy, AdmissionPolicy::LastOneWins);
    }

    #[test]
    fn test_rejects_duplicate_routes() {
        let json = br#"{"routes": [
            {"path": "/state", "tier": "read"},
            {"path": "/state/", "tier": "bulk"}
        ]}"#;
        assert!(matches!(
            PriorityTable::from_json(json),
            Err(CoordError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_tier() {
        let json = br#"{"routes": [{"path": "/state", "tier": "urgent"}]}"#;
        assert!(PriorityTable::from_json(json).is_err());
    }
}
