use std::fmt;

use serde::{Deserialize, Serialize};

/// Query parameters that never change what an operation does: cache busters
/// and the coordination layer's own transport parameters.
pub const IGNORED_QUERY_PARAMS: &[&str] = &[
    "staging",
    "_t",
    "timestamp",
    "cache_buster",
    "user_id",
    "from_index",
];

/// Identity of a logical operation for one user.
///
/// Two requests that normalise to the same `(user_id, path, method, query)`
/// are duplicates of each other regardless of arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub user_id: String,
    pub path: String,
    pub method: String,
    /// Canonical query: `name=value` pairs sorted and joined with `&`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
}

impl RequestKey {
    /// Build a key from a raw request target.
    ///
    /// Normalisation rules:
    /// - the fragment is dropped
    /// - runs of `/` collapse into one and a leading `/` is ensured
    /// - a trailing `/` is removed, except for the root path
    /// - path case is kept, the method is upper-cased
    /// - query pairs are sorted, [`IGNORED_QUERY_PARAMS`] and empty pairs dropped
    pub fn new(user_id: impl Into<String>, raw_path: &str, method: &str) -> Self {
        Self {
            user_id: user_id.into(),
            path: normalize_path(raw_path),
            method: method.trim().to_ascii_uppercase(),
            query: canonical_query(raw_path),
        }
    }

    /// Stable hex digest of the key, safe to use as a storage key segment.
    pub fn fingerprint(&self) -> String {
        let mut hash = FNV_OFFSET;
        for part in [&self.user_id, &self.method, &self.path, &self.query] {
            for b in part.as_bytes() {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
            // NUL separator (xor with 0 is a no-op) so ("ab", "c") and ("a", "bc") differ
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        format!("{hash:016x}")
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.user_id, self.method, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        Ok(())
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn normalize_path(raw: &str) -> String {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let mut out = String::with_capacity(end + 1);
    out.push('/');
    for segment in raw[..end].split('/').filter(|s| !s.is_empty()) {
        if out.len() > 1 {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}

/// Sorted `name=value` pairs of the query part of `raw`, without ignored
/// parameters. A bare `name` is kept as `name=`.
pub fn canonical_query(raw: &str) -> String {
    let Some(start) = raw.find('?') else {
        return String::new();
    };
    let end = raw[start..].find('#').map_or(raw.len(), |i| start + i);
    let mut pairs: Vec<(&str, &str)> = raw[start + 1..end]
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .filter(|(name, _)| !name.is_empty() && !IGNORED_QUERY_PARAMS.contains(name))
        .collect();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}
