use anyhow::Result;
use async_trait::async_trait;

/// Key-value storage with per-key revisions and optional expiry.
///
/// Every write bumps a store-wide revision; `compare_and_swap` and
/// `compare_and_delete` succeed only when the key's current revision equals
/// the expected one. An absent or expired key has revision 0.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
        ttl_ms: Option<u64>,
    ) -> Result<(bool, u64)>;

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool>;
}
