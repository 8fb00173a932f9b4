use std::sync::Arc;

use anyhow::Result;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use tokio::sync::Mutex;

use crate::types::MetaStore;

/// Registry storage shared by every server process.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }

    fn ttl_to_seconds(ttl_ms: u64) -> i64 {
        let mut secs = (ttl_ms as f64 / 1000.0).ceil() as i64;
        if secs <= 0 {
            secs = 1;
        }
        secs
    }

    async fn put_options(cli: &mut Client, ttl_ms: Option<u64>) -> Result<Option<PutOptions>> {
        let Some(ttl_ms) = ttl_ms else {
            return Ok(None);
        };
        let lease = cli.lease_grant(Self::ttl_to_seconds(ttl_ms), None).await?;
        Ok(Some(PutOptions::new().with_lease(lease.id())))
    }

    fn revision_guard(key: &str, expected_revision: u64) -> Compare {
        // a missing key has create_revision 0
        if expected_revision == 0 {
            Compare::create_revision(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64)
        }
    }

    async fn current_revision(cli: &mut Client, key: &str) -> Result<u64> {
        let current = cli.get(key, None).await?;
        Ok(current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let opts = Self::put_options(&mut cli, ttl_ms).await?;
        let resp = cli.put(key, value, opts).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        let kv = match resp.kvs().first() {
            Some(kv) => kv,
            None => return Ok(None),
        };
        let rev = kv.mod_revision() as u64;
        Ok(Some((kv.value().to_vec(), rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let opts = GetOptions::new().with_prefix();
        let resp = cli.get(prefix, Some(opts)).await?;

        let mut out = Vec::new();
        for kv in resp.kvs() {
            let k = String::from_utf8_lossy(kv.key()).to_string();
            let v = kv.value().to_vec();
            let rev = kv.mod_revision() as u64;
            out.push((k, v, rev));
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
        ttl_ms: Option<u64>,
    ) -> Result<(bool, u64)> {
        let mut cli = self.client.lock().await;
        let opts = Self::put_options(&mut cli, ttl_ms).await?;

        let cmp = Self::revision_guard(key, expected_revision);
        let put = TxnOp::put(key, value, opts);
        let txn = Txn::new().when([cmp]).and_then([put]).or_else([]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok((true, rev as u64));
        }

        // failed CAS: report the current mod_revision, 0 when absent
        let current_rev = Self::current_revision(&mut cli, key).await?;
        Ok((false, current_rev))
    }

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool> {
        if expected_revision == 0 {
            return Ok(false);
        }
        let mut cli = self.client.lock().await;
        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let del = TxnOp::delete(key, None);
        let txn = Txn::new().when([cmp]).and_then([del]).or_else([]);
        let resp = cli.txn(txn).await?;
        Ok(resp.succeeded())
    }
}
