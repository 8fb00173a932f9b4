use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use folio_common::util::duration_ms;
use folio_common::{RecordStatus, RequestKey, RequestRecord, StreamFrame};

use crate::types::MetaStore;

/// Upper bound on optimistic retries of a read-modify-CAS cycle.
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Prefix of every key this registry touches.
    pub namespace: String,
    /// Lifetime of an ACTIVE slot, cancellation flags and outstanding entries.
    pub record_ttl: Duration,
    /// How long a terminal record stays readable for duplicate waiters.
    pub result_ttl: Duration,
    /// Lifetime of stream buffers while their producer runs.
    pub stream_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "/folio".to_string(),
            record_ttl: Duration::from_secs(130),
            result_ttl: Duration::from_secs(10),
            stream_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now holds the user's active slot. `displaced` is the lower
    /// priority (or superseded) record it replaced; that record's
    /// cancellation flag is already raised.
    Acquired { displaced: Option<RequestRecord> },
    /// Another record holds the slot and may not be displaced.
    Busy(RequestRecord),
}

/// Identity of a replay buffer: one per user and streaming request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub user_id: String,
    pub fingerprint: String,
}

impl StreamId {
    pub fn for_key(key: &RequestKey) -> Self {
        Self {
            user_id: key.user_id.clone(),
            fingerprint: key.fingerprint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamState {
    pub active: bool,
    pub owner_token: String,
}

/// Coordination primitives over a shared [`MetaStore`].
///
/// Nothing here caches state between calls: every answer comes from the
/// store, so any number of processes can share one registry.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn MetaStore>,
    cfg: RegistryConfig,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("namespace", &self.cfg.namespace)
            .finish()
    }
}

impl Registry {
    pub fn new(store: Arc<dyn MetaStore>, cfg: RegistryConfig) -> Self {
        Self { store, cfg }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.cfg
    }

    fn user_key(&self, user: &str, suffix: &str) -> String {
        format!("{}/users/{}/{}", self.cfg.namespace, user, suffix)
    }

    fn active_key(&self, user: &str) -> String {
        self.user_key(user, "active")
    }

    fn result_key(&self, user: &str, token: &str) -> String {
        self.user_key(user, &format!("results/{token}"))
    }

    fn cancel_key(&self, user: &str, token: &str) -> String {
        self.user_key(user, &format!("cancel/{token}"))
    }

    fn stream_key(&self, stream: &StreamId, suffix: &str) -> String {
        format!(
            "{}/streams/{}/{}/{}",
            self.cfg.namespace, stream.user_id, stream.fingerprint, suffix
        )
    }

    fn frames_prefix(&self, stream: &StreamId) -> String {
        self.stream_key(stream, "frames/")
    }

    fn record_ttl_ms(&self) -> Option<u64> {
        Some(duration_ms(self.cfg.record_ttl))
    }

    async fn read_active(&self, user: &str) -> Result<Option<(Option<RequestRecord>, u64)>> {
        let Some((bytes, rev)) = self.store.get(&self.active_key(user)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<RequestRecord>(&bytes) {
            Ok(rec) => Ok(Some((Some(rec), rev))),
            Err(e) => {
                tracing::warn!(user, error=%e, "undecodable active record, treating slot as stale");
                Ok(Some((None, rev)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Active slot
    // -----------------------------------------------------------------------

    /// Try to make `record` the user's single ACTIVE record.
    ///
    /// Succeeds when the slot is empty or expired, when the holder is a
    /// different key of strictly lower priority, or when `replace_same_key`
    /// is set and the holder is another instance of the same key. The
    /// displaced holder's cancellation flag is raised before the slot is
    /// swapped, so its waiters never see the slot change without the flag.
    pub async fn try_claim(
        &self,
        record: &RequestRecord,
        replace_same_key: bool,
    ) -> Result<ClaimOutcome> {
        let user = record.key.user_id.as_str();
        let key = self.active_key(user);
        let value = serde_json::to_vec(&record.clone().activated())?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (expected, displaced) = match self.read_active(user).await? {
                None => (0, None),
                Some((None, rev)) => (rev, None),
                Some((Some(cur), rev)) => {
                    if cur.is_owned_by(&record.owner_token) {
                        return Ok(ClaimOutcome::Acquired { displaced: None });
                    }
                    let preempts = cur.key != record.key && cur.priority < record.priority;
                    let supersedes = cur.key == record.key && replace_same_key;
                    if !preempts && !supersedes {
                        return Ok(ClaimOutcome::Busy(cur));
                    }
                    self.cancel_token(user, &cur.owner_token).await?;
                    (rev, Some(cur))
                }
            };

            let (ok, _) = self
                .store
                .compare_and_swap(&key, expected, value.clone(), self.record_ttl_ms())
                .await?;
            if ok {
                return Ok(ClaimOutcome::Acquired { displaced });
            }
        }

        Err(anyhow!("active slot for {user} is contended, giving up"))
    }

    pub async fn get_active(&self, user: &str) -> Result<Option<RequestRecord>> {
        Ok(self.read_active(user).await?.and_then(|(rec, _)| rec))
    }

    /// Extend the slot's TTL while `token` still owns it.
    pub async fn refresh_claim(&self, user: &str, token: &str) -> Result<bool> {
        let key = self.active_key(user);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((Some(cur), rev)) = self.read_active(user).await? else {
                return Ok(false);
            };
            if !cur.is_owned_by(token) {
                return Ok(false);
            }
            let value = serde_json::to_vec(&cur)?;
            let (ok, _) = self
                .store
                .compare_and_swap(&key, rev, value, self.record_ttl_ms())
                .await?;
            if ok {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record the terminal outcome of `token`'s attempt at `key` and free the
    /// slot.
    ///
    /// Returns `false` without writing anything when the slot is no longer
    /// held by `token` (it expired or was displaced) or a terminal record for
    /// `token` already exists.
    pub async fn mark_terminal(
        &self,
        key: &RequestKey,
        token: &str,
        status: RecordStatus,
        payload: Option<Value>,
        status_code: Option<u16>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("{} is not a terminal status", status.as_str()));
        }
        let user = key.user_id.as_str();
        let Some((Some(cur), _)) = self.read_active(user).await? else {
            return Ok(false);
        };
        if !cur.is_owned_by(token) || &cur.key != key {
            return Ok(false);
        }

        let terminal = cur.finished(status, payload, status_code);
        let (written, _) = self
            .store
            .compare_and_swap(
                &self.result_key(user, token),
                0,
                serde_json::to_vec(&terminal)?,
                Some(duration_ms(self.cfg.result_ttl)),
            )
            .await?;
        if !written {
            return Ok(false);
        }

        // the result is visible before the slot frees up
        self.release(user, token).await?;
        Ok(true)
    }

    async fn release(&self, user: &str, token: &str) -> Result<()> {
        let key = self.active_key(user);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((Some(cur), rev)) = self.read_active(user).await? else {
                return Ok(());
            };
            if !cur.is_owned_by(token) {
                return Ok(());
            }
            if self.store.compare_and_delete(&key, rev).await? {
                return Ok(());
            }
        }
        Err(anyhow!("could not release active slot for {user}"))
    }

    pub async fn get_result(&self, user: &str, token: &str) -> Result<Option<RequestRecord>> {
        let Some((bytes, _)) = self.store.get(&self.result_key(user, token)).await? else {
            return Ok(None);
        };
        let rec = serde_json::from_slice(&bytes).context("decode terminal record")?;
        Ok(Some(rec))
    }

    // -----------------------------------------------------------------------
    // Cancellation flags
    // -----------------------------------------------------------------------

    /// Raise the flag on the current ACTIVE instance of `key`. Idempotent.
    pub async fn set_cancelled(&self, key: &RequestKey) -> Result<bool> {
        match self.get_active(&key.user_id).await? {
            Some(cur) if &cur.key == key => {
                self.cancel_token(&key.user_id, &cur.owner_token).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn cancel_token(&self, user: &str, token: &str) -> Result<()> {
        self.store
            .put(&self.cancel_key(user, token), b"1".to_vec(), self.record_ttl_ms())
            .await?;
        tracing::info!(user, token, "cancellation flag raised");
        Ok(())
    }

    pub async fn is_cancelled(&self, user: &str, token: &str) -> Result<bool> {
        Ok(self.store.get(&self.cancel_key(user, token)).await?.is_some())
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    async fn increment(&self, key: &str, delta: i64, ttl_ms: Option<u64>) -> Result<i64> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (current, rev) = match self.store.get(key).await? {
                Some((bytes, rev)) => {
                    let n = std::str::from_utf8(&bytes)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0);
                    (n, rev)
                }
                None => (0, 0),
            };
            let next = current.saturating_add(delta).max(0);
            let (ok, _) = self
                .store
                .compare_and_swap(key, rev, next.to_string().into_bytes(), ttl_ms)
                .await?;
            if ok {
                return Ok(next);
            }
        }
        Err(anyhow!("counter {key} is contended, giving up"))
    }

    /// Per-user request number, for display only.
    pub async fn next_sequence(&self, user: &str) -> Result<u64> {
        let n = self.increment(&self.user_key(user, "seq"), 1, None).await?;
        Ok(n as u64)
    }

    fn outstanding_key(&self, user: &str, token: &str) -> String {
        self.user_key(user, &format!("outstanding/{token}"))
    }

    /// Count `token` as outstanding for `user` and return how many requests
    /// are outstanding now, this one included. Entries expire after
    /// `record_ttl`, so one left behind by a crashed process decays.
    pub async fn enter_outstanding(&self, user: &str, token: &str) -> Result<usize> {
        self.store
            .put(&self.outstanding_key(user, token), b"1".to_vec(), self.record_ttl_ms())
            .await?;
        let prefix = self.user_key(user, "outstanding/");
        Ok(self.store.list_prefix(&prefix).await?.len())
    }

    pub async fn leave_outstanding(&self, user: &str, token: &str) -> Result<()> {
        self.store.delete(&self.outstanding_key(user, token)).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream buffers
    // -----------------------------------------------------------------------

    pub async fn stream_state(&self, stream: &StreamId) -> Result<Option<StreamState>> {
        let Some((bytes, _)) = self.store.get(&self.stream_key(stream, "state")).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).context("decode stream state")?))
    }

    /// Start a fresh buffer owned by `token`, discarding any leftover frames.
    pub async fn open_stream(&self, stream: &StreamId, token: &str) -> Result<()> {
        self.clear_frames(stream).await?;
        self.put_stream_state(stream, true, token, duration_ms(self.cfg.stream_ttl))
            .await
    }

    async fn put_stream_state(
        &self,
        stream: &StreamId,
        active: bool,
        token: &str,
        ttl_ms: u64,
    ) -> Result<()> {
        let state = StreamState {
            active,
            owner_token: token.to_string(),
        };
        self.store
            .put(
                &self.stream_key(stream, "state"),
                serde_json::to_vec(&state)?,
                Some(ttl_ms),
            )
            .await?;
        Ok(())
    }

    /// Append a frame and return its index.
    pub async fn append_frame(&self, stream: &StreamId, frame: &StreamFrame) -> Result<u64> {
        let ttl_ms = duration_ms(self.cfg.stream_ttl);
        let len = self
            .increment(&self.stream_key(stream, "len"), 1, Some(ttl_ms))
            .await?;
        let index = (len - 1) as u64;
        let key = format!("{}{:010}", self.frames_prefix(stream), index);
        self.store
            .put(&key, serde_json::to_vec(frame)?, Some(ttl_ms))
            .await?;
        Ok(index)
    }

    /// Frames at `from_index` and after, in append order.
    pub async fn read_frames(
        &self,
        stream: &StreamId,
        from_index: u64,
    ) -> Result<Vec<(u64, StreamFrame)>> {
        let prefix = self.frames_prefix(stream);
        let mut out = Vec::new();
        for (k, v, _) in self.store.list_prefix(&prefix).await? {
            let Some(index) = k
                .strip_prefix(&prefix)
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if index < from_index {
                continue;
            }
            let frame: StreamFrame = serde_json::from_slice(&v).context("decode stream frame")?;
            out.push((index, frame));
        }
        out.sort_by_key(|(i, _)| *i);
        Ok(out)
    }

    /// Keep an active buffer alive while its producer runs.
    pub async fn touch_stream(&self, stream: &StreamId, token: &str) -> Result<()> {
        self.put_stream_state(stream, true, token, duration_ms(self.cfg.stream_ttl))
            .await
    }

    /// Mark the buffer finished. State and frames stay readable for `grace`.
    pub async fn close_stream(&self, stream: &StreamId, token: &str, grace: Duration) -> Result<()> {
        let grace_ms = duration_ms(grace);
        for (k, v, _) in self.store.list_prefix(&self.frames_prefix(stream)).await? {
            self.store.put(&k, v, Some(grace_ms)).await?;
        }
        self.put_stream_state(stream, false, token, grace_ms).await
    }

    pub async fn delete_stream(&self, stream: &StreamId) -> Result<()> {
        self.store.delete(&self.stream_key(stream, "state")).await?;
        self.clear_frames(stream).await
    }

    async fn clear_frames(&self, stream: &StreamId) -> Result<()> {
        for (k, _, _) in self.store.list_prefix(&self.frames_prefix(stream)).await? {
            self.store.delete(&k).await?;
        }
        self.store.delete(&self.stream_key(stream, "len")).await?;
        Ok(())
    }
}
