use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;

use folio_common::{PriorityTier, RecordStatus, RequestKey, RequestRecord};
use folio_meta::{ClaimOutcome, Registry, StreamId};

use crate::cancel::CancellationChecker;
use crate::config::CoordinatorConfig;
use crate::error::CoordError;
use crate::executor::{ExecutorError, OperationExecutor, OperationResult, RequestParams, StreamingExecutor};
use crate::outcome::{CoordinatedResponse, Outcome};
use crate::priority::{AdmissionPolicy, Classification, PriorityTable};
use crate::stream::{FrameSink, FrameStream, StreamReplay};

/// Shared entry point: one per process, cheap to clone.
#[derive(Debug, Clone)]
pub struct Coordinator {
    registry: Registry,
    table: Arc<PriorityTable>,
    cfg: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(registry: Registry, table: PriorityTable, cfg: CoordinatorConfig) -> Self {
        Self {
            registry,
            table: Arc::new(table),
            cfg,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn table(&self) -> &PriorityTable {
        &self.table
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    /// Fingerprint and classify a request, and mint its owner token.
    pub fn request(&self, user_id: &str, raw_path: &str, method: &str) -> CoordinatedRequest {
        CoordinatedRequest {
            registry: self.registry.clone(),
            cfg: self.cfg.clone(),
            class: self.table.classify(user_id, raw_path, method),
            token: uuid::Uuid::new_v4().to_string(),
            sequence: None,
            state: RequestState::New,
        }
    }
}

/// Where a request is in the admission protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    New,
    Owner,
    WaitingDuplicate,
    WaitingPriority,
    Executing,
    Completed,
    Cancelled,
    TimedOut,
    Error,
}

impl RequestState {
    fn after(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Executed(_) | Outcome::Duplicate(_) => RequestState::Completed,
            Outcome::Cancelled => RequestState::Cancelled,
            Outcome::TimedOut => RequestState::TimedOut,
            Outcome::Rejected { .. } | Outcome::Failed(_) => RequestState::Error,
        }
    }
}

/// Result of the admission stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The caller holds the user's slot and must execute, then finalize.
    Owner { displaced: Option<RequestRecord> },
    /// Uncoordinated route: execute directly.
    Passthrough,
    /// The request is already answered (duplicate result, 409, 408).
    Settled(Outcome),
}

/// What a streaming request turned into.
#[derive(Debug)]
pub enum StreamResponse {
    /// Frames to relay to the client, ending with one sentinel.
    Frames {
        frames: FrameStream,
        request_number: Option<u64>,
    },
    /// Answered without a stream (409, 408, 500).
    Settled(CoordinatedResponse),
}

enum Admitted {
    Owner(Option<RequestRecord>),
    Duplicate(RequestRecord),
    Settled(Outcome),
}

enum DuplicateWait {
    Finished(Outcome),
    OwnerVanished,
    TimedOut,
}

/// Aborts the slot keep-alive when execution ends, however it ends.
struct KeepAlive(JoinHandle<()>);

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One incoming request moving through admit → execute → finalize.
#[derive(Debug)]
pub struct CoordinatedRequest {
    registry: Registry,
    cfg: CoordinatorConfig,
    class: Classification,
    token: String,
    sequence: Option<u64>,
    state: RequestState,
}

impl CoordinatedRequest {
    pub fn key(&self) -> &RequestKey {
        &self.class.key
    }

    pub fn tier(&self) -> PriorityTier {
        self.class.tier
    }

    pub fn classification(&self) -> &Classification {
        &self.class
    }

    pub fn owner_token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    fn user(&self) -> &str {
        &self.class.key.user_id
    }

    fn is_coordinated(&self) -> bool {
        self.class.policy != AdmissionPolicy::Passthrough
    }

    pub fn params(&self, query: Option<String>, body: Option<Value>) -> RequestParams {
        RequestParams {
            key: self.class.key.clone(),
            owner_token: self.token.clone(),
            query,
            body,
        }
    }

    pub fn checker(&self) -> CancellationChecker {
        if !self.is_coordinated() {
            return CancellationChecker::detached();
        }
        CancellationChecker::new(
            self.registry.clone(),
            self.user(),
            self.token.clone(),
            self.cfg.cancel_check_interval,
        )
    }

    fn replay(&self) -> StreamReplay {
        StreamReplay::new(
            self.registry.clone(),
            StreamId::for_key(&self.class.key),
            self.cfg.poll_interval,
            self.cfg.wait_timeout,
        )
    }

    // -----------------------------------------------------------------------
    // Stage 1: admission
    // -----------------------------------------------------------------------

    /// Decide whether this request runs now, waits, or shares another
    /// request's result. Waiting happens inside this call.
    pub async fn admit(&mut self) -> Result<Admission, CoordError> {
        if !self.is_coordinated() {
            return Ok(Admission::Passthrough);
        }
        Ok(match self.admit_inner(false).await? {
            Admitted::Owner(displaced) => Admission::Owner { displaced },
            Admitted::Settled(outcome) => Admission::Settled(outcome),
            // only produced when joining duplicates
            Admitted::Duplicate(_) => Admission::Settled(Outcome::Failed(
                "unexpected duplicate admission".to_string(),
            )),
        })
    }

    async fn admit_inner(&mut self, join_duplicates: bool) -> Result<Admitted, CoordError> {
        let user = self.user().to_string();
        let deadline = Instant::now() + self.cfg.wait_timeout;

        let seq = match self.sequence {
            Some(seq) => seq,
            None => {
                let seq = self.registry.next_sequence(&user).await?;
                self.sequence = Some(seq);
                seq
            }
        };

        loop {
            if Instant::now() >= deadline {
                return Ok(self.settle(Outcome::TimedOut));
            }

            if let Some(active) = self.registry.get_active(&user).await? {
                if active.priority > self.class.tier && !active.is_owned_by(&self.token) {
                    tracing::info!(
                        user=%user,
                        key=%self.class.key.path,
                        tier=self.class.tier.as_str(),
                        blocking=%active.key.path,
                        blocking_tier=active.priority.as_str(),
                        "waiting for higher priority request"
                    );
                    self.state = RequestState::WaitingPriority;
                    if !self.wait_for_release(&active, deadline).await? {
                        return Ok(self.settle(Outcome::TimedOut));
                    }
                    continue;
                }
            }

            let record =
                RequestRecord::pending(self.class.key.clone(), self.token.clone(), self.class.tier, seq);
            let replace = self.class.policy == AdmissionPolicy::LastOneWins;

            match self.registry.try_claim(&record, replace).await? {
                ClaimOutcome::Acquired { displaced } => {
                    self.cancel_active_lower_tier(displaced.as_ref()).await?;
                    self.state = RequestState::Owner;
                    tracing::info!(
                        user=%user,
                        key=%self.class.key.path,
                        token=%self.token,
                        seq,
                        "request admitted"
                    );
                    return Ok(Admitted::Owner(displaced));
                }
                ClaimOutcome::Busy(holder) if holder.key == self.class.key => {
                    self.state = RequestState::WaitingDuplicate;
                    if join_duplicates {
                        return Ok(Admitted::Duplicate(holder));
                    }
                    tracing::info!(
                        user=%user,
                        key=%self.class.key.path,
                        owner=%holder.owner_token,
                        "waiting for duplicate in flight"
                    );
                    match self.wait_for_duplicate(&holder, deadline).await? {
                        DuplicateWait::Finished(outcome) => return Ok(self.settle(outcome)),
                        DuplicateWait::TimedOut => return Ok(self.settle(Outcome::TimedOut)),
                        DuplicateWait::OwnerVanished => {
                            tracing::warn!(
                                user=%user,
                                owner=%holder.owner_token,
                                "duplicate owner vanished without a result, re-admitting"
                            );
                        }
                    }
                }
                ClaimOutcome::Busy(holder) => {
                    self.state = RequestState::WaitingPriority;
                    tracing::info!(
                        user=%user,
                        key=%self.class.key.path,
                        blocking=%holder.key.path,
                        "waiting for equal or higher priority request"
                    );
                    if !self.wait_for_release(&holder, deadline).await? {
                        return Ok(self.settle(Outcome::TimedOut));
                    }
                }
            }
        }
    }

    fn settle(&mut self, outcome: Outcome) -> Admitted {
        self.state = RequestState::after(&outcome);
        Admitted::Settled(outcome)
    }

    /// Raise the cancellation flag of the record this request displaced.
    /// The registry already raised it during the claim; repeating it is
    /// harmless and keeps the flag's TTL fresh.
    async fn cancel_active_lower_tier(
        &self,
        displaced: Option<&RequestRecord>,
    ) -> Result<(), CoordError> {
        let Some(d) = displaced else {
            return Ok(());
        };
        if d.key == self.class.key {
            tracing::info!(
                user=%d.key.user_id,
                key=%d.key.path,
                cancelled=%d.owner_token,
                "superseding earlier instance of the same request"
            );
        } else {
            tracing::info!(
                user=%d.key.user_id,
                cancelled_key=%d.key.path,
                cancelled_tier=d.priority.as_str(),
                key=%self.class.key.path,
                tier=self.class.tier.as_str(),
                "preempting lower priority request"
            );
        }
        self.registry.cancel_token(&d.key.user_id, &d.owner_token).await?;
        Ok(())
    }

    async fn sleep_until_next_poll(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(self.cfg.poll_interval.min(deadline - now)).await;
        true
    }

    /// Poll until `holder` leaves the user's slot. `false` on timeout.
    async fn wait_for_release(
        &self,
        holder: &RequestRecord,
        deadline: Instant,
    ) -> Result<bool, CoordError> {
        loop {
            match self.registry.get_active(self.user()).await? {
                Some(cur) if cur.is_owned_by(&holder.owner_token) => {}
                _ => return Ok(true),
            }
            if !self.sleep_until_next_poll(deadline).await {
                return Ok(false);
            }
        }
    }

    /// Poll until the duplicate owner publishes a result, gets cancelled,
    /// or disappears.
    async fn wait_for_duplicate(
        &self,
        holder: &RequestRecord,
        deadline: Instant,
    ) -> Result<DuplicateWait, CoordError> {
        let user = self.user();
        let owner = holder.owner_token.as_str();
        loop {
            // slot first: a result is published before the slot frees up and
            // a flag is raised before the slot is swapped
            let still_held = matches!(
                self.registry.get_active(user).await?,
                Some(cur) if cur.is_owned_by(owner)
            );
            if let Some(result) = self.registry.get_result(user, owner).await? {
                return Ok(DuplicateWait::Finished(Outcome::from_record(&result)));
            }
            if self.registry.is_cancelled(user, owner).await? {
                return Ok(DuplicateWait::Finished(Outcome::Cancelled));
            }
            if !still_held {
                return Ok(DuplicateWait::OwnerVanished);
            }
            if !self.sleep_until_next_poll(deadline).await {
                return Ok(DuplicateWait::TimedOut);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stage 2: execution
    // -----------------------------------------------------------------------

    fn keepalive(&self) -> Option<KeepAlive> {
        if !self.is_coordinated() {
            return None;
        }
        let registry = self.registry.clone();
        let user = self.user().to_string();
        let token = self.token.clone();
        let every = (registry.config().record_ttl / 3).max(Duration::from_millis(10));

        Some(KeepAlive(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                match registry.refresh_claim(&user, &token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(user=%user, token=%token, "slot no longer owned, stopping keep-alive");
                        return;
                    }
                    Err(e) => tracing::warn!(user=%user, error=%e, "failed to refresh active slot"),
                }
            }
        })))
    }

    /// Run the executor, retrying transient failures in place.
    pub async fn execute(
        &mut self,
        executor: &dyn OperationExecutor,
        params: &RequestParams,
    ) -> Result<OperationResult, ExecutorError> {
        let checker = self.checker();
        let _keepalive = self.keepalive();
        self.state = RequestState::Executing;

        let mut attempt: u32 = 0;
        loop {
            match executor.execute(&checker, params).await {
                Err(ExecutorError::Transient(msg)) if attempt < self.cfg.max_transient_retries => {
                    attempt += 1;
                    tracing::warn!(
                        user=%self.class.key.user_id,
                        key=%self.class.key.path,
                        attempt,
                        max_retries=self.cfg.max_transient_retries,
                        error=%msg,
                        "transient executor failure, retrying"
                    );
                    tokio::time::sleep(self.cfg.retry_backoff).await;
                    checker.ensure_active().await?;
                }
                other => return other,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stage 3: finalization
    // -----------------------------------------------------------------------

    /// Publish the executor's outcome for duplicate waiters and free the slot.
    pub async fn finalize(&mut self, result: Result<OperationResult, ExecutorError>) -> Outcome {
        let outcome = Outcome::from_execution(result);
        self.state = RequestState::after(&outcome);
        if !self.is_coordinated() {
            return outcome;
        }

        let (status, payload, status_code) = outcome.terminal_entry();
        match self
            .registry
            .mark_terminal(&self.class.key, &self.token, status, Some(payload), Some(status_code))
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::info!(
                user=%self.class.key.user_id,
                key=%self.class.key.path,
                token=%self.token,
                "slot no longer owned, result not recorded"
            ),
            Err(e) => tracing::warn!(
                user=%self.class.key.user_id,
                key=%self.class.key.path,
                error=%e,
                "failed to record terminal status"
            ),
        }
        outcome
    }

    async fn enter(&self) -> usize {
        match self.registry.enter_outstanding(self.user(), &self.token).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(user=%self.user(), error=%e, "failed to count outstanding request");
                1
            }
        }
    }

    async fn leave(registry: &Registry, user: &str, token: &str) {
        if let Err(e) = registry.leave_outstanding(user, token).await {
            tracing::warn!(user, error=%e, "failed to release outstanding request");
        }
    }

    fn request_number(&self, outstanding: usize) -> Option<u64> {
        if outstanding > 1 {
            self.sequence
        } else {
            None
        }
    }

    /// admit → execute → finalize, for single-response operations.
    pub async fn run(
        mut self,
        executor: &dyn OperationExecutor,
        query: Option<String>,
        body: Option<Value>,
    ) -> CoordinatedResponse {
        let params = self.params(query, body);

        if !self.is_coordinated() {
            let result = self.execute(executor, &params).await;
            return CoordinatedResponse {
                outcome: self.finalize(result).await,
                request_number: None,
            };
        }

        let outstanding = self.enter().await;
        let outcome = match self.admit().await {
            Ok(Admission::Owner { .. }) | Ok(Admission::Passthrough) => {
                let result = self.execute(executor, &params).await;
                self.finalize(result).await
            }
            Ok(Admission::Settled(outcome)) => outcome,
            Err(e) => {
                tracing::error!(user=%self.user(), key=%self.class.key.path, error=%e, "admission failed");
                self.state = RequestState::Error;
                Outcome::Failed(e.to_string())
            }
        };
        Self::leave(&self.registry, self.user(), &self.token).await;

        tracing::info!(
            user=%self.class.key.user_id,
            key=%self.class.key.path,
            outcome=outcome.label(),
            status=outcome.status_code(),
            "request finished"
        );
        CoordinatedResponse {
            request_number: self.request_number(outstanding),
            outcome,
        }
    }

    /// Streaming counterpart of [`run`](Self::run).
    ///
    /// A reconnecting client (`resume_from` set) is served from the existing
    /// buffer for the same key, live or recently finished. Anything else goes
    /// through admission: a concurrent duplicate follows the owner's buffer,
    /// and a new owner starts a fresh buffer.
    pub async fn run_stream(
        mut self,
        executor: Arc<dyn StreamingExecutor>,
        query: Option<String>,
        body: Option<Value>,
        resume_from: Option<u64>,
    ) -> StreamResponse {
        let stream = StreamId::for_key(&self.class.key);

        if let Some(from) = resume_from {
            match self.registry.stream_state(&stream).await {
                Ok(Some(state)) => {
                    tracing::info!(
                        user=%self.class.key.user_id,
                        key=%self.class.key.path,
                        active=state.active,
                        resume_from=from,
                        "replaying stream buffer"
                    );
                    return StreamResponse::Frames {
                        frames: self.replay().follow(from),
                        request_number: None,
                    };
                }
                Ok(None) => {}
                Err(e) => return self.settled_stream(Outcome::Failed(e.to_string()), None),
            }
        }

        let outstanding = self.enter().await;
        let admitted = match self.admit_inner(true).await {
            Ok(admitted) => admitted,
            Err(e) => {
                Self::leave(&self.registry, self.user(), &self.token).await;
                return self.settled_stream(Outcome::Failed(e.to_string()), None);
            }
        };
        let request_number = self.request_number(outstanding);

        match admitted {
            Admitted::Owner(_) => {
                if let Err(e) = self.registry.open_stream(&stream, &self.token).await {
                    if let Err(e) = self.registry.delete_stream(&stream).await {
                        tracing::warn!(user=%self.user(), error=%e, "failed to discard stream buffer");
                    }
                    let outcome = self.finalize(Err(ExecutorError::logic(e.to_string()))).await;
                    Self::leave(&self.registry, self.user(), &self.token).await;
                    return self.settled_stream(outcome, request_number);
                }
                let (tx, frames) = FrameSink::live_channel();
                let sink = FrameSink::new(self.registry.clone(), stream, self.token.clone(), Some(tx));
                let params = self.params(query, body);
                tokio::spawn(async move {
                    let registry = self.registry.clone();
                    let user = self.user().to_string();
                    let token = self.token.clone();
                    self.produce(executor, params, sink).await;
                    Self::leave(&registry, &user, &token).await;
                });
                StreamResponse::Frames {
                    frames,
                    request_number,
                }
            }
            Admitted::Duplicate(holder) => {
                Self::leave(&self.registry, self.user(), &self.token).await;
                tracing::info!(
                    user=%self.class.key.user_id,
                    key=%self.class.key.path,
                    owner=%holder.owner_token,
                    "joining stream in flight"
                );
                StreamResponse::Frames {
                    frames: self.replay().follow(resume_from.unwrap_or(0)),
                    request_number,
                }
            }
            Admitted::Settled(outcome) => {
                Self::leave(&self.registry, self.user(), &self.token).await;
                self.settled_stream(outcome, request_number)
            }
        }
    }

    fn settled_stream(&self, outcome: Outcome, request_number: Option<u64>) -> StreamResponse {
        StreamResponse::Settled(CoordinatedResponse {
            outcome,
            request_number,
        })
    }

    async fn produce(
        mut self,
        executor: Arc<dyn StreamingExecutor>,
        params: RequestParams,
        mut sink: FrameSink,
    ) {
        let checker = self.checker();
        let result = {
            let _keepalive = self.keepalive();
            self.state = RequestState::Executing;
            executor.execute_stream(&checker, &params, &mut sink).await
        };
        let result = result.map(|mut r| {
            r.is_stream = true;
            r
        });

        let (status, error) = match &result {
            Ok(_) => (RecordStatus::Completed, None),
            Err(ExecutorError::Cancelled) => (RecordStatus::Cancelled, None),
            Err(e) => (RecordStatus::Error, Some(e.to_string())),
        };
        let frames = sink.emitted();
        sink.finish(status, error.as_deref(), self.cfg.stream_grace).await;

        let outcome = self.finalize(result).await;
        tracing::info!(
            user=%self.class.key.user_id,
            key=%self.class.key.path,
            frames,
            outcome=outcome.label(),
            "stream finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_stream::StreamExt;

    use folio_common::StreamFrame;
    use folio_meta::{MemoryMetaStore, MetaStore, RegistryConfig};

    use super::*;
    use crate::outcome::CANCELLED_MESSAGE;
    use crate::stream::IndexedFrame;

    fn coordinator(record_ttl: Duration, wait_timeout: Duration) -> Coordinator {
        coordinator_on(Arc::new(MemoryMetaStore::new()), record_ttl, wait_timeout)
    }

    fn coordinator_on(
        store: Arc<dyn MetaStore>,
        record_ttl: Duration,
        wait_timeout: Duration,
    ) -> Coordinator {
        let registry = Registry::new(
            store,
            RegistryConfig {
                namespace: "/test".to_string(),
                record_ttl,
                result_ttl: Duration::from_secs(2),
                stream_ttl: Duration::from_secs(5),
            },
        );
        let cfg = CoordinatorConfig {
            wait_timeout,
            poll_interval: Duration::from_millis(10),
            max_transient_retries: 2,
            retry_backoff: Duration::from_millis(10),
            stream_grace: Duration::from_secs(2),
            cancel_check_interval: 1,
        };
        Coordinator::new(registry, PriorityTable::default(), cfg)
    }

    fn default_coordinator() -> Coordinator {
        coordinator(Duration::from_secs(5), Duration::from_secs(3))
    }

    /// Sleeps in small steps, checking cancellation between them.
    #[derive(Default)]
    struct Scripted {
        calls: AtomicU32,
        running: AtomicI32,
        peak: AtomicI32,
        delay: Duration,
        transient_failures: u32,
        error: Option<ExecutorError>,
    }

    impl Scripted {
        fn sleeping(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OperationExecutor for Scripted {
        async fn execute(
            &self,
            cancel: &CancellationChecker,
            params: &RequestParams,
        ) -> Result<OperationResult, ExecutorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.transient_failures {
                return Err(ExecutorError::Transient("session restarting".into()));
            }
            if let Some(e) = &self.error {
                return Err(e.clone());
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let mut result = Ok(OperationResult::ok(
                json!({ "path": params.key.path, "call": n }),
            ));
            for _ in 0..(self.delay.as_millis() / 10).max(1) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if let Err(e) = cancel.ensure_active().await {
                    result = Err(e);
                    break;
                }
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    /// Records whether another request's flag was already up when it started.
    struct FlagWitness {
        registry: Registry,
        watched_token: String,
        saw_flag: AtomicBool,
    }

    #[async_trait]
    impl OperationExecutor for FlagWitness {
        async fn execute(
            &self,
            _cancel: &CancellationChecker,
            params: &RequestParams,
        ) -> Result<OperationResult, ExecutorError> {
            let flagged = self
                .registry
                .is_cancelled(&params.key.user_id, &self.watched_token)
                .await
                .unwrap_or(false);
            self.saw_flag.store(flagged, Ordering::SeqCst);
            Ok(OperationResult::ok(json!({ "navigated": true })))
        }
    }

    struct Pages {
        calls: AtomicU32,
        frames: u32,
        delay: Duration,
    }

    impl Pages {
        fn new(frames: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                frames,
                delay,
            })
        }
    }

    #[async_trait]
    impl StreamingExecutor for Pages {
        async fn execute_stream(
            &self,
            cancel: &CancellationChecker,
            _params: &RequestParams,
            sink: &mut FrameSink,
        ) -> Result<OperationResult, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for i in 0..self.frames {
                cancel.ensure_active().await?;
                sink.emit(StreamFrame::new("book", json!({ "n": i }))).await;
                tokio::time::sleep(self.delay).await;
            }
            Ok(OperationResult::stream_summary(sink.emitted()))
        }
    }

    /// Memory store that refuses to write stream state.
    struct NoStreamState(Arc<MemoryMetaStore>);

    #[async_trait]
    impl MetaStore for NoStreamState {
        async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> anyhow::Result<u64> {
            if key.contains("/streams/") && key.ends_with("/state") {
                anyhow::bail!("stream state unavailable");
            }
            self.0.put(key, value, ttl_ms).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, u64)>> {
            self.0.get(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<u64> {
            self.0.delete(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>, u64)>> {
            self.0.list_prefix(prefix).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_revision: u64,
            value: Vec<u8>,
            ttl_ms: Option<u64>,
        ) -> anyhow::Result<(bool, u64)> {
            self.0.compare_and_swap(key, expected_revision, value, ttl_ms).await
        }

        async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> anyhow::Result<bool> {
            self.0.compare_and_delete(key, expected_revision).await
        }
    }

    async fn drain(resp: StreamResponse) -> Vec<IndexedFrame> {
        match resp {
            StreamResponse::Frames { frames, .. } => frames.collect().await,
            StreamResponse::Settled(r) => panic!("expected frames, got {}", r.status_code()),
        }
    }

    fn sentinel_count(frames: &[IndexedFrame]) -> usize {
        frames.iter().filter(|(_, f)| f.is_sentinel()).count()
    }

    async fn wait_until_released(coord: &Coordinator, user: &str) {
        for _ in 0..200 {
            if coord.registry().get_active(user).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slot of {user} was never released");
    }

    #[tokio::test]
    async fn test_identical_requests_execute_once() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(100));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coord = coord.clone();
            let op = op.clone();
            handles.push(tokio::spawn(async move {
                coord.request("u1", "/state", "GET").run(&*op, None, None).await
            }));
        }

        let mut executed = 0;
        for h in handles {
            let resp = h.await.unwrap();
            assert_eq!(resp.status_code(), 200);
            assert_eq!(resp.outcome.body(), json!({"path": "/state", "call": 1}));
            if matches!(resp.outcome, Outcome::Executed(_)) {
                executed += 1;
            }
        }
        assert_eq!(op.calls(), 1);
        assert_eq!(executed, 1);
        assert!(coord.registry().get_active("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_execution_per_user_at_a_time() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(60));

        let a = {
            let (coord, op) = (coord.clone(), op.clone());
            tokio::spawn(async move { coord.request("u1", "/auth", "POST").run(&*op, None, None).await })
        };
        let b = {
            let (coord, op) = (coord.clone(), op.clone());
            tokio::spawn(async move {
                coord.request("u1", "/screenshot", "GET").run(&*op, None, None).await
            })
        };

        assert_eq!(a.await.unwrap().status_code(), 200);
        assert_eq!(b.await.unwrap().status_code(), 200);
        assert_eq!(op.calls(), 2);
        assert_eq!(op.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_users_do_not_block_each_other() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(100));

        let handles: Vec<_> = ["u1", "u2"]
            .into_iter()
            .map(|user| {
                let (coord, op) = (coord.clone(), op.clone());
                tokio::spawn(async move { coord.request(user, "/state", "GET").run(&*op, None, None).await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().status_code(), 200);
        }
        assert_eq!(op.calls(), 2);
        assert_eq!(op.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_higher_priority_preempts_owner_and_its_duplicates() {
        let coord = default_coordinator();
        let slow = Scripted::sleeping(Duration::from_secs(2));

        let low = coord.request("u1", "/books", "GET");
        let low_token = low.owner_token().to_string();
        let low_handle = {
            let slow = slow.clone();
            tokio::spawn(async move { low.run(&*slow, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dup_handle = {
            let (coord, slow) = (coord.clone(), slow.clone());
            tokio::spawn(async move { coord.request("u1", "/books", "GET").run(&*slow, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let witness = FlagWitness {
            registry: coord.registry().clone(),
            watched_token: low_token,
            saw_flag: AtomicBool::new(false),
        };
        let started = Instant::now();
        let high = coord.request("u1", "/navigate", "POST").run(&witness, None, None).await;
        assert_eq!(high.status_code(), 200);
        assert!(witness.saw_flag.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_millis(500));

        let low = low_handle.await.unwrap();
        assert_eq!(low.status_code(), 409);
        assert_eq!(low.outcome.body(), json!({"error": CANCELLED_MESSAGE}));

        let dup = dup_handle.await.unwrap();
        assert_eq!(dup.outcome, Outcome::Cancelled);
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn test_lower_priority_waits_for_higher() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(100));

        let nav = {
            let (coord, op) = (coord.clone(), op.clone());
            tokio::spawn(async move { coord.request("u1", "/navigate", "POST").run(&*op, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let books = coord.request("u1", "/books", "GET").run(&*op, None, None).await;
        assert_eq!(books.status_code(), 200);
        assert_eq!(books.outcome.body()["call"], 2);
        assert_eq!(nav.await.unwrap().status_code(), 200);
        assert_eq!(op.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_one_wins_supersedes_same_key() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(300));

        let first = {
            let (coord, op) = (coord.clone(), op.clone());
            tokio::spawn(async move {
                coord.request("u1", "/open-random-book", "POST").run(&*op, None, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = coord.request("u1", "/open-random-book", "POST").run(&*op, None, None).await;
        assert_eq!(second.status_code(), 200);
        assert_eq!(first.await.unwrap().status_code(), 409);
        assert_eq!(op.calls(), 2);
    }

    #[tokio::test]
    async fn test_slot_reclaimed_after_owner_crash() {
        let coord = coordinator(Duration::from_millis(300), Duration::from_secs(3));
        let crashed = RequestRecord::pending(
            RequestKey::new("u1", "/open-book", "POST"),
            "crashed",
            PriorityTier::Session,
            1,
        );
        coord.registry().try_claim(&crashed, false).await.unwrap();

        let op = Scripted::sleeping(Duration::from_millis(10));
        let started = Instant::now();
        let resp = coord.request("u1", "/state", "GET").run(&*op, None, None).await;
        assert_eq!(resp.status_code(), 200);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_readmitted_when_owner_vanishes() {
        let coord = coordinator(Duration::from_millis(300), Duration::from_secs(3));
        let crashed = RequestRecord::pending(
            RequestKey::new("u1", "/state", "GET"),
            "crashed",
            PriorityTier::Read,
            1,
        );
        coord.registry().try_claim(&crashed, false).await.unwrap();

        let op = Scripted::sleeping(Duration::from_millis(10));
        let mut req = coord.request("u1", "/state", "GET");
        assert!(matches!(req.admit().await.unwrap(), Admission::Owner { displaced: None }));
        assert_eq!(req.state(), RequestState::Owner);

        let params = req.params(None, None);
        let result = req.execute(&*op, &params).await;
        let outcome = req.finalize(result).await;
        assert_eq!(outcome.status_code(), 200);
        assert_eq!(req.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let coord = coordinator(Duration::from_secs(5), Duration::from_millis(200));
        let holder = RequestRecord::pending(
            RequestKey::new("u1", "/open-book", "POST"),
            "stuck",
            PriorityTier::Session,
            1,
        );
        coord.registry().try_claim(&holder, false).await.unwrap();

        let op = Scripted::sleeping(Duration::from_millis(10));
        let started = Instant::now();
        let mut req = coord.request("u1", "/state", "GET");
        let admission = req.admit().await.unwrap();

        assert_eq!(admission, Admission::Settled(Outcome::TimedOut));
        assert_eq!(req.state(), RequestState::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(op.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_wait_is_bounded() {
        let coord = coordinator(Duration::from_secs(5), Duration::from_millis(200));
        let holder = RequestRecord::pending(
            RequestKey::new("u1", "/state", "GET"),
            "stuck",
            PriorityTier::Read,
            1,
        );
        coord.registry().try_claim(&holder, false).await.unwrap();

        let op = Scripted::sleeping(Duration::from_millis(10));
        let started = Instant::now();
        let resp = coord.request("u1", "/state", "GET").run(&*op, None, None).await;

        assert_eq!(resp.outcome, Outcome::TimedOut);
        assert_eq!(resp.status_code(), 408);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(op.calls(), 0);
        assert!(coord
            .registry()
            .get_active("u1")
            .await
            .unwrap()
            .unwrap()
            .is_owned_by("stuck"));
    }

    #[tokio::test]
    async fn test_query_parameters_separate_requests() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(100));

        let handles: Vec<_> = ["/books?title=dune", "/books?title=emma", "/books?_t=7&title=dune"]
            .into_iter()
            .map(|target| {
                let (coord, op) = (coord.clone(), op.clone());
                tokio::spawn(async move { coord.request("u1", target, "GET").run(&*op, None, None).await })
            })
            .collect();
        let mut bodies = Vec::new();
        for h in handles {
            let resp = h.await.unwrap();
            assert_eq!(resp.status_code(), 200);
            bodies.push(resp.outcome.body());
        }

        assert_eq!(op.calls(), 2);
        assert_eq!(bodies[0], bodies[2]);
        assert_ne!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let coord = default_coordinator();
        let flaky = Scripted {
            transient_failures: 2,
            ..Default::default()
        };
        let resp = coord.request("u1", "/state", "GET").run(&flaky, None, None).await;
        assert_eq!(resp.status_code(), 200);
        assert_eq!(flaky.calls(), 3);

        let broken = Scripted {
            transient_failures: u32::MAX,
            ..Default::default()
        };
        let resp = coord.request("u1", "/state", "GET").run(&broken, None, None).await;
        assert_eq!(resp.status_code(), 503);
        assert_eq!(broken.calls(), 3);
    }

    #[tokio::test]
    async fn test_logic_errors_are_not_retried() {
        let coord = default_coordinator();
        let op = Scripted {
            error: Some(ExecutorError::bad_request("unknown book")),
            ..Default::default()
        };
        let resp = coord.request("u1", "/open-book", "POST").run(&op, None, None).await;
        assert_eq!(resp.status_code(), 400);
        assert_eq!(resp.body(), json!({"error": "unknown book"}));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test]
    async fn test_passthrough_skips_coordination() {
        let coord = default_coordinator();
        let op = Scripted::sleeping(Duration::from_millis(50));

        let handles: Vec<_> = [("/staff-auth", "POST"), ("/state", "DELETE")]
            .into_iter()
            .map(|(path, method)| {
                let (coord, op) = (coord.clone(), op.clone());
                tokio::spawn(async move { coord.request("u1", path, method).run(&*op, None, None).await })
            })
            .collect();
        for h in handles {
            let resp = h.await.unwrap();
            assert_eq!(resp.status_code(), 200);
            assert_eq!(resp.request_number, None);
        }
        assert_eq!(op.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finished_stream_replays_from_index() {
        let coord = default_coordinator();
        let pages = Pages::new(5, Duration::from_millis(5));

        let live = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, None)
            .await;
        let frames = drain(live).await;
        assert_eq!(frames.len(), 6);
        assert_eq!(frames.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(frames[5].1.data["status"], "completed");

        let replay = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, Some(3))
            .await;
        let tail = drain(replay).await;
        assert_eq!(tail.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(sentinel_count(&tail), 1);
        assert_eq!(pages.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_request_reruns_finished_stream() {
        let coord = default_coordinator();
        let pages = Pages::new(5, Duration::from_millis(20));

        let first = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, None)
            .await;
        let StreamResponse::Frames { frames: mut live, .. } = first else {
            panic!("expected a live stream");
        };
        live.next().await;

        let op = Scripted::sleeping(Duration::from_millis(10));
        let nav = coord.request("u1", "/navigate", "POST").run(&*op, None, None).await;
        assert_eq!(nav.status_code(), 200);
        let cut: Vec<_> = live.collect().await;
        assert_eq!(cut.last().unwrap().1.data["status"], "cancelled");
        wait_until_released(&coord, "u1").await;

        let rerun = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, None)
            .await;
        let frames = drain(rerun).await;
        assert_eq!(frames.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(frames[5].1.data["status"], "completed");
        assert_eq!(sentinel_count(&frames), 1);
        assert_eq!(pages.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_stream_open_discards_buffer() {
        let memory = Arc::new(MemoryMetaStore::new());
        let healthy = coordinator_on(memory.clone(), Duration::from_secs(5), Duration::from_secs(3));
        let broken = coordinator_on(
            Arc::new(NoStreamState(memory)),
            Duration::from_secs(5),
            Duration::from_secs(3),
        );

        let pages = Pages::new(2, Duration::from_millis(5));
        let earlier = healthy
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, None)
            .await;
        assert_eq!(drain(earlier).await.len(), 3);
        wait_until_released(&healthy, "u1").await;

        let resp = broken
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, None)
            .await;
        let StreamResponse::Settled(resp) = resp else {
            panic!("expected the request to fail before streaming");
        };
        assert_eq!(resp.status_code(), 500);
        assert_eq!(pages.calls.load(Ordering::SeqCst), 1);

        let stream = StreamId::for_key(&RequestKey::new("u1", "/books-stream", "GET"));
        assert!(healthy.registry().stream_state(&stream).await.unwrap().is_none());
        assert!(healthy.registry().read_frames(&stream, 0).await.unwrap().is_empty());
        assert!(healthy.registry().get_active("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_joins_active_stream() {
        let coord = default_coordinator();
        let pages = Pages::new(5, Duration::from_millis(30));

        let first = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, None)
            .await;
        let StreamResponse::Frames { frames: mut live, .. } = first else {
            panic!("expected a live stream");
        };
        assert_eq!(live.next().await.map(|(i, _)| i), Some(0));
        assert_eq!(live.next().await.map(|(i, _)| i), Some(1));

        let resumed = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages.clone(), None, None, Some(1))
            .await;
        let rest = drain(resumed).await;
        assert_eq!(rest.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(sentinel_count(&rest), 1);

        let live_rest: Vec<_> = live.collect().await;
        assert_eq!(sentinel_count(&live_rest), 1);
        assert_eq!(pages.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preempted_stream_ends_with_cancelled_sentinel() {
        let coord = default_coordinator();
        let pages = Pages::new(50, Duration::from_millis(20));

        let resp = coord
            .request("u1", "/books-stream", "GET")
            .run_stream(pages, None, None, None)
            .await;
        let StreamResponse::Frames { frames: mut live, .. } = resp else {
            panic!("expected a live stream");
        };
        live.next().await;

        let op = Scripted::sleeping(Duration::from_millis(10));
        let nav = coord.request("u1", "/navigate", "POST").run(&*op, None, None).await;
        assert_eq!(nav.status_code(), 200);

        let rest: Vec<_> = live.collect().await;
        let (_, last) = rest.last().unwrap();
        assert!(last.is_sentinel());
        assert_eq!(last.data["status"], "cancelled");
        assert!(rest.len() < 50);
    }
}
