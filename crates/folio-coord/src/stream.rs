use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use folio_common::{RecordStatus, StreamFrame};
use folio_meta::{Registry, StreamId};

/// A frame together with its position in the replay buffer.
pub type IndexedFrame = (u64, StreamFrame);

pub type FrameStream = ReceiverStream<IndexedFrame>;

const LIVE_CHANNEL_CAPACITY: usize = 64;

/// Write side of a stream: every frame is persisted to the replay buffer
/// before it goes to the live client.
pub struct FrameSink {
    registry: Registry,
    stream: StreamId,
    owner_token: String,
    live: Option<mpsc::Sender<IndexedFrame>>,
    emitted: u64,
}

impl FrameSink {
    pub(crate) fn new(
        registry: Registry,
        stream: StreamId,
        owner_token: String,
        live: Option<mpsc::Sender<IndexedFrame>>,
    ) -> Self {
        Self {
            registry,
            stream,
            owner_token,
            live,
            emitted: 0,
        }
    }

    /// Channel pair for an owner that has a live client attached.
    pub(crate) fn live_channel() -> (mpsc::Sender<IndexedFrame>, FrameStream) {
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        (tx, ReceiverStream::new(rx))
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Persist `frame` and forward it to the live client, if still connected.
    /// Returns the frame's index.
    pub async fn emit(&mut self, frame: StreamFrame) -> u64 {
        let index = match self.registry.append_frame(&self.stream, &frame).await {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(
                    user=%self.stream.user_id,
                    stream=%self.stream.fingerprint,
                    error=%e,
                    "failed to buffer stream frame"
                );
                self.emitted
            }
        };
        self.emitted = index + 1;

        if let Err(e) = self.registry.touch_stream(&self.stream, &self.owner_token).await {
            tracing::debug!(error=%e, "failed to extend stream buffer ttl");
        }

        if let Some(tx) = self.live.as_ref() {
            if tx.send((index, frame)).await.is_err() {
                tracing::debug!(
                    user=%self.stream.user_id,
                    "live client went away, continuing into the replay buffer"
                );
                self.live = None;
            }
        }
        index
    }

    /// Append the sentinel and mark the buffer inactive for `grace`.
    pub(crate) async fn finish(mut self, status: RecordStatus, error: Option<&str>, grace: Duration) {
        self.emit(StreamFrame::sentinel_for(status, error)).await;
        if let Err(e) = self
            .registry
            .close_stream(&self.stream, &self.owner_token, grace)
            .await
        {
            tracing::warn!(user=%self.stream.user_id, error=%e, "failed to close stream buffer");
        }
    }
}

/// Read side of a stream, for reconnecting clients and duplicate callers.
#[derive(Debug, Clone)]
pub struct StreamReplay {
    registry: Registry,
    stream: StreamId,
    poll_interval: Duration,
    idle_timeout: Duration,
}

impl StreamReplay {
    pub fn new(
        registry: Registry,
        stream: StreamId,
        poll_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stream,
            poll_interval,
            idle_timeout,
        }
    }

    /// Buffered frames from `from_index` on, then the live tail, ending with
    /// exactly one sentinel.
    pub fn follow(self, from_index: u64) -> FrameStream {
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        tokio::spawn(async move { self.pump(from_index, tx).await });
        ReceiverStream::new(rx)
    }

    async fn pump(self, from_index: u64, tx: mpsc::Sender<IndexedFrame>) {
        let mut next = from_index;
        let mut last_progress = Instant::now();
        let mut seen_state = false;
        let mut inactive_polls = 0u32;

        loop {
            match self.registry.read_frames(&self.stream, next).await {
                Ok(frames) if !frames.is_empty() => {
                    for (index, frame) in frames {
                        let sentinel = frame.is_sentinel();
                        if tx.send((index, frame)).await.is_err() {
                            return;
                        }
                        next = index + 1;
                        if sentinel {
                            return;
                        }
                    }
                    last_progress = Instant::now();
                    inactive_polls = 0;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user=%self.stream.user_id, error=%e, "failed to read stream buffer");
                }
            }

            match self.registry.stream_state(&self.stream).await {
                Ok(Some(state)) => {
                    seen_state = true;
                    if state.active {
                        let preempted = self
                            .registry
                            .is_cancelled(&self.stream.user_id, &state.owner_token)
                            .await
                            .unwrap_or(false);
                        if preempted {
                            let _ = tx
                                .send((next, StreamFrame::sentinel_for(RecordStatus::Cancelled, None)))
                                .await;
                            return;
                        }
                    } else {
                        // the sentinel lands before the buffer goes inactive,
                        // so give the next read one chance to pick it up
                        inactive_polls += 1;
                        if inactive_polls > 1 {
                            let last = self.final_sentinel().await.unwrap_or_else(|| {
                                let frame = StreamFrame::sentinel_for(
                                    RecordStatus::Error,
                                    Some("stream ended without a final frame"),
                                );
                                (next, frame)
                            });
                            let _ = tx.send(last).await;
                            return;
                        }
                        continue;
                    }
                }
                Ok(None) if seen_state => {
                    let frame = StreamFrame::sentinel_for(RecordStatus::Error, Some("stream expired"));
                    let _ = tx.send((next, frame)).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user=%self.stream.user_id, error=%e, "failed to read stream state");
                }
            }

            if last_progress.elapsed() >= self.idle_timeout {
                let _ = tx.send((next, StreamFrame::sentinel("timeout", None))).await;
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The closing sentinel of a finished buffer, for followers that resume
    /// past its end.
    async fn final_sentinel(&self) -> Option<IndexedFrame> {
        match self.registry.read_frames(&self.stream, 0).await {
            Ok(frames) => frames.into_iter().last().filter(|(_, f)| f.is_sentinel()),
            Err(e) => {
                tracing::warn!(user=%self.stream.user_id, error=%e, "failed to read stream buffer");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio_stream::StreamExt;

    use folio_common::RequestKey;
    use folio_meta::{MemoryMetaStore, RegistryConfig};

    use super::*;

    fn buffer() -> (Registry, StreamId) {
        let registry = Registry::new(Arc::new(MemoryMetaStore::new()), RegistryConfig::default());
        let stream = StreamId::for_key(&RequestKey::new("u1", "/books-stream", "GET"));
        (registry, stream)
    }

    async fn finished_buffer(frames: u64) -> (Registry, StreamId) {
        let (registry, stream) = buffer();
        registry.open_stream(&stream, "tok").await.unwrap();
        let mut sink = FrameSink::new(registry.clone(), stream.clone(), "tok".to_string(), None);
        for n in 0..frames {
            sink.emit(StreamFrame::new("book", json!({ "n": n }))).await;
        }
        sink.finish(RecordStatus::Completed, None, Duration::from_secs(5)).await;
        (registry, stream)
    }

    fn replay(registry: Registry, stream: StreamId) -> StreamReplay {
        StreamReplay::new(registry, stream, Duration::from_millis(10), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_follow_finished_buffer_from_middle() {
        let (registry, stream) = finished_buffer(3).await;
        let frames: Vec<_> = replay(registry, stream).follow(1).collect().await;
        assert_eq!(frames.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(frames[2].1.is_sentinel());
    }

    #[tokio::test]
    async fn test_resume_past_end_yields_final_sentinel() {
        let (registry, stream) = finished_buffer(3).await;
        let frames: Vec<_> = replay(registry, stream).follow(10).collect().await;
        assert_eq!(frames.len(), 1);
        let (index, frame) = &frames[0];
        assert_eq!(*index, 3);
        assert!(frame.is_sentinel());
        assert_eq!(frame.data, json!({ "status": "completed" }));
    }

    #[tokio::test]
    async fn test_buffer_closed_without_sentinel_ends_in_error() {
        let (registry, stream) = buffer();
        registry.open_stream(&stream, "tok").await.unwrap();
        registry
            .append_frame(&stream, &StreamFrame::new("book", json!({ "n": 0 })))
            .await
            .unwrap();
        registry
            .close_stream(&stream, "tok", Duration::from_secs(5))
            .await
            .unwrap();

        let frames: Vec<_> = replay(registry, stream).follow(0).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].0, 1);
        assert_eq!(frames[1].1.data["status"], "error");
    }
}
