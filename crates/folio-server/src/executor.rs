use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use folio_common::StreamFrame;
use folio_coord::{
    CancellationChecker, ExecutorError, FrameSink, OperationExecutor, OperationResult,
    RequestParams, StreamingExecutor,
};

pub const USER_HEADER: &str = "x-folio-user";
pub const TOKEN_HEADER: &str = "x-folio-token";

fn classify_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timeout";
    }
    if error.is_connect() {
        return "connect";
    }
    "other"
}

fn send_error(error: reqwest::Error) -> ExecutorError {
    match classify_reqwest_error(&error) {
        "other" => ExecutorError::Logic {
            status_code: 502,
            message: format!("worker request failed: {error}"),
        },
        kind => ExecutorError::Transient(format!("worker {kind}: {error}")),
    }
}

/// Worker reply body: JSON when it parses, the raw text otherwise.
fn parse_payload(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn error_message(payload: &Value, status: u16) -> String {
    match payload {
        Value::Object(map) => map
            .get("error")
            .or_else(|| map.get("detail"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| format!("worker returned {status}")),
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => format!("worker returned {status}"),
    }
}

/// Map a non-success worker status to an executor error.
fn status_error(status: u16, payload: &Value) -> ExecutorError {
    let message = error_message(payload, status);
    match status {
        502..=504 => ExecutorError::Transient(message),
        _ => ExecutorError::Logic {
            status_code: status,
            message,
        },
    }
}

fn event_frame(event: Event) -> StreamFrame {
    let name = if event.event.is_empty() {
        "message".to_string()
    } else {
        event.event
    };
    let data = serde_json::from_str(&event.data).unwrap_or(Value::String(event.data));
    StreamFrame::new(name, data)
}

/// Decode a worker's `text/event-stream` body into frames. Events are cut on
/// raw bytes, so a character split across chunks arrives intact.
fn worker_frames<S, B, E>(body: S) -> impl Stream<Item = Result<StreamFrame, ExecutorError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    body.eventsource().map(|event| {
        event
            .map(event_frame)
            .map_err(|e| ExecutorError::Transient(format!("worker stream interrupted: {e}")))
    })
}

/// Forwards operations to the automation worker over HTTP.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    http: reqwest::Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, params: &RequestParams) -> Result<reqwest::RequestBuilder, ExecutorError> {
        let method = reqwest::Method::from_bytes(params.key.method.as_bytes())
            .map_err(|_| ExecutorError::bad_request(format!("unsupported method {}", params.key.method)))?;
        let url = match params.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}{}?{q}", self.base_url, params.key.path),
            _ => format!("{}{}", self.base_url, params.key.path),
        };

        let mut builder = self
            .http
            .request(method, url)
            .header(USER_HEADER, params.key.user_id.as_str())
            .header(TOKEN_HEADER, params.owner_token.as_str());
        if let Some(body) = params.body.as_ref() {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

#[async_trait]
impl OperationExecutor for HttpExecutor {
    async fn execute(
        &self,
        cancel: &CancellationChecker,
        params: &RequestParams,
    ) -> Result<OperationResult, ExecutorError> {
        cancel.ensure_active().await?;

        let resp = self.request(params)?.send().await.map_err(|e| {
            tracing::error!(error=%e, retry_kind=classify_reqwest_error(&e), "worker request failed");
            send_error(e)
        })?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(send_error)?;
        let payload = parse_payload(&bytes);

        // the worker finished, but a preempting request owns the session now
        cancel.ensure_active().await?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &payload));
        }
        Ok(OperationResult::with_status(payload, status))
    }
}

#[async_trait]
impl StreamingExecutor for HttpExecutor {
    async fn execute_stream(
        &self,
        cancel: &CancellationChecker,
        params: &RequestParams,
        sink: &mut FrameSink,
    ) -> Result<OperationResult, ExecutorError> {
        cancel.ensure_active().await?;

        let resp = self
            .request(params)?
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(send_error)?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let bytes = resp.bytes().await.unwrap_or_default();
            return Err(status_error(status, &parse_payload(&bytes)));
        }

        let mut frames = std::pin::pin!(worker_frames(resp.bytes_stream()));
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if frame.is_sentinel() {
                // the worker's own terminal frame; ours is appended by the sink
                if let Some(err) = frame.data.get("error").and_then(Value::as_str) {
                    return Err(ExecutorError::logic(err));
                }
                break;
            }
            if cancel.check().await {
                return Err(ExecutorError::Cancelled);
            }
            sink.emit(frame).await;
        }
        Ok(OperationResult::stream_summary(sink.emitted()))
    }
}
