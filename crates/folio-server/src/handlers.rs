use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use folio_coord::{
    CancellationChecker, CoordinatedResponse, FrameStream, Outcome, RequestParams, StreamResponse,
};
use folio_common::RequestKey;

use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const REQUEST_NUMBER_HEADER: &str = "x-request-number";

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn cancellation_status(
    State(st): State<AppState>,
    Path((user_id, token)): Path<(String, String)>,
) -> Response {
    match st.coordinator.registry().is_cancelled(&user_id, &token).await {
        Ok(cancelled) => Json(json!({
            "user_id": user_id,
            "token": token,
            "cancelled": cancelled,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(user=%user_id, error=%e, "cancellation lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

pub async fn active_request(State(st): State<AppState>, Path(user_id): Path<String>) -> Response {
    match st.coordinator.registry().get_active(&user_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no active request"),
        Err(e) => {
            tracing::error!(user=%user_id, error=%e, "active record lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn user_id(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get("user_id").map(String::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// First buffer index a reconnecting client still needs: one past
/// `Last-Event-ID`, or an explicit `from_index` query parameter. `None` for a
/// fresh request.
fn resume_index(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<u64> {
    if let Some(last) = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
    {
        return Some(last.saturating_add(1));
    }
    query.get("from_index").and_then(|s| s.parse::<u64>().ok())
}

fn json_response(resp: &CoordinatedResponse) -> Response {
    let status = StatusCode::from_u16(resp.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = (status, Json(resp.body())).into_response();
    if let Some(n) = resp.request_number {
        out.headers_mut().insert(REQUEST_NUMBER_HEADER, n.into());
    }
    out
}

fn sse_response(frames: FrameStream, request_number: Option<u64>) -> Response {
    let events = frames.map(|(index, frame)| {
        Ok::<_, Infallible>(
            Event::default()
                .id(index.to_string())
                .event(frame.event)
                .data(frame.data.to_string()),
        )
    });
    let mut resp = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Some(n) = request_number {
        resp.headers_mut().insert(REQUEST_NUMBER_HEADER, n.into());
    }
    resp
}

/// Every route the server does not handle itself is an automation operation
/// and goes through the coordinator.
pub async fn coordinate(
    State(st): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    req: Request<Body>,
) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let raw_query = req.uri().query().map(str::to_string);

    let body = match axum::body::to_bytes(req.into_body(), st.max_request_body_bytes).await {
        Ok(b) if b.is_empty() => None,
        Ok(b) => match serde_json::from_slice::<Value>(&b) {
            Ok(v) => Some(v),
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}"))
            }
        },
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    let Some(user) = user_id(&headers, &query) else {
        return uncoordinated(&st, &target, &method, raw_query, body).await;
    };

    let request = st.coordinator.request(&user, &target, &method);

    if request.classification().streaming {
        st.metrics.stream_requests_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let from = resume_index(&headers, &query);
        return match request
            .run_stream(st.stream_executor.clone(), raw_query, body, from)
            .await
        {
            StreamResponse::Frames {
                frames,
                request_number,
            } => sse_response(frames, request_number),
            StreamResponse::Settled(resp) => {
                st.metrics.record_outcome(resp.outcome.label());
                json_response(&resp)
            }
        };
    }

    // a client that disconnects must not abandon a run other callers wait on
    let executor = st.executor.clone();
    let handle =
        tokio::spawn(async move { request.run(executor.as_ref(), raw_query, body).await });
    let resp = match handle.await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(user=%user, key=%path, error=%e, "coordinated run panicked");
            CoordinatedResponse {
                outcome: Outcome::Failed("internal error".to_string()),
                request_number: None,
            }
        }
    };
    st.metrics.record_outcome(resp.outcome.label());
    json_response(&resp)
}

async fn uncoordinated(
    st: &AppState,
    path: &str,
    method: &str,
    query: Option<String>,
    body: Option<Value>,
) -> Response {
    st.metrics.uncoordinated_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let class = st.coordinator.table().classify("", path, method);
    if class.streaming {
        return error_response(StatusCode::BAD_REQUEST, "streaming requests need a user id");
    }

    let params = RequestParams {
        key: RequestKey::new("", path, method),
        owner_token: uuid::Uuid::new_v4().to_string(),
        query,
        body,
    };
    let result = st
        .executor
        .execute(&CancellationChecker::detached(), &params)
        .await;
    json_response(&CoordinatedResponse {
        outcome: Outcome::from_execution(result),
        request_number: None,
    })
}
