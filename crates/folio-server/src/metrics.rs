use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub stream_requests_total: AtomicU64,
    pub uncoordinated_total: AtomicU64,
    /// Coordinated requests by how they ended (executed, duplicate, ...).
    outcomes: DashMap<&'static str, AtomicU64>,
}

impl Metrics {
    pub fn record_outcome(&self, label: &'static str) {
        self.outcomes
            .entry(label)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcome_count(&self, label: &str) -> u64 {
        self.outcomes
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let mut body = format!(
            "folio_requests_total {}\nfolio_requests_inflight {}\nfolio_responses_2xx {}\nfolio_responses_4xx {}\nfolio_responses_5xx {}\nfolio_stream_requests_total {}\nfolio_uncoordinated_requests_total {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.requests_inflight.load(Ordering::Relaxed),
            self.status_2xx.load(Ordering::Relaxed),
            self.status_4xx.load(Ordering::Relaxed),
            self.status_5xx.load(Ordering::Relaxed),
            self.stream_requests_total.load(Ordering::Relaxed),
            self.uncoordinated_total.load(Ordering::Relaxed),
        );

        let mut outcomes: Vec<(&'static str, u64)> = self
            .outcomes
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        outcomes.sort_unstable();
        for (label, n) in outcomes {
            body.push_str(&format!("folio_outcomes_total{{outcome=\"{label}\"}} {n}\n"));
        }
        body
    }
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, st.metrics.render())
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
