use std::sync::Arc;

use folio_coord::{Coordinator, OperationExecutor, StreamingExecutor};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub executor: Arc<dyn OperationExecutor>,
    pub stream_executor: Arc<dyn StreamingExecutor>,
    pub metrics: Arc<Metrics>,
    pub max_request_body_bytes: usize,
}
