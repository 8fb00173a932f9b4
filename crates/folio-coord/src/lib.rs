pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod priority;
pub mod stream;

pub use cancel::CancellationChecker;
pub use config::CoordinatorConfig;
pub use coordinator::{Admission, CoordinatedRequest, Coordinator, RequestState, StreamResponse};
pub use error::CoordError;
pub use executor::{
    ExecutorError, OperationExecutor, OperationResult, RequestParams, StreamingExecutor,
};
pub use outcome::{CoordinatedResponse, Outcome, CANCELLED_MESSAGE, TIMEOUT_MESSAGE};
pub use priority::{AdmissionPolicy, Classification, PriorityTable, RouteRule};
pub use stream::{FrameSink, FrameStream, IndexedFrame, StreamReplay};
