pub mod frame;
pub mod key;
pub mod record;
pub mod util;

pub use frame::StreamFrame;
pub use key::RequestKey;
pub use record::{PriorityTier, RecordStatus, RequestRecord};

pub mod telemetry;
