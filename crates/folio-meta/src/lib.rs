pub mod etcd;
pub mod memory;
pub mod registry;
pub mod types;

pub use etcd::EtcdMetaStore;
pub use memory::MemoryMetaStore;
pub use registry::{ClaimOutcome, Registry, RegistryConfig, StreamId, StreamState};
pub use types::MetaStore;
