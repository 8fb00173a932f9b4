use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use folio_coord::CoordinatorConfig;
use folio_meta::RegistryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Single-process store; coordination does not span replicas.
    Memory,
    Etcd,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "FOLIO_LISTEN_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    #[arg(long, env = "FOLIO_STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    #[arg(long, env = "ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Key prefix shared by every replica of this deployment.
    #[arg(long, env = "FOLIO_NAMESPACE", default_value = "/folio")]
    pub namespace: String,

    /// Base URL of the automation worker that runs the operations.
    #[arg(long, env = "FOLIO_WORKER_URL", default_value = "http://127.0.0.1:18091")]
    pub worker_url: String,

    /// JSON route table; the built-in table is used when unset.
    #[arg(long, env = "FOLIO_PRIORITY_TABLE")]
    pub priority_table: Option<PathBuf>,

    #[arg(long, env = "FOLIO_RECORD_TTL_MS", default_value_t = 130_000)]
    pub record_ttl_ms: u64,

    #[arg(long, env = "FOLIO_RESULT_TTL_MS", default_value_t = 10_000)]
    pub result_ttl_ms: u64,

    #[arg(long, env = "FOLIO_STREAM_TTL_MS", default_value_t = 300_000)]
    pub stream_ttl_ms: u64,

    #[arg(long, env = "FOLIO_STREAM_GRACE_MS", default_value_t = 60_000)]
    pub stream_grace_ms: u64,

    #[arg(long, env = "FOLIO_WAIT_TIMEOUT_MS", default_value_t = 125_000)]
    pub wait_timeout_ms: u64,

    #[arg(long, env = "FOLIO_POLL_INTERVAL_MS", default_value_t = 250)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "FOLIO_MAX_TRANSIENT_RETRIES", default_value_t = 2)]
    pub max_transient_retries: u32,

    #[arg(long, env = "FOLIO_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,

    #[arg(long, env = "FOLIO_WORKER_TIMEOUT_MS", default_value_t = 120_000)]
    pub worker_timeout_ms: u64,

    #[arg(long, env = "FOLIO_MAX_REQUEST_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_request_body_bytes: usize,

    /// `text` or `json`.
    #[arg(long, env = "FOLIO_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP/HTTP endpoint for exporting traces.
    #[arg(long, env = "FOLIO_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint.
    #[arg(long, env = "FOLIO_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            namespace: self.namespace.trim_end_matches('/').to_string(),
            record_ttl: Duration::from_millis(self.record_ttl_ms),
            result_ttl: Duration::from_millis(self.result_ttl_ms),
            stream_ttl: Duration::from_millis(self.stream_ttl_ms),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_transient_retries: self.max_transient_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            stream_grace: Duration::from_millis(self.stream_grace_ms),
            ..CoordinatorConfig::default()
        }
    }
}
