use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use folio_coord::{Coordinator, PriorityTable};
use folio_meta::{EtcdMetaStore, MemoryMetaStore, MetaStore, Registry};
use folio_server::args::{Args, StoreKind};
use folio_server::executor::HttpExecutor;
use folio_server::metrics::Metrics;
use folio_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_guard = folio_common::telemetry::init_tracing(
        "folio-server",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let store: Arc<dyn MetaStore> = match args.store {
        StoreKind::Memory => {
            tracing::warn!("using in-memory registry, coordination is local to this process");
            Arc::new(MemoryMetaStore::new())
        }
        StoreKind::Etcd => Arc::new(
            EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?,
        ),
    };
    let registry = Registry::new(store, args.registry_config());

    let table = match args.priority_table.as_deref() {
        Some(path) => PriorityTable::load(path)?,
        None => PriorityTable::default(),
    };
    let coordinator = Coordinator::new(registry, table, args.coordinator_config());

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_millis(args.worker_timeout_ms))
        .build()?;
    let worker = Arc::new(HttpExecutor::new(http, &args.worker_url));

    let st = AppState {
        coordinator,
        executor: worker.clone(),
        stream_executor: worker,
        metrics: Arc::new(Metrics::default()),
        max_request_body_bytes: args.max_request_body_bytes,
    };
    let app = folio_server::app(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr=%args.listen_addr, worker=%args.worker_url, store=?args.store, "folio server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(provider) = otel_guard {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}
