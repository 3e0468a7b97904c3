// # pagekv server
//
// Entry point: initializes logging, opens the store (running WAL
// recovery), starts the metrics exporter and the TCP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pagekv::net::Server;
use pagekv::{metrics, Config, Result, Store, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config = Config::from_env()?;
    info!("pagekv {VERSION} starting");
    info!(data_dir = %config.data_dir.display(), port = config.port, "configuration");

    let store = Arc::new(Store::open(&config)?);
    info!("store opened, recovery complete");

    if config.enable_metrics {
        let registry = store.metrics();
        let addr: SocketAddr = format!("{}:{}", config.listen_address, config.metrics_port)
            .parse()
            .map_err(|e| pagekv::DbError::Config(format!("metrics address: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(registry, addr).await {
                error!(error = %e, "metrics exporter stopped");
            }
        });
        start_monitor(store.clone());
    }

    let server = Server::new(store, config);
    server.run().await
}

/// Refresh the file-size and checkpoint gauges once a second.
fn start_monitor(store: Arc<Store>) {
    tokio::spawn(async move {
        let registry = store.metrics();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            registry.db_file_size.set(store.data_len() as f64);
            registry.wal_file_size.set(store.wal_len() as f64);
            registry.wal_checkpoint.set(store.checkpoint() as f64);
        }
    });
}
