//! Metrics registry and HTTP exposition.
//!
//! The registry is an observer handed to the engine and the server; the
//! storage contract itself carries no global state. Values are exposed
//! in Prometheus text format on a separate port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;

use crate::error::Result;

/// Monotonically increasing value.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: RwLock<f64>,
}

impl Counter {
    fn new(name: &'static str, help: &'static str) -> Counter {
        Counter {
            name,
            help,
            value: RwLock::new(0.0),
        }
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

/// Value that can move in both directions.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: RwLock<f64>,
}

impl Gauge {
    fn new(name: &'static str, help: &'static str) -> Gauge {
        Gauge {
            name,
            help,
            value: RwLock::new(0.0),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn dec(&self) {
        *self.value.write() -= 1.0;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }
}

pub struct Registry {
    pub connections: Gauge,
    pub db_file_size: Gauge,
    pub wal_file_size: Gauge,
    pub wal_checkpoint: Gauge,
    pub pure_set_duration: Gauge,
    pub lock_set_duration: Gauge,
    pub pure_get_duration: Gauge,
    pub lock_get_duration: Gauge,
    pub pure_del_duration: Gauge,
    pub lock_del_duration: Gauge,
    pub recv_commands: Counter,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            connections: Gauge::new(
                "pagekv_conn_tcp_connection_count",
                "tcp connection count",
            ),
            db_file_size: Gauge::new("pagekv_storage_db_file_size", "db file size"),
            wal_file_size: Gauge::new("pagekv_storage_wal_file_size", "wal file size"),
            wal_checkpoint: Gauge::new(
                "pagekv_storage_wal_checkpoint_size",
                "wal checkpoint size",
            ),
            pure_set_duration: Gauge::new("pagekv_storage_pure_set_duration", "pure set duration"),
            lock_set_duration: Gauge::new("pagekv_storage_lock_set_duration", "lock set duration"),
            pure_get_duration: Gauge::new("pagekv_storage_pure_get_duration", "pure get duration"),
            lock_get_duration: Gauge::new("pagekv_storage_lock_get_duration", "lock get duration"),
            pure_del_duration: Gauge::new("pagekv_storage_pure_del_duration", "pure del duration"),
            lock_del_duration: Gauge::new("pagekv_storage_lock_del_duration", "lock del duration"),
            recv_commands: Counter::new("pagekv_parser_recv_cmd_count", "recv cmd count"),
        }
    }

    fn gauges(&self) -> [&Gauge; 10] {
        [
            &self.connections,
            &self.db_file_size,
            &self.wal_file_size,
            &self.wal_checkpoint,
            &self.pure_set_duration,
            &self.lock_set_duration,
            &self.pure_get_duration,
            &self.lock_get_duration,
            &self.pure_del_duration,
            &self.lock_del_duration,
        ]
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for g in self.gauges() {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
                name = g.name,
                help = g.help,
                value = g.get(),
            ));
        }
        let c = &self.recv_commands;
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
            name = c.name,
            help = c.help,
            value = c.get(),
        ));
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> String {
    registry.render()
}

/// Serve `/metrics` until the process exits.
pub async fn serve(registry: Arc<Registry>, addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics exporter listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
