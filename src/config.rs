use std::env;
use std::path::PathBuf;

use crate::error::{DbError, Result};

/// Server configuration. Defaults serve from `./data` on the standard
/// port; `PAGEKV_*` environment variables override individual fields.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_address: String,
    pub port: u16,
    pub metrics_port: u16,
    pub enable_metrics: bool,
    pub max_connections: usize,
    /// Pin the free-list PRNG for reproducible page placement in tests.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            listen_address: "127.0.0.1".to_string(),
            port: 6379,
            metrics_port: 9091,
            enable_metrics: true,
            max_connections: 10_000,
            rng_seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();
        if let Ok(dir) = env::var("PAGEKV_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = env::var("PAGEKV_LISTEN") {
            config.listen_address = addr;
        }
        if let Ok(port) = env::var("PAGEKV_PORT") {
            config.port = parse_var("PAGEKV_PORT", &port)?;
        }
        if let Ok(port) = env::var("PAGEKV_METRICS_PORT") {
            config.metrics_port = parse_var("PAGEKV_METRICS_PORT", &port)?;
        }
        if let Ok(v) = env::var("PAGEKV_ENABLE_METRICS") {
            config.enable_metrics = parse_var("PAGEKV_ENABLE_METRICS", &v)?;
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| DbError::Config(format!("invalid {name}: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 6379);
        assert_eq!(c.metrics_port, 9091);
        assert!(c.rng_seed.is_none());
    }

    #[test]
    fn bad_value_is_a_config_error() {
        assert!(matches!(
            parse_var::<u16>("PAGEKV_PORT", "not-a-port"),
            Err(DbError::Config(_))
        ));
    }
}
