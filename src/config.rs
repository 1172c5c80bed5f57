use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::network::NetworkClass;

pub const CONFIG_FILE: &str = "hauler.toml";
pub const ENV_PREFIX: &str = "HAULER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// Root directory of the local object store.
    pub storage_root: PathBuf,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub transfer: TransferConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub worker_threads: usize,
    pub chunk_size: usize,
    pub progress_interval: u64,
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub callback_lanes: usize,
    pub default_network: NetworkClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub poll_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("hauler.db"),
            storage_root: PathBuf::from("hauler-store"),
            simulation: false,
            verbose: false,
            json_logs: false,
            transfer: TransferConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            chunk_size: 64 * 1024,
            progress_interval: 1024 * 1024,
            multipart_threshold: 5 * 1024 * 1024,
            part_size: 5 * 1024 * 1024,
            max_retries: 3,
            base_delay_ms: 100,
            max_backoff_ms: 20_000,
            callback_lanes: 4,
            default_network: NetworkClass::Any,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

impl AppConfig {
    /// Defaults, then `hauler.toml`, then `HAULER_*` variables (`__` for
    /// nesting), then whatever the CLI arguments set.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        Self::figment(CONFIG_FILE, cli_args)
            .extract()
            .context("Failed to load configuration")
    }

    pub fn figment<T: Serialize>(file: impl Into<PathBuf>, cli_args: Option<&T>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file.into()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }
        figment
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Overrides {
        simulation: bool,
    }

    #[test]
    fn layers_apply_in_order() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                    storage_root = "/srv/objects"

                    [transfer]
                    worker_threads = 8
                    default_network = "unmetered-only"
                "#,
            )?;
            jail.set_env("HAULER_TRANSFER__WORKER_THREADS", "2");

            let config: AppConfig = AppConfig::figment("custom.toml", Some(&Overrides { simulation: true }))
                .extract()?;
            assert_eq!(config.storage_root, PathBuf::from("/srv/objects"));
            assert_eq!(config.transfer.worker_threads, 2);
            assert_eq!(config.transfer.default_network, NetworkClass::UnmeteredOnly);
            assert_eq!(config.transfer.part_size, 5 * 1024 * 1024);
            assert!(config.simulation);
            Ok(())
        });
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
