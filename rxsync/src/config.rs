//! Engine configuration
//!
//! Layered: built-in defaults, then an optional file (TOML, YAML or JSON by
//! extension), then `RXSYNC__SECTION__KEY` environment variables.

use crate::cache::CacheConfig;
use crate::conflict_resolution::ConflictStrategy;
use crate::error::SyncResult;
use crate::field_encryption::FieldEncryptionConfig;
use crate::local_db::LocalDbConfig;
use crate::remote::HttpRemoteConfig;
use crate::sync_service::SyncServiceConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "RXSYNC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    Http,
    /// Process-local store, for demos and tests
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub kind: RemoteKind,
    pub http: HttpRemoteConfig,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            kind: RemoteKind::Http,
            http: HttpRemoteConfig::default(),
            conflict_strategy: ConflictStrategy::NewerWins,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// URL probed with HEAD requests; no probing when unset
    pub probe_url: Option<String>,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RxSyncConfig {
    pub storage: LocalDbConfig,
    pub sync: SyncServiceConfig,
    pub cache: CacheConfig,
    pub encryption: FieldEncryptionConfig,
    pub remote: RemoteSettings,
    pub connectivity: ConnectivityConfig,
}

impl RxSyncConfig {
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&RxSyncConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
