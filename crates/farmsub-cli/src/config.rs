use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use farmsub_core::{OverrideOrdering, ResolutionConfig, VersionPolicy};

/// `farmsub.toml`, loaded from the working directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub production: ProductionConfig,
    pub resolve: ResolveConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite shared-store path; `~` expands.
    pub path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProductionConfig {
    /// JSON production-data file. Absent means every lookup comes back empty.
    #[serde(default)]
    pub ranges_file: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveConfig {
    pub ordering: OverrideOrdering,
    pub default_version_policy: VersionPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
    /// Seconds after which the scheduler may drop the pause on its own.
    #[serde(default)]
    pub pause_expiry_secs: Option<u64>,
    /// Host tag picking the worker dispatcher for deferred submissions.
    #[serde(default = "default_host_app")]
    pub host_app: String,
}

fn default_host_app() -> String {
    "generic".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig { path: "~/.farmsub/store.db".to_string() },
            production: ProductionConfig::default(),
            resolve: ResolveConfig {
                ordering: OverrideOrdering::EnvironmentFirst,
                default_version_policy: VersionPolicy::Next,
            },
            dispatch: DispatchConfig {
                poll_interval_secs: 5,
                max_poll_attempts: 60,
                pause_expiry_secs: None,
                host_app: default_host_app(),
            },
        }
    }
}

impl Config {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join("farmsub.toml")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&text).with_context(|| "parse farmsub.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let text = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// The shared-store path with `~` expanded.
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store.path).into_owned())
    }

    /// The settings as the resolve and dispatch layers want them.
    pub fn resolution(&self) -> ResolutionConfig {
        ResolutionConfig {
            ordering: self.resolve.ordering,
            default_version_policy: self.resolve.default_version_policy,
            poll_interval: Duration::from_secs(self.dispatch.poll_interval_secs),
            max_poll_attempts: self.dispatch.max_poll_attempts,
            pause_expiry: self.dispatch.pause_expiry_secs.map(Duration::from_secs),
        }
    }
}
