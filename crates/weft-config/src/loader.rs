use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use weft_core::{Result, WeftError};

use crate::schema::WeftConfig;

/// Loads and optionally hot-reloads the weft configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<WeftConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > WEFT_CONFIG env >
    /// ~/.weft/weft.toml.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var("WEFT_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".weft")
            .join("weft.toml")
    }

    /// Load the config from disk, falling back to defaults when the file is
    /// absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<WeftConfig>(&raw).map_err(|e| {
                WeftError::Config(format!("failed to parse {}: {e}", config_path.display()))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            WeftConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for warning in &warnings {
                    warn!("{warning}");
                }
            }
            Err(e) => return Err(WeftError::Config(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Read snapshot of the current config.
    pub fn get(&self) -> WeftConfig {
        self.config.read().clone()
    }

    pub fn shared(&self) -> Arc<RwLock<WeftConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn apply_env_overrides(mut config: WeftConfig) -> WeftConfig {
        if let Ok(level) = std::env::var("WEFT_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(binary) = std::env::var("WEFT_SIDECAR_BIN") {
            config.sidecar.binary = PathBuf::from(binary);
        }
        // The auth key is the secret, so the config file takes priority and
        // the env fills the gap.
        if config.sidecar.auth_key.is_none() {
            if let Ok(key) = std::env::var("WEFT_AUTH_KEY") {
                config.sidecar.auth_key = Some(key);
            }
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(WeftError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<WeftConfig>(&raw).map_err(|e| {
            WeftError::Config(format!(
                "failed to parse {}: {e}",
                self.config_path.display()
            ))
        })?;
        *self.config.write() = Self::apply_env_overrides(new_config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads on change. The returned
    /// watcher must be kept alive for watching to continue.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();
        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            return;
                        }
                        let is_our_file = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == path_for_event.file_name());
                        if !is_our_file {
                            return;
                        }
                        info!("config file changed, reloading");
                        match std::fs::read_to_string(&path_for_event) {
                            Ok(raw) => match toml::from_str::<WeftConfig>(&raw) {
                                Ok(new_config) => {
                                    *config.write() =
                                        ConfigLoader::apply_env_overrides(new_config);
                                    info!("configuration hot-reloaded");
                                }
                                Err(e) => {
                                    warn!(error = %e, "config file has errors, keeping current config");
                                }
                            },
                            Err(e) => {
                                warn!(error = %e, "failed to read config file during hot-reload");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "file watcher error"),
                }
            })
            .map_err(|e| WeftError::Config(format!("failed to create file watcher: {e}")))?;

        // Watch the parent directory (editors often write a temp file and
        // rename over the original).
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| WeftError::Config(format!("failed to watch config directory: {e}")))?;

        Ok(watcher)
    }
}
