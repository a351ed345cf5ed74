use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration — maps to `weft.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub node: NodeSection,
    pub sidecar: SidecarSection,
    pub mesh: MeshSection,
    pub logging: LoggingSection,
}

// ── Node identity ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Stable device id. Generated on the first `weft dev` run and written
    /// back into the config file.
    pub id: Option<String>,
    /// Human label for this device.
    pub name: String,
    /// Device kind, a single `-`-free label (desktop, phone, server, ...).
    #[serde(rename = "type")]
    pub device_type: String,
    /// Application-wide hostname prefix; every device of one fleet must
    /// share it.
    pub hostname_prefix: String,
    /// Prefer this device in primary elections.
    pub prefer_primary: bool,
    pub capabilities: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            name: "weft device".into(),
            device_type: "desktop".into(),
            hostname_prefix: "weft".into(),
            prefer_primary: false,
            capabilities: vec![],
        }
    }
}

// ── Sidecar ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSection {
    /// Path to the overlay sidecar executable.
    pub binary: PathBuf,
    /// Directory the sidecar owns for overlay state. Must be writable.
    pub state_dir: PathBuf,
    /// Overlay auth key; WEFT_AUTH_KEY env is the fallback.
    pub auth_key: Option<String>,
    /// Port devices listen on inside the overlay.
    pub port: u16,
}

impl Default for SidecarSection {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".weft")
            .join("state");
        Self {
            binary: PathBuf::from("weft-sidecar"),
            state_dir,
            auth_key: None,
            port: 443,
        }
    }
}

// ── Mesh timings ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    pub announce_interval_ms: u64,
    pub election_timeout_ms: u64,
    pub primary_loss_grace_ms: u64,
    pub heartbeat_ping_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Frame serialization: "binary" or "json".
    pub wire_format: String,
    /// Compress frames larger than this many bytes; absent = never.
    pub compress_threshold_bytes: Option<usize>,
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            announce_interval_ms: 30_000,
            election_timeout_ms: 3_000,
            primary_loss_grace_ms: 5_000,
            heartbeat_ping_ms: 2_000,
            heartbeat_timeout_ms: 5_000,
            dial_timeout_ms: 10_000,
            max_reconnect_delay_ms: 30_000,
            wire_format: "binary".into(),
            compress_threshold_bytes: None,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            sidecar: SidecarSection::default(),
            mesh: MeshSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{icon}: {}: {}", self.field, self.message)?;
        if let Some(ref hint) = self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

impl WeftConfig {
    /// Validate the config. Returns the warnings, or `Err` with all
    /// error-severity messages joined.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        if self.node.hostname_prefix.is_empty() {
            warnings.push(ConfigWarning {
                field: "node.hostname_prefix".into(),
                message: "hostname prefix is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("every device of a fleet shares one prefix, e.g. \"weft\"".into()),
            });
        }
        if self.node.hostname_prefix.contains('-') {
            warnings.push(ConfigWarning {
                field: "node.hostname_prefix".into(),
                message: format!(
                    "prefix '{}' contains '-', which breaks hostname parsing",
                    self.node.hostname_prefix
                ),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }
        if self.node.device_type.is_empty() || self.node.device_type.contains('-') {
            warnings.push(ConfigWarning {
                field: "node.type".into(),
                message: format!(
                    "device type '{}' must be a non-empty label without '-'",
                    self.node.device_type
                ),
                severity: WarningSeverity::Error,
                hint: Some("use e.g. \"desktop\", \"phone\", \"server\"".into()),
            });
        }

        let valid_formats = ["binary", "json"];
        if !valid_formats.contains(&self.mesh.wire_format.as_str()) {
            warnings.push(ConfigWarning {
                field: "mesh.wire_format".into(),
                message: format!("unknown wire format '{}'", self.mesh.wire_format),
                severity: WarningSeverity::Error,
                hint: Some(format!("valid values: {}", valid_formats.join(", "))),
            });
        }

        if self.mesh.election_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "mesh.election_timeout_ms".into(),
                message: "election rounds need a non-zero window".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }
        if self.mesh.heartbeat_timeout_ms <= self.mesh.heartbeat_ping_ms {
            warnings.push(ConfigWarning {
                field: "mesh.heartbeat_timeout_ms".into(),
                message: "heartbeat timeout should exceed the ping interval".into(),
                severity: WarningSeverity::Warning,
                hint: Some("connections would drop before the second ping".into()),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("valid values: {}", valid_levels.join(", "))),
            });
        }
        let valid_log_formats = ["pretty", "json"];
        if !valid_log_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("valid values: {}", valid_log_formats.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();
        if !errors.is_empty() {
            return Err(format!("configuration errors:\n  - {}", errors.join("\n  - ")));
        }

        Ok(warnings)
    }
}
