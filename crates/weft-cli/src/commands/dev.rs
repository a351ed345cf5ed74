use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use weft_codec::{Codec, Compression, WireFormat};
use weft_config::WeftConfig;
use weft_core::{EventBus, MeshEvent, WeftError, format_hostname};
use weft_mesh::{ElectionConfig, EnvelopeSender, MeshNode, MessageBus, NodeConfig};
use weft_overlay::{OverlayClient, OverlayConfig};
use weft_transport::TransportConfig;

pub(super) struct DevOverrides {
    pub name: Option<String>,
    pub prefix: Option<String>,
    pub sidecar: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub auth_key: Option<String>,
    pub device_type: Option<String>,
}

/// Bring up a node in the foreground and run until Ctrl-C.
pub(super) async fn cmd_dev(
    mut config: WeftConfig,
    overrides: DevOverrides,
    config_path: &Path,
) -> weft_core::Result<()> {
    if let Some(name) = overrides.name {
        config.node.name = name;
    }
    if let Some(prefix) = overrides.prefix {
        config.node.hostname_prefix = prefix;
    }
    if let Some(sidecar) = overrides.sidecar {
        config.sidecar.binary = sidecar;
    }
    if let Some(state_dir) = overrides.state_dir {
        config.sidecar.state_dir = state_dir;
    }
    if let Some(auth_key) = overrides.auth_key {
        config.sidecar.auth_key = Some(auth_key);
    }
    if let Some(device_type) = overrides.device_type {
        config.node.device_type = device_type;
    }
    config.validate().map_err(WeftError::Config)?;

    // The device id outlives every run; mint one on first launch and write
    // it back so the hostname stays stable.
    let device_id = match config.node.id.clone() {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            persist_device_id(config_path, &id)?;
            info!(device_id = %id, "generated device id");
            id
        }
    };
    let hostname = format_hostname(
        &config.node.hostname_prefix,
        &config.node.device_type,
        &device_id,
    );

    let mut overlay_config = OverlayConfig::new(
        config.sidecar.binary.clone(),
        hostname.clone(),
        config.sidecar.state_dir.clone(),
    );
    overlay_config.auth_key = config.sidecar.auth_key.clone();
    overlay_config.hostname_prefix = Some(config.node.hostname_prefix.clone());
    let mut overlay = OverlayClient::new(overlay_config);

    let events = EventBus::default();
    spawn_event_logger(&events);

    let (overlay_handle, overlay_rx) = overlay.start().await?;

    let node = MeshNode::new(
        node_config(&config, device_id.clone()),
        overlay_handle,
        events.clone(),
    );
    let bus = MessageBus::new(
        Arc::downgrade(&(Arc::clone(&node) as Arc<dyn EnvelopeSender>)),
        events.clone(),
    );
    bus.start(node.incoming());
    node.start(overlay_rx, overlay.current_status());

    println!("weft node running as {hostname} (id {device_id}) — Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    println!();
    info!("shutting down");

    node.stop();
    bus.stop();
    overlay.stop().await?;
    Ok(())
}

fn node_config(config: &WeftConfig, device_id: String) -> NodeConfig {
    let ms = Duration::from_millis;
    let format = match config.mesh.wire_format.as_str() {
        "json" => WireFormat::Json,
        _ => WireFormat::Binary,
    };
    let mut codec = Codec::new(format);
    if let Some(threshold) = config.mesh.compress_threshold_bytes {
        codec = codec.with_compression(Compression {
            threshold: Some(threshold),
            level: 0,
        });
    }

    let mut node_config = NodeConfig::new(
        device_id,
        config.node.device_type.clone(),
        config.node.name.clone(),
        config.node.hostname_prefix.clone(),
    );
    node_config.prefer_primary = config.node.prefer_primary;
    node_config.capabilities = config.node.capabilities.clone();
    node_config.announce_interval = ms(config.mesh.announce_interval_ms);
    node_config.election = ElectionConfig {
        round_timeout: ms(config.mesh.election_timeout_ms),
        primary_loss_grace: ms(config.mesh.primary_loss_grace_ms),
    };
    node_config.transport = TransportConfig {
        heartbeat_ping: ms(config.mesh.heartbeat_ping_ms),
        heartbeat_timeout: ms(config.mesh.heartbeat_timeout_ms),
        dial_timeout: ms(config.mesh.dial_timeout_ms),
        max_reconnect_delay: ms(config.mesh.max_reconnect_delay_ms),
        default_port: config.sidecar.port,
        codec,
    };
    node_config
}

fn spawn_event_logger(events: &EventBus) {
    let mut events_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            match event {
                MeshEvent::AuthRequired { auth_url } => {
                    println!("overlay login required: {auth_url}");
                }
                MeshEvent::DeviceDiscovered { device } => {
                    info!(device = %device.id, hostname = %device.hostname, "device discovered");
                }
                MeshEvent::DeviceOffline { device_id } => {
                    info!(device = %device_id, "device offline");
                }
                MeshEvent::PrimaryChanged { primary_id } => {
                    info!(primary = ?primary_id, "primary changed");
                }
                MeshEvent::RoleChanged { role } => {
                    info!(?role, "local role changed");
                }
                _ => {}
            }
        }
    });
}

/// Write the generated id into `[node].id` of the config file, preserving
/// everything else in place.
fn persist_device_id(config_path: &Path, device_id: &str) -> weft_core::Result<()> {
    if !config_path.exists() {
        // Running purely on defaults; nothing to write back into.
        return Ok(());
    }
    let content = std::fs::read_to_string(config_path)?;
    let mut doc = content
        .parse::<toml_edit::DocumentMut>()
        .map_err(|e| WeftError::Config(format!("invalid TOML in {}: {e}", config_path.display())))?;
    if doc.get("node").is_none() {
        doc["node"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    doc["node"]["id"] = toml_edit::value(device_id);
    std::fs::write(config_path, doc.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_device_id_keeps_the_rest_of_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.toml");
        std::fs::write(&path, "[node]\nname = \"laptop\"\n\n[sidecar]\nport = 8443\n").unwrap();

        persist_device_id(&path, "dev-42").unwrap();

        let config: WeftConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("dev-42"));
        assert_eq!(config.node.name, "laptop");
        assert_eq!(config.sidecar.port, 8443);
    }

    #[test]
    fn node_config_maps_timings_and_codec() {
        let mut config = WeftConfig::default();
        config.mesh.wire_format = "json".into();
        config.mesh.heartbeat_ping_ms = 1_000;
        let node_config = super::node_config(&config, "dev-1".into());
        assert_eq!(node_config.transport.codec.format(), WireFormat::Json);
        assert_eq!(
            node_config.transport.heartbeat_ping,
            Duration::from_millis(1_000)
        );
        assert_eq!(node_config.announce_interval, Duration::from_secs(30));
    }
}
