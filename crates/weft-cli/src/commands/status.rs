use std::path::{Path, PathBuf};

use weft_config::ConfigLoader;

/// Print configuration presence and the resolved values.
pub(super) fn cmd_status(dir: Option<PathBuf>, explicit: Option<&Path>) -> weft_core::Result<()> {
    let config_path = match (explicit, dir) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(dir)) => dir.join("weft.toml"),
        (None, None) => ConfigLoader::resolve_path(None),
    };

    println!("weft status");
    println!();
    println!("  config file:   {}", config_path.display());
    if !config_path.exists() {
        println!("  present:       no (run `weft init` to scaffold one)");
        return Ok(());
    }
    println!("  present:       yes");

    match ConfigLoader::load(Some(&config_path)) {
        Ok(loader) => {
            let config = loader.get();
            println!(
                "  device id:     {}",
                config.node.id.as_deref().unwrap_or("(generated on first run)")
            );
            println!("  name:          {}", config.node.name);
            println!(
                "  hostname:      {}-{}-<id>",
                config.node.hostname_prefix, config.node.device_type
            );
            println!(
                "  sidecar:       {} ({})",
                config.sidecar.binary.display(),
                if config.sidecar.binary.exists() || which_on_path(&config.sidecar.binary) {
                    "found"
                } else {
                    "not found"
                }
            );
            println!(
                "  state dir:     {} ({})",
                config.sidecar.state_dir.display(),
                if config.sidecar.state_dir.is_dir() {
                    "exists"
                } else {
                    "missing"
                }
            );
            println!(
                "  auth key:      {}",
                if config.sidecar.auth_key.is_some() {
                    "configured"
                } else {
                    "not set (interactive login)"
                }
            );
            println!("  wire format:   {}", config.mesh.wire_format);
        }
        Err(e) => {
            println!("  valid:         no — {e}");
        }
    }
    Ok(())
}

/// Bare command names resolve through PATH rather than the filesystem.
fn which_on_path(binary: &Path) -> bool {
    if binary.components().count() > 1 {
        return false;
    }
    let Some(name) = binary.file_name() else {
        return false;
    };
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
        })
        .unwrap_or(false)
}
