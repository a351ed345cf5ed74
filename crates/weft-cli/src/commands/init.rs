use std::path::PathBuf;

use weft_config::WeftConfig;
use weft_core::WeftError;

/// Scaffold a `weft.toml` and the sidecar state directory.
pub(super) fn cmd_init(dir: Option<PathBuf>) -> weft_core::Result<()> {
    let target = match dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".weft"),
    };
    std::fs::create_dir_all(&target)?;

    let config_path = target.join("weft.toml");
    if config_path.exists() {
        println!("weft.toml already exists at {}", config_path.display());
        return Ok(());
    }

    let mut config = WeftConfig::default();
    config.sidecar.state_dir = target.join("state");
    std::fs::create_dir_all(&config.sidecar.state_dir)?;

    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| WeftError::Config(format!("failed to render default config: {e}")))?;
    std::fs::write(&config_path, rendered)?;

    println!("created {}", config_path.display());
    println!("created {}", config.sidecar.state_dir.display());
    println!();
    println!("next steps:");
    println!("  1. point [sidecar].binary at your overlay sidecar");
    println!("  2. run `weft dev` to bring the node up");
    Ok(())
}
