use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

use weft_config::ConfigLoader;

mod dev;
mod init;
mod status;

/// weft — a personal mesh for the devices on your tailnet
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to weft.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a weft.toml and the sidecar state directory
    Init {
        /// Directory to scaffold into (default: ~/.weft)
        dir: Option<PathBuf>,
    },
    /// Bring up a mesh node in the foreground (Ctrl-C to stop)
    Dev {
        /// Human label for this device
        #[arg(long)]
        name: Option<String>,
        /// Hostname prefix shared by the fleet
        #[arg(long)]
        prefix: Option<String>,
        /// Path to the overlay sidecar executable
        #[arg(long)]
        sidecar: Option<PathBuf>,
        /// Directory for the sidecar's overlay state
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Overlay auth key
        #[arg(long)]
        auth_key: Option<String>,
        /// Device kind, a single '-'-free label
        #[arg(long = "type")]
        device_type: Option<String>,
    },
    /// Print configuration presence and resolved values
    Status {
        /// Directory holding a weft.toml (default: resolved config path)
        dir: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub async fn run(self) -> weft_core::Result<()> {
        let Cli {
            config: config_path,
            log_level,
            verbose,
            quiet,
            command,
        } = self;

        // --verbose > --quiet > --log-level > config default
        let flag_level = if verbose {
            Some("debug".to_string())
        } else if quiet {
            Some("error".to_string())
        } else {
            log_level
        };

        match command {
            Commands::Completions { shell } => Self::cmd_completions(shell),
            Commands::Init { dir } => {
                Self::init_tracing("pretty", flag_level.as_deref().unwrap_or("info"));
                init::cmd_init(dir)
            }
            Commands::Status { dir } => {
                Self::init_tracing("pretty", flag_level.as_deref().unwrap_or("info"));
                status::cmd_status(dir, config_path.as_deref())
            }
            Commands::Dev {
                name,
                prefix,
                sidecar,
                state_dir,
                auth_key,
                device_type,
            } => {
                let loader = ConfigLoader::load(config_path.as_deref())?;
                let config = loader.get();
                Self::init_tracing(
                    &config.logging.format,
                    flag_level.as_deref().unwrap_or(&config.logging.level),
                );
                let overrides = dev::DevOverrides {
                    name,
                    prefix,
                    sidecar,
                    state_dir,
                    auth_key,
                    device_type,
                };
                dev::cmd_dev(config, overrides, loader.path()).await
            }
        }
    }

    fn init_tracing(format: &str, level: &str) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
        if format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }

    fn cmd_completions(shell: Shell) -> weft_core::Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "weft", &mut std::io::stdout());
        Ok(())
    }
}
