//! Plexus CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plexus_config::{load_config, Config, LoggingConfig};
use plexus_host::{PluginHost, SignalHandler};
use plexus_store::PluginRecord;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "plexus")]
#[command(about = "Plexus plugin host", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "PLEXUS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host until SIGINT/SIGTERM
    Serve,

    /// Scan the plugin directory and record what is found
    Discover,

    /// List recorded plugins
    List {
        /// Only enabled plugins
        #[arg(long)]
        enabled: bool,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark a plugin enabled
    Enable {
        /// Plugin id
        id: String,
    },

    /// Mark a plugin disabled
    Disable {
        /// Plugin id
        id: String,
    },

    /// Run a plugin's uninstaller and disable it
    Uninstall {
        /// Plugin id
        id: String,
    },

    /// Inspect and record a single module file
    Register {
        /// Module path
        path: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("Plexus plugin host");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }

        Commands::Validate => {
            let path = cli
                .config
                .context("--config (or PLEXUS_CONFIG) is required for validate")?;
            match load_config(&path) {
                Ok(cfg) => {
                    println!("✓ Configuration is valid");
                    println!("  Plugin directory: {}", cfg.plugins.directory.display());
                    println!("  Extensions: {}", cfg.plugins.extensions.join(", "));
                    println!("  Watch: {}", cfg.plugins.watch);
                    println!("  Storage: {:?}", cfg.storage);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        command => {
            let config = resolve_config(cli.config.as_deref())?;
            init_tracing(&config.observability.logging, cli.log_level.as_deref())?;
            run(command, config).await
        }
    }
}

async fn run(command: Commands, config: Config) -> Result<()> {
    let host = PluginHost::builder().config(config).build()?;

    match command {
        Commands::Serve => {
            tracing::info!(
                directory = %host.options().directory.display(),
                "Starting Plexus plugin host"
            );

            let shutdown_signal = host.shutdown_signal();
            tokio::spawn(async move {
                if let Err(e) = SignalHandler::new(shutdown_signal.clone()).run().await {
                    tracing::error!(error = %e, "Signal handler failed; shutting down");
                    shutdown_signal.trigger();
                }
            });

            let report = host.run_until_shutdown().await?;
            tracing::info!(loaded = report.loaded, "Plugin host exited");
        }

        Commands::Discover => {
            let records = host.discover().await?;
            print_records(&records);
        }

        Commands::List { enabled, json } => {
            let records = if enabled {
                host.registry().list_enabled().await?
            } else {
                host.registry().list_all().await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }

        Commands::Enable { id } => {
            host.enable_plugin(&id).await?;
            println!("Enabled {id}");
        }

        Commands::Disable { id } => {
            host.disable_plugin(&id).await?;
            println!("Disabled {id}");
        }

        Commands::Uninstall { id } => {
            if host.uninstall_plugin(&id).await? {
                println!("Uninstalled {id}");
            } else {
                println!("Nothing to uninstall for {id}; disabled");
            }
        }

        Commands::Register { path } => {
            let record = host.register_plugin(&path).await?;
            println!(
                "Registered {} {} ({})",
                record.id,
                record.version,
                if record.enabled { "enabled" } else { "disabled" }
            );
        }

        Commands::Validate | Commands::Version => {}
    }

    Ok(())
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn print_records(records: &[PluginRecord]) {
    if records.is_empty() {
        println!("No plugins recorded");
        return;
    }
    println!("{:<24} {:<12} {:<8} PATH", "ID", "VERSION", "ENABLED");
    for record in records {
        println!(
            "{:<24} {:<12} {:<8} {}",
            record.id,
            record.version,
            record.enabled,
            record.module_path.display()
        );
    }
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    Ok(())
}
