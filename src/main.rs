//! target-link command line
//!
//! Loads the settings file, registers the declared nodes and applies a
//! configuration to them without touching any hardware.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use target_link::catalog::{self, Catalog};
use target_link::config::{self, LinkConfig};
use target_link::usb::{
    InboundSink, JsonFilePreferences, PortHub, PortKind, PortPreferences, PortWriter, UsbPort,
    UsbService,
};
use target_link::{ConnectionManager, LinkError, Registry};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "target-link")]
#[command(about = "Check codec chain configurations against the nodes in a settings file")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to config.toml in the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read and write port preferences in the app data directory
    #[arg(long, global = true)]
    persist_preferences: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a configuration and print the resulting tree
    Check {
        /// Configuration id from the settings file, or a configuration string
        configuration: String,
    },
    /// Print how strongly a configuration needs each declared device
    Devices {
        configuration: String,
    },
    /// Write a settings file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// USB access for a process that never opens ports
struct OfflineUsb;

#[async_trait]
impl UsbService for OfflineUsb {
    async fn list_ports(
        &self,
        _kind: PortKind,
        _vendor_id: Option<u16>,
    ) -> target_link::Result<Vec<UsbPort>> {
        Ok(Vec::new())
    }

    async fn open(
        &self,
        port: &UsbPort,
        _baud_rate: Option<u32>,
        _inbound: InboundSink,
    ) -> target_link::Result<Box<dyn PortWriter>> {
        Err(LinkError::Failure(format!(
            "{} cannot be opened from the command line",
            port.name
        )))
    }
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "target-link.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,target_link=debug")),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn settings_path(cli: &Cli) -> Result<PathBuf> {
    cli.config
        .clone()
        .or_else(config::default_config_path)
        .context("No settings file given and no app data directory available")
}

fn load_settings(cli: &Cli) -> Result<LinkConfig> {
    let path = settings_path(cli)?;
    if cli.config.is_none() && !path.exists() {
        return Ok(LinkConfig::default());
    }
    LinkConfig::load(&path).with_context(|| format!("Failed to load settings from {:?}", path))
}

struct Session {
    settings: LinkConfig,
    registry: Arc<Registry>,
    catalog: Catalog,
    manager: Arc<ConnectionManager>,
}

impl Session {
    fn open(settings: LinkConfig, persist_preferences: bool) -> Result<Self> {
        let registry = Arc::new(Registry::default());
        let hub = PortHub::new(Arc::new(OfflineUsb), registry.clone());
        let preferences = if persist_preferences {
            let store = JsonFilePreferences::open_default()?;
            PortPreferences::new(Arc::new(store), &settings.app_name)
        } else {
            PortPreferences::in_memory(&settings.app_name)
        };

        let catalog = Catalog::install(&settings, &hub, preferences)?;
        let manager = ConnectionManager::new(registry.clone());
        manager.set_allow_auto_connect_on_device_detection(settings.allow_auto_connect);
        catalog.register_transports(&manager);
        for (id, configuration) in &settings.configurations {
            manager.register_configuration(id.clone(), configuration.clone());
        }

        Ok(Self {
            settings,
            registry,
            catalog,
            manager,
        })
    }

    fn apply(&self, configuration: &str) -> Result<()> {
        self.manager
            .set_active_configuration(configuration)
            .with_context(|| format!("Configuration {:?} was rejected", configuration))?;
        tracing::info!(
            configuration = %self.manager.active_configuration_id(),
            "configuration applied"
        );
        Ok(())
    }

    fn close(self) {
        self.catalog.dispose(Some(self.manager.as_ref()));
        self.manager.dispose();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let _guard = init_logging(settings.log_dir.as_deref());

    match &cli.command {
        Commands::Init { force } => {
            let path = settings_path(&cli)?;
            if path.exists() && !force {
                anyhow::bail!("{:?} already exists, pass --force to overwrite", path);
            }
            LinkConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
        Commands::Check { configuration } => {
            let session = Session::open(settings, cli.persist_preferences)?;
            session.apply(configuration)?;
            print!("{}", catalog::active_tree(&session.registry));
            session.close();
        }
        Commands::Devices { configuration } => {
            let session = Session::open(settings, cli.persist_preferences)?;
            session.apply(configuration)?;
            let devices = session.settings.device_ids();
            if devices.is_empty() {
                println!("No devices declared");
            }
            for (device, requirement) in catalog::device_requirements(&session.registry, &devices)? {
                println!("{:<16} {:?}", device, requirement);
            }
            session.close();
        }
    }
    Ok(())
}
