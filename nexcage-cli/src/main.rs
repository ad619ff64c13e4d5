//! CLI for nexcage, a container lifecycle controller for Proxmox VE.

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use nexcage_core::config;
use nexcage_core::orchestrator::Orchestrator;
use nexcage_core::router::build_router;
use nexcage_core::sandbox::{SandboxConfig, SecurityConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nexcage", version, about = "Container lifecycle controller for Proxmox VE")]
struct Cli {
    /// Path to `config.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging, equivalent to `--log-level debug`.
    #[arg(long, global = true)]
    debug: bool,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    /// State directory root, overriding `runtime.root_path`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Creates a container from an image or OCI bundle.
    Create(CreateArgs),

    /// Starts a created or stopped container.
    Start {
        /// Container id.
        id: String,
    },

    /// Stops a running container.
    Stop {
        /// Container id.
        id: String,
    },

    /// Deletes a container. Requires `--force` if it's running.
    Delete {
        /// Container id.
        id: String,
        /// Stop the container first if it's running.
        #[arg(long)]
        force: bool,
    },

    /// Lists every managed container.
    #[command(visible_alias = "ls")]
    List,

    /// Describes one container.
    Info {
        /// Container id.
        id: String,
    },

    /// Creates then immediately starts a container.
    Run(CreateArgs),

    /// Generates a shell completion script.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct CreateArgs {
    /// Container name; `^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$`.
    #[arg(long)]
    name: String,

    /// Path to an OCI bundle directory, overriding the positional image.
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Image reference: an existing Proxmox template name, or an OCI
    /// bundle directory path if `--bundle` wasn't given.
    image: Option<String>,

    /// Command to run, in order.
    #[arg(long = "cmd", num_args = 1.., value_delimiter = ',')]
    command: Option<Vec<String>>,

    /// Memory limit in MiB.
    #[arg(long)]
    memory_mib: Option<u32>,

    /// Number of CPU cores.
    #[arg(long)]
    cpu_cores: Option<u32>,

    /// Root disk size in GiB.
    #[arg(long)]
    disk_gib: Option<u32>,

    /// Network bridge, e.g. `vmbr0`.
    #[arg(long)]
    bridge: Option<String>,

    /// Run unprivileged (LXC only).
    #[arg(long)]
    unprivileged: bool,
}

impl CreateArgs {
    fn into_sandbox_config(self) -> SandboxConfig {
        let image = self.bundle.map(|p| p.display().to_string()).or(self.image);
        let resources = if self.memory_mib.is_some() || self.cpu_cores.is_some() || self.disk_gib.is_some() {
            Some(nexcage_core::sandbox::ResourceLimits {
                memory_mib: self.memory_mib,
                cpu_cores: self.cpu_cores,
                disk_gib: self.disk_gib,
            })
        } else {
            None
        };
        let network = self.bridge.map(|bridge| nexcage_core::sandbox::NetworkConfig {
            bridge,
            ip: None,
            mac: None,
        });
        SandboxConfig {
            name: self.name,
            image,
            command: self.command,
            workdir: None,
            env: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            resources,
            network,
            security: SecurityConfig {
                unprivileged: self.unprivileged,
            },
        }
    }
}

// `Backend::create` bridges into the async `ImageConverter` via
// `block_in_place`, which requires running on a worker thread of a
// multi-thread runtime — hence `main` itself is the async task that
// owns that thread, even though every call below it is synchronous.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_format);
    if let Err(e) = run(cli) {
        eprintln!("nexcage: {e:#}");
        std::process::exit(exit_code_for(&e));
    }
}

fn init_logging(debug: bool, format: LogFormat) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("NEXCAGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<nexcage_core::Error>()
        .map_or(1, nexcage_core::Error::exit_code)
}

fn run(cli: Cli) -> Result<()> {
    let config_path = config::resolve_config_path(cli.config.as_deref());
    let mut cfg = config::load(&config_path).context("loading config.json")?;
    if let Some(root) = cli.root {
        cfg.runtime.root_path = root;
    }

    match cli.command {
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "nexcage", &mut std::io::stdout());
            Ok(())
        }
        other => dispatch(&cfg, other),
    }
}

fn dispatch(cfg: &config::Config, command: Command) -> Result<()> {
    let orchestrator = build_orchestrator(cfg)?;
    match command {
        Command::Create(args) => {
            let sandbox = args.into_sandbox_config();
            orchestrator.create(&sandbox)?;
            println!("{}", sandbox.name);
            Ok(())
        }
        Command::Run(args) => {
            let sandbox = args.into_sandbox_config();
            orchestrator.create(&sandbox)?;
            orchestrator.start(&sandbox.name)?;
            println!("{}", sandbox.name);
            Ok(())
        }
        Command::Start { id } => {
            orchestrator.start(&id)?;
            println!("{id}");
            Ok(())
        }
        Command::Stop { id } => {
            orchestrator.stop(&id)?;
            println!("{id}");
            Ok(())
        }
        Command::Delete { id, force } => {
            orchestrator.delete(&id, force)?;
            println!("{id}");
            Ok(())
        }
        Command::List => {
            for info in orchestrator.list()? {
                println!("{:<24} {:?}  {:?}", info.name, info.backend, info.status);
            }
            Ok(())
        }
        Command::Info { id } => {
            let info = orchestrator.info(&id)?;
            println!("{}", serde_json::to_string_pretty(&InfoView::from(info))?);
            Ok(())
        }
        Command::Completion { .. } => unreachable!("handled before dispatch"),
    }
}

#[derive(serde::Serialize)]
struct InfoView {
    name: String,
    backend: String,
    status: String,
    pid: Option<u32>,
    ip: Option<String>,
}

impl From<nexcage_core::backend::ContainerInfo> for InfoView {
    fn from(info: nexcage_core::backend::ContainerInfo) -> Self {
        Self {
            name: info.name,
            backend: format!("{:?}", info.backend),
            status: format!("{:?}", info.status),
            pid: info.pid,
            ip: info.ip,
        }
    }
}

fn build_orchestrator(cfg: &config::Config) -> Result<Orchestrator> {
    let proxmox = std::sync::Arc::new(nexcage_core::proxmox::ProxmoxClient::new(&cfg.proxmox));
    let layerfs = std::sync::Arc::new(
        nexcage_core::layerfs::LayerFS::open(cfg.runtime.root_path.join("layers"), 256)
            .context("opening layer store")?,
    );
    let router = build_router(cfg, proxmox, layerfs);
    Ok(Orchestrator::new(cfg.runtime.root_path.join("containers"), router))
}
