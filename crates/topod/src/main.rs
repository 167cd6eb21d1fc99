//! topod — the topo daemon binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use topo_core::TopoConfig;
use topo_core::config::SubstrateKind;
use topod::standalone::run_standalone;
use topod::validate_manifests;

#[derive(Parser)]
#[command(name = "topod", about = "Topo workload topology reconciler")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum SubstrateArg {
    Sim,
    Process,
}

impl From<SubstrateArg> for SubstrateKind {
    fn from(arg: SubstrateArg) -> Self {
        match arg {
            SubstrateArg::Sim => SubstrateKind::Sim,
            SubstrateArg::Process => SubstrateKind::Process,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (all subsystems in one process).
    Standalone {
        /// Configuration file (topo.toml). Flags override its values.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Manifest file or directory applied at startup.
        #[arg(long)]
        manifests: Option<PathBuf>,

        /// Compute substrate driving members.
        #[arg(long, value_enum)]
        substrate: Option<SubstrateArg>,

        /// Directory of mounted secrets (`<name>/<key>`).
        #[arg(long)]
        secrets_dir: Option<PathBuf>,
    },

    /// Check manifests offline without starting the daemon.
    Validate {
        /// Manifest files or directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,topod=debug,topo=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
            manifests,
            substrate,
            secrets_dir,
        } => {
            let mut cfg = match config {
                Some(path) => {
                    info!(path = ?path, "loading configuration");
                    TopoConfig::from_file(&path)?
                }
                None => TopoConfig::default(),
            };
            if let Some(port) = port {
                cfg.api.port = port;
            }
            if let Some(dir) = data_dir {
                cfg.daemon.data_dir = dir;
            }
            if manifests.is_some() {
                cfg.daemon.manifests = manifests;
            }
            if let Some(kind) = substrate {
                cfg.daemon.substrate = kind.into();
            }
            if secrets_dir.is_some() {
                cfg.daemon.secrets_dir = secrets_dir;
            }
            run_standalone(cfg).await
        }
        Command::Validate { paths } => {
            let paths: Vec<&std::path::Path> = paths.iter().map(PathBuf::as_path).collect();
            let report = validate_manifests(&paths)?;
            for key in &report.accepted {
                info!(document = %key, "valid");
            }
            for (key, reason) in &report.rejected {
                error!(document = %key, %reason, "invalid");
            }
            if report.is_ok() {
                info!(documents = report.accepted.len(), "all manifests valid");
                Ok(())
            } else {
                anyhow::bail!("{} invalid document(s)", report.rejected.len())
            }
        }
    }
}
