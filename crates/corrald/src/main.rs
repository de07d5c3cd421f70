//! corrald: a corral cluster member.
//!
//! One binary runs the metadata store, the raft node, the cluster API and
//! the membership reconciler for a single member. `run` is the daemon;
//! `bootstrap` and `join` talk to a running daemon over its control
//! socket.
//!
//! # Usage
//!
//! ```text
//! corrald --name n1 --address 10.0.0.1:7443 run --bootstrap
//! corrald --name n2 --address 10.0.0.2:7443 run
//! corrald --name n2 join --via 10.0.0.1:7443 --secret <token>
//! ```

mod config;
mod control;
mod node;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, LogFormat};
use crate::control::{ControlClient, MembershipStatus};
use crate::node::{Node, restart_args};

const DEFAULT_FILTER: &str =
    "info,corrald=debug,corral_cluster=debug,corral_api=debug,corral_raft=debug,openraft=warn";

#[derive(Parser)]
#[command(name = "corrald", about = "corral cluster member daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Member name, overriding the configuration file.
    #[arg(long, global = true)]
    name: Option<String>,

    /// Address peers reach this member on, as `host:port`.
    #[arg(long, global = true)]
    address: Option<String>,

    /// Data directory for cluster state and identity.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve as a cluster member, waiting for `bootstrap` or `join` if
    /// this member has no cluster state.
    Run {
        /// Form a new single-member cluster if this member has no cluster state.
        #[arg(long)]
        bootstrap: bool,
    },
    /// Have the running daemon form a new single-member cluster.
    Bootstrap,
    /// Have the running daemon join an existing cluster.
    Join {
        /// Address of any current member.
        #[arg(long)]
        via: String,

        /// Join token secret issued for this member's name.
        #[arg(long)]
        secret: String,
    },
}

impl Cli {
    /// The configuration file (or defaults) with command-line overrides applied.
    fn resolve_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = DaemonConfig::load(self.config.as_deref())?;
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    init_tracing(config.log_format);

    let client = ControlClient::new(config.layout().control_socket());
    match cli.command {
        Command::Run { bootstrap } => {
            info!(
                name = %config.name,
                address = %config.address,
                data_dir = ?config.data_dir,
                "corrald starting"
            );
            let node = Node::open(config, restart_args(std::env::args_os())).await?;
            Arc::new(node).run(bootstrap).await
        }
        Command::Bootstrap => {
            report("bootstrapped", client.bootstrap().await?);
            Ok(())
        }
        Command::Join { via, secret } => {
            report("joined", client.join(&via, &secret).await?);
            Ok(())
        }
    }
}

fn report(what: &str, status: MembershipStatus) {
    info!(
        member = %status.name,
        address = %status.address,
        trusted = status.trusted,
        "{what} cluster"
    );
}
