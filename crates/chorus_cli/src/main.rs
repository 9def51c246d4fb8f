//! CHORUS CLI
//!
//! Runs one gossip membership agent over UDP/TCP.

#![warn(missing_docs)]
#![warn(clippy::all)]

use chorus_cluster::{Config, EventSinks, Member, MemberEventKind};
use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Capacity of each event channel the agent listens on
const EVENT_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "chorus")]
#[command(about = "CHORUS - Gossip-based cluster membership", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a membership agent until interrupted
    Agent(AgentArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Profile {
    Lan,
    Wan,
    Local,
}

#[derive(Debug, Args)]
struct AgentArgs {
    /// Node name, unique in the cluster
    #[arg(short, long)]
    name: Option<String>,

    /// Address to bind UDP and TCP on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Address to advertise to peers
    #[arg(short, long)]
    advertise: Option<SocketAddr>,

    /// Seed to join through; repeat for several
    #[arg(short, long = "join", value_name = "ADDR")]
    join: Vec<SocketAddr>,

    /// JSON config file; replaces the profile defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tuning preset
    #[arg(short, long, value_enum, default_value_t = Profile::Lan)]
    profile: Profile,

    /// Metadata attached to this node
    #[arg(short, long)]
    meta: Option<String>,

    /// How long to announce departure on shutdown, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    leave_timeout_ms: u64,
}

impl AgentArgs {
    /// Preset, then config file, then flags
    fn to_config(&self) -> Result<Config> {
        let name = self.name.clone().unwrap_or_default();
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => match self.profile {
                Profile::Lan => Config::lan(name.clone()),
                Profile::Wan => Config::wan(name.clone()),
                Profile::Local => Config::local(name.clone()),
            },
        };
        if !name.is_empty() {
            config.name = name;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(advertise) = self.advertise {
            config.advertise_addr = Some(advertise);
        }
        if let Some(meta) = &self.meta {
            config.meta = meta.as_bytes().to_vec();
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chorus=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_events(kind: MemberEventKind, mut rx: mpsc::Receiver<Member>) {
    tokio::spawn(async move {
        while let Some(member) = rx.recv().await {
            info!(
                event = kind.as_str(),
                member = %member.name,
                addr = %member.addr,
                status = member.status.as_str(),
                incarnation = %member.incarnation,
                "membership changed"
            );
        }
    });
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let (join_tx, join_rx) = mpsc::channel(EVENT_BUFFER);
    let (leave_tx, leave_rx) = mpsc::channel(EVENT_BUFFER);
    let (update_tx, update_rx) = mpsc::channel(EVENT_BUFFER);
    log_events(MemberEventKind::Join, join_rx);
    log_events(MemberEventKind::Leave, leave_rx);
    log_events(MemberEventKind::Update, update_rx);

    let sinks = EventSinks::default()
        .with_join(join_tx)
        .with_leave(leave_tx)
        .with_update(update_tx);
    let config = args.to_config()?.with_events(sinks);

    let membership = if args.join.is_empty() {
        chorus_cluster::create(config).await?
    } else {
        chorus_cluster::join(config, &args.join).await?
    };
    info!(
        node = %membership.local_node(),
        members = membership.num_members()?,
        "agent running"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, leaving cluster");
    let dropped = membership.dropped_events()?;
    if dropped > 0 {
        warn!(dropped, "some membership events were not logged");
    }
    membership
        .leave(Duration::from_millis(args.leave_timeout_ms))
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Agent(args) => run_agent(args).await,
    }
}
