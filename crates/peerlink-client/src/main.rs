//! peerlink - P2P chat and file exchange client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerlink_client::config::{expand_path, Config};
use peerlink_client::directory::DirectoryClient;
use peerlink_client::{ClientEvent, ConnectionDecision, EventReceiver, Node, SendOutcome};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "P2P chat and file exchange", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.peerlink/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Directory URL (overrides config)
    #[arg(long)]
    directory: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// List peers registered with the directory
    Peers,

    /// Show where a peer can be reached
    Info {
        #[arg(required = true)]
        username: String,
    },

    /// Register with the directory and start an interactive session
    Run {
        /// Username to register (overrides config)
        #[arg(short, long)]
        username: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not register with the directory
        #[arg(long)]
        no_register: bool,
    },
}

/// Inbound connection requests waiting for `accept`/`reject`
type DecisionQueue = Arc<Mutex<VecDeque<ConnectionDecision>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    match cli.command {
        Commands::Init => init_config(&config_path)?,
        Commands::Peers => {
            let config = load_config(&config_path, cli.directory)?;
            list_peers(&config).await?;
        }
        Commands::Info { username } => {
            let config = load_config(&config_path, cli.directory)?;
            show_peer_info(&config, &username).await?;
        }
        Commands::Run {
            username,
            port,
            no_register,
        } => {
            let mut config = load_config(&config_path, cli.directory)?;
            if let Some(username) = username {
                config.username = username;
            }
            if let Some(port) = port {
                config.listen.port = port;
            }
            run_session(config, !no_register).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path, directory_url: Option<String>) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Config::default()
    };
    if let Some(url) = directory_url {
        config.directory.url = url;
    }
    Ok(config)
}

fn directory_client(config: &Config) -> Result<DirectoryClient> {
    Ok(DirectoryClient::new(
        &config.directory.url,
        Duration::from_secs(config.directory.timeout_secs),
    )?)
}

async fn list_peers(config: &Config) -> Result<()> {
    let directory = directory_client(config)?;
    let peers = directory.list_peers().await?;

    if peers.is_empty() {
        println!("No peers registered at {}", directory.base_url());
    } else {
        println!("{} peer(s) registered:", peers.len());
        for peer in peers {
            println!("  - {}", peer);
        }
    }
    Ok(())
}

async fn show_peer_info(config: &Config, username: &str) -> Result<()> {
    let record = directory_client(config)?.peer_info(username).await?;
    println!("Username:  {}", record.username);
    println!("Address:   {}", record.socket_addr());
    if !record.last_seen.is_empty() {
        println!("Last seen: {}", record.last_seen);
    }
    Ok(())
}

async fn run_session(config: Config, register: bool) -> Result<()> {
    if config.username.trim().is_empty() {
        anyhow::bail!("Username required. Set it in the config or pass --username");
    }

    let (node, events) = Node::start(config).await?;
    println!("peerlink v{}", env!("CARGO_PKG_VERSION"));
    println!("Listening as '{}' on {}", node.username(), node.local_addr());

    if register {
        if let Err(e) = node.register_with_directory().await {
            node.shutdown().await;
            return Err(e).context("Directory registration failed");
        }
    }

    let decisions: DecisionQueue = Arc::new(Mutex::new(VecDeque::new()));
    let printer = tokio::spawn(print_events(events, decisions.clone()));

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if !handle_command(&node, &decisions, line.trim()).await {
            break;
        }
    }

    println!("Shutting down...");
    node.shutdown().await;
    if register {
        if let Err(e) = node.unregister_from_directory().await {
            tracing::warn!("Failed to unregister: {}", e);
        }
    }
    printer.abort();
    Ok(())
}

/// Oldest connection request still waiting for an answer.
///
/// Requests whose handshake already timed out are dropped so `accept` and
/// `reject` fall through to the pending file offer.
async fn next_decision(decisions: &DecisionQueue) -> Option<ConnectionDecision> {
    let mut queue = decisions.lock().await;
    while let Some(decision) = queue.pop_front() {
        if decision.is_pending() {
            return Some(decision);
        }
        println!("Connection request from {} expired", decision.username);
    }
    None
}

/// Execute one shell command. Returns false when the session should end.
async fn handle_command(node: &Arc<Node>, decisions: &DecisionQueue, line: &str) -> bool {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let arg1 = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match (command, arg1, rest) {
        ("", _, _) => {}
        ("exit" | "quit", _, _) => return false,
        ("help", _, _) => print_help(),
        ("list", _, _) => match node.directory().list_peers().await {
            Ok(peers) => {
                let others: Vec<String> = peers.into_iter().filter(|p| p != node.username()).collect();
                if others.is_empty() {
                    println!("No other peers online");
                } else {
                    println!("Online: {}", others.join(", "));
                }
            }
            Err(e) => println!("Could not list peers: {}", e),
        },
        ("connect", Some(username), addr) => {
            // The remote user has to answer, so don't block the shell
            let node = node.clone();
            let username = username.to_string();
            let addr = addr.map(str::to_string);
            tokio::spawn(async move {
                println!("Connecting to {}...", username);
                let result = match addr {
                    Some(addr) => node.connect(&username, &addr).await,
                    None => node.connect_via_directory(&username).await,
                };
                if let Err(e) = result {
                    println!("Could not connect to {}: {}", username, e);
                }
            });
        }
        ("send", Some(username), Some(message)) => {
            if let Err(e) = node.send_text(username, message).await {
                println!("Send failed: {}", e);
            }
        }
        ("file", Some(username), Some(path)) => {
            let node = node.clone();
            let username = username.to_string();
            let path = expand_path(path);
            tokio::spawn(async move {
                match node.send_file(&username, &path).await {
                    Ok(SendOutcome::Delivered { filename, chunks }) => {
                        println!("Sent {} to {} ({} chunks)", filename, username, chunks)
                    }
                    Ok(SendOutcome::Rejected) => println!("{} declined the file", username),
                    Ok(SendOutcome::TimedOut) => println!("{} did not answer the file offer", username),
                    Err(e) => println!("File transfer failed: {}", e),
                }
            });
        }
        ("accept", _, _) => {
            if let Some(decision) = next_decision(decisions).await {
                let username = decision.username.clone();
                if decision.accept() {
                    println!("Accepted connection from {}", username);
                } else {
                    println!("Connection request from {} expired", username);
                }
            } else {
                match node.accept_file().await {
                    Ok(metadata) => println!("Receiving {} ({} bytes)", metadata.filename, metadata.size),
                    Err(e) => println!("Nothing to accept: {}", e),
                }
            }
        }
        ("reject", _, _) => {
            if let Some(decision) = next_decision(decisions).await {
                let username = decision.username.clone();
                if decision.reject() {
                    println!("Rejected connection from {}", username);
                }
            } else if let Err(e) = node.reject_file().await {
                println!("Reject failed: {}", e);
            }
        }
        ("abort", _, _) => {
            if node.abort_transfer().await {
                println!("Transfer aborted");
            } else {
                println!("No transfer in progress");
            }
        }
        ("peers", _, _) => {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("No active connections");
            }
            for peer in peers {
                println!(
                    "  {} ({}, {}) connected {}s",
                    peer.username,
                    peer.role,
                    peer.addr,
                    peer.connected_for.as_secs()
                );
            }
        }
        ("status", _, _) => {
            let status = node.transfer_status().await;
            match (&status.peer, &status.filename) {
                (Some(peer), Some(filename)) => println!(
                    "{}: {} with {} ({}/{} chunks)",
                    status.state, filename, peer, status.chunks_transferred, status.total_chunks
                ),
                _ => println!("{}", status.state),
            }
            if let Some(offer) = node.pending_offer().await {
                println!(
                    "Pending offer: {} ({} bytes) from {}",
                    offer.metadata.filename, offer.metadata.size, offer.sender
                );
            }
        }
        ("disconnect", Some(username), _) => {
            if !node.disconnect(username).await {
                println!("Not connected to {}", username);
            }
        }
        _ => println!("Unknown or incomplete command. Type 'help' for usage."),
    }
    true
}

async fn print_events(mut events: EventReceiver, decisions: DecisionQueue) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::ConnectionRequested(decision) => {
                println!(
                    "\n{} ({}) wants to connect. Type 'accept' or 'reject'.",
                    decision.username, decision.addr
                );
                decisions.lock().await.push_back(decision);
            }
            ClientEvent::PeerConnected { username, role, addr } => {
                println!("[+] Connected to {} ({}, {})", username, role, addr)
            }
            ClientEvent::PeerDisconnected { username } => println!("[-] {} disconnected", username),
            ClientEvent::TextReceived { from, content, .. } => println!("[{}] {}", from, content),
            ClientEvent::FileOffered { from, metadata } => println!(
                "\n{} offers {} ({} bytes, {} chunks). Type 'accept' or 'reject'.",
                from, metadata.filename, metadata.size, metadata.total_chunks
            ),
            ClientEvent::FileOfferDeclined { from, filename } => {
                println!("Declined {} from {}: a transfer is already in progress", filename, from)
            }
            ClientEvent::TransferProgress {
                filename,
                chunks_done,
                total_chunks,
                ..
            } => println!("Progress: {} {}/{} chunks", filename, chunks_done, total_chunks),
            ClientEvent::FileSent { peer, filename } => println!("Delivered {} to {}", filename, peer),
            ClientEvent::FileReceived {
                from,
                path,
                size,
                verified,
                ..
            } => {
                println!("Received {} ({} bytes) from {}", path.display(), size, from);
                if !verified {
                    println!("WARNING: integrity check failed, the file may be corrupt");
                }
            }
            ClientEvent::TransferFailed { peer, filename, reason } => {
                println!("Transfer of {} with {} failed: {}", filename, peer, reason)
            }
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  list                      peers registered with the directory");
    println!("  connect <user> [host:port]");
    println!("  send <user> <message>");
    println!("  file <user> <path>");
    println!("  accept | reject           answer a connection request or file offer");
    println!("  abort                     cancel the current transfer");
    println!("  peers                     active connections");
    println!("  status                    transfer state");
    println!("  disconnect <user>");
    println!("  help | exit");
}

fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
        tracing::info!("Created config directory: {}", parent.display());
    }

    let config = Config::default();
    let toml = toml::to_string_pretty(&config)?;
    std::fs::write(config_path, toml)?;
    std::fs::create_dir_all(config.download_dir())?;

    println!("Initialized peerlink config at: {}", config_path.display());
    println!("Set `username` before running `peerlink run`.");
    Ok(())
}
