mod cli;
mod logging;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use holdem_network::command::{Command, decode};
use holdem_network::{GameNode, NetworkEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::Cli;

/// Ticker period when ticks are disabled; the branch never fires then.
const IDLE_TICK: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let _log_guard = logging::init_logging(&cli.log_level, cli.log_dir.as_deref())?;

    let identity = cli.node_identity();
    let (mut node, mut events) = GameNode::with_events(identity, cli.network_config());
    node.start().await.context("Failed to start node")?;

    let tick_interval = cli.tick_interval().filter(|_| node.is_host());
    let mut ticker = tokio::time::interval(tick_interval.unwrap_or(IDLE_TICK));
    // The first tick completes immediately.
    ticker.tick().await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, cli.port),
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let chat = Command::chat(node.peer_id(), line.trim());
                    match node.broadcast(&chat).await {
                        Ok(n) => info!("Chat sent to {n} players"),
                        Err(e) => warn!("Chat not sent: {e}"),
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Cannot read stdin: {e}");
                    stdin_open = false;
                }
            },
            _ = ticker.tick(), if tick_interval.is_some() => {
                let tick = Command::tick(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
                if let Err(e) = node.broadcast(&tick).await {
                    warn!("Tick not sent: {e}");
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, leaving the table");
                break;
            }
        }
    }

    node.stop().await;
    Ok(())
}

fn print_event(event: &NetworkEvent, port: u16) {
    match event {
        NetworkEvent::Ready { is_host, identity } => {
            println!("{} ready as {}", identity.name, identity.peer_id);
            for target in identity.dial_targets() {
                println!("listening on {target}");
                if *is_host {
                    println!(
                        "Now run \"holdem -l {} -d {target}\" on a different terminal",
                        port.wrapping_add(1)
                    );
                }
            }
        }
        NetworkEvent::PeersChanged { peers } => {
            println!("players at the table: {}", peers.len());
            for peer in peers {
                println!("  {peer}");
            }
        }
        NetworkEvent::Error { cause } => println!("network error: {cause}"),
        NetworkEvent::CommandReceived { from, tag, payload } => match decode(payload) {
            Ok(Command::Chat(chat)) => println!("[{}] {}", chat.sender_id, chat.content),
            Ok(Command::Tick(tick)) => println!("tick from {from}: {}", tick.tick),
            Ok(_) => println!("{tag} from {from}"),
            Err(e) => println!("bad {tag} from {from}: {e}"),
        },
    }
}
