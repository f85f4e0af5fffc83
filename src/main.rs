#![deny(dead_code)]
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use chatsync::config::{self, Credentials, SyncConfig};
use chatsync::models::{DeliveryStatus, MessageId};
use chatsync::realtime::{ChatSession, ConnectionManager, RealtimeChannel, SessionUpdate};
use chatsync::rest::{MessageApi, RestClient, StaticToken};
use chatsync::UserRef;
use utils::Command;

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: a terminal client for the realtime chat backend.",
    long_about = "chatsync connects to the chat backend over Socket.IO, keeps presence, typing and \
    unread state in sync, and sends every line typed at the prompt to the open conversation.\n\n\
    Commands: /open <peer>, /list, /older, /resend <temp-id>, /quit"
)]
struct Args {
    /// Socket.IO server url
    #[arg(long, value_name = "URL")]
    server: Option<String>,

    /// REST api base url
    #[arg(long, value_name = "URL")]
    api: Option<String>,

    /// Bearer token; falls back to CHATSYNC_TOKEN and saved credentials
    #[arg(long)]
    token: Option<String>,

    /// Our own user id
    #[arg(long, value_name = "ID")]
    user_id: Option<String>,

    /// Conversation to open right away
    #[arg(long, value_name = "ID")]
    peer: Option<String>,

    /// Directory for config.json and credentials.json
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// Work out who we are and which token to use, saving new credentials.
fn resolve_credentials(args: &Args) -> Result<(UserRef, String)> {
    let saved = match config::load_credentials() {
        Ok(saved) => saved,
        Err(e) => {
            warn!("Ignoring unreadable credentials: {}", e);
            None
        }
    };

    let token = args
        .token
        .clone()
        .or_else(|| env::var(config::ENV_TOKEN).ok())
        .or_else(|| saved.as_ref().and_then(|c| c.get_token()))
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow!("No token given; use --token or {}", config::ENV_TOKEN))?;
    let user_id = args
        .user_id
        .clone()
        .or_else(|| saved.as_ref().map(|c| c.user_id.clone()))
        .ok_or_else(|| anyhow!("No user id given; use --user-id"))?;
    let user_name = saved
        .as_ref()
        .filter(|c| c.user_id == user_id)
        .map(|c| c.user_name.clone())
        .unwrap_or_else(|| user_id.clone());

    if args.token.is_some() || args.user_id.is_some() {
        let credentials = Credentials::new(&user_id, &user_name, &token);
        if let Err(e) = config::save_credentials(&credentials) {
            warn!("Failed to save credentials: {}", e);
        }
    }

    Ok((UserRef::new(user_id, user_name), token))
}

fn print_update(session: &ChatSession, update: &SessionUpdate) {
    match update {
        SessionUpdate::Connected => println!("* connected"),
        SessionUpdate::Disconnected { reason } => println!("* disconnected: {}", reason),
        SessionUpdate::ConnectError { message } => println!("* connection error: {}", message),
        SessionUpdate::ReconnectFailed { attempts } => {
            println!("* gave up reconnecting after {} attempts; messages go over REST", attempts)
        }
        SessionUpdate::PresenceSnapshot { online } => println!("* {} users online", online),
        SessionUpdate::PresenceChanged { user_id, status } => println!("* {} is {}", user_id, status),
        SessionUpdate::MessageAppended(message) => println!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M"),
            message.sender_name,
            message.content
        ),
        SessionUpdate::Unread { peer_id, count } => println!("* {} unread from {}", count, peer_id),
        SessionUpdate::MessageFailed { id, reason } => {
            println!("* {} failed: {} (use /resend {})", id, reason, id)
        }
        SessionUpdate::Typing { peer_id, typing } => {
            if *typing && session.active_peer().as_deref() == Some(peer_id.as_str()) {
                println!("* {} is typing...", peer_id);
            }
        }
    }
}

fn print_conversation(session: &ChatSession) {
    for message in session.visible_messages() {
        let marker = match message.delivery_status {
            DeliveryStatus::Sent => " (sending)",
            DeliveryStatus::Delivered => "",
            DeliveryStatus::Error => " (failed)",
        };
        println!(
            "[{}] {}: {}{}",
            message.created_at.format("%H:%M"),
            message.sender_name,
            message.content,
            marker
        );
    }
}

fn watch_delivery(handle: chatsync::realtime::SendHandle) {
    tokio::spawn(async move {
        let temp_id = handle.temp_id.clone();
        match handle.outcome().await {
            DeliveryStatus::Error => println!("* {} was not delivered (use /resend {})", temp_id, temp_id),
            status => info!("{} finished as {:?}", temp_id, status),
        }
    });
}

/// Returns false when the user asked to quit.
async fn run_command(session: &ChatSession, command: Command) -> bool {
    match command {
        Command::Open(peer) => match session.open_conversation(&peer).await {
            Ok(loaded) => {
                println!("* conversation with {} ({} from history)", peer, loaded);
                print_conversation(session);
            }
            Err(e) => println!("* could not load history with {}: {}", peer, e),
        },
        Command::List => {
            let partners = match session.refresh_conversation_list().await {
                Ok(partners) => partners,
                Err(e) => {
                    println!("* conversation list unavailable, showing cached ({})", e);
                    session.conversation_list()
                }
            };
            for partner in partners {
                let last = partner
                    .last_message
                    .as_ref()
                    .map(|m| m.content.as_str())
                    .unwrap_or("");
                println!(
                    "{:>8} {:<20} [{}] {}",
                    partner.status.to_string(),
                    partner.display_name,
                    partner.unread_count,
                    last
                );
            }
        }
        Command::Older => match session.load_older().await {
            Ok(loaded) => {
                println!("* {} older messages", loaded);
                print_conversation(session);
            }
            Err(e) => println!("* {}", e),
        },
        Command::Resend(id) => {
            let temp_id = MessageId::Temp(id);
            match session.resend(&temp_id) {
                Ok(handle) => watch_delivery(handle),
                Err(e) => println!("* {}", e),
            }
        }
        Command::Send(text) => match session.send(&text).await {
            Ok(handle) => watch_delivery(handle),
            Err(e) => println!("* {}", e),
        },
        Command::Unknown(line) => println!("* unknown command: {}", line),
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.config_dir {
        config::set_config_dir_override(dir.clone());
    }
    let log_file = match &args.log_file {
        Some(path) => path.clone(),
        None => config::get_config_dir()?.join("chatsync.log"),
    };
    utils::setup_logging(log_file.to_str(), LevelFilter::Debug)?;
    info!("Logging to file: {}", log_file.display());

    let mut sync_config = SyncConfig::load()?;
    if let Some(server) = &args.server {
        sync_config.server_url = server.clone();
    }
    if let Some(api) = &args.api {
        sync_config.api_url = api.clone();
    }
    let (me, token) = resolve_credentials(&args)?;
    info!("Signed in as {} against {}", me.id, sync_config.server_url);

    let tokens = Arc::new(StaticToken::new(token.clone()));
    let api: Arc<dyn MessageApi> = Arc::new(RestClient::new(&sync_config.api_url, tokens)?);
    let (manager, mut events) = ConnectionManager::new(sync_config.clone());
    let manager = Arc::new(manager);
    manager.connect(&token)?;

    let channel: Arc<dyn RealtimeChannel> = manager.clone();
    let session = ChatSession::new(
        me,
        channel,
        api,
        sync_config.timeouts.clone(),
        sync_config.history_page_size,
    );

    println!("Connecting to {}...", sync_config.server_url);
    if let Some(peer) = &args.peer {
        run_command(&session, Command::Open(peer.clone())).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(update) = session.handle_event(event).await {
                        print_update(&session, &update);
                    }
                }
                None => {
                    warn!("Realtime event stream closed");
                    break;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(command) = Command::parse(&line) {
                        if !run_command(&session, command).await {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    info!("Shutting down");
    manager.disconnect();
    Ok(())
}
