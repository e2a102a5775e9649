//! Parley Terminal Client
//!
//! Line-mode chat client. Plain lines go to the open conversation; lines
//! starting with `/` are commands (`/help` lists them). The connection is
//! kept alive in the background and the last successful login is replayed
//! after every reconnect.

use anyhow::Context;
use clap::Parser;
use parley::client::{
    ClientEvent, ConnectionState, Credentials, Incoming, ReconnectController, SessionStore,
    WsConnector,
};
use parley::config::Config;
use parley::dispatch::ChatEvent;
use parley::store::{Conversation, Message};
use parley::websocket::{ConversationId, AUTH_ERROR, AUTH_SUCCESS};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "parley")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Terminal client for a Parley relay")]
struct Args {
    /// Relay WebSocket URL
    #[arg(short, long)]
    server: Option<String>,

    /// Saved-session slot, for running several accounts side by side
    #[arg(short, long)]
    profile: Option<String>,

    /// Config file (default: search the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const HELP: &str = "\
Commands:
  /login <user> <password>      log in
  /register <user> <password>   create an account and log in
  /logout                       forget the saved session
  /convs                        list conversations
  /open <id>                    open a conversation and show its history
  /new <name|-> <user,user...>  start a conversation
  /add <user>                   add someone to the open conversation
  /rename <name>                rename the open conversation
  /leave                        leave the open conversation
  /check <user>                 check whether a username exists
  /reconnect                    dial again after giving up
  /quit                         exit
Anything else is sent to the open conversation.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = parley::logging::bootstrap(|| match &args.config {
        Some(path) => Config::load_with_env(path),
        None => Ok(Config::load_default()),
    })?;
    if let Some(server) = args.server {
        config.client.server_url = server;
    }
    if let Some(profile) = args.profile {
        config.client.profile = profile;
    }

    parley::logging::init(&config.logging);

    let url = config.client.server_url.clone();
    let policy = config.client.reconnect.clone();
    let connector = WsConnector::new(url.clone());

    let controller = match SessionStore::for_profile(&config.client.profile) {
        Ok(store) => ReconnectController::start_with_session(connector, policy.clone(), store, &url),
        Err(e) => {
            tracing::warn!(error = %e, "Sessions will not be saved");
            ReconnectController::start(connector, policy.clone())
        }
    };

    println!("Parley {} - connecting to {}", env!("CARGO_PKG_VERSION"), url);
    println!("Type /help for commands.");

    let mut ui = Ui {
        max_attempts: policy.max_attempts,
        ..Ui::default()
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = controller.recv() => match event {
                Some(event) => ui.on_event(event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !ui.on_line(&controller, line.trim()) {
                    break;
                }
            }
        }
    }

    controller.close();
    Ok(())
}

#[derive(Default)]
struct Ui {
    max_attempts: u32,
    username: Option<String>,
    open: Option<ConversationId>,
}

impl Ui {
    /// Returns false to quit
    fn on_line(&mut self, controller: &ReconnectController, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        if !line.starts_with('/') {
            match self.open {
                Some(conversation_id) => report(controller.send(
                    "send_message",
                    &json!({ "conversation_id": conversation_id, "content": line }),
                )),
                None => println!("Open a conversation first (/convs, /open <id>)."),
            }
            return true;
        }

        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match (command, args.as_slice()) {
            ("/quit", _) | ("/exit", _) => return false,
            ("/help", _) => println!("{}", HELP),
            ("/login", [user, password]) => {
                report(controller.login(Credentials::login(*user, *password)))
            }
            ("/register", [user, password]) => {
                report(controller.login(Credentials::register(*user, *password)))
            }
            ("/logout", _) => {
                self.username = None;
                self.open = None;
                report(controller.logout());
                println!("Logged out.");
            }
            ("/convs", _) => report(controller.send("get_conversations", &json!({}))),
            ("/open", [id]) => match id.parse::<ConversationId>() {
                Ok(conversation_id) => {
                    self.open = Some(conversation_id);
                    report(controller.send(
                        "get_messages",
                        &json!({ "conversation_id": conversation_id }),
                    ));
                }
                Err(_) => println!("Not a conversation id: {}", id),
            },
            ("/new", [name, users]) => {
                let usernames: Vec<&str> = users.split(',').filter(|u| !u.is_empty()).collect();
                let name = (*name != "-").then_some(*name);
                report(controller.send(
                    "create_conversation",
                    &json!({
                        "name": name,
                        "is_group": usernames.len() > 1,
                        "usernames": usernames,
                    }),
                ));
            }
            ("/add", [user]) => self.in_open(|id| {
                controller.send(
                    "add_participant",
                    &json!({ "conversation_id": id, "username": user }),
                )
            }),
            ("/rename", [_, ..]) => {
                let name = args.join(" ");
                self.in_open(|id| {
                    controller.send(
                        "rename_conversation",
                        &json!({ "conversation_id": id, "name": name }),
                    )
                })
            }
            ("/leave", _) => {
                self.in_open(|id| {
                    controller.send("leave_conversation", &json!({ "conversation_id": id }))
                });
                self.open = None;
            }
            ("/check", [user]) => {
                report(controller.send("check_user", &json!({ "username": user })))
            }
            ("/reconnect", _) => report(controller.restart()),
            _ => println!("Unknown command or wrong arguments. Type /help."),
        }
        true
    }

    fn in_open<F>(&self, action: F)
    where
        F: FnOnce(ConversationId) -> Result<(), parley::client::ClientError>,
    {
        match self.open {
            Some(id) => report(action(id)),
            None => println!("Open a conversation first."),
        }
    }

    fn on_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::State(state) => self.on_state(state),
            ClientEvent::Frame(frame) => self.on_frame(frame),
        }
    }

    fn on_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting { attempt } if attempt > 1 => {
                println!("Reconnecting ({}/{})", attempt, self.max_attempts)
            }
            ConnectionState::Connected => println!("* connected"),
            ConnectionState::Backoff { attempt, delay } => println!(
                "* connection lost, retrying in {}s ({}/{})",
                delay.as_secs(),
                attempt,
                self.max_attempts
            ),
            ConnectionState::Failed => {
                println!("* disconnected. Type /reconnect to try again or /quit to exit.")
            }
            _ => {}
        }
    }

    fn on_frame(&mut self, frame: Incoming) {
        match frame.kind.as_str() {
            AUTH_SUCCESS => {
                let username = frame.body["username"].as_str().unwrap_or_default().to_string();
                println!("* logged in as {}", username);
                self.username = Some(username);
                if let Ok(conversations) =
                    serde_json::from_value::<Vec<Conversation>>(frame.body["conversations"].clone())
                {
                    print_conversations(&conversations);
                }
                return;
            }
            AUTH_ERROR | "error" => {
                println!("! {}", frame.body["message"].as_str().unwrap_or("error"));
                return;
            }
            _ => {}
        }

        let event = match frame.decode::<ChatEvent>() {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(kind = %frame.kind, error = %e, "Unrecognized frame");
                return;
            }
        };

        match event {
            ChatEvent::Conversations { conversations } => print_conversations(&conversations),
            ChatEvent::ConversationCreated { conversation } => {
                println!("* created conversation #{}", conversation.id);
                self.open = Some(conversation.id);
            }
            ChatEvent::Messages {
                conversation_id,
                messages,
            } => {
                if self.open == Some(conversation_id) {
                    println!("--- #{} ---", conversation_id);
                    messages.iter().for_each(print_message);
                }
            }
            ChatEvent::NewMessage { message } => {
                if self.open == Some(message.conversation_id) {
                    print_message(&message);
                } else {
                    println!(
                        "* new message in #{} from {}",
                        message.conversation_id, message.sender_username
                    );
                }
            }
            ChatEvent::Typing {
                conversation_id,
                username,
                ..
            } => {
                if self.open == Some(conversation_id) && self.username.as_deref() != Some(&username)
                {
                    println!("* {} is typing...", username);
                }
            }
            ChatEvent::UserCheckResult { username, exists } => {
                let verdict = if exists { "exists" } else { "does not exist" };
                println!("* {} {}", username, verdict);
            }
        }
    }
}

fn report(result: Result<(), parley::client::ClientError>) {
    if let Err(e) = result {
        println!("! {}", e);
    }
}

fn print_conversations(conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("No conversations yet. Start one with /new.");
        return;
    }
    for conversation in conversations {
        let title = conversation
            .name
            .clone()
            .unwrap_or_else(|| conversation.participants.join(", "));
        let unread = match conversation.unread_count {
            0 => String::new(),
            n => format!(" ({} unread)", n),
        };
        println!("  #{:<4} {}{}", conversation.id, title, unread);
    }
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.sender_username,
        message.content
    );
}
