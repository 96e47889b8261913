mod auth;
mod commands;
mod config;
mod logging;

use std::{
    fs,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use auth::ConsoleTokens;
use chat_client::{HttpChatApi, RuntimeHandle, SocketPushChannel, spawn_runtime};
use chat_core::{ChatCommand, ChatEvent, Message, NotificationBridge, PeerProfile, TimelineChange};
use chat_platform::FileCounterStore;
use commands::{ConsoleCommand, HELP, parse_line};
use config::ConsoleConfig;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{debug, error, info, warn};

const CONVERSATION_PREVIEW_ROWS: usize = 10;

type SearchResults = Arc<Mutex<Vec<PeerProfile>>>;

/// Console-side state that outlives single lines.
struct Console {
    results: SearchResults,
    tokens: Arc<ConsoleTokens>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting chat-console");

    let config = match ConsoleConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid console configuration");
            return ExitCode::from(2);
        }
    };
    if let Err(err) = fs::create_dir_all(&config.data_dir) {
        warn!(path = %config.data_dir.display(), error = %err, "could not create data dir");
    }

    let tokens = Arc::new(auth::token_provider(
        &config.user_id,
        config.token.as_deref(),
    ));
    let api = match HttpChatApi::new(&config.api_url, tokens.clone()) {
        Ok(api) => Arc::new(api),
        Err(err) => {
            error!(error = %err, "cannot build REST client");
            return ExitCode::from(2);
        }
    };
    let push = match SocketPushChannel::new(&config.socket_url, config.reconnect) {
        Ok(push) => Arc::new(push),
        Err(err) => {
            error!(error = %err, "cannot build push channel");
            return ExitCode::from(2);
        }
    };
    let counters = Arc::new(FileCounterStore::new(config.counters_path()));

    let handle = spawn_runtime(config.runtime.clone(), api, push.clone(), counters);
    let console = Console {
        results: Arc::default(),
        tokens,
    };
    tokio::spawn(render_events(handle.subscribe(), console.results.clone()));
    tokio::spawn(watch_badge(handle.notification_bridge()));

    let outcome = drive(&handle, &config, &console).await;

    push.shutdown();
    handle.abort();
    info!("chat-console stopped");
    outcome
}

async fn drive(handle: &RuntimeHandle, config: &ConsoleConfig, console: &Console) -> ExitCode {
    if handle
        .send(ChatCommand::Start {
            user_id: config.user_id.clone(),
        })
        .await
        .is_err()
    {
        error!("runtime stopped before start");
        return ExitCode::FAILURE;
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "failed to read stdin");
                return ExitCode::FAILURE;
            }
        };
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        let Some(chat_command) = to_chat_command(command, console) else {
            continue;
        };
        debug!(?chat_command, "dispatching console command");
        if handle.send(chat_command).await.is_err() {
            error!("runtime stopped; exiting");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

/// Map a console line onto a runtime command. Local-only lines yield `None`.
fn to_chat_command(command: ConsoleCommand, console: &Console) -> Option<ChatCommand> {
    let command = match command {
        ConsoleCommand::Open { peer_id } => ChatCommand::OpenConversation { peer_id },
        ConsoleCommand::Older => ChatCommand::LoadOlderPage,
        ConsoleCommand::Send { peer_id, text } => ChatCommand::SendMessage { peer_id, text },
        ConsoleCommand::Retry { client_id } => ChatCommand::RetrySend { client_id },
        ConsoleCommand::Search { query } => ChatCommand::SearchUsers { query },
        ConsoleCommand::Pick { index } => match pick(&console.results, index) {
            Some(user) => ChatCommand::OpenFromSearch { user },
            None => {
                println!("no search result #{index}");
                return None;
            }
        },
        ConsoleCommand::Focus { peer_id } => ChatCommand::FocusConversation { peer_id },
        ConsoleCommand::Close => ChatCommand::CloseConversation,
        ConsoleCommand::Show => ChatCommand::SetVisible { visible: true },
        ConsoleCommand::Hide => ChatCommand::SetVisible { visible: false },
        ConsoleCommand::Refresh => ChatCommand::RefreshConversations,
        ConsoleCommand::SignOut => {
            if let Ok(mut users) = console.results.lock() {
                users.clear();
            }
            auth::forget(&console.tokens);
            ChatCommand::SignOut
        }
        ConsoleCommand::Help => {
            println!("{HELP}");
            return None;
        }
        ConsoleCommand::Quit => return None,
    };
    Some(command)
}

fn pick(results: &SearchResults, index: usize) -> Option<PeerProfile> {
    let users = results.lock().ok()?;
    users.get(index.checked_sub(1)?).cloned()
}

async fn render_events(mut events: chat_core::EventStream, results: SearchResults) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "console fell behind runtime events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            ChatEvent::ConnectivityChanged { state } => info!(?state, "connectivity"),
            ChatEvent::ConversationsUpdated { conversations } => {
                info!(count = conversations.len(), "conversations");
                for entry in conversations.iter().take(CONVERSATION_PREVIEW_ROWS) {
                    let name = if entry.peer_display_name.is_empty() {
                        entry.peer_id.as_str()
                    } else {
                        entry.peer_display_name.as_str()
                    };
                    println!(
                        "  {name:<24} {:>3} unread  {}",
                        entry.unread_count, entry.last_message_text
                    );
                }
            }
            ChatEvent::UnreadTotalChanged { total } => debug!(total, "unread total"),
            ChatEvent::TimelineUpdated {
                peer_id,
                change,
                messages,
            } => render_timeline(&peer_id, change, &messages),
            ChatEvent::FocusChanged { peer } => {
                info!(peer_id = %peer.id, name = peer.display_name(), "focused")
            }
            ChatEvent::SearchResults { query, users } => {
                info!(%query, count = users.len(), "search results");
                for (position, user) in users.iter().enumerate() {
                    println!("  {:>2}. {} <{}> ({})", position + 1, user.name, user.email, user.id);
                }
                if let Ok(mut latest) = results.lock() {
                    *latest = users;
                }
            }
            ChatEvent::SendFailed {
                client_id,
                peer_id,
                error_code,
                ..
            } => warn!(
                %client_id,
                %peer_id,
                %error_code,
                "send failed; 'retry {client_id}' to resend"
            ),
            ChatEvent::Notice {
                code,
                message,
                recoverable,
            } => warn!(%code, recoverable, "{message}"),
        }
    }
}

fn render_timeline(peer_id: &str, change: TimelineChange, messages: &[Message]) {
    match change {
        TimelineChange::Reset => {
            debug!(%peer_id, "timeline reset");
            return;
        }
        TimelineChange::PageLoaded {
            page_index,
            has_more,
            ..
        } => info!(%peer_id, page_index, has_more, count = messages.len(), "history page"),
        TimelineChange::Appended | TimelineChange::Reconciled => {}
    }
    for message in messages {
        let marker = if message.is_pending() {
            "…"
        } else if message.is_failed() {
            "!"
        } else {
            " "
        };
        println!(
            "  {} {marker} {:<12} {}",
            message.timestamp.format("%m-%d %H:%M"),
            message.from,
            message.text
        );
    }
}

async fn watch_badge(mut bridge: NotificationBridge) {
    while let Some(total) = bridge.changed().await {
        debug!(total, "badge");
    }
}

#[cfg(test)]
mod tests {
    use chat_platform::{AuthTokenProvider, CredentialStore, InMemoryCredentialStore};

    use super::*;

    fn console_with(users: Vec<PeerProfile>) -> Console {
        let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::default());
        Console {
            results: Arc::new(Mutex::new(users)),
            tokens: Arc::new(auth::with_store(store, "me", Some("t0ken"))),
        }
    }

    #[test]
    fn pick_opens_the_listed_user() {
        let console = console_with(vec![
            PeerProfile::new("u1", "Ada", "ada@example.com"),
            PeerProfile::new("u2", "Grace", "grace@example.com"),
        ]);
        assert_eq!(
            to_chat_command(ConsoleCommand::Pick { index: 2 }, &console),
            Some(ChatCommand::OpenFromSearch {
                user: PeerProfile::new("u2", "Grace", "grace@example.com"),
            })
        );
        assert_eq!(to_chat_command(ConsoleCommand::Pick { index: 3 }, &console), None);
    }

    #[test]
    fn sign_out_forgets_search_results_and_token() {
        let console = console_with(vec![PeerProfile::new("u1", "Ada", "ada@example.com")]);
        assert_eq!(console.tokens.bearer_token().as_deref(), Some("t0ken"));
        assert_eq!(
            to_chat_command(ConsoleCommand::SignOut, &console),
            Some(ChatCommand::SignOut)
        );
        assert!(console.results.lock().expect("results lock").is_empty());
        assert_eq!(console.tokens.bearer_token(), None);
    }

    #[test]
    fn visibility_lines_map_to_set_visible() {
        let console = console_with(Vec::new());
        assert_eq!(
            to_chat_command(ConsoleCommand::Hide, &console),
            Some(ChatCommand::SetVisible { visible: false })
        );
        assert_eq!(to_chat_command(ConsoleCommand::Help, &console), None);
    }
}
