//! Single-loop runtime that wires the sync components to their collaborators.
//!
//! Commands, push events and completions of spawned network calls are all
//! handled on one task, so component state is never touched concurrently.
//! Network calls report back through an internal channel tagged with the
//! session epoch; completions from a previous user are discarded.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chat_core::{
    BadgeCounter, ChannelError, ChatApi, ChatChannels, ChatCommand, ChatError, ChatEvent,
    ConnectivityState, Conversation, ConversationIndex, EventStream, HistoryPage, LinkState,
    LiveOutcome, Message, NotificationBridge, OutboundMessage, PageOutcome, PageRequest,
    PeerProfile, PushChannel, PushEvent, RuntimeConfig, SearchDebouncer, SearchTicket, SendAck,
    SendOutcome, SendPipeline, SendResolution, SessionManager, TimelineChange, TimelinePager,
    normalize_send_outcome, notice_from_error,
};
use chat_platform::UnreadCounterStore;
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, trace, warn};

use crate::counters::CounterWriter;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

enum Completion {
    History {
        request: PageRequest,
        result: Result<HistoryPage, ChatError>,
    },
    Snapshot {
        generation: u64,
        result: Result<Vec<Conversation>, ChatError>,
    },
    SearchDue(SearchTicket),
    Search {
        ticket: SearchTicket,
        result: Result<Vec<PeerProfile>, ChatError>,
    },
    Profile {
        peer_id: String,
        result: Result<PeerProfile, ChatError>,
    },
    /// The push channel finished with an outbound frame.
    Dispatched {
        client_id: String,
        result: Result<(), ChatError>,
    },
}

struct Tagged {
    epoch: u64,
    completion: Completion,
}

/// Handle to a spawned runtime.
pub struct RuntimeHandle {
    channels: ChatChannels,
    unread: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl RuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn unread_total(&self) -> u64 {
        *self.unread.borrow()
    }

    pub fn notification_bridge(&self) -> NotificationBridge {
        NotificationBridge::new(self.channels.command_sender(), self.unread.clone())
    }

    /// Stop the runtime loop without waiting for queued commands.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the runtime on the current tokio runtime.
pub fn spawn_runtime(
    config: RuntimeConfig,
    api: Arc<dyn ChatApi>,
    push: Arc<dyn PushChannel>,
    counters: Arc<dyn UnreadCounterStore>,
) -> RuntimeHandle {
    let (channels, commands) = ChatChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let (unread_tx, unread_rx) = watch::channel(0_u64);
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    // Subscribe before spawning so no push event is missed.
    let push_events = push.subscribe();

    let runtime = ChatRuntime::new(
        config,
        api,
        push,
        CounterWriter::spawn(counters),
        channels.event_sender(),
        unread_tx,
        completions_tx,
    );
    let task = tokio::spawn(runtime.run(commands, push_events, completions_rx));

    RuntimeHandle {
        channels,
        unread: unread_rx,
        task,
    }
}

struct ChatRuntime {
    config: RuntimeConfig,
    api: Arc<dyn ChatApi>,
    push: Arc<dyn PushChannel>,
    counters: CounterWriter,
    events: broadcast::Sender<ChatEvent>,
    unread_tx: watch::Sender<u64>,
    completions_tx: mpsc::UnboundedSender<Tagged>,
    epoch: u64,
    user_id: Option<String>,
    session: SessionManager,
    timeline: TimelinePager,
    index: ConversationIndex,
    sends: SendPipeline,
    badge: BadgeCounter,
    search: SearchDebouncer,
    pending_focus: Option<String>,
    profile_lookups: HashSet<String>,
}

impl ChatRuntime {
    fn new(
        config: RuntimeConfig,
        api: Arc<dyn ChatApi>,
        push: Arc<dyn PushChannel>,
        counters: CounterWriter,
        events: broadcast::Sender<ChatEvent>,
        unread_tx: watch::Sender<u64>,
        completions_tx: mpsc::UnboundedSender<Tagged>,
    ) -> Self {
        let mut session = SessionManager::new(push.clone());
        let connectivity_events = events.clone();
        session.on_connectivity_change(Box::new(move |state| {
            let _ = connectivity_events.send(ChatEvent::ConnectivityChanged { state });
        }));

        Self {
            timeline: TimelinePager::new("", config.page_size),
            index: ConversationIndex::new("", config.seen_message_capacity),
            search: SearchDebouncer::new(Duration::from_millis(config.search_debounce_ms)),
            config,
            api,
            push,
            counters,
            events,
            unread_tx,
            completions_tx,
            epoch: 0,
            user_id: None,
            session,
            sends: SendPipeline::new(),
            badge: BadgeCounter::new(),
            pending_focus: None,
            profile_lookups: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ChatCommand>,
        mut push_events: broadcast::Receiver<PushEvent>,
        mut completions: mpsc::UnboundedReceiver<Tagged>,
    ) {
        info!(page_size = self.config.page_size, "chat runtime started");
        let mut push_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = push_events.recv(), if push_open => match event {
                    Ok(event) => self.handle_push(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push events lagged; resynchronizing");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("push channel closed its event stream");
                        push_open = false;
                    }
                },
                Some(tagged) = completions.recv() => {
                    if tagged.epoch == self.epoch {
                        self.handle_completion(tagged.completion);
                    } else {
                        trace!("dropping completion from a previous session");
                    }
                }
            }
        }
        info!("command channel closed; chat runtime stopped");
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Start { user_id } => self.start(user_id).await,
            ChatCommand::SignOut => self.sign_out(),
            ChatCommand::RefreshConversations => self.request_snapshot(),
            ChatCommand::OpenConversation { peer_id } => {
                if self.require_user() {
                    self.open_conversation(peer_id);
                }
            }
            ChatCommand::OpenFromSearch { user } => {
                if self.require_user() {
                    self.index.mark_opened_from_search(&user);
                    self.open_conversation(user.id);
                }
            }
            ChatCommand::FocusConversation { peer_id } => self.focus_conversation(peer_id),
            ChatCommand::CloseConversation => self.close_conversation(),
            ChatCommand::LoadOlderPage => match self.timeline.load_older_page() {
                Some(request) => self.spawn_history(request),
                None => trace!("older page request suppressed"),
            },
            ChatCommand::SetVisible { visible } => self.set_visible(visible),
            ChatCommand::SendMessage { peer_id, text } => self.send_message(&peer_id, &text),
            ChatCommand::RetrySend { client_id } => self.retry_send(&client_id),
            ChatCommand::SearchUsers { query } => self.search_users(&query),
        }
    }

    async fn start(&mut self, user_id: String) {
        if self.user_id.as_deref() == Some(user_id.as_str()) {
            debug!(%user_id, "already started for user; refreshing");
            self.request_snapshot();
            return;
        }
        info!(%user_id, "starting chat session");
        self.reset_state(Some(user_id.clone()));

        match self.counters.load(&user_id).await {
            Ok(restored) => self.badge.restore(restored),
            Err(err) => warn!(%user_id, error = %err, "failed to restore unread counter"),
        }
        self.publish_unread();

        if let Err(err) = self.session.register_identity(&user_id).await {
            warn!(%user_id, error = %err, "identity registration failed");
            self.emit(notice_from_error(&err));
        }
        self.session.connect();
        self.request_snapshot();
    }

    fn sign_out(&mut self) {
        info!("signing out of chat session");
        self.session.sign_out();
        self.reset_state(None);
        self.counters.clear_all();
        self.emit_conversations();
        self.publish_unread();
    }

    fn reset_state(&mut self, user_id: Option<String>) {
        self.epoch = self.epoch.wrapping_add(1);
        let self_id = user_id.clone().unwrap_or_default();
        self.timeline.reset(self_id.clone());
        self.index.reset(self_id);
        self.sends.bind(user_id.clone());
        self.badge.reset();
        self.search.cancel();
        self.pending_focus = None;
        self.profile_lookups.clear();
        self.user_id = user_id;
    }

    fn require_user(&self) -> bool {
        if self.user_id.is_none() {
            debug!("ignoring command without a signed-in user");
            return false;
        }
        true
    }

    fn open_conversation(&mut self, peer_id: String) {
        self.pending_focus = None;
        self.index.mark_focused(&peer_id);
        let request = self.timeline.open_conversation(peer_id.clone());
        debug!(%peer_id, "conversation opened");

        self.emit(ChatEvent::TimelineUpdated {
            peer_id: peer_id.clone(),
            change: TimelineChange::Reset,
            messages: Vec::new(),
        });
        let peer = self.peer_profile(&peer_id);
        self.emit(ChatEvent::FocusChanged { peer });
        self.emit_conversations();
        self.publish_unread();
        self.spawn_history(request);
    }

    fn focus_conversation(&mut self, peer_id: String) {
        if !self.require_user() {
            return;
        }
        let known = self.index.get(&peer_id).is_some() || self.index.profile(&peer_id).is_some();
        if known {
            self.open_conversation(peer_id);
            return;
        }
        debug!(%peer_id, "looking up peer before focusing");
        self.pending_focus = Some(peer_id.clone());
        self.spawn_profile_lookup(peer_id);
    }

    fn close_conversation(&mut self) {
        self.pending_focus = None;
        self.index.clear_focus();
        if let Some(peer_id) = self.timeline.peer_id().map(str::to_owned) {
            self.timeline.close();
            self.emit(ChatEvent::TimelineUpdated {
                peer_id,
                change: TimelineChange::Reset,
                messages: Vec::new(),
            });
        }
    }

    fn set_visible(&mut self, visible: bool) {
        let cleared = self.index.set_visible(visible);
        debug!(visible, cleared, "visibility changed");
        if cleared > 0 {
            self.emit_conversations();
            self.publish_unread();
        }
        if visible {
            self.request_snapshot();
        }
    }

    fn send_message(&mut self, peer_id: &str, text: &str) {
        let (message, outbound) = match self.sends.prepare(peer_id, text, Utc::now()) {
            Ok(prepared) => prepared,
            Err(err) => {
                debug!(code = %err.code, "send rejected");
                self.emit(notice_from_error(&err));
                return;
            }
        };

        if self.timeline.append_optimistic(message.clone()) == LiveOutcome::Inserted {
            self.emit_timeline(TimelineChange::Appended);
        }
        self.merge_into_index(&message);
        self.dispatch(outbound);
    }

    fn retry_send(&mut self, client_id: &str) {
        match self.sends.retry(client_id) {
            Ok((_, outbound)) => {
                if self.timeline.mark_pending(client_id).is_ok() {
                    self.emit_timeline(TimelineChange::Reconciled);
                }
                self.dispatch(outbound);
            }
            Err(err) => self.emit(notice_from_error(&err)),
        }
    }

    /// Hand the frame to the push channel off the loop; the result comes back as a completion.
    fn dispatch(&mut self, outbound: OutboundMessage) {
        let push = self.push.clone();
        self.spawn_call(async move {
            let client_id = outbound.client_id.clone();
            let result = push.send(outbound).await;
            Completion::Dispatched { client_id, result }
        });
    }

    fn handle_dispatched(&mut self, client_id: String, result: Result<(), ChatError>) {
        let outcome = match result {
            Ok(()) if self.config.confirm_on_dispatch => SendOutcome::Accepted { message_id: None },
            Ok(()) => {
                trace!(%client_id, "frame written; waiting for the server ack");
                return;
            }
            Err(error) => {
                debug!(%client_id, code = %error.code, "outbound frame was not written");
                SendOutcome::Rejected { error }
            }
        };
        self.apply_ack(&normalize_send_outcome(client_id, outcome));
    }

    fn apply_ack(&mut self, ack: &SendAck) {
        match self.sends.resolve_ack(ack) {
            Some(SendResolution::Confirmed {
                client_id,
                message_id,
                ..
            }) => {
                if self.timeline.confirm(&client_id, message_id).is_ok() {
                    self.emit_timeline(TimelineChange::Reconciled);
                }
            }
            Some(SendResolution::Failed {
                client_id,
                peer_id,
                text,
                error_code,
            }) => {
                if self.timeline.mark_failed(&client_id).is_ok() {
                    self.emit_timeline(TimelineChange::Reconciled);
                }
                self.emit(ChatEvent::SendFailed {
                    client_id,
                    peer_id,
                    text,
                    error_code,
                });
            }
            None => {}
        }
    }

    fn search_users(&mut self, query: &str) {
        let ticket = self.search.begin(query);
        let delay = self.search.delay();
        let epoch = self.epoch;
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = completions.send(Tagged {
                epoch,
                completion: Completion::SearchDue(ticket),
            });
        });
    }

    async fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Link(link) => self.handle_link(link).await,
            PushEvent::Message(message) => self.handle_live_message(message),
            PushEvent::SendAck(ack) => self.apply_ack(&ack),
        }
    }

    async fn handle_link(&mut self, link: LinkState) {
        let before = self.session.state();
        if let Err(err) = self.session.handle_link(link).await {
            warn!(error = %err, "identity registration after connect failed");
            self.emit(notice_from_error(&err));
        }
        let recovered = matches!(
            before,
            ConnectivityState::Disconnected | ConnectivityState::Connecting
        ) && matches!(
            self.session.state(),
            ConnectivityState::Connected | ConnectivityState::Registered
        );
        if recovered && self.user_id.is_some() {
            debug!("push channel connected; resynchronizing");
            self.resync();
        }
    }

    /// Catch up on whatever the push channel may have missed.
    fn resync(&mut self) {
        self.request_snapshot();
        if let Some(request) = self.timeline.refresh_latest() {
            self.spawn_history(request);
        }
    }

    fn handle_live_message(&mut self, message: Message) {
        if self.user_id.is_none() {
            return;
        }
        if let Some(client_id) = self.sends.confirm_echo(&message) {
            trace!(%client_id, "live echo confirmed pending send");
        }
        match self.timeline.append_live(message.clone()) {
            LiveOutcome::Inserted => self.emit_timeline(TimelineChange::Appended),
            LiveOutcome::Reconciled => self.emit_timeline(TimelineChange::Reconciled),
            LiveOutcome::Duplicate | LiveOutcome::NotInTimeline => {}
        }
        self.merge_into_index(&message);
    }

    fn merge_into_index(&mut self, message: &Message) {
        let Some(outcome) = self.index.apply_incoming(message) else {
            return;
        };
        self.emit_conversations();
        self.publish_unread();
        if outcome.needs_profile {
            self.spawn_profile_lookup(outcome.peer_id);
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History { request, result } => {
                match self.timeline.apply_page(&request, result) {
                    PageOutcome::Applied(change) => self.emit_timeline(change),
                    PageOutcome::Stale => trace!(peer_id = %request.peer_id, "stale history page"),
                    PageOutcome::Failed(err) => {
                        warn!(peer_id = %request.peer_id, error = %err, "history fetch failed");
                        self.emit(notice_from_error(&err));
                    }
                }
            }
            Completion::Snapshot { generation, result } => match result {
                Ok(conversations) => {
                    if self.index.load_snapshot(generation, conversations) {
                        self.emit_conversations();
                        self.publish_unread();
                    }
                }
                Err(err) => {
                    self.index.abandon_snapshot(generation);
                    warn!(error = %err, "conversation snapshot failed");
                    self.emit(notice_from_error(&err));
                }
            },
            Completion::SearchDue(ticket) => {
                if self.search.is_current(&ticket) {
                    self.spawn_search(ticket);
                }
            }
            Completion::Search { ticket, result } => {
                if !self.search.is_current(&ticket) {
                    trace!(query = %ticket.query, "dropping superseded search results");
                    return;
                }
                let users = match result {
                    Ok(users) => users,
                    Err(err) => {
                        self.emit(notice_from_error(&err));
                        Vec::new()
                    }
                };
                let mut renamed = false;
                for user in &users {
                    renamed |= self.index.apply_profile(user.clone());
                }
                if renamed {
                    self.emit_conversations();
                }
                self.emit(ChatEvent::SearchResults {
                    query: ticket.query,
                    users,
                });
            }
            Completion::Profile { peer_id, result } => {
                self.profile_lookups.remove(&peer_id);
                let focus = self.pending_focus.as_deref() == Some(peer_id.as_str());
                match result {
                    Ok(profile) => {
                        if self.index.apply_profile(profile.clone()) {
                            self.emit_conversations();
                        }
                        if focus {
                            self.index.mark_opened_from_search(&profile);
                            self.open_conversation(peer_id);
                        }
                    }
                    Err(err) => {
                        debug!(%peer_id, error = %err, "directory lookup failed");
                        if focus {
                            self.emit(notice_from_error(&err));
                            self.open_conversation(peer_id);
                        }
                    }
                }
            }
            Completion::Dispatched { client_id, result } => {
                self.handle_dispatched(client_id, result)
            }
        }
    }

    fn request_snapshot(&mut self) {
        if self.user_id.is_none() {
            return;
        }
        let generation = self.index.begin_snapshot();
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.fetch_conversations().await;
            Completion::Snapshot { generation, result }
        });
    }

    fn spawn_history(&mut self, request: PageRequest) {
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api
                .fetch_history(&request.peer_id, request.limit, request.skip)
                .await;
            Completion::History { request, result }
        });
    }

    fn spawn_search(&mut self, ticket: SearchTicket) {
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.search_users(&ticket.query).await;
            Completion::Search { ticket, result }
        });
    }

    fn spawn_profile_lookup(&mut self, peer_id: String) {
        if !self.profile_lookups.insert(peer_id.clone()) {
            return;
        }
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.fetch_user(&peer_id).await;
            Completion::Profile { peer_id, result }
        });
    }

    fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let epoch = self.epoch;
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let completion = call.await;
            let _ = completions.send(Tagged { epoch, completion });
        });
    }

    fn peer_profile(&self, peer_id: &str) -> PeerProfile {
        if let Some(profile) = self.index.profile(peer_id) {
            return profile.clone();
        }
        let name = self
            .index
            .get(peer_id)
            .map(|entry| entry.peer_display_name.clone())
            .unwrap_or_default();
        PeerProfile::new(peer_id, name, "")
    }

    fn publish_unread(&mut self) {
        let Some(total) = self.badge.publish(&self.index) else {
            return;
        };
        self.unread_tx.send_replace(total);
        self.emit(ChatEvent::UnreadTotalChanged { total });
        if let Some(user_id) = &self.user_id {
            self.counters.save(user_id, total);
        }
    }

    fn emit_conversations(&self) {
        self.emit(ChatEvent::ConversationsUpdated {
            conversations: self.index.conversations().to_vec(),
        });
    }

    fn emit_timeline(&self, change: TimelineChange) {
        if let Some(peer_id) = self.timeline.peer_id() {
            self.emit(ChatEvent::TimelineUpdated {
                peer_id: peer_id.to_owned(),
                change,
                messages: self.timeline.items().to_vec(),
            });
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}
