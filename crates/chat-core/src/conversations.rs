use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::types::{Conversation, Message, PeerProfile};

/// Bounded memory of merged message identities.
///
/// Identities are compared with the same precedence as
/// [`Message::same_message`]: server IDs first, then client IDs, and the
/// `from|to|timestamp` surrogate only when neither side can be told apart by
/// an ID. The oldest identity is forgotten once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct SeenWindow {
    capacity: usize,
    order: VecDeque<SeenIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SeenIdentity {
    id: Option<String>,
    client_id: Option<String>,
    key: String,
}

impl SeenIdentity {
    fn of(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            client_id: message.client_id.clone(),
            key: message.surrogate_key(),
        }
    }

    fn matches(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.client_id, &other.client_id) {
            return a == b;
        }
        self.key == other.key
    }

    /// Fill in IDs learned from a later copy of the same message.
    fn absorb(&mut self, other: Self) {
        if self.id.is_none() {
            self.id = other.id;
        }
        if self.client_id.is_none() {
            self.client_id = other.client_id;
        }
    }
}

impl SeenWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
        }
    }

    /// Record `message`. Returns `false` when it was already known.
    pub fn remember(&mut self, message: &Message) -> bool {
        let identity = SeenIdentity::of(message);
        if let Some(known) = self.order.iter_mut().find(|seen| seen.matches(&identity)) {
            known.absorb(identity);
            return false;
        }
        self.order.push_back(identity);
        while self.order.len() > self.capacity {
            self.order.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}

/// What [`ConversationIndex::apply_incoming`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOutcome {
    pub peer_id: String,
    /// A conversation entry was synthesized for a new peer.
    pub created: bool,
    pub unread_incremented: bool,
    /// The entry has no display name and no cached profile; a directory lookup is due.
    pub needs_profile: bool,
}

#[derive(Debug, Clone, Default)]
struct SnapshotState {
    generation: u64,
    in_flight: Option<u64>,
    /// Live messages merged while the snapshot request was outstanding.
    buffered: Vec<Message>,
}

/// Recency-ordered conversation list with per-peer unread counts.
#[derive(Debug, Clone)]
pub struct ConversationIndex {
    self_id: String,
    entries: Vec<Conversation>,
    focused: Option<String>,
    visible: bool,
    profiles: HashMap<String, PeerProfile>,
    seen: SeenWindow,
    snapshot: SnapshotState,
    has_snapshot: bool,
}

impl ConversationIndex {
    pub fn new(self_id: impl Into<String>, seen_capacity: usize) -> Self {
        Self {
            self_id: self_id.into(),
            entries: Vec::new(),
            focused: None,
            visible: true,
            profiles: HashMap::new(),
            seen: SeenWindow::new(seen_capacity),
            snapshot: SnapshotState::default(),
            has_snapshot: false,
        }
    }

    /// Forget everything and bind to `self_id`.
    ///
    /// The snapshot generation keeps counting so responses requested before
    /// the reset are still recognized as superseded.
    pub fn reset(&mut self, self_id: impl Into<String>) {
        let capacity = self.seen.capacity;
        let generation = self.snapshot.generation;
        *self = Self::new(self_id, capacity);
        self.snapshot.generation = generation;
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.entries
    }

    pub fn get(&self, peer_id: &str) -> Option<&Conversation> {
        self.entries.iter().find(|entry| entry.peer_id == peer_id)
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether at least one snapshot has replaced the list.
    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    pub fn profile(&self, peer_id: &str) -> Option<&PeerProfile> {
        self.profiles.get(peer_id)
    }

    /// Aggregate unread count.
    pub fn unread_total(&self) -> u64 {
        self.entries.iter().map(|entry| entry.unread_count).sum()
    }

    /// Start a snapshot request. Live messages merged until it lands are replayed on top of it.
    pub fn begin_snapshot(&mut self) -> u64 {
        self.snapshot.generation = self.snapshot.generation.wrapping_add(1);
        self.snapshot.in_flight = Some(self.snapshot.generation);
        self.snapshot.buffered.clear();
        self.snapshot.generation
    }

    /// Give up on snapshot `generation` after a failed fetch.
    pub fn abandon_snapshot(&mut self, generation: u64) {
        if self.snapshot.in_flight == Some(generation) {
            self.snapshot.in_flight = None;
            self.snapshot.buffered.clear();
        }
    }

    /// Replace the list with a server snapshot, keeping server order.
    ///
    /// Returns `false` when `generation` was superseded and nothing was applied.
    pub fn load_snapshot(&mut self, generation: u64, conversations: Vec<Conversation>) -> bool {
        if self.snapshot.in_flight != Some(generation) {
            debug!(generation, "dropping superseded conversation snapshot");
            return false;
        }
        self.snapshot.in_flight = None;
        let buffered = std::mem::take(&mut self.snapshot.buffered);

        let mut peers = HashSet::new();
        self.entries = conversations
            .into_iter()
            .filter(|entry| peers.insert(entry.peer_id.clone()))
            .map(|mut entry| {
                if entry.peer_display_name.is_empty()
                    && let Some(profile) = self.profiles.get(&entry.peer_id)
                {
                    entry.peer_display_name = profile.display_name().to_owned();
                }
                entry
            })
            .collect();

        let mut replayed = 0usize;
        for message in &buffered {
            let peer_id = message.counterpart(&self.self_id);
            let covered = self.get(peer_id).is_some_and(|entry| {
                entry
                    .last_message_timestamp
                    .is_some_and(|last| last >= message.timestamp)
            });
            if !covered {
                self.merge(message);
                replayed += 1;
            }
        }

        if self.visible
            && let Some(focused) = self.focused.clone()
        {
            self.zero_unread(&focused);
        }
        self.has_snapshot = true;
        debug!(
            generation,
            conversations = self.entries.len(),
            replayed,
            unread_total = self.unread_total(),
            "conversation snapshot loaded"
        );
        true
    }

    /// Merge one observed message. Returns `None` for duplicates and foreign messages.
    pub fn apply_incoming(&mut self, message: &Message) -> Option<IncomingOutcome> {
        if message.from != self.self_id && message.to != self.self_id {
            trace!(from = %message.from, to = %message.to, "ignoring message for another user");
            return None;
        }
        if !self.seen.remember(message) {
            trace!(key = %message.surrogate_key(), "ignoring already merged message");
            return None;
        }
        if self.snapshot.in_flight.is_some() {
            self.snapshot.buffered.push(message.clone());
        }
        Some(self.merge(message))
    }

    /// Focus `peer_id` and clear its unread count. Returns how many were cleared.
    pub fn mark_focused(&mut self, peer_id: &str) -> u64 {
        self.focused = Some(peer_id.to_owned());
        self.zero_unread(peer_id)
    }

    /// Focus a user picked from directory search, creating the entry when missing.
    pub fn mark_opened_from_search(&mut self, user: &PeerProfile) -> u64 {
        self.apply_profile(user.clone());
        if self.get(&user.id).is_none() {
            self.entries
                .insert(0, Conversation::new(&user.id, user.display_name()));
        }
        self.mark_focused(&user.id)
    }

    pub fn clear_focus(&mut self) {
        self.focused = None;
    }

    /// Record visibility. Becoming visible clears the focused conversation's unread count.
    pub fn set_visible(&mut self, visible: bool) -> u64 {
        self.visible = visible;
        match (visible, self.focused.clone()) {
            (true, Some(peer_id)) => self.zero_unread(&peer_id),
            _ => 0,
        }
    }

    /// Cache directory metadata and backfill the entry's display name.
    ///
    /// Returns `true` when a visible entry changed.
    pub fn apply_profile(&mut self, profile: PeerProfile) -> bool {
        let display_name = profile.display_name().to_owned();
        let peer_id = profile.id.clone();
        self.profiles.insert(peer_id.clone(), profile);
        match self.entries.iter_mut().find(|entry| entry.peer_id == peer_id) {
            Some(entry) if !display_name.is_empty() && entry.peer_display_name != display_name => {
                entry.peer_display_name = display_name;
                true
            }
            _ => false,
        }
    }

    fn zero_unread(&mut self, peer_id: &str) -> u64 {
        match self.entries.iter_mut().find(|entry| entry.peer_id == peer_id) {
            Some(entry) => std::mem::take(&mut entry.unread_count),
            None => 0,
        }
    }

    fn merge(&mut self, message: &Message) -> IncomingOutcome {
        let peer_id = message.counterpart(&self.self_id).to_owned();
        let (mut entry, created) = match self.entries.iter().position(|e| e.peer_id == peer_id) {
            Some(index) => (self.entries.remove(index), false),
            None => {
                let name = self
                    .profiles
                    .get(&peer_id)
                    .map(|profile| profile.display_name().to_owned())
                    .unwrap_or_default();
                (Conversation::new(peer_id.clone(), name), true)
            }
        };

        let newer = entry
            .last_message_timestamp
            .is_none_or(|last| message.timestamp >= last);
        if newer {
            entry.last_message_text = message.text.clone();
            entry.last_message_timestamp = Some(message.timestamp);
        }

        let from_peer = message.from == peer_id && message.from != self.self_id;
        let watching = self.visible && self.focused.as_deref() == Some(peer_id.as_str());
        let unread_incremented = from_peer && !watching;
        if unread_incremented {
            entry.unread_count += 1;
        }

        let needs_profile =
            entry.peer_display_name.is_empty() && !self.profiles.contains_key(&peer_id);
        self.entries.insert(0, entry);

        IncomingOutcome {
            peer_id,
            created,
            unread_incremented,
            needs_profile,
        }
    }
}
