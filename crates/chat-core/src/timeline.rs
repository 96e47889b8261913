use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    error::ChatError,
    normalization::normalize_history,
    types::{DeliveryState, HistoryPage, Message, TimelineChange},
};

/// Errors raised when an operation targets a timeline entry that is not there.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// No entry carries the given client ID.
    #[error("timeline entry with client_id '{0}' was not found")]
    MissingEntry(String),
}

/// Why a history page was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Page 0 right after opening a conversation.
    Initial,
    /// Next older page, triggered near the oldest boundary.
    Older,
    /// Page 0 re-fetched to catch up after a reconnect. Leaves the cursor alone.
    Refresh,
}

/// One history fetch issued by the pager. Hand it back to [`TimelinePager::apply_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub peer_id: String,
    pub kind: PageKind,
    pub page_index: u32,
    pub limit: u16,
    pub skip: u32,
    generation: u64,
}

/// Backward pagination state of the open conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Index of the oldest page merged so far (0 = most recent).
    pub page_index: u32,
    /// Set once page 0 has been merged. Until then `page_index` means nothing.
    pub loaded: bool,
    /// Cleared by the first page shorter than the page size.
    pub has_more: bool,
    /// Guards against overlapping fetches.
    pub in_flight: bool,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            page_index: 0,
            loaded: false,
            has_more: true,
            in_flight: false,
        }
    }
}

/// Result of applying a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page was merged.
    Applied(TimelineChange),
    /// The conversation changed since the request; nothing was applied.
    Stale,
    /// The fetch failed; the timeline is unchanged and the fetch can be retried.
    Failed(ChatError),
}

/// Result of offering a single message to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Inserted,
    /// An optimistic entry was confirmed or replaced by its canonical copy.
    Reconciled,
    Duplicate,
    /// The message belongs to a conversation that is not open.
    NotInTimeline,
}

/// Ordered, deduplicated message sequence of the open conversation.
///
/// Entries are kept non-decreasing by timestamp; equal timestamps keep
/// arrival order.
#[derive(Debug, Clone)]
pub struct TimelinePager {
    self_id: String,
    page_size: u16,
    peer_id: Option<String>,
    items: Vec<Message>,
    cursor: PageCursor,
    generation: u64,
}

impl TimelinePager {
    /// Create a pager for `self_id` with a fixed page size (`>= 1`).
    pub fn new(self_id: impl Into<String>, page_size: u16) -> Self {
        Self {
            self_id: self_id.into(),
            page_size: page_size.max(1),
            peer_id: None,
            items: Vec::new(),
            cursor: PageCursor::default(),
            generation: 0,
        }
    }

    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    /// Rebind to another user and drop the open conversation.
    pub fn reset(&mut self, self_id: impl Into<String>) {
        self.self_id = self_id.into();
        self.close();
    }

    /// Drop the open conversation. In-flight pages for it become stale.
    pub fn close(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.peer_id = None;
        self.items.clear();
        self.cursor = PageCursor::default();
    }

    /// Reset the timeline for `peer_id` and request its most recent page.
    pub fn open_conversation(&mut self, peer_id: impl Into<String>) -> PageRequest {
        let peer_id = peer_id.into();
        self.close();
        debug!(%peer_id, "opening conversation timeline");
        self.peer_id = Some(peer_id);
        self.cursor.in_flight = true;
        self.request(PageKind::Initial, 0)
    }

    /// Request the next older page unless one is in flight or history is exhausted.
    ///
    /// While page 0 has never been merged, the initial request is re-issued instead.
    pub fn load_older_page(&mut self) -> Option<PageRequest> {
        self.peer_id.as_ref()?;
        if self.cursor.in_flight {
            trace!("older page already in flight");
            return None;
        }
        if !self.cursor.loaded {
            debug!("latest page never arrived; retrying it");
            self.cursor.in_flight = true;
            return Some(self.request(PageKind::Initial, 0));
        }
        if !self.cursor.has_more {
            trace!("history exhausted");
            return None;
        }
        self.cursor.in_flight = true;
        Some(self.request(PageKind::Older, self.cursor.page_index + 1))
    }

    /// Re-request page 0 without disturbing the pagination cursor.
    pub fn refresh_latest(&mut self) -> Option<PageRequest> {
        self.peer_id.as_ref()?;
        if self.cursor.in_flight {
            return None;
        }
        self.cursor.in_flight = true;
        let kind = if self.cursor.loaded {
            PageKind::Refresh
        } else {
            PageKind::Initial
        };
        Some(self.request(kind, 0))
    }

    /// Merge the response for `request`.
    pub fn apply_page(
        &mut self,
        request: &PageRequest,
        result: Result<HistoryPage, ChatError>,
    ) -> PageOutcome {
        if request.generation != self.generation
            || self.peer_id.as_deref() != Some(request.peer_id.as_str())
        {
            debug!(peer_id = %request.peer_id, "dropping stale history page");
            return PageOutcome::Stale;
        }
        self.cursor.in_flight = false;

        let page = match result {
            Ok(page) => page,
            Err(error) => return PageOutcome::Failed(error),
        };

        let received = page.received.max(page.messages.len());
        let has_more = received >= usize::from(self.page_size);
        let peer_id = request.peer_id.clone();
        let messages: Vec<Message> = normalize_history(page)
            .into_iter()
            .filter(|message| message.involves(&self.self_id, &peer_id))
            .collect();

        let anchor = self.items.first().cloned();
        let fresh = self.absorb(messages);
        let added = fresh.len();
        let mut merged = fresh;
        merged.append(&mut self.items);
        merged.sort_by_key(|message| message.timestamp);
        self.items = merged;

        let prepended = anchor
            .and_then(|anchor| self.items.iter().position(|m| m.same_message(&anchor)))
            .unwrap_or(self.items.len());

        debug!(
            %peer_id,
            kind = ?request.kind,
            page_index = request.page_index,
            received,
            added,
            prepended,
            "history page merged"
        );

        match request.kind {
            PageKind::Initial | PageKind::Older => {
                self.cursor.page_index = request.page_index;
                self.cursor.loaded = true;
                self.cursor.has_more = has_more;
                PageOutcome::Applied(TimelineChange::PageLoaded {
                    page_index: request.page_index,
                    prepended,
                    has_more,
                })
            }
            PageKind::Refresh => PageOutcome::Applied(TimelineChange::Appended),
        }
    }

    /// Offer a push-delivered message.
    pub fn append_live(&mut self, message: Message) -> LiveOutcome {
        if !self.belongs(&message) {
            return LiveOutcome::NotInTimeline;
        }
        match self.position_of(&message) {
            Some(index) => self.reconcile_at(index, message),
            None => {
                let mut message = message;
                message.delivery = DeliveryState::Confirmed;
                self.insert_ordered(message);
                LiveOutcome::Inserted
            }
        }
    }

    /// Insert a locally composed message as pending.
    pub fn append_optimistic(&mut self, message: Message) -> LiveOutcome {
        if !self.belongs(&message) {
            return LiveOutcome::NotInTimeline;
        }
        if self.position_of(&message).is_some() {
            return LiveOutcome::Duplicate;
        }
        let mut message = message;
        message.delivery = DeliveryState::Pending;
        self.insert_ordered(message);
        LiveOutcome::Inserted
    }

    /// Confirm a pending entry, recording its server ID when known.
    pub fn confirm(
        &mut self,
        client_id: &str,
        message_id: Option<String>,
    ) -> Result<(), TimelineError> {
        let entry = self.entry_mut(client_id)?;
        entry.delivery = DeliveryState::Confirmed;
        if entry.id.is_none() {
            entry.id = message_id;
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, client_id: &str) -> Result<(), TimelineError> {
        self.entry_mut(client_id)?.delivery = DeliveryState::Failed;
        Ok(())
    }

    pub fn mark_pending(&mut self, client_id: &str) -> Result<(), TimelineError> {
        self.entry_mut(client_id)?.delivery = DeliveryState::Pending;
        Ok(())
    }

    fn request(&self, kind: PageKind, page_index: u32) -> PageRequest {
        PageRequest {
            peer_id: self.peer_id.clone().unwrap_or_default(),
            kind,
            page_index,
            limit: self.page_size,
            skip: page_index.saturating_mul(u32::from(self.page_size)),
            generation: self.generation,
        }
    }

    fn belongs(&self, message: &Message) -> bool {
        self.peer_id
            .as_deref()
            .is_some_and(|peer_id| message.involves(&self.self_id, peer_id))
    }

    fn position_of(&self, message: &Message) -> Option<usize> {
        self.items.iter().position(|item| item.same_message(message))
    }

    fn entry_mut(&mut self, client_id: &str) -> Result<&mut Message, TimelineError> {
        self.items
            .iter_mut()
            .find(|item| item.client_id.as_deref() == Some(client_id))
            .ok_or_else(|| TimelineError::MissingEntry(client_id.to_owned()))
    }

    /// Reconcile page entries already present and return the rest, deduplicated.
    fn absorb(&mut self, messages: Vec<Message>) -> Vec<Message> {
        let mut fresh: Vec<Message> = Vec::with_capacity(messages.len());
        for mut message in messages {
            if let Some(index) = self.position_of(&message) {
                self.reconcile_at(index, message);
            } else if !fresh.iter().any(|m| m.same_message(&message)) {
                message.delivery = DeliveryState::Confirmed;
                fresh.push(message);
            }
        }
        fresh
    }

    fn reconcile_at(&mut self, index: usize, incoming: Message) -> LiveOutcome {
        let existing = &self.items[index];
        let already_canonical = existing.delivery == DeliveryState::Confirmed
            && (existing.id.is_some() || incoming.id.is_none());
        if already_canonical {
            return LiveOutcome::Duplicate;
        }

        let mut canonical = incoming;
        canonical.client_id = canonical.client_id.or_else(|| existing.client_id.clone());
        canonical.delivery = DeliveryState::Confirmed;

        if canonical.timestamp == existing.timestamp {
            self.items[index] = canonical;
        } else {
            self.items.remove(index);
            self.insert_ordered(canonical);
        }
        LiveOutcome::Reconciled
    }

    fn insert_ordered(&mut self, message: Message) {
        let index = self
            .items
            .partition_point(|item| item.timestamp <= message.timestamp);
        self.items.insert(index, message);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::types::HistoryOrder;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn inbound(id: &str, secs: i64) -> Message {
        Message::new("peer", "me", id, at(secs)).with_id(id)
    }

    fn page(range: std::ops::Range<i64>) -> HistoryPage {
        HistoryPage::new(
            range.map(|secs| inbound(&format!("m{secs}"), secs)).collect(),
            HistoryOrder::Unspecified,
        )
    }

    fn opened() -> (TimelinePager, PageRequest) {
        let mut pager = TimelinePager::new("me", 20);
        let request = pager.open_conversation("peer");
        (pager, request)
    }

    #[test]
    fn full_page_keeps_paging_and_short_page_stops() {
        let (mut pager, first) = opened();
        assert_eq!((first.page_index, first.limit, first.skip), (0, 20, 0));

        let outcome = pager.apply_page(&first, Ok(page(100..120)));
        assert_eq!(
            outcome,
            PageOutcome::Applied(TimelineChange::PageLoaded {
                page_index: 0,
                prepended: 20,
                has_more: true,
            })
        );

        let older = pager.load_older_page().expect("more history is available");
        assert_eq!((older.page_index, older.skip), (1, 20));
        let outcome = pager.apply_page(&older, Ok(page(10..17)));
        assert_eq!(
            outcome,
            PageOutcome::Applied(TimelineChange::PageLoaded {
                page_index: 1,
                prepended: 7,
                has_more: false,
            })
        );
        assert_eq!(pager.items().len(), 27);
        assert_eq!(pager.items()[0].id.as_deref(), Some("m10"));
        assert!(pager.load_older_page().is_none());
    }

    #[test]
    fn overlapping_older_requests_are_suppressed() {
        let (mut pager, first) = opened();
        assert!(pager.load_older_page().is_none(), "initial page in flight");

        pager.apply_page(&first, Ok(page(100..120)));
        let older = pager.load_older_page().expect("first older request");
        assert!(pager.load_older_page().is_none());
        assert!(pager.cursor().in_flight);

        pager.apply_page(&older, Ok(page(80..100)));
        assert!(!pager.cursor().in_flight);
        assert!(pager.load_older_page().is_some());
    }

    #[test]
    fn failed_page_leaves_state_and_allows_retry() {
        let (mut pager, first) = opened();
        pager.apply_page(&first, Ok(page(100..120)));
        let older = pager.load_older_page().expect("older request");

        let outcome = pager.apply_page(
            &older,
            Err(ChatError::network("request_failed", "connection reset")),
        );
        assert!(matches!(outcome, PageOutcome::Failed(_)));
        assert_eq!(pager.items().len(), 20);
        assert_eq!(pager.cursor().page_index, 0);

        let retry = pager.load_older_page().expect("retry after failure");
        assert_eq!(retry.page_index, 1);
    }

    #[test]
    fn failed_latest_page_is_retried_before_older_ones() {
        let (mut pager, first) = opened();
        let outcome = pager.apply_page(
            &first,
            Err(ChatError::network("request_failed", "connection reset")),
        );
        assert!(matches!(outcome, PageOutcome::Failed(_)));
        assert!(!pager.cursor().loaded);

        let retry = pager.load_older_page().expect("latest page is retried");
        assert_eq!((retry.kind, retry.page_index, retry.skip), (PageKind::Initial, 0, 0));

        assert_eq!(
            pager.apply_page(&retry, Ok(page(100..120))),
            PageOutcome::Applied(TimelineChange::PageLoaded {
                page_index: 0,
                prepended: 20,
                has_more: true,
            })
        );
        let older = pager.load_older_page().expect("older page after recovery");
        assert_eq!((older.kind, older.page_index, older.skip), (PageKind::Older, 1, 20));
    }

    #[test]
    fn reconnect_refresh_loads_a_latest_page_that_never_arrived() {
        let (mut pager, first) = opened();
        pager.apply_page(&first, Err(ChatError::network("request_failed", "offline")));

        let refresh = pager.refresh_latest().expect("refresh request");
        assert_eq!(refresh.kind, PageKind::Initial);
        pager.apply_page(&refresh, Ok(page(10..15)));
        assert!(pager.cursor().loaded);
        assert!(!pager.cursor().has_more);
    }

    #[test]
    fn undecodable_records_still_count_toward_a_full_page() {
        let (mut pager, first) = opened();
        let partial = HistoryPage::new(
            (1..20).map(|secs| inbound(&format!("m{secs}"), secs)).collect(),
            HistoryOrder::Ascending,
        )
        .with_received(20);

        assert_eq!(
            pager.apply_page(&first, Ok(partial)),
            PageOutcome::Applied(TimelineChange::PageLoaded {
                page_index: 0,
                prepended: 19,
                has_more: true,
            })
        );
        assert!(pager.load_older_page().is_some());
    }

    #[test]
    fn pages_for_a_replaced_conversation_are_stale() {
        let mut pager = TimelinePager::new("me", 20);
        let for_peer = pager.open_conversation("peer");
        let _for_other = pager.open_conversation("other");

        assert_eq!(pager.apply_page(&for_peer, Ok(page(1..5))), PageOutcome::Stale);
        assert!(pager.items().is_empty());
        assert!(pager.cursor().in_flight);
    }

    #[test]
    fn overlapping_pages_do_not_duplicate_entries() {
        let (mut pager, first) = opened();
        pager.apply_page(&first, Ok(page(100..120)));
        let older = pager.load_older_page().expect("older request");

        // Page boundary shifted by two new messages on the server.
        pager.apply_page(&older, Ok(page(82..102)));
        assert_eq!(pager.items().len(), 38);
        let ids: Vec<_> = pager.items().iter().filter_map(|m| m.id.clone()).collect();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids, deduped);
    }

    #[test]
    fn live_echo_replaces_optimistic_entry() {
        let (mut pager, first) = opened();
        pager.apply_page(&first, Ok(HistoryPage::default()));

        let local = Message::new("me", "peer", "hi", at(50)).with_client_id("c1");
        assert_eq!(pager.append_optimistic(local), LiveOutcome::Inserted);
        assert!(pager.items()[0].is_pending());

        let echo = Message::new("me", "peer", "hi", at(50)).with_id("srv-1");
        assert_eq!(pager.append_live(echo.clone()), LiveOutcome::Reconciled);
        assert_eq!(pager.append_live(echo), LiveOutcome::Duplicate);

        let items = pager.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_deref(), Some("srv-1"));
        assert_eq!(items[0].client_id.as_deref(), Some("c1"));
        assert_eq!(items[0].delivery, DeliveryState::Confirmed);
    }

    #[test]
    fn confirmed_send_is_not_duplicated_by_refresh() {
        let (mut pager, first) = opened();
        pager.apply_page(&first, Ok(page(10..12)));

        let local = Message::new("me", "peer", "hi", at(50)).with_client_id("c2");
        pager.append_optimistic(local);
        pager
            .confirm("c2", Some("srv-2".into()))
            .expect("entry exists");

        let refresh = pager.refresh_latest().expect("refresh request");
        let mut messages = page(10..12).messages;
        messages.push(Message::new("me", "peer", "hi", at(50)).with_id("srv-2"));
        let outcome = pager.apply_page(
            &refresh,
            Ok(HistoryPage::new(messages, HistoryOrder::Ascending)),
        );

        assert_eq!(outcome, PageOutcome::Applied(TimelineChange::Appended));
        assert_eq!(pager.items().len(), 3);
        assert_eq!(pager.cursor().page_index, 0);
        assert!(!pager.cursor().has_more);
    }

    #[test]
    fn live_inserts_keep_order_and_tie_arrival() {
        let (mut pager, first) = opened();
        pager.apply_page(&first, Ok(page(10..12)));

        assert_eq!(pager.append_live(inbound("late", 30)), LiveOutcome::Inserted);
        assert_eq!(pager.append_live(inbound("tie-a", 20)), LiveOutcome::Inserted);
        assert_eq!(pager.append_live(inbound("tie-b", 20)), LiveOutcome::Inserted);

        let ids: Vec<_> = pager.items().iter().filter_map(|m| m.id.as_deref()).collect();
        assert_eq!(ids, vec!["m10", "m11", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn messages_for_other_peers_are_ignored() {
        let (mut pager, _) = opened();
        let foreign = Message::new("other", "me", "hey", at(1)).with_id("x");
        assert_eq!(pager.append_live(foreign), LiveOutcome::NotInTimeline);

        pager.close();
        assert_eq!(pager.append_live(inbound("m1", 1)), LiveOutcome::NotInTimeline);
        assert!(pager.load_older_page().is_none());
    }

    #[test]
    fn delivery_transitions_require_a_known_entry() {
        let (mut pager, _) = opened();
        pager.append_optimistic(Message::new("me", "peer", "hi", at(5)).with_client_id("c3"));

        pager.mark_failed("c3").expect("entry exists");
        assert!(pager.items()[0].is_failed());
        pager.mark_pending("c3").expect("entry exists");
        assert!(pager.items()[0].is_pending());

        assert_eq!(
            pager.mark_failed("missing"),
            Err(TimelineError::MissingEntry("missing".into()))
        );
    }
}
