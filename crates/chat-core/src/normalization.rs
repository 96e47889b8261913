use crate::{
    error::ChatError,
    types::{ChatEvent, HistoryOrder, HistoryPage, Message, SendAck},
};

/// Result of handing a message to the push channel, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted; carries the server ID when one is known.
    Accepted { message_id: Option<String> },
    /// Rejected or never delivered.
    Rejected { error: ChatError },
}

/// Convert a send outcome into the same `SendAck` shape the server sends.
pub fn normalize_send_outcome(client_id: impl Into<String>, outcome: SendOutcome) -> SendAck {
    let client_id = client_id.into();
    match outcome {
        SendOutcome::Accepted { message_id } => SendAck {
            client_id,
            message_id,
            error_code: None,
        },
        SendOutcome::Rejected { error } => SendAck {
            client_id,
            message_id: None,
            error_code: Some(error.code),
        },
    }
}

/// Surface an error as a non-fatal notice.
pub fn notice_from_error(error: &ChatError) -> ChatEvent {
    ChatEvent::Notice {
        code: error.code.clone(),
        message: error.message.clone(),
        recoverable: error.is_recoverable(),
    }
}

/// Guess the order of a page whose endpoint declared none.
///
/// Compares the first and last timestamps; pages with fewer than two entries
/// or equal end points count as ascending.
pub fn detect_history_order(messages: &[Message]) -> HistoryOrder {
    match (messages.first(), messages.last()) {
        (Some(first), Some(last)) if first.timestamp > last.timestamp => HistoryOrder::Descending,
        _ => HistoryOrder::Ascending,
    }
}

/// Return the page oldest-first.
///
/// A declared order is trusted; otherwise it is detected. A stable sort runs
/// afterwards so the timeline never stores an out-of-order page.
pub fn normalize_history(page: HistoryPage) -> Vec<Message> {
    let HistoryPage {
        mut messages,
        order,
        ..
    } = page;
    let order = match order {
        HistoryOrder::Unspecified => detect_history_order(&messages),
        declared => declared,
    };
    if order == HistoryOrder::Descending {
        messages.reverse();
    }
    messages.sort_by_key(|message| message.timestamp);
    messages
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::error::ChatErrorCategory;

    fn msg(id: &str, secs: i64) -> Message {
        Message::new(
            "peer",
            "me",
            id,
            Utc.timestamp_opt(secs, 0).single().expect("timestamp"),
        )
        .with_id(id)
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages
            .iter()
            .filter_map(|message| message.id.as_deref())
            .collect()
    }

    #[test]
    fn accepted_outcome_keeps_server_id() {
        let ack = normalize_send_outcome(
            "c-1",
            SendOutcome::Accepted {
                message_id: Some("m-1".into()),
            },
        );
        assert_eq!(ack.client_id, "c-1");
        assert_eq!(ack.message_id.as_deref(), Some("m-1"));
        assert_eq!(ack.error_code, None);
    }

    #[test]
    fn rejected_outcome_carries_stable_code() {
        let ack = normalize_send_outcome(
            "c-2",
            SendOutcome::Rejected {
                error: ChatError::network("channel_disconnected", "offline"),
            },
        );
        assert_eq!(ack.message_id, None);
        assert_eq!(ack.error_code.as_deref(), Some("channel_disconnected"));
    }

    #[test]
    fn notice_marks_transient_errors_recoverable() {
        let event = notice_from_error(&ChatError::new(
            ChatErrorCategory::Auth,
            "unauthorized",
            "token expired",
        ));
        assert_eq!(
            event,
            ChatEvent::Notice {
                code: "unauthorized".into(),
                message: "token expired".into(),
                recoverable: false,
            }
        );
    }

    #[test]
    fn detects_newest_first_pages() {
        let page = HistoryPage::new(
            vec![msg("c", 30), msg("b", 20), msg("a", 10)],
            HistoryOrder::Unspecified,
        );
        assert_eq!(ids(&normalize_history(page)), vec!["a", "b", "c"]);
    }

    #[test]
    fn keeps_oldest_first_pages() {
        let page = HistoryPage::new(
            vec![msg("a", 10), msg("b", 20), msg("c", 30)],
            HistoryOrder::Unspecified,
        );
        assert_eq!(ids(&normalize_history(page)), vec!["a", "b", "c"]);
    }

    #[test]
    fn trusts_declared_order_and_keeps_ties_stable() {
        let page = HistoryPage::new(
            vec![msg("c", 20), msg("b", 10), msg("a", 10)],
            HistoryOrder::Descending,
        );
        assert_eq!(ids(&normalize_history(page)), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_and_single_pages_pass_through() {
        assert!(normalize_history(HistoryPage::default()).is_empty());
        let single = HistoryPage::new(vec![msg("a", 1)], HistoryOrder::Unspecified);
        assert_eq!(ids(&normalize_history(single)), vec!["a"]);
    }
}
