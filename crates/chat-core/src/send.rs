use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::ChatError,
    types::{DeliveryState, Message, OutboundMessage, SendAck},
};

/// Terminal result of reconciling an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResolution {
    Confirmed {
        client_id: String,
        peer_id: String,
        message_id: Option<String>,
    },
    /// The entry stays tracked so the user can retry it.
    Failed {
        client_id: String,
        peer_id: String,
        text: String,
        error_code: String,
    },
}

/// Reconciliation state for locally originated messages, keyed by client ID.
///
/// `Pending` moves to `Confirmed` (and is forgotten) or to `Failed`. Only a
/// user retry moves `Failed` back to `Pending`.
#[derive(Debug, Clone, Default)]
pub struct SendPipeline {
    self_id: Option<String>,
    entries: HashMap<String, Message>,
}

impl SendPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the sending user and drop every tracked entry.
    pub fn bind(&mut self, self_id: Option<String>) {
        self.self_id = self_id;
        self.entries.clear();
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, client_id: &str) -> Option<&Message> {
        self.entries.get(client_id)
    }

    /// Validate a compose action and build its provisional entry plus the outbound frame.
    pub fn prepare(
        &mut self,
        peer_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(Message, OutboundMessage), ChatError> {
        let self_id = self
            .self_id
            .clone()
            .ok_or_else(|| ChatError::validation("not_signed_in", "no user is signed in"))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::validation(
                "empty_message",
                "message text is empty after trimming",
            ));
        }
        let peer_id = peer_id.trim();
        if peer_id.is_empty() {
            return Err(ChatError::validation(
                "missing_recipient",
                "no recipient selected",
            ));
        }

        let client_id = Uuid::new_v4().to_string();
        let mut message = Message::new(self_id, peer_id, text, now).with_client_id(&client_id);
        message.delivery = DeliveryState::Pending;
        self.entries.insert(client_id.clone(), message.clone());
        debug!(%client_id, %peer_id, "prepared optimistic send");

        let outbound = outbound_for(&message, client_id);
        Ok((message, outbound))
    }

    /// Apply a server or normalized acknowledgement.
    pub fn resolve_ack(&mut self, ack: &SendAck) -> Option<SendResolution> {
        let Some(entry) = self.entries.get_mut(&ack.client_id) else {
            debug!(client_id = %ack.client_id, "acknowledgement for untracked send");
            return None;
        };
        if entry.delivery != DeliveryState::Pending {
            return None;
        }

        match &ack.error_code {
            None => {
                let peer_id = entry.to.clone();
                self.entries.remove(&ack.client_id);
                Some(SendResolution::Confirmed {
                    client_id: ack.client_id.clone(),
                    peer_id,
                    message_id: ack.message_id.clone(),
                })
            }
            Some(error_code) => {
                entry.delivery = DeliveryState::Failed;
                warn!(client_id = %ack.client_id, %error_code, "send failed");
                Some(SendResolution::Failed {
                    client_id: ack.client_id.clone(),
                    peer_id: entry.to.clone(),
                    text: entry.text.clone(),
                    error_code: error_code.clone(),
                })
            }
        }
    }

    /// Confirm the pending entry that a live echo corresponds to.
    ///
    /// Returns the client ID of the confirmed entry.
    pub fn confirm_echo(&mut self, echo: &Message) -> Option<String> {
        let client_id = self
            .entries
            .iter()
            .find(|(_, entry)| {
                entry.delivery != DeliveryState::Confirmed && entry.same_message(echo)
            })
            .map(|(client_id, _)| client_id.clone())?;
        self.entries.remove(&client_id);
        Some(client_id)
    }

    /// Move a failed entry back to pending for another attempt.
    ///
    /// The client ID and original timestamp are kept so the timeline entry is
    /// updated in place.
    pub fn retry(&mut self, client_id: &str) -> Result<(Message, OutboundMessage), ChatError> {
        let entry = self.entries.get_mut(client_id).ok_or_else(|| {
            ChatError::validation("unknown_message", format!("no send tracked for '{client_id}'"))
        })?;
        if entry.delivery != DeliveryState::Failed {
            return Err(ChatError::validation(
                "not_retryable",
                format!("send '{client_id}' has not failed"),
            ));
        }
        entry.delivery = DeliveryState::Pending;
        let message = entry.clone();
        debug!(%client_id, "retrying send");
        Ok((message.clone(), outbound_for(&message, client_id.to_owned())))
    }
}

fn outbound_for(message: &Message, client_id: String) -> OutboundMessage {
    OutboundMessage {
        client_id,
        from: message.from.clone(),
        to: message.to.clone(),
        text: message.text.clone(),
        timestamp: message.timestamp,
    }
}
