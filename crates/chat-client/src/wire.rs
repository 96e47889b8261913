//! JSON shapes spoken by the REST endpoints and the push socket.
//!
//! Decoding is lenient: a record that cannot be decoded is skipped on its
//! own, and a payload of the wrong shape reads as empty.

use chat_core::{
    Conversation, HistoryOrder, HistoryPage, Message, OutboundMessage, PeerProfile, PushEvent,
    SendAck,
};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

pub const EVENT_REGISTER: &str = "register";
pub const EVENT_CHAT_MESSAGE: &str = "chat-message";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_CHAT_ACK: &str = "chat-ack";

/// RFC 3339 string or epoch milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Rfc3339(DateTime<Utc>),
    Millis(i64),
}

impl WireTimestamp {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rfc3339(at) => Some(at),
            Self::Millis(millis) => Utc.timestamp_millis_opt(millis).single(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "_id", default)]
    mongo_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "clientId", default)]
    client_id: Option<String>,
    from: String,
    to: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<WireTimestamp>,
    #[serde(default)]
    time: Option<WireTimestamp>,
}

impl WireMessage {
    fn into_message(self) -> Option<Message> {
        let timestamp = self
            .timestamp
            .or(self.created_at)
            .or(self.time)
            .and_then(WireTimestamp::resolve)?;
        let mut message = Message::new(self.from, self.to, self.text, timestamp);
        message.id = self.mongo_id.or(self.id);
        message.client_id = self.client_id;
        Some(message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversation {
    user_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_time: Option<WireTimestamp>,
    #[serde(default)]
    unread_count: Option<u64>,
}

impl From<WireConversation> for Conversation {
    fn from(wire: WireConversation) -> Self {
        let profile = PeerProfile::new(
            wire.user_id,
            wire.name.unwrap_or_default(),
            wire.email.unwrap_or_default(),
        );
        Conversation {
            peer_display_name: profile.display_name().to_owned(),
            last_message_text: wire.last_message.unwrap_or_default(),
            last_message_timestamp: wire.last_message_time.and_then(WireTimestamp::resolve),
            unread_count: wire.unread_count.unwrap_or(0),
            peer_id: profile.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(rename = "_id", default)]
    mongo_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl WireUser {
    fn into_profile(self) -> Option<PeerProfile> {
        let id = self.mongo_id.or(self.id)?;
        Some(PeerProfile::new(
            id,
            self.name.unwrap_or_default(),
            self.email.unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct WireAck {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(default, alias = "_id")]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decode one message record.
pub fn decode_message(value: Value) -> Option<Message> {
    serde_json::from_value::<WireMessage>(value)
        .ok()
        .and_then(WireMessage::into_message)
}

/// Decode a history response body.
pub fn decode_messages(value: Value) -> Vec<Message> {
    decode_records(value, "message", decode_message)
}

/// Decode a history response, keeping the raw record count for pagination.
pub fn decode_history(value: Value, order: HistoryOrder) -> HistoryPage {
    let received = value.as_array().map_or(0, Vec::len);
    HistoryPage::new(decode_messages(value), order).with_received(received)
}

/// Decode a conversation summary response body.
pub fn decode_conversations(value: Value) -> Vec<Conversation> {
    decode_records(value, "conversation", |record| {
        serde_json::from_value::<WireConversation>(record)
            .ok()
            .map(Conversation::from)
    })
}

/// Decode a directory search response body.
pub fn decode_users(value: Value) -> Vec<PeerProfile> {
    decode_records(value, "user", decode_user)
}

/// Decode a single directory record.
pub fn decode_user(value: Value) -> Option<PeerProfile> {
    serde_json::from_value::<WireUser>(value)
        .ok()
        .and_then(WireUser::into_profile)
}

fn decode_records<T>(value: Value, kind: &str, decode: impl Fn(Value) -> Option<T>) -> Vec<T> {
    let Value::Array(records) = value else {
        debug!(kind, "payload is not an array; treating as empty");
        return Vec::new();
    };
    let total = records.len();
    let decoded: Vec<T> = records.into_iter().filter_map(decode).collect();
    if decoded.len() != total {
        debug!(kind, skipped = total - decoded.len(), "skipped malformed records");
    }
    decoded
}

/// Decode one inbound socket frame. Unknown events and bad payloads yield `None`.
pub fn decode_frame(text: &str) -> Option<PushEvent> {
    let frame = match serde_json::from_str::<RawFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "dropping undecodable socket frame");
            return None;
        }
    };
    match frame.event.as_str() {
        EVENT_CHAT_MESSAGE | EVENT_NEW_MESSAGE => {
            decode_message(frame.data).map(PushEvent::Message)
        }
        EVENT_CHAT_ACK => serde_json::from_value::<WireAck>(frame.data)
            .ok()
            .map(|ack| {
                PushEvent::SendAck(SendAck {
                    client_id: ack.client_id,
                    message_id: ack.id,
                    error_code: ack.error,
                })
            }),
        other => {
            trace!(event = other, "ignoring socket event");
            None
        }
    }
}

pub fn encode_register(user_id: &str) -> String {
    json!({ "event": EVENT_REGISTER, "data": user_id }).to_string()
}

pub fn encode_outbound(message: &OutboundMessage) -> String {
    json!({
        "event": EVENT_CHAT_MESSAGE,
        "data": {
            "clientId": message.client_id,
            "from": message.from,
            "to": message.to,
            "text": message.text,
            "timestamp": message.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_accepts_field_aliases_and_skips_bad_records() {
        let body = json!([
            { "_id": "m1", "from": "a", "to": "b", "text": "one", "timestamp": "2024-05-01T10:00:00.000Z" },
            { "id": "m2", "from": "b", "to": "a", "text": "two", "createdAt": "2024-05-01T10:01:00Z" },
            { "from": "a", "to": "b", "text": "three", "time": 1714557720000_i64 },
            { "from": "a", "to": "b", "text": "no time" },
            { "from": "a", "to": "b", "timestamp": "yesterday" },
            "garbage"
        ]);
        let messages = decode_messages(body);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id.as_deref(), Some("m1"));
        assert_eq!(messages[1].id.as_deref(), Some("m2"));
        assert_eq!(messages[2].id, None);
        assert_eq!(
            messages[2].timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "2024-05-01T10:02:00.000Z"
        );
    }

    #[test]
    fn history_page_counts_records_that_failed_to_decode() {
        let mut records: Vec<Value> = (0..19)
            .map(|n| json!({ "_id": format!("m{n}"), "from": "a", "to": "b", "text": "x", "time": 1_714_557_600_000_i64 + n }))
            .collect();
        records.push(json!({ "_id": "broken", "from": "a", "to": "b", "text": "no time" }));

        let page = decode_history(Value::Array(records), HistoryOrder::Descending);
        assert_eq!(page.messages.len(), 19);
        assert_eq!(page.received, 20);
        assert_eq!(page.order, HistoryOrder::Descending);

        let empty = decode_history(json!({ "error": "nope" }), HistoryOrder::Unspecified);
        assert_eq!(empty.received, 0);
    }

    #[test]
    fn non_array_payloads_read_as_empty() {
        assert!(decode_messages(json!({ "error": "nope" })).is_empty());
        assert!(decode_conversations(Value::Null).is_empty());
        assert!(decode_users(json!("x")).is_empty());
    }

    #[test]
    fn conversation_name_falls_back_to_email() {
        let conversations = decode_conversations(json!([
            { "userId": "u1", "name": null, "email": "u1@example.com", "lastMessage": "hi",
              "lastMessageTime": "2024-05-01T10:00:00Z", "unreadCount": 2 },
            { "userId": "u2" }
        ]));
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].peer_display_name, "u1@example.com");
        assert_eq!(conversations[0].unread_count, 2);
        assert_eq!(conversations[1].peer_display_name, "");
        assert_eq!(conversations[1].last_message_timestamp, None);
    }

    #[test]
    fn users_need_an_id() {
        let users = decode_users(json!([
            { "_id": "u1", "name": "Ada", "email": "ada@example.com" },
            { "name": "no id" }
        ]));
        assert_eq!(users, vec![PeerProfile::new("u1", "Ada", "ada@example.com")]);
    }

    #[test]
    fn decodes_message_and_ack_frames() {
        let frame = r#"{"event":"new_message","data":{"_id":"m9","from":"p","to":"me","text":"yo","timestamp":"2024-05-01T10:00:00Z"}}"#;
        match decode_frame(frame) {
            Some(PushEvent::Message(message)) => assert_eq!(message.id.as_deref(), Some("m9")),
            other => panic!("unexpected frame decode: {other:?}"),
        }

        let ack = r#"{"event":"chat-ack","data":{"clientId":"c1","error":"rejected"}}"#;
        assert_eq!(
            decode_frame(ack),
            Some(PushEvent::SendAck(SendAck {
                client_id: "c1".into(),
                message_id: None,
                error_code: Some("rejected".into()),
            }))
        );

        assert_eq!(decode_frame(r#"{"event":"typing","data":{}}"#), None);
        assert_eq!(decode_frame("not json"), None);
    }

    #[test]
    fn outbound_frame_carries_client_id_and_millis_timestamp() {
        let outbound = OutboundMessage {
            client_id: "c1".into(),
            from: "me".into(),
            to: "p".into(),
            text: "hello".into(),
            timestamp: Utc
                .timestamp_millis_opt(1_714_557_600_000)
                .single()
                .expect("timestamp"),
        };
        let value: Value =
            serde_json::from_str(&encode_outbound(&outbound)).expect("valid json frame");
        assert_eq!(value["event"], "chat-message");
        assert_eq!(value["data"]["clientId"], "c1");
        assert_eq!(value["data"]["timestamp"], "2024-05-01T10:00:00.000Z");

        let register: Value =
            serde_json::from_str(&encode_register("me")).expect("valid json frame");
        assert_eq!(register, json!({ "event": "register", "data": "me" }));
    }
}
