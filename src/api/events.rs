use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::models::{ChatRoomRef, Conversation, ConversationKey, Message};
use crate::error::Result;

pub const ACK_EVENT: &str = "ack";
pub const MARK_AS_READ_EVENT: &str = "markAsRead";

/// One text frame on the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data, ack_id: None }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    ConversationItem,
    BlastProgress,
    BlastCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::NewMessage,
        EventKind::ConversationItem,
        EventKind::BlastProgress,
        EventKind::BlastCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewMessage => "newMessage",
            EventKind::ConversationItem => "conversationItem",
            EventKind::BlastProgress => "blastMessageProgress",
            EventKind::BlastCompleted => "blastMessageCompleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessageEvent {
    pub message: Message,
    pub other_user_id: Option<String>,
    pub chat_room_id: Option<String>,
}

impl NewMessageEvent {
    pub fn key(&self) -> Result<ConversationKey> {
        ConversationKey::resolve(self.other_user_id.as_deref(), self.chat_room_id.as_deref())
    }
}

/// `newMessage` arrives either wrapped (`{message, chatRoomId, ...}`) or as the
/// bare message carrying its own room reference.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMessagePayload {
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    other_user_id: Option<Value>,
    #[serde(default)]
    chat_room_id: Option<Value>,
    #[serde(default)]
    chat_room: Option<ChatRoomRef>,
}

fn id_of(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastProgress {
    pub campaign_id: String,
    #[serde(default)]
    pub sent: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastCompleted {
    pub campaign_id: String,
    #[serde(default)]
    pub sent: u32,
    #[serde(default)]
    pub failed: u32,
}

/// Closed set of inbound events the core understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    NewMessage(NewMessageEvent),
    ConversationItem(Conversation),
    BlastProgress(BlastProgress),
    BlastCompleted(BlastCompleted),
}

impl PushEvent {
    pub fn decode(kind: EventKind, data: &Value) -> Result<Self> {
        Ok(match kind {
            EventKind::NewMessage => {
                let payload: NewMessagePayload = serde_json::from_value(data.clone())?;
                let message = match payload.message {
                    Some(message) => message,
                    None => serde_json::from_value(data.clone())?,
                };
                let chat_room_id = id_of(payload.chat_room_id)
                    .or_else(|| payload.chat_room.map(|room| room.id))
                    .or_else(|| message.chat_room_id.clone());
                PushEvent::NewMessage(NewMessageEvent {
                    other_user_id: id_of(payload.other_user_id),
                    chat_room_id,
                    message,
                })
            }
            EventKind::ConversationItem => PushEvent::ConversationItem(serde_json::from_value(data.clone())?),
            EventKind::BlastProgress => PushEvent::BlastProgress(serde_json::from_value(data.clone())?),
            EventKind::BlastCompleted => PushEvent::BlastCompleted(serde_json::from_value(data.clone())?),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::NewMessage(_) => EventKind::NewMessage,
            PushEvent::ConversationItem(_) => EventKind::ConversationItem,
            PushEvent::BlastProgress(_) => EventKind::BlastProgress,
            PushEvent::BlastCompleted(_) => EventKind::BlastCompleted,
        }
    }
}
