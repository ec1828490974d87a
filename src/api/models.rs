use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SyncError};
use crate::utils::validate_identifier;

/// Audience-specific channel. Each role keeps its own list, filter and unread
/// aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Patient,
    Provider,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Patient, Role::Provider];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Patient => "patient",
            Role::Provider => "provider",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Open,
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationFilter {
    #[default]
    All,
    Unread,
    Unresolved,
}

impl ConversationFilter {
    /// Query value sent to the server; `All` sends none.
    pub fn as_query(self) -> Option<&'static str> {
        match self {
            ConversationFilter::All => None,
            ConversationFilter::Unread => Some("unread"),
            ConversationFilter::Unresolved => Some("unresolved"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self { field: "lastMessageAt".to_string(), order: SortOrder::Desc }
    }
}

/// Stable identity of a conversation across fetches and push events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    User(String),
    Room(String),
}

impl ConversationKey {
    /// `user-{otherUserId}` when present, else `room-{chatRoomId}`.
    pub fn resolve(other_user_id: Option<&str>, chat_room_id: Option<&str>) -> Result<Self> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }
        if let Some(user) = present(other_user_id) {
            return Ok(ConversationKey::User(validate_identifier(user)?.to_string()));
        }
        if let Some(room) = present(chat_room_id) {
            return Ok(ConversationKey::Room(validate_identifier(room)?.to_string()));
        }
        Err(SyncError::InvalidIdentifier("conversation has neither otherUserId nor chatRoomId".into()))
    }

    pub fn other_user_id(&self) -> Option<&str> {
        match self {
            ConversationKey::User(id) => Some(id),
            ConversationKey::Room(_) => None,
        }
    }

    pub fn chat_room_id(&self) -> Option<&str> {
        match self {
            ConversationKey::Room(id) => Some(id),
            ConversationKey::User(_) => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::User(id) => write!(f, "user-{id}"),
            ConversationKey::Room(id) => write!(f, "room-{id}"),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(id) = s.strip_prefix("user-") {
            Ok(ConversationKey::User(validate_identifier(id)?.to_string()))
        } else if let Some(id) = s.strip_prefix("room-") {
            Ok(ConversationKey::Room(validate_identifier(id)?.to_string()))
        } else {
            Err(SyncError::InvalidIdentifier(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default, deserialize_with = "opt_id")]
    pub other_user_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub chat_room_id: Option<String>,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub role: Option<Role>,
}

impl Conversation {
    pub fn key(&self) -> Result<ConversationKey> {
        ConversationKey::resolve(self.other_user_id.as_deref(), self.chat_room_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(deserialize_with = "id")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_id")]
    pub chat_room_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomRef {
    #[serde(deserialize_with = "id")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "first_page")]
    pub total_pages: u32,
    #[serde(default)]
    pub sort_field: Option<String>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    pub meta: ConversationMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default)]
    pub has_next_page: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    pub meta: MessageMeta,
    #[serde(default)]
    pub chat_room: Option<ChatRoomRef>,
}

fn first_page() -> u32 {
    1
}

/// Backends are inconsistent about numeric vs string ids; accept both.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

fn id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    RawId::deserialize(d).map(String::from)
}

fn opt_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_prefers_other_user() {
        let key = ConversationKey::resolve(Some("u1"), Some("r1")).unwrap();
        assert_eq!(key.to_string(), "user-u1");
    }

    #[test]
    fn key_falls_back_to_room() {
        let key = ConversationKey::resolve(None, Some("r9")).unwrap();
        assert_eq!(key.to_string(), "room-r9");
        let key = ConversationKey::resolve(Some("  "), Some("r9")).unwrap();
        assert_eq!(key, ConversationKey::Room("r9".into()));
    }

    #[test]
    fn key_ignores_padding_around_ids() {
        let key = ConversationKey::resolve(Some(" u1 "), None).unwrap();
        assert_eq!(key, ConversationKey::User("u1".into()));
    }

    #[test]
    fn key_without_identity_is_rejected() {
        assert!(matches!(ConversationKey::resolve(None, None), Err(SyncError::InvalidIdentifier(_))));
        assert!(matches!(ConversationKey::resolve(Some(""), Some("")), Err(SyncError::InvalidIdentifier(_))));
    }

    #[test]
    fn key_parses_back() {
        assert_eq!("user-42".parse::<ConversationKey>().unwrap(), ConversationKey::User("42".into()));
        assert_eq!("room-abc".parse::<ConversationKey>().unwrap(), ConversationKey::Room("abc".into()));
        assert!("chat-1".parse::<ConversationKey>().is_err());
        assert!("user-".parse::<ConversationKey>().is_err());
        assert!("user-a b".parse::<ConversationKey>().is_err());
    }

    #[test]
    fn conversation_accepts_numeric_ids() {
        let conv: Conversation = serde_json::from_value(json!({
            "otherUserId": 17,
            "lastMessagePreview": "see you tomorrow",
            "unreadCount": 3,
            "status": "unresolved"
        }))
        .unwrap();
        assert_eq!(conv.other_user_id.as_deref(), Some("17"));
        assert_eq!(conv.chat_room_id, None);
        assert_eq!(conv.status, ConversationStatus::Unresolved);
        assert_eq!(conv.key().unwrap().to_string(), "user-17");
    }

    #[test]
    fn message_page_defaults() {
        let page: MessagePage = serde_json::from_value(json!({
            "messages": [{"id": "m1", "content": "hi", "createdAt": "2024-05-01T10:00:00Z"}],
            "meta": {"page": 2, "hasNextPage": true},
            "chatRoom": {"id": 88}
        }))
        .unwrap();
        assert_eq!(page.messages[0].attachments.len(), 0);
        assert_eq!(page.meta.page, 2);
        assert_eq!(page.chat_room.unwrap().id, "88");
    }
}
