//! Message Pagination Store.
//!
//! Holds the history of the one open conversation. Older pages are merged by
//! message id, so overlapping or repeated loads and redelivered push events
//! never duplicate a message.

use std::collections::HashMap;

use crate::api::client::MessageQuery;
use crate::api::models::{ConversationKey, Message, MessagePage};
use crate::error::Result;

/// Viewport geometry captured right before an older page is requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub content_extent: f64,
    pub offset: f64,
}

/// Handed to the UI after older messages were prepended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollRestore {
    pub anchor: ScrollAnchor,
    pub prepended: usize,
}

impl ScrollRestore {
    /// Offset that keeps the previously visible content in view once the
    /// content has grown to `new_extent`.
    pub fn offset_for(&self, new_extent: f64) -> f64 {
        self.anchor.offset + (new_extent - self.anchor.content_extent).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationCursor {
    pub page: u32,
    pub limit: u32,
    pub has_next_page: bool,
}

impl PaginationCursor {
    fn initial(limit: u32) -> Self {
        Self { page: 0, limit, has_next_page: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub query: MessageQuery,
    generation: u64,
}

#[derive(Debug)]
struct History {
    key: ConversationKey,
    chat_room_id: Option<String>,
    cursor: PaginationCursor,
    messages: Vec<Message>,
    in_flight: bool,
    anchor: Option<ScrollAnchor>,
    restore: Option<ScrollRestore>,
}

/// Overlays `incoming` on `current` by id and returns the merged list ordered
/// by `(createdAt, id)` together with the number of ids that were new.
/// Messages without a timestamp go last.
pub fn merge_messages(current: Vec<Message>, incoming: Vec<Message>) -> (Vec<Message>, usize) {
    let mut by_id: HashMap<String, Message> = current.into_iter().map(|m| (m.id.clone(), m)).collect();
    let mut added = 0;
    for message in incoming {
        if by_id.insert(message.id.clone(), message).is_none() {
            added += 1;
        }
    }
    let mut merged: Vec<Message> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        (a.created_at.is_empty(), &a.created_at, &a.id).cmp(&(b.created_at.is_empty(), &b.created_at, &b.id))
    });
    (merged, added)
}

pub struct MessagePaginationStore {
    limit: u32,
    active: Option<History>,
    generation: u64,
}

impl MessagePaginationStore {
    pub fn new(limit: u32) -> Self {
        Self { limit: limit.max(1), active: None, generation: 0 }
    }

    /// Switches to `key`, dropping the previous history and cursor.
    pub fn open(&mut self, key: ConversationKey) {
        self.generation += 1;
        self.active = Some(History {
            key,
            chat_room_id: None,
            cursor: PaginationCursor::initial(self.limit),
            messages: Vec::new(),
            in_flight: false,
            anchor: None,
            restore: None,
        });
    }

    pub fn close(&mut self) {
        self.generation += 1;
        self.active = None;
    }

    pub fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|h| &h.key)
    }

    pub fn messages(&self) -> &[Message] {
        self.active.as_ref().map(|h| h.messages.as_slice()).unwrap_or(&[])
    }

    pub fn cursor(&self) -> Option<PaginationCursor> {
        self.active.as_ref().map(|h| h.cursor)
    }

    pub fn is_loading(&self) -> bool {
        self.active.as_ref().is_some_and(|h| h.in_flight)
    }

    pub fn pending_restore(&self) -> Option<ScrollRestore> {
        self.active.as_ref().and_then(|h| h.restore)
    }

    pub fn take_scroll_restore(&mut self) -> Option<ScrollRestore> {
        self.active.as_mut().and_then(|h| h.restore.take())
    }

    /// Plans the next older page. Invalid ids fail fast; a load already in
    /// flight, an exhausted history or a conversation that is not open yield
    /// `Ok(None)`.
    pub fn load_older(&mut self, conversation_id: &str, anchor: Option<ScrollAnchor>) -> Result<Option<PageRequest>> {
        let key: ConversationKey = conversation_id.parse()?;
        let generation = self.generation;
        let Some(history) = self.active.as_mut() else {
            log::debug!("load_older({key}) with no open conversation");
            return Ok(None);
        };
        if history.key != key {
            log::debug!("load_older({key}) ignored, {} is open", history.key);
            return Ok(None);
        }
        if history.in_flight || !history.cursor.has_next_page {
            return Ok(None);
        }

        history.in_flight = true;
        history.anchor = anchor;
        Ok(Some(PageRequest {
            query: MessageQuery { conversation: key, page: history.cursor.page + 1, limit: history.cursor.limit },
            generation,
        }))
    }

    /// Applies a fetched page. Returns `false` when the conversation has been
    /// switched since the request was made.
    pub fn apply_page(&mut self, request: &PageRequest, page: MessagePage) -> bool {
        if request.generation != self.generation {
            log::debug!("discarding messages for {}: conversation switched", request.query.conversation);
            return false;
        }
        let Some(history) = self.active.as_mut() else { return false };

        let (messages, added) = merge_messages(std::mem::take(&mut history.messages), page.messages);
        history.messages = messages;
        history.in_flight = false;
        history.cursor.page = history.cursor.page.max(page.meta.page);
        history.cursor.has_next_page = page.meta.has_next_page;
        if let Some(room) = page.chat_room {
            history.chat_room_id = Some(room.id);
        }
        history.restore = history.anchor.take().map(|anchor| ScrollRestore { anchor, prepended: added });
        true
    }

    /// A failed load keeps the messages and cursor so the user can retry.
    pub fn page_failed(&mut self, request: &PageRequest) {
        if request.generation != self.generation {
            return;
        }
        if let Some(history) = self.active.as_mut() {
            history.in_flight = false;
            history.anchor = None;
        }
    }

    /// Whether an event for `key` / `room` belongs to the open conversation.
    pub fn is_open(&self, key: &ConversationKey, room: Option<&str>) -> bool {
        self.active.as_ref().is_some_and(|h| {
            h.key == *key
                || room.is_some_and(|r| h.chat_room_id.as_deref() == Some(r) || h.key.chat_room_id() == Some(r))
        })
    }

    /// Merges a pushed message into the open history. Returns whether it was new.
    pub fn absorb(&mut self, message: Message) -> bool {
        let Some(history) = self.active.as_mut() else { return false };
        let (messages, added) = merge_messages(std::mem::take(&mut history.messages), vec![message]);
        history.messages = messages;
        added > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{ChatRoomRef, MessageMeta};
    use crate::error::SyncError;

    fn msg(id: &str, at: &str) -> Message {
        Message {
            id: id.to_string(),
            chat_room_id: None,
            sender_id: Some("s1".into()),
            content: format!("message {id}"),
            created_at: at.to_string(),
            attachments: Vec::new(),
        }
    }

    fn page(messages: Vec<Message>, page: u32, has_next_page: bool) -> MessagePage {
        MessagePage { messages, meta: MessageMeta { page, has_next_page }, chat_room: None }
    }

    fn ids(store: &MessagePaginationStore) -> Vec<&str> {
        store.messages().iter().map(|m| m.id.as_str()).collect()
    }

    fn opened(key: &str) -> MessagePaginationStore {
        let mut store = MessagePaginationStore::new(2);
        store.open(key.parse().unwrap());
        store
    }

    #[test]
    fn untimestamped_messages_sort_last() {
        let (merged, added) = merge_messages(vec![msg("b", "2024-01-02T00:00:00Z")], vec![msg("a", ""), msg("c", "2024-01-01T00:00:00Z")]);
        assert_eq!(added, 2);
        let order: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn closing_drops_history_and_invalidates_pages() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.close();
        assert!(store.active_key().is_none());
        assert!(store.messages().is_empty());
        assert!(!store.is_loading());
        assert!(!store.apply_page(&req, page(vec![msg("m1", "2024-01-01T00:00:00Z")], 1, false)));
        assert!(store.messages().is_empty());
    }

    #[test]
    fn first_load_requests_page_one() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        assert_eq!(req.query.page, 1);
        assert_eq!(req.query.limit, 2);
        assert!(store.is_loading());
    }

    #[test]
    fn second_call_while_in_flight_is_noop() {
        let mut store = opened("user-u1");
        assert!(store.load_older("user-u1", None).unwrap().is_some());
        assert!(store.load_older("user-u1", None).unwrap().is_none());
    }

    #[test]
    fn invalid_identifier_fails_fast() {
        let mut store = opened("user-u1");
        let err = store.load_older("user-not valid", None).unwrap_err();
        assert!(matches!(err, SyncError::InvalidIdentifier(_)));
        let err = store.load_older("undefined", None).unwrap_err();
        assert!(matches!(err, SyncError::InvalidIdentifier(_)));
        assert!(!store.is_loading());
    }

    #[test]
    fn exhausted_history_stops_paging() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.apply_page(&req, page(vec![msg("m1", "2024-01-01T00:00:01Z")], 1, false));
        assert!(store.load_older("user-u1", None).unwrap().is_none());
    }

    #[test]
    fn overlapping_pages_are_idempotent() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.apply_page(&req, page(vec![msg("m3", "2024-01-01T00:00:03Z"), msg("m4", "2024-01-01T00:00:04Z")], 1, true));

        let req = store.load_older("user-u1", None).unwrap().unwrap();
        assert_eq!(req.query.page, 2);
        store.apply_page(&req, page(vec![msg("m2", "2024-01-01T00:00:02Z"), msg("m3", "2024-01-01T00:00:03Z")], 2, true));
        assert_eq!(ids(&store), ["m2", "m3", "m4"]);
        assert_eq!(store.cursor().unwrap().page, 2);
    }

    #[test]
    fn anchor_becomes_restore_after_merge() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.apply_page(&req, page(vec![msg("m5", "2024-01-01T00:00:05Z")], 1, true));
        assert_eq!(store.pending_restore(), None);

        let anchor = ScrollAnchor { content_extent: 800.0, offset: 10.0 };
        let req = store.load_older("user-u1", Some(anchor)).unwrap().unwrap();
        store.apply_page(&req, page(vec![msg("m1", "2024-01-01T00:00:01Z"), msg("m2", "2024-01-01T00:00:02Z")], 2, true));

        let restore = store.take_scroll_restore().unwrap();
        assert_eq!(restore.prepended, 2);
        assert_eq!(restore.offset_for(1200.0), 410.0);
        assert_eq!(store.take_scroll_restore(), None);
    }

    #[test]
    fn switching_conversation_clears_and_discards_late_pages() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.open("room-r2".parse().unwrap());
        assert!(!store.apply_page(&req, page(vec![msg("m1", "2024-01-01T00:00:01Z")], 1, true)));
        assert!(store.messages().is_empty());
        assert_eq!(store.cursor().unwrap(), PaginationCursor { page: 0, limit: 2, has_next_page: true });
        assert!(store.load_older("room-r2", None).unwrap().is_some());
    }

    #[test]
    fn failure_keeps_state_and_allows_retry() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.apply_page(&req, page(vec![msg("m9", "2024-01-01T00:00:09Z")], 1, true));
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        store.page_failed(&req);
        assert_eq!(ids(&store), ["m9"]);
        assert_eq!(store.load_older("user-u1", None).unwrap().unwrap().query.page, 2);
    }

    #[test]
    fn room_binding_matches_events_by_room() {
        let mut store = opened("user-u1");
        let req = store.load_older("user-u1", None).unwrap().unwrap();
        let mut reply = page(vec![], 1, false);
        reply.chat_room = Some(ChatRoomRef { id: "r7".into() });
        store.apply_page(&req, reply);

        assert!(store.is_open(&"room-r7".parse().unwrap(), Some("r7")));
        assert!(store.is_open(&"user-u1".parse().unwrap(), None));
        assert!(!store.is_open(&"user-u2".parse().unwrap(), Some("r8")));
    }

    #[test]
    fn absorbing_twice_keeps_one_copy() {
        let mut store = opened("user-u1");
        assert!(store.absorb(msg("m1", "2024-01-01T00:00:01Z")));
        assert!(!store.absorb(msg("m1", "2024-01-01T00:00:01Z")));
        assert_eq!(ids(&store), ["m1"]);
    }
}
