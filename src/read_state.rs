//! Read-State Tracker.
//!
//! Apply-then-reconcile: `mark_read` zeroes counters immediately and the
//! acknowledgement goes out afterwards. A failed or unconfirmed ack is not
//! rolled back; the next authoritative fetch overwrites whatever drifted.

use std::collections::HashMap;

use crate::api::models::{Conversation, ConversationKey, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadAggregates {
    pub admin: u32,
    pub patient: u32,
    pub provider: u32,
}

impl UnreadAggregates {
    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::Admin => self.admin,
            Role::Patient => self.patient,
            Role::Provider => self.provider,
        }
    }

    fn slot(&mut self, role: Role) -> &mut u32 {
        match role {
            Role::Admin => &mut self.admin,
            Role::Patient => &mut self.patient,
            Role::Provider => &mut self.provider,
        }
    }
}

/// What an optimistic `mark_read` changed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub key: ConversationKey,
    pub role: Option<Role>,
    pub prior: u32,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    role: Role,
    unread: u32,
}

#[derive(Debug, Default)]
pub struct ReadStateTracker {
    counters: HashMap<ConversationKey, Counter>,
    aggregates: UnreadAggregates,
    /// Bumped by every `mark_read`.
    marks: u64,
    read_at: HashMap<ConversationKey, u64>,
}

impl ReadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.counters.get(key).map(|c| c.unread).unwrap_or(0)
    }

    pub fn aggregate(&self, role: Role) -> u32 {
        self.aggregates.get(role)
    }

    pub fn aggregates(&self) -> UnreadAggregates {
        self.aggregates
    }

    /// Position in the read-mark sequence. Record it when a fetch is issued
    /// and hand it back to [`sync_role`](Self::sync_role) with the result.
    pub fn checkpoint(&self) -> u64 {
        self.marks
    }

    /// Takes server counters from a page fetched at `issued_at` as the truth
    /// and recomputes the role aggregate from every counter known for the
    /// role. Conversations read after `issued_at` stay at zero: the page
    /// predates the read.
    pub fn sync_role(&mut self, role: Role, fetched: &[Conversation], issued_at: u64) {
        for conv in fetched {
            match conv.key() {
                Ok(key) => {
                    let read_since = self.read_at.get(&key).is_some_and(|&at| at > issued_at);
                    let unread = if read_since { 0 } else { conv.unread_count };
                    self.counters.insert(key, Counter { role, unread });
                }
                Err(e) => log::debug!("skipping unread counter: {e}"),
            }
        }
        let total = self
            .counters
            .values()
            .filter(|c| c.role == role)
            .fold(0u32, |acc, c| acc.saturating_add(c.unread));
        *self.aggregates.slot(role) = total;
    }

    /// Optimistically zeroes `key` and takes its prior count off the role
    /// aggregate, clamped at zero.
    pub fn mark_read(&mut self, key: &ConversationKey) -> ReadReceipt {
        self.marks += 1;
        self.read_at.insert(key.clone(), self.marks);
        let Some(counter) = self.counters.get_mut(key) else {
            return ReadReceipt { key: key.clone(), role: None, prior: 0 };
        };
        let prior = std::mem::take(&mut counter.unread);
        let role = counter.role;
        let slot = self.aggregates.slot(role);
        *slot = slot.saturating_sub(prior);
        log::debug!("marked {key} read ({prior} unread, {role} now {})", *slot);
        ReadReceipt { key: key.clone(), role: Some(role), prior }
    }
}
