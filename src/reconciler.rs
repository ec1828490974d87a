//! Conversation Reconciler.
//!
//! Sole writer of the per-role conversation lists. A background refresh may
//! update entries and append new ones but never reorders what is already on
//! screen; scoped views (non-`All` filters, fresh activations) are replaced
//! wholesale instead.

use std::collections::HashMap;

use crate::api::client::ConversationQuery;
use crate::api::models::{Conversation, ConversationFilter, ConversationKey, ConversationPage, Role, SortSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Incremental,
    FullReplace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    Activate,
    FilterChanged,
    SortChanged,
    NextPage,
    EventRefresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListConfig {
    pub sort: SortSpec,
    pub filter: ConversationFilter,
}

/// Ordered conversations of one role plus their fetch metadata.
#[derive(Debug, Clone)]
pub struct RoleScopedList {
    pub role: Role,
    pub entries: Vec<Conversation>,
    pub config: ListConfig,
    pub page: u32,
    pub total_pages: u32,
    generation: u64,
    loading_next: bool,
}

impl RoleScopedList {
    fn new(role: Role, sort: SortSpec) -> Self {
        Self {
            role,
            entries: Vec::new(),
            config: ListConfig { sort, filter: ConversationFilter::All },
            page: 0,
            total_pages: 0,
            generation: 0,
            loading_next: false,
        }
    }

    pub fn keys(&self) -> Vec<ConversationKey> {
        self.entries.iter().filter_map(|c| c.key().ok()).collect()
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.entries.iter().find(|c| c.key().ok().as_ref() == Some(key))
    }

    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

/// One planned `GET conversations` call and how its result will be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTicket {
    pub query: ConversationQuery,
    pub mode: MergeMode,
    pub reason: FetchReason,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The view that asked for this page has moved on; nothing changed.
    Stale,
}

/// Drops entries without a usable identity, logging each one.
fn keyed(fetched: Vec<Conversation>) -> Vec<(ConversationKey, Conversation)> {
    fetched
        .into_iter()
        .filter_map(|c| match c.key() {
            Ok(key) => Some((key, c)),
            Err(e) => {
                log::warn!("discarding conversation: {e}");
                None
            }
        })
        .collect()
}

/// Merges a fetched page into `existing`: known keys are updated where they
/// stand, unknown keys are appended in fetched order, and nothing is removed.
pub fn merge(existing: Vec<Conversation>, fetched: Vec<Conversation>) -> Vec<Conversation> {
    let mut order: Vec<ConversationKey> = Vec::new();
    let mut lookup: HashMap<ConversationKey, Conversation> = HashMap::new();
    for (key, conv) in keyed(fetched) {
        if lookup.insert(key.clone(), conv).is_none() {
            order.push(key);
        }
    }

    let mut merged = Vec::with_capacity(existing.len() + lookup.len());
    for current in existing {
        let fresher = current.key().ok().and_then(|key| lookup.remove(&key));
        merged.push(fresher.unwrap_or(current));
    }
    merged.extend(order.into_iter().filter_map(|key| lookup.remove(&key)));
    merged
}

fn replace(fetched: Vec<Conversation>) -> Vec<Conversation> {
    merge(Vec::new(), fetched)
}

pub struct ConversationReconciler {
    lists: HashMap<Role, RoleScopedList>,
    page_size: u32,
}

impl ConversationReconciler {
    pub fn new(page_size: u32, default_sort: SortSpec) -> Self {
        let lists = Role::ALL.into_iter().map(|role| (role, RoleScopedList::new(role, default_sort.clone()))).collect();
        Self { lists, page_size: page_size.max(1) }
    }

    pub fn list(&self, role: Role) -> &RoleScopedList {
        &self.lists[&role]
    }

    fn list_mut(&mut self, role: Role) -> &mut RoleScopedList {
        self.lists.entry(role).or_insert_with(|| RoleScopedList::new(role, SortSpec::default()))
    }

    /// Finds a conversation in any role list.
    pub fn find(&self, key: &ConversationKey) -> Option<(Role, &Conversation)> {
        Role::ALL.into_iter().find_map(|role| self.list(role).get(key).map(|c| (role, c)))
    }

    fn ticket(&self, role: Role, page: u32, mode: MergeMode, reason: FetchReason) -> FetchTicket {
        let list = self.list(role);
        FetchTicket {
            query: ConversationQuery {
                role,
                page,
                limit: self.page_size,
                filter: list.config.filter,
                sort: list.config.sort.clone(),
            },
            mode,
            reason,
            generation: list.generation,
        }
    }

    /// Fresh view activation (role switch or first show): page 1, replaced.
    pub fn activate(&mut self, role: Role) -> FetchTicket {
        let list = self.list_mut(role);
        list.generation += 1;
        list.loading_next = false;
        self.ticket(role, 1, MergeMode::FullReplace, FetchReason::Activate)
    }

    pub fn set_filter(&mut self, role: Role, filter: ConversationFilter) -> FetchTicket {
        let list = self.list_mut(role);
        list.config.filter = filter;
        list.generation += 1;
        list.loading_next = false;
        self.ticket(role, 1, MergeMode::FullReplace, FetchReason::FilterChanged)
    }

    /// Explicit sort override; it sticks for every later fetch of the role.
    pub fn set_sort(&mut self, role: Role, sort: SortSpec) -> FetchTicket {
        let list = self.list_mut(role);
        list.config.sort = sort;
        list.generation += 1;
        list.loading_next = false;
        self.ticket(role, 1, MergeMode::FullReplace, FetchReason::SortChanged)
    }

    /// `None` when the last page is already loaded or a next-page load is
    /// still in flight.
    pub fn next_page(&mut self, role: Role) -> Option<FetchTicket> {
        let list = self.list_mut(role);
        if list.loading_next || !list.has_more() {
            log::debug!("no next page for {role} (page {}/{})", list.page, list.total_pages);
            return None;
        }
        list.loading_next = true;
        let page = list.page + 1;
        Some(self.ticket(role, page, MergeMode::Incremental, FetchReason::NextPage))
    }

    /// Scoped re-fetch after a push event. Filtered views are defined by what
    /// currently matches, so they are replaced; `All` merges.
    pub fn refresh(&mut self, role: Role) -> FetchTicket {
        let mode = match self.list(role).config.filter {
            ConversationFilter::All => MergeMode::Incremental,
            _ => MergeMode::FullReplace,
        };
        self.ticket(role, 1, mode, FetchReason::EventRefresh)
    }

    pub fn apply(&mut self, ticket: &FetchTicket, page: ConversationPage) -> ApplyOutcome {
        let role = ticket.query.role;
        let list = self.list_mut(role);
        if ticket.generation != list.generation {
            log::debug!("discarding stale {:?} result for {role}", ticket.reason);
            return ApplyOutcome::Stale;
        }
        if ticket.reason == FetchReason::NextPage {
            list.loading_next = false;
        }

        let ConversationPage { conversations, meta } = page;
        let fetched: Vec<Conversation> = conversations
            .into_iter()
            .map(|mut c| {
                c.role.get_or_insert(role);
                c
            })
            .collect();

        let existing = std::mem::take(&mut list.entries);
        match ticket.mode {
            MergeMode::Incremental => {
                list.entries = merge(existing, fetched);
                list.page = list.page.max(meta.page);
            }
            MergeMode::FullReplace => {
                list.entries = replace(fetched);
                list.page = meta.page;
            }
        }
        list.total_pages = meta.total_pages;

        // The server may echo the sort it applied; otherwise keep ours.
        if let Some(field) = meta.sort_field {
            list.config.sort.field = field;
        }
        if let Some(order) = meta.sort_order {
            list.config.sort.order = order;
        }
        ApplyOutcome::Applied
    }

    /// A failed fetch leaves the list as it was.
    pub fn fetch_failed(&mut self, ticket: &FetchTicket) {
        let list = self.list_mut(ticket.query.role);
        // A newer view may have its own next-page load in flight.
        if ticket.reason == FetchReason::NextPage && ticket.generation == list.generation {
            list.loading_next = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{ConversationMeta, ConversationStatus, SortOrder};
    use proptest::prelude::*;

    fn conv(user: &str, preview: &str) -> Conversation {
        Conversation {
            other_user_id: Some(user.to_string()),
            chat_room_id: None,
            other_user_name: None,
            last_message_preview: Some(preview.to_string()),
            last_message_at: None,
            unread_count: 0,
            status: ConversationStatus::Open,
            role: None,
        }
    }

    fn page(convs: Vec<Conversation>, page: u32, total_pages: u32) -> ConversationPage {
        ConversationPage { conversations: convs, meta: ConversationMeta { page, total_pages, sort_field: None, sort_order: None } }
    }

    fn users(list: &[Conversation]) -> Vec<String> {
        list.iter().map(|c| c.other_user_id.clone().unwrap_or_default()).collect()
    }

    #[test]
    fn merge_keeps_existing_order_and_updates_fields() {
        let existing = vec![conv("x", "old x"), conv("y", "old y")];
        let fetched = vec![conv("y", "new y"), conv("x", "new x")];
        let merged = merge(existing, fetched);
        assert_eq!(users(&merged), ["x", "y"]);
        assert_eq!(merged[0].last_message_preview.as_deref(), Some("new x"));
        assert_eq!(merged[1].last_message_preview.as_deref(), Some("new y"));
    }

    #[test]
    fn merge_appends_new_and_keeps_missing() {
        let existing = vec![conv("a", ""), conv("b", "")];
        let fetched = vec![conv("c", ""), conv("b", ""), conv("d", "")];
        assert_eq!(users(&merge(existing, fetched)), ["a", "b", "c", "d"]);
    }

    #[test]
    fn merge_discards_identityless_entries() {
        let mut ghost = conv("", "");
        ghost.other_user_id = None;
        let mut room = conv("", "room");
        room.other_user_id = None;
        room.chat_room_id = Some("r1".into());
        let merged = merge(vec![conv("a", "")], vec![ghost, room]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].key().unwrap().to_string(), "room-r1");
    }

    #[test]
    fn activation_replaces_and_records_meta() {
        let mut rec = ConversationReconciler::new(20, SortSpec::default());
        let ticket = rec.activate(Role::Patient);
        assert_eq!(ticket.mode, MergeMode::FullReplace);
        assert_eq!(ticket.query.page, 1);
        assert_eq!(rec.apply(&ticket, page(vec![conv("x", ""), conv("y", "")], 1, 3)), ApplyOutcome::Applied);

        let list = rec.list(Role::Patient);
        assert_eq!(users(&list.entries), ["x", "y"]);
        assert_eq!((list.page, list.total_pages), (1, 3));
        assert!(list.entries.iter().all(|c| c.role == Some(Role::Patient)));
    }

    #[test]
    fn filtered_refresh_drops_entries_that_no_longer_match() {
        let mut rec = ConversationReconciler::new(20, SortSpec::default());
        let ticket = rec.set_filter(Role::Admin, ConversationFilter::Unread);
        rec.apply(&ticket, page(vec![conv("x", ""), conv("y", "")], 1, 1));

        let ticket = rec.refresh(Role::Admin);
        assert_eq!(ticket.mode, MergeMode::FullReplace);
        assert_eq!(ticket.query.filter, ConversationFilter::Unread);
        rec.apply(&ticket, page(vec![conv("y", "")], 1, 1));
        assert_eq!(users(&rec.list(Role::Admin).entries), ["y"]);
    }

    #[test]
    fn next_page_merges_and_is_bounded() {
        let mut rec = ConversationReconciler::new(2, SortSpec::default());
        let ticket = rec.activate(Role::Provider);
        rec.apply(&ticket, page(vec![conv("a", ""), conv("b", "")], 1, 2));

        let next = rec.next_page(Role::Provider).unwrap();
        assert_eq!((next.query.page, next.mode), (2, MergeMode::Incremental));
        assert!(rec.next_page(Role::Provider).is_none(), "already in flight");

        rec.apply(&next, page(vec![conv("c", ""), conv("d", "")], 2, 2));
        assert_eq!(users(&rec.list(Role::Provider).entries), ["a", "b", "c", "d"]);
        assert!(rec.next_page(Role::Provider).is_none(), "last page reached");
    }

    #[test]
    fn sort_is_carried_forward_unless_overridden() {
        let mut rec = ConversationReconciler::new(20, SortSpec::default());
        let custom = SortSpec { field: "createdAt".into(), order: SortOrder::Asc };
        let ticket = rec.set_sort(Role::Admin, custom.clone());
        rec.apply(&ticket, page(vec![conv("a", "")], 1, 2));

        assert_eq!(rec.refresh(Role::Admin).query.sort, custom);
        assert_eq!(rec.next_page(Role::Admin).unwrap().query.sort, custom);
        assert_eq!(rec.activate(Role::Admin).query.sort, custom);
    }

    #[test]
    fn server_echoed_sort_is_stored() {
        let mut rec = ConversationReconciler::new(20, SortSpec::default());
        let ticket = rec.activate(Role::Admin);
        let mut reply = page(vec![], 1, 1);
        reply.meta.sort_field = Some("unreadCount".into());
        rec.apply(&ticket, reply);
        assert_eq!(rec.refresh(Role::Admin).query.sort.field, "unreadCount");
        assert_eq!(rec.refresh(Role::Admin).query.sort.order, SortOrder::Desc);
    }

    #[test]
    fn superseded_results_are_discarded() {
        let mut rec = ConversationReconciler::new(20, SortSpec::default());
        let first = rec.activate(Role::Patient);
        let second = rec.set_filter(Role::Patient, ConversationFilter::Unresolved);
        assert_eq!(rec.apply(&first, page(vec![conv("stale", "")], 1, 1)), ApplyOutcome::Stale);
        assert!(rec.list(Role::Patient).entries.is_empty());
        assert_eq!(rec.apply(&second, page(vec![conv("fresh", "")], 1, 1)), ApplyOutcome::Applied);
        assert_eq!(users(&rec.list(Role::Patient).entries), ["fresh"]);
    }

    #[test]
    fn failed_next_page_can_be_retried() {
        let mut rec = ConversationReconciler::new(1, SortSpec::default());
        let ticket = rec.activate(Role::Admin);
        rec.apply(&ticket, page(vec![conv("a", "")], 1, 2));
        let next = rec.next_page(Role::Admin).unwrap();
        rec.fetch_failed(&next);
        assert_eq!(users(&rec.list(Role::Admin).entries), ["a"]);
        assert!(rec.next_page(Role::Admin).is_some());
    }

    #[test]
    fn superseded_next_page_leaves_the_newer_one_in_flight() {
        let mut rec = ConversationReconciler::new(1, SortSpec::default());
        let ticket = rec.activate(Role::Admin);
        rec.apply(&ticket, page(vec![conv("a", "")], 1, 3));
        let old = rec.next_page(Role::Admin).unwrap();

        let ticket = rec.set_filter(Role::Admin, ConversationFilter::Unread);
        rec.apply(&ticket, page(vec![conv("u", "")], 1, 3));
        let current = rec.next_page(Role::Admin).unwrap();

        assert_eq!(rec.apply(&old, page(vec![conv("b", "")], 2, 3)), ApplyOutcome::Stale);
        rec.fetch_failed(&old);
        assert!(rec.next_page(Role::Admin).is_none(), "newer page still loading");

        assert_eq!(rec.apply(&current, page(vec![conv("v", "")], 2, 3)), ApplyOutcome::Applied);
        assert_eq!(users(&rec.list(Role::Admin).entries), ["u", "v"]);
        assert!(rec.next_page(Role::Admin).is_some());
    }

    #[test]
    fn find_searches_every_role() {
        let mut rec = ConversationReconciler::new(20, SortSpec::default());
        let ticket = rec.activate(Role::Provider);
        rec.apply(&ticket, page(vec![conv("p1", "")], 1, 1));
        let (role, found) = rec.find(&ConversationKey::User("p1".into())).unwrap();
        assert_eq!(role, Role::Provider);
        assert_eq!(found.other_user_id.as_deref(), Some("p1"));
    }

    proptest! {
        #[test]
        fn merge_preserves_known_order(
            existing in proptest::collection::hash_set(0u8..40, 0..15),
            fetched in proptest::collection::vec(0u8..40, 0..20),
        ) {
            let existing: Vec<u8> = existing.into_iter().collect();
            let merged = merge(
                existing.iter().map(|k| conv(&format!("u{k}"), "old")).collect(),
                fetched.iter().map(|k| conv(&format!("u{k}"), "new")).collect(),
            );

            let mut expected: Vec<String> = existing.iter().map(|k| format!("u{k}")).collect();
            for k in &fetched {
                let key = format!("u{k}");
                if !expected.contains(&key) {
                    expected.push(key);
                }
            }
            prop_assert_eq!(users(&merged), expected);

            for c in &merged {
                let id: u8 = c.other_user_id.as_ref().unwrap()[1..].parse().unwrap();
                let wanted = if fetched.contains(&id) { "new" } else { "old" };
                prop_assert_eq!(c.last_message_preview.as_deref(), Some(wanted));
            }
        }
    }
}
