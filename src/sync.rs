//! Single-owner synchronization actor.
//!
//! `ChatSync` is the only task that touches the reconciler, the message store
//! and the read-state tracker. UI intents, push events and finished network
//! calls all arrive as messages, so a slow fetch never blocks event handling
//! and no locks guard the in-memory state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};

use crate::api::client::{ApiClient, ConversationQuery, MessageQuery};
use crate::api::events::{MARK_AS_READ_EVENT, PushEvent};
use crate::api::models::{
    Conversation, ConversationFilter, ConversationKey, ConversationPage, Message, MessagePage, Role, SortOrder,
    SortSpec,
};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::pagination::{MessagePaginationStore, PageRequest, ScrollAnchor, ScrollRestore};
use crate::read_state::{ReadStateTracker, UnreadAggregates};
use crate::reconciler::{ApplyOutcome, ConversationReconciler, FetchTicket};
use crate::router::{EventRouter, FollowUp};
use crate::transport::Connection;

/// Network side the actor depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn conversations(&self, query: &ConversationQuery) -> Result<ConversationPage>;
    async fn messages(&self, query: &MessageQuery) -> Result<MessagePage>;
    async fn mark_as_read(&self, other_user_id: &str) -> Result<()>;
}

/// REST for reads, the push connection's request/ack for `markAsRead`.
pub struct RemoteBackend {
    api: ApiClient,
    connection: Arc<Connection>,
    ack_timeout: Duration,
}

impl RemoteBackend {
    pub fn new(api: ApiClient, connection: Arc<Connection>, ack_timeout: Duration) -> Self {
        Self { api, connection, ack_timeout }
    }
}

#[async_trait]
impl ChatBackend for RemoteBackend {
    async fn conversations(&self, query: &ConversationQuery) -> Result<ConversationPage> {
        self.api.conversations(query).await
    }

    async fn messages(&self, query: &MessageQuery) -> Result<MessagePage> {
        self.api.messages(query).await
    }

    async fn mark_as_read(&self, other_user_id: &str) -> Result<()> {
        self.connection
            .request(MARK_AS_READ_EVENT, json!({ "otherUserId": other_user_id }), self.ack_timeout)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub initial_role: Role,
    pub conversation_page_size: u32,
    pub message_page_size: u32,
    pub sort: SortSpec,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig, initial_role: Role) -> Self {
        Self {
            initial_role,
            conversation_page_size: config.conversation_page_size,
            message_page_size: config.message_page_size,
            sort: config.sort.clone(),
        }
    }
}

/// Toast-style notifications for the UI.
#[derive(Debug, Clone)]
pub enum Notice {
    FetchFailed { what: String, error: SyncError },
    /// The server never confirmed a read; counters stay cleared locally.
    ReadNotConfirmed { conversation: ConversationKey, error: SyncError },
    Connection(String),
}

/// Everything the UI renders, republished after each change.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub active_role: Role,
    pub filter: ConversationFilter,
    pub sort: SortSpec,
    pub conversations: Vec<Conversation>,
    pub page: u32,
    pub total_pages: u32,
    pub loading_conversations: bool,
    pub active_conversation: Option<ConversationKey>,
    pub messages: Vec<Message>,
    pub has_older_messages: bool,
    pub loading_older_messages: bool,
    pub scroll_restore: Option<ScrollRestore>,
    pub unread: UnreadAggregates,
}

impl SyncSnapshot {
    fn empty(role: Role, sort: SortSpec) -> Self {
        Self {
            active_role: role,
            filter: ConversationFilter::All,
            sort,
            conversations: Vec::new(),
            page: 0,
            total_pages: 0,
            loading_conversations: false,
            active_conversation: None,
            messages: Vec::new(),
            has_older_messages: false,
            loading_older_messages: false,
            scroll_restore: None,
            unread: UnreadAggregates::default(),
        }
    }
}

enum Command {
    SelectRole(Role),
    SelectFilter(ConversationFilter),
    SelectSortOrder(SortSpec),
    OpenConversation(ConversationKey),
    CloseConversation,
    LoadMoreConversations,
    LoadOlderMessages(Option<ScrollAnchor>),
    ScrollRestored,
    Refresh,
    Snapshot(oneshot::Sender<SyncSnapshot>),
    Shutdown,
}

enum Completion {
    /// `issued_at` is the read-state checkpoint when the fetch went out.
    Conversations { ticket: FetchTicket, issued_at: u64, result: Result<ConversationPage> },
    Messages { request: PageRequest, result: Result<MessagePage> },
    Ack { key: ConversationKey, result: Result<()> },
}

/// Cloneable front door used by the UI layer.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SyncSnapshot>,
}

impl SyncHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }

    pub fn select_role(&self, role: Role) -> Result<()> {
        self.send(Command::SelectRole(role))
    }

    pub fn select_filter(&self, filter: ConversationFilter) -> Result<()> {
        self.send(Command::SelectFilter(filter))
    }

    pub fn select_sort_order(&self, field: impl Into<String>, order: SortOrder) -> Result<()> {
        self.send(Command::SelectSortOrder(SortSpec { field: field.into(), order }))
    }

    /// Fails fast with `InvalidIdentifier` for a malformed key.
    pub fn open_conversation(&self, conversation_key: &str) -> Result<()> {
        let key: ConversationKey = conversation_key.parse()?;
        self.send(Command::OpenConversation(key))
    }

    /// Leaves the open conversation; pages still in flight for it are dropped.
    pub fn close_conversation(&self) -> Result<()> {
        self.send(Command::CloseConversation)
    }

    pub fn load_more_conversations(&self) -> Result<()> {
        self.send(Command::LoadMoreConversations)
    }

    /// `anchor` is the viewport geometry right now; it comes back as
    /// [`SyncSnapshot::scroll_restore`] once older messages are merged.
    pub fn load_older_messages(&self, anchor: Option<ScrollAnchor>) -> Result<()> {
        self.send(Command::LoadOlderMessages(anchor))
    }

    /// Clears the pending scroll restore after the UI has repositioned.
    pub fn scroll_restored(&self) -> Result<()> {
        self.send(Command::ScrollRestored)
    }

    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.clone()
    }

    /// Latest published state, without waiting.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    /// State after every previously sent command has been handled.
    pub async fn current(&self) -> Result<SyncSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct ChatSync {
    backend: Arc<dyn ChatBackend>,
    router: EventRouter,
    reconciler: ConversationReconciler,
    store: MessagePaginationStore,
    read_state: ReadStateTracker,
    active_role: Role,
    conversation_fetches: usize,
    snapshot: watch::Sender<SyncSnapshot>,
    notices: mpsc::UnboundedSender<Notice>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl ChatSync {
    /// Starts the actor on the current runtime. It immediately fetches the
    /// first page for `options.initial_role`.
    pub fn spawn(
        backend: Arc<dyn ChatBackend>,
        router: EventRouter,
        events: mpsc::UnboundedReceiver<PushEvent>,
        notices: mpsc::UnboundedSender<Notice>,
        options: SyncOptions,
    ) -> SyncHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(SyncSnapshot::empty(options.initial_role, options.sort.clone()));

        let actor = ChatSync {
            backend,
            router,
            reconciler: ConversationReconciler::new(options.conversation_page_size, options.sort),
            store: MessagePaginationStore::new(options.message_page_size),
            read_state: ReadStateTracker::new(),
            active_role: options.initial_role,
            conversation_fetches: 0,
            snapshot: snapshot_tx,
            notices,
            completions: completion_tx,
        };
        tokio::spawn(actor.run(command_rx, events, completion_rx));

        SyncHandle { commands: command_tx, snapshot: snapshot_rx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PushEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let ticket = self.reconciler.activate(self.active_role);
        self.fetch_conversations(ticket);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(done) = completions.recv() => self.handle_completion(done),
            }
            self.publish();
        }
        log::debug!("sync actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectRole(role) => {
                self.active_role = role;
                let ticket = self.reconciler.activate(role);
                self.fetch_conversations(ticket);
            }
            Command::SelectFilter(filter) => {
                let ticket = self.reconciler.set_filter(self.active_role, filter);
                self.fetch_conversations(ticket);
            }
            Command::SelectSortOrder(sort) => {
                let ticket = self.reconciler.set_sort(self.active_role, sort);
                self.fetch_conversations(ticket);
            }
            Command::OpenConversation(key) => {
                self.store.open(key.clone());
                self.mark_read(key);
                self.load_older(None);
            }
            Command::CloseConversation => self.store.close(),
            Command::LoadMoreConversations => {
                if let Some(ticket) = self.reconciler.next_page(self.active_role) {
                    self.fetch_conversations(ticket);
                }
            }
            Command::LoadOlderMessages(anchor) => self.load_older(anchor),
            Command::ScrollRestored => {
                self.store.take_scroll_restore();
            }
            Command::Refresh => {
                let ticket = self.reconciler.refresh(self.active_role);
                self.fetch_conversations(ticket);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.build_snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: PushEvent) {
        for follow_up in self.router.dispatch(event, &mut self.store) {
            match follow_up {
                FollowUp::RefreshConversations => {
                    let ticket = self.reconciler.refresh(self.active_role);
                    self.fetch_conversations(ticket);
                }
                FollowUp::MarkRead(key) => self.mark_read(key),
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Conversations { ticket, issued_at, result } => {
                self.conversation_fetches = self.conversation_fetches.saturating_sub(1);
                let role = ticket.query.role;
                match result {
                    Ok(_) if role != self.active_role => {
                        log::debug!("discarding {role} conversations, {} is active", self.active_role);
                        self.reconciler.fetch_failed(&ticket);
                    }
                    Ok(page) => {
                        let fetched = page.conversations.clone();
                        if self.reconciler.apply(&ticket, page) == ApplyOutcome::Applied {
                            self.read_state.sync_role(role, &fetched, issued_at);
                        }
                    }
                    Err(error) => {
                        log::warn!("conversation fetch for {role} failed: {error}");
                        self.reconciler.fetch_failed(&ticket);
                        self.notify(Notice::FetchFailed { what: format!("{role} conversations"), error });
                    }
                }
            }
            Completion::Messages { request, result } => match result {
                Ok(page) => {
                    self.store.apply_page(&request, page);
                }
                Err(error) => {
                    log::warn!("message fetch for {} failed: {error}", request.query.conversation);
                    self.store.page_failed(&request);
                    self.notify(Notice::FetchFailed { what: format!("messages of {}", request.query.conversation), error });
                }
            },
            Completion::Ack { key, result } => {
                // No rollback: the next authoritative fetch settles the counter.
                if let Err(error) = result {
                    log::warn!("read acknowledgement for {key} failed: {error}");
                    self.notify(Notice::ReadNotConfirmed { conversation: key, error });
                }
            }
        }
    }

    fn mark_read(&mut self, key: ConversationKey) {
        self.read_state.mark_read(&key);
        let Some(user) = key.other_user_id().map(str::to_string) else {
            log::debug!("{key} has no other user; skipping read acknowledgement");
            return;
        };
        let backend = self.backend.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend.mark_as_read(&user).await;
            let _ = completions.send(Completion::Ack { key, result });
        });
    }

    fn load_older(&mut self, anchor: Option<ScrollAnchor>) {
        let Some(key) = self.store.active_key().map(ToString::to_string) else {
            log::debug!("no open conversation to page");
            return;
        };
        match self.store.load_older(&key, anchor) {
            Ok(Some(request)) => self.fetch_messages(request),
            Ok(None) => log::debug!("load_older({key}) is a no-op"),
            Err(e) => log::warn!("load_older({key}) rejected: {e}"),
        }
    }

    fn fetch_conversations(&mut self, ticket: FetchTicket) {
        self.conversation_fetches += 1;
        let issued_at = self.read_state.checkpoint();
        let backend = self.backend.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend.conversations(&ticket.query).await;
            let _ = completions.send(Completion::Conversations { ticket, issued_at, result });
        });
    }

    fn fetch_messages(&mut self, request: PageRequest) {
        let backend = self.backend.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend.messages(&request.query).await;
            let _ = completions.send(Completion::Messages { request, result });
        });
    }

    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            log::debug!("notice receiver dropped");
        }
    }

    fn build_snapshot(&self) -> SyncSnapshot {
        let list = self.reconciler.list(self.active_role);
        let conversations = list
            .entries
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if let Ok(key) = c.key() {
                    c.unread_count = self.read_state.unread(&key);
                }
                c
            })
            .collect();
        SyncSnapshot {
            active_role: self.active_role,
            filter: list.config.filter,
            sort: list.config.sort.clone(),
            conversations,
            page: list.page,
            total_pages: list.total_pages,
            loading_conversations: self.conversation_fetches > 0,
            active_conversation: self.store.active_key().cloned(),
            messages: self.store.messages().to_vec(),
            has_older_messages: self.store.cursor().is_some_and(|c| c.has_next_page),
            loading_older_messages: self.store.is_loading(),
            scroll_restore: self.store.pending_restore(),
            unread: self.read_state.aggregates(),
        }
    }

    fn publish(&self) {
        let next = self.build_snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
