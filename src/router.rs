//! Event Router.
//!
//! Turns raw push frames into typed [`PushEvent`]s on a channel, then decides
//! which components each event touches. Every downstream effect is a merge by
//! id or key, so redelivery after a reconnect is harmless.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::events::{BlastCompleted, BlastProgress, EventKind, PushEvent};
use crate::api::models::ConversationKey;
use crate::error::Result;
use crate::pagination::MessagePaginationStore;
use crate::transport::{Connection, Subscription};

/// Receives campaign status updates.
pub trait CampaignReporter: Send + Sync {
    fn progress(&self, progress: &BlastProgress);
    fn completed(&self, completed: &BlastCompleted);
}

pub struct LogReporter;

impl CampaignReporter for LogReporter {
    fn progress(&self, p: &BlastProgress) {
        log::info!("campaign {}: {}/{} sent, {} failed", p.campaign_id, p.sent, p.total, p.failed);
    }

    fn completed(&self, c: &BlastCompleted) {
        log::info!("campaign {} completed: {} sent, {} failed", c.campaign_id, c.sent, c.failed);
    }
}

/// Work an event leaves for the owner of the async side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Scoped re-fetch of the active role's conversation list.
    RefreshConversations,
    /// A message landed in the open conversation.
    MarkRead(ConversationKey),
}

pub struct EventRouter {
    reporter: Arc<dyn CampaignReporter>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(Arc::new(LogReporter))
    }
}

impl EventRouter {
    pub fn new(reporter: Arc<dyn CampaignReporter>) -> Self {
        Self { reporter }
    }

    /// Decodes a frame payload and checks that conversation-bearing events
    /// resolve to a key.
    pub fn classify(kind: EventKind, data: &Value) -> Result<PushEvent> {
        let event = PushEvent::decode(kind, data)?;
        match &event {
            PushEvent::NewMessage(ev) => {
                ev.key()?;
            }
            PushEvent::ConversationItem(conv) => {
                conv.key()?;
            }
            PushEvent::BlastProgress(_) | PushEvent::BlastCompleted(_) => {}
        }
        Ok(event)
    }

    /// Subscribes to every known event on `connection` and forwards the valid
    /// ones to `bus`. The returned subscriptions must be kept alive for as long
    /// as events are wanted.
    pub fn attach(connection: &Arc<Connection>, bus: mpsc::UnboundedSender<PushEvent>) -> Vec<Subscription> {
        EventKind::ALL
            .into_iter()
            .map(|kind| {
                let bus = bus.clone();
                connection.subscribe(kind.as_str(), move |frame| match Self::classify(kind, &frame.data) {
                    Ok(event) => {
                        if bus.send(event).is_err() {
                            log::debug!("event bus closed, dropping `{}`", kind.as_str());
                        }
                    }
                    Err(e) => log::warn!("dropping `{}` event: {e}", kind.as_str()),
                })
            })
            .collect()
    }

    pub fn dispatch(&self, event: PushEvent, store: &mut MessagePaginationStore) -> Vec<FollowUp> {
        log::trace!("dispatching `{}`", event.kind().as_str());
        match event {
            PushEvent::NewMessage(ev) => {
                let key = match ev.key() {
                    Ok(key) => key,
                    Err(e) => {
                        log::warn!("dropping newMessage {}: {e}", ev.message.id);
                        return Vec::new();
                    }
                };
                let mut follow_ups = Vec::with_capacity(2);
                if store.is_open(&key, ev.chat_room_id.as_deref()) {
                    if !store.absorb(ev.message) {
                        log::debug!("newMessage for {key} already known");
                    }
                    if let Some(open) = store.active_key() {
                        follow_ups.push(FollowUp::MarkRead(open.clone()));
                    }
                }
                follow_ups.push(FollowUp::RefreshConversations);
                follow_ups
            }
            PushEvent::ConversationItem(conv) => match conv.key() {
                Ok(_) => vec![FollowUp::RefreshConversations],
                Err(e) => {
                    log::warn!("dropping conversationItem: {e}");
                    Vec::new()
                }
            },
            PushEvent::BlastProgress(progress) => {
                self.reporter.progress(&progress);
                Vec::new()
            }
            PushEvent::BlastCompleted(completed) => {
                self.reporter.completed(&completed);
                Vec::new()
            }
        }
    }
}
