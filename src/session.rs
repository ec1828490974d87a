use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::client::ApiClient;
use crate::api::models::Role;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::router::{CampaignReporter, EventRouter, LogReporter};
use crate::sync::{ChatSync, Notice, RemoteBackend, SyncHandle, SyncOptions};
use crate::transport::ws::WsTransport;
use crate::transport::{ConnectionManager, ConnectionState, Subscription};

/// Builds the connection manager described by `config`. Share it between
/// sessions so that they reuse one push connection per credential.
pub fn connection_manager(config: &SyncConfig) -> Result<Arc<ConnectionManager>> {
    let transport = WsTransport::new(config.push_url()?, config.reconnect_policy()).with_keepalive(config.keepalive());
    Ok(Arc::new(ConnectionManager::new(Arc::new(transport), config.connect_timeout())))
}

/// One view's worth of synchronized chat state.
///
/// Dropping a session disposes its event subscriptions and stops its actor;
/// the shared connection stays up for other sessions.
pub struct Session {
    handle: SyncHandle,
    notices: Option<mpsc::UnboundedReceiver<Notice>>,
    connection_state: watch::Receiver<ConnectionState>,
    subscriptions: Vec<Subscription>,
    error_watch: JoinHandle<()>,
}

impl Session {
    pub fn start(config: &SyncConfig, manager: &ConnectionManager, role: Role) -> Result<Self> {
        Self::start_with_reporter(config, manager, role, Arc::new(LogReporter))
    }

    pub fn start_with_reporter(
        config: &SyncConfig,
        manager: &ConnectionManager,
        role: Role,
        reporter: Arc<dyn CampaignReporter>,
    ) -> Result<Self> {
        config.validate()?;
        let token = config.token.clone().ok_or_else(|| SyncError::Config("no credential configured".into()))?;

        let connection = manager.connect(&token);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let subscriptions = EventRouter::attach(&connection, event_tx);

        let api = ApiClient::new(&config.base_url, Some(token));
        let backend = Arc::new(RemoteBackend::new(api, connection.clone(), config.ack_timeout()));
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let handle = ChatSync::spawn(
            backend,
            EventRouter::new(reporter),
            event_rx,
            notice_tx.clone(),
            SyncOptions::from_config(config, role),
        );

        let error_watch =
            tokio::spawn(forward_connection_errors(connection.watch_state(), handle.clone(), notice_tx));

        Ok(Self {
            handle,
            notices: Some(notices),
            connection_state: connection.watch_state(),
            subscriptions,
            error_watch,
        })
    }

    pub fn handle(&self) -> &SyncHandle {
        &self.handle
    }

    /// Notice stream; can be taken once.
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notices.take()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.error_watch.abort();
        self.handle.shutdown();
    }
}

/// Surfaces each new transport error once and re-fetches after a reconnect,
/// since events may have been missed while offline.
async fn forward_connection_errors(
    mut state: watch::Receiver<ConnectionState>,
    handle: SyncHandle,
    notices: mpsc::UnboundedSender<Notice>,
) {
    let mut last = state.borrow_and_update().clone();
    while state.changed().await.is_ok() {
        let now = state.borrow_and_update().clone();
        if let Some(error) = now.last_error.as_ref().filter(|e| last.last_error.as_ref() != Some(*e)) {
            let _ = notices.send(Notice::Connection(error.clone()));
        }
        if now.connects > last.connects && now.connects > 1 {
            log::info!("push transport reconnected, refreshing conversations");
            if handle.refresh().is_err() {
                break;
            }
        }
        last = now;
    }
}
