//! Conversation synchronization core for the CareBridge dashboards.
//!
//! Keeps role-scoped conversation lists, the open conversation's message
//! history and unread counters consistent with the server while REST
//! responses and push events arrive in any order.
//!
//! A typical embedding shares one [`ConnectionManager`] and opens a
//! [`Session`] per view:
//!
//! ```no_run
//! # async fn run() -> carebridge_sync::Result<()> {
//! use carebridge_sync::{Role, Session, SyncConfig, session};
//!
//! let config = SyncConfig::load();
//! let manager = session::connection_manager(&config)?;
//! let session = Session::start(&config, &manager, Role::Provider)?;
//! session.handle().open_conversation("user-42")?;
//! let snapshot = session.handle().current().await?;
//! println!("{} messages", snapshot.messages.len());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod pagination;
pub mod read_state;
pub mod reconciler;
pub mod router;
pub mod session;
pub mod sync;
pub mod transport;
pub mod utils;

pub use api::models::{
    Conversation, ConversationFilter, ConversationKey, ConversationStatus, Message, Role, SortOrder, SortSpec,
};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use session::Session;
pub use sync::{ChatBackend, ChatSync, Notice, SyncHandle, SyncOptions, SyncSnapshot};
pub use transport::{ConnectionManager, ConnectionState};
