//! # roomdb Sync API
//!
//! Output log storage and incremental sync for roomdb.
//!
//! Every event the room server applies is appended to the output log at a
//! unique, strictly increasing stream position. Sync requests read windows of
//! that log: the most recent timeline events per room, plus the state that
//! changed in the window.
//!
//! - [`OutputLog`] appends events and answers range queries
//! - [`RoomEventConsumer`] moves room server outputs into the log
//! - [`Notifier`] wakes long-polling requests
//! - [`SyncStream`] assembles [`SyncResponse`]s
//!
//! ## Usage
//!
//! ```
//! use roomdb_event::{Event, HeaderedEvent, RoomVersion};
//! use roomdb_roomserver::{InputRoomEvent, RoomServer, RoomServerConfig};
//! use roomdb_storage::{Context, MemoryStore, Store};
//! use roomdb_syncapi::{SyncApi, SyncConfig, SyncRequest};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let server = RoomServer::new(Arc::clone(&store), RoomServerConfig::default());
//! let sync = SyncApi::new(store, SyncConfig::default()).unwrap();
//! let ctx = Context::background();
//!
//! let create = HeaderedEvent::new(RoomVersion::V6, Event {
//!     event_id: String::new(),
//!     room_id: "!room:example.org".into(),
//!     sender: "@alice:example.org".into(),
//!     event_type: "m.room.create".into(),
//!     state_key: Some(String::new()),
//!     prev_events: vec![],
//!     auth_events: vec![],
//!     depth: 1,
//!     origin_server_ts: 0,
//!     content: json!({"creator": "@alice:example.org"}),
//! }).unwrap();
//! server.input(&ctx, &InputRoomEvent::new(create)).unwrap();
//! sync.consumer().catch_up(&ctx, server.feed(), 0).unwrap();
//!
//! let request = SyncRequest { timeout: Some(Duration::ZERO), ..SyncRequest::default() };
//! let response = sync.stream().incremental(&ctx, &request).unwrap();
//! assert_eq!(response.rooms["!room:example.org"].timeline.events.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Library code propagates errors instead of panicking.
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod api;
mod config;
mod consumer;
mod error;
mod notifier;
mod output_log;
mod sync;
mod types;

pub use api::SyncApi;
pub use config::SyncConfig;
pub use consumer::RoomEventConsumer;
pub use error::{SyncError, SyncResult};
pub use notifier::Notifier;
pub use output_log::OutputLog;
pub use sync::{
    ClientEvent, MessagesPage, RoomResponse, SyncRequest, SyncResponse, SyncStream, Timeline,
};
pub use types::{Range, StateInRange, StreamEvent, StreamPosition, SyncToken};
