//! # roomdb Room Server
//!
//! Applies room events to storage and answers questions about room state.
//!
//! Each input event is handled by [`RoomUpdater::process`] in one
//! transaction:
//!
//! 1. Assign NIDs for the room, the event type and the state key
//! 2. Work out the state before the event from its prev events, resolving
//!    conflicts with the room version's [`StateResolver`] when they diverge
//! 3. Store the event
//! 4. Lock the room row, recompute the forward extremities and the current
//!    state, and record the state delta
//! 5. Commit, then publish an [`OutputNewRoomEvent`] to the
//!    [`OutputProducer`]
//!
//! Events of one room are applied strictly one at a time; different rooms
//! proceed in parallel.
//!
//! ## Usage
//!
//! ```
//! use roomdb_event::{Event, HeaderedEvent, RoomVersion};
//! use roomdb_roomserver::{InputRoomEvent, RoomServer, RoomServerConfig};
//! use roomdb_storage::{Context, StoreConfig};
//! use serde_json::json;
//!
//! let server = RoomServer::open(&StoreConfig::default(), RoomServerConfig::default()).unwrap();
//! let create = HeaderedEvent::new(
//!     RoomVersion::V6,
//!     Event {
//!         event_id: String::new(),
//!         room_id: "!room:example.org".into(),
//!         sender: "@alice:example.org".into(),
//!         event_type: "m.room.create".into(),
//!         state_key: Some(String::new()),
//!         prev_events: vec![],
//!         auth_events: vec![],
//!         depth: 1,
//!         origin_server_ts: 0,
//!         content: json!({"creator": "@alice:example.org"}),
//!     },
//! )
//! .unwrap();
//!
//! let update = server
//!     .input(&Context::background(), &InputRoomEvent::new(create))
//!     .unwrap();
//! assert_eq!(update.applied().unwrap().latest_event_ids.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod event_store;
mod nid;
mod output;
mod query;
mod server;
mod state_resolution;
mod state_store;
mod types;
mod updater;

pub use config::RoomServerConfig;
pub use error::{RoomServerError, RoomServerResult};
pub use event_store::{EventStore, PrevEvents, StoredEvent};
pub use nid::NidAllocator;
pub use output::{FeedItem, OutputFeed, OutputProducer};
pub use query::{LatestEventsAndState, RoomQuery, StateAfterEvents};
pub use server::RoomServer;
pub use state_resolution::{
    split_states, SplitState, StateResolver, CREATE_KEY, CREATOR_POWER, POWER_LEVELS_KEY,
};
pub use state_store::{state_diff, StateDelta, StateStore};
pub use types::{
    InputKind, InputRoomEvent, OutputNewRoomEvent, RoomUpdate, StateMap, TransactionId,
};
pub use updater::RoomUpdater;
