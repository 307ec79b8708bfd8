//! # roomdb Testkit
//!
//! Test utilities for roomdb.
//!
//! This crate provides:
//! - Store fixtures for every engine, with automatic cleanup
//! - [`EventFactory`], a builder for valid room events
//! - Property-based test generators using proptest
//! - Concurrent ingest helpers for stress tests and benchmarks
//!
//! ## Usage
//!
//! ```
//! use roomdb_event::RoomVersion;
//! use roomdb_roomserver::InputRoomEvent;
//! use roomdb_storage::Context;
//! use roomdb_testkit::prelude::*;
//!
//! for fixture in TestStore::all() {
//!     let server = fixture.room_server();
//!     let mut room = EventFactory::new("!room:test", RoomVersion::V1);
//!     let create = room.create("@alice:test");
//!     server
//!         .input(&Context::background(), &InputRoomEvent::new(create))
//!         .unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod events;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::events::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use events::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
