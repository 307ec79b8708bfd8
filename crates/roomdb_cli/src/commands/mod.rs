//! CLI command implementations.

pub mod ingest;
pub mod inspect;
pub mod log;
pub mod state;
pub mod sync;
