//! The room server facade.

use crate::config::RoomServerConfig;
use crate::error::RoomServerResult;
use crate::output::OutputFeed;
use crate::query::RoomQuery;
use crate::types::{InputRoomEvent, RoomUpdate};
use crate::updater::RoomUpdater;
use roomdb_storage::{open_store, Context, Store, StoreConfig};
use std::sync::Arc;

/// Ties the updater, the query side and the output feed to one store.
///
/// ```
/// use roomdb_roomserver::{RoomServer, RoomServerConfig};
/// use roomdb_storage::StoreConfig;
///
/// let server = RoomServer::open(&StoreConfig::default(), RoomServerConfig::default()).unwrap();
/// assert_eq!(server.store().engine(), "memory");
/// ```
#[derive(Debug, Clone)]
pub struct RoomServer {
    store: Arc<dyn Store>,
    updater: RoomUpdater,
    query: RoomQuery,
    feed: Arc<OutputFeed>,
}

impl RoomServer {
    /// Creates a room server over an open store.
    pub fn new(store: Arc<dyn Store>, config: RoomServerConfig) -> Self {
        let feed = Arc::new(OutputFeed::with_max_history(config.output_history));
        let updater = RoomUpdater::new(Arc::clone(&store), config).with_producer(feed.clone());
        Self {
            query: RoomQuery::new(Arc::clone(&store)),
            store,
            updater,
            feed,
        }
    }

    /// Opens the configured store and creates a room server over it.
    pub fn open(store_config: &StoreConfig, config: RoomServerConfig) -> RoomServerResult<Self> {
        Ok(Self::new(open_store(store_config)?, config))
    }

    /// Applies one input event.
    pub fn input(&self, ctx: &Context, input: &InputRoomEvent) -> RoomServerResult<RoomUpdate> {
        self.updater.process(ctx, input)
    }

    /// Applies input events in order, stopping at the first error.
    pub fn input_all(
        &self,
        ctx: &Context,
        inputs: &[InputRoomEvent],
    ) -> RoomServerResult<Vec<RoomUpdate>> {
        inputs
            .iter()
            .map(|input| self.updater.process(ctx, input))
            .collect()
    }

    /// Returns the query side.
    pub fn query(&self) -> &RoomQuery {
        &self.query
    }

    /// Returns the feed every applied event is published to.
    pub fn feed(&self) -> &Arc<OutputFeed> {
        &self.feed
    }

    /// Returns the updater.
    pub fn updater(&self) -> &RoomUpdater {
        &self.updater
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
