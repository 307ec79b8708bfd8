//! Wiring of the sync API components over one store.

use crate::config::SyncConfig;
use crate::consumer::RoomEventConsumer;
use crate::error::SyncResult;
use crate::notifier::Notifier;
use crate::output_log::OutputLog;
use crate::sync::SyncStream;
use roomdb_roomserver::OutputFeed;
use roomdb_storage::{Context, Store};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

/// The output log, its consumer and the sync stream, sharing one notifier.
///
/// ```
/// use roomdb_storage::{Context, MemoryStore};
/// use roomdb_syncapi::{SyncApi, SyncConfig, SyncRequest};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let api = SyncApi::new(Arc::new(MemoryStore::new()), SyncConfig::default()).unwrap();
/// let request = SyncRequest {
///     timeout: Some(Duration::ZERO),
///     ..SyncRequest::default()
/// };
/// let response = api.stream().incremental(&Context::background(), &request).unwrap();
/// assert!(response.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct SyncApi {
    log: OutputLog,
    notifier: Arc<Notifier>,
    consumer: RoomEventConsumer,
    stream: SyncStream,
}

impl SyncApi {
    /// Wires the components over `store`, starting the notifier at the
    /// newest logged position.
    pub fn new(store: Arc<dyn Store>, config: SyncConfig) -> SyncResult<Self> {
        let log = OutputLog::new(store);
        let position = log.select_max_event_id(&Context::background())?;
        let notifier = Arc::new(Notifier::new(position));
        let consumer = RoomEventConsumer::new(log.clone(), Arc::clone(&notifier));
        let stream = SyncStream::new(log.clone(), Arc::clone(&notifier), config);
        Ok(Self {
            log,
            notifier,
            consumer,
            stream,
        })
    }

    /// Returns the output log.
    pub fn log(&self) -> &OutputLog {
        &self.log
    }

    /// Returns the notifier.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Returns the consumer.
    pub fn consumer(&self) -> &RoomEventConsumer {
        &self.consumer
    }

    /// Returns the sync stream.
    pub fn stream(&self) -> &SyncStream {
        &self.stream
    }

    /// Subscribes to `feed` and consumes it on a background thread until the
    /// feed is dropped or `ctx` is cancelled.
    ///
    /// Items already in the feed history are appended first. The thread
    /// ends with the count of outputs it appended, or with
    /// [`SyncError::ConsumerStopped`](crate::SyncError::ConsumerStopped) if
    /// one could not be appended.
    pub fn spawn_consumer(
        &self,
        ctx: Context,
        feed: &OutputFeed,
    ) -> SyncResult<JoinHandle<SyncResult<usize>>> {
        let items = feed.subscribe();
        let cursor = self.consumer.catch_up(&ctx, feed, 0)?;
        info!(cursor, "sync consumer caught up");
        let consumer = self.consumer.clone();
        Ok(thread::spawn(move || consumer.run(&ctx, items, cursor)))
    }
}
