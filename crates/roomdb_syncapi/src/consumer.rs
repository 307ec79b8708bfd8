//! Moves room server outputs into the output log.

use crate::error::{SyncError, SyncResult};
use crate::notifier::Notifier;
use crate::output_log::OutputLog;
use roomdb_roomserver::{FeedItem, OutputFeed, OutputNewRoomEvent};
use roomdb_storage::{Context, StreamPosition};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

const RECV_POLL: Duration = Duration::from_millis(50);
const MAX_APPEND_ATTEMPTS: usize = 5;
const CATCH_UP_BATCH: usize = 256;

/// Appends every output it is given and wakes waiting sync requests.
///
/// Redelivered outputs land on their original position, so a consumer can
/// replay the feed from any cursor.
#[derive(Debug, Clone)]
pub struct RoomEventConsumer {
    log: OutputLog,
    notifier: Arc<Notifier>,
}

impl RoomEventConsumer {
    /// Creates a consumer writing to `log`.
    pub fn new(log: OutputLog, notifier: Arc<Notifier>) -> Self {
        Self { log, notifier }
    }

    /// Returns the notifier woken by this consumer.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Appends one output. Conflicting appends are retried.
    #[instrument(skip_all, fields(event_id = %output.event.event_id()))]
    pub fn on_output(
        &self,
        ctx: &Context,
        output: &OutputNewRoomEvent,
    ) -> SyncResult<StreamPosition> {
        let mut attempt = 1;
        loop {
            match self.log.append_output(ctx, output) {
                Ok(position) => {
                    self.notifier.on_new_event(position);
                    return Ok(position);
                }
                Err(e) if e.is_retryable() && attempt < MAX_APPEND_ATTEMPTS => {
                    warn!(attempt, error = %e, "append conflicted, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Appends one feed item.
    pub fn consume(&self, ctx: &Context, item: &FeedItem) -> SyncResult<StreamPosition> {
        self.on_output(ctx, &item.event)
    }

    /// Appends everything the feed still holds after `cursor` and returns
    /// the new cursor.
    pub fn catch_up(&self, ctx: &Context, feed: &OutputFeed, mut cursor: u64) -> SyncResult<u64> {
        loop {
            let batch = feed.poll(cursor, CATCH_UP_BATCH);
            if batch.is_empty() {
                return Ok(cursor);
            }
            for item in &batch {
                self.consume(ctx, item)?;
                cursor = item.sequence;
            }
        }
    }

    /// Consumes `items` until the sender goes away or `ctx` is cancelled.
    ///
    /// Items at or below `cursor` were already appended and are skipped.
    /// Returns the number of outputs appended. The first output that cannot
    /// be appended stops the consumer with [`SyncError::ConsumerStopped`],
    /// whose cursor is where [`catch_up`](Self::catch_up) resumes.
    pub fn run(
        &self,
        ctx: &Context,
        items: Receiver<FeedItem>,
        mut cursor: u64,
    ) -> SyncResult<usize> {
        let mut appended = 0;
        while !ctx.is_cancelled() {
            match items.recv_timeout(RECV_POLL) {
                Ok(item) if item.sequence <= cursor => {}
                Ok(item) => match self.consume(ctx, &item) {
                    Ok(_) => {
                        appended += 1;
                        cursor = item.sequence;
                    }
                    Err(e) => {
                        error!(
                            sequence = item.sequence,
                            cursor,
                            error = %e,
                            "room event consumer stopped"
                        );
                        return Err(SyncError::ConsumerStopped {
                            cursor,
                            source: Box::new(e),
                        });
                    }
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(appended, cursor, "room event consumer stopped");
        Ok(appended)
    }
}
