//! Wakes long-polling sync requests when the output log advances.

use parking_lot::{Condvar, Mutex};
use roomdb_storage::{Context, StreamPosition};
use std::time::{Duration, Instant};
use tracing::trace;

/// Tracks the newest logged position and wakes waiters when it moves.
#[derive(Debug, Default)]
pub struct Notifier {
    position: Mutex<StreamPosition>,
    advanced: Condvar,
}

impl Notifier {
    /// Creates a notifier starting at `position`.
    pub fn new(position: StreamPosition) -> Self {
        Self {
            position: Mutex::new(position),
            advanced: Condvar::new(),
        }
    }

    /// Returns the newest position seen.
    pub fn current_position(&self) -> StreamPosition {
        *self.position.lock()
    }

    /// Records that `position` has been logged. Positions never move back.
    pub fn on_new_event(&self, position: StreamPosition) {
        let mut current = self.position.lock();
        if position > *current {
            *current = position;
            trace!(%position, "output log advanced");
            self.advanced.notify_all();
        }
    }

    /// Blocks until the position passes `since`, `timeout` elapses or the
    /// context expires, and returns the position at that point.
    pub fn wait_for_events(
        &self,
        ctx: &Context,
        since: StreamPosition,
        timeout: Duration,
    ) -> StreamPosition {
        let budget = ctx.remaining().map_or(timeout, |left| left.min(timeout));
        let deadline = Instant::now() + budget;
        let mut current = self.position.lock();
        while *current <= since && !ctx.is_cancelled() {
            if self.advanced.wait_until(&mut current, deadline).timed_out() {
                break;
            }
        }
        *current
    }
}
