//! Bookkeeping for request streams that have been accepted and not yet
//! completed.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::proto::stream::StreamId;
use crate::stream::StreamHandle;

/// The set of in-flight request streams plus a completion signal for the
/// shutdown drain.
pub(crate) struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, StreamHandle>>,
    completed: Notify,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        StreamRegistry {
            streams: Mutex::new(HashMap::new()),
            completed: Notify::new(),
        }
    }

    pub(crate) fn register(&self, handle: StreamHandle) {
        let previous = self
            .streams
            .lock()
            .expect("stream registry lock")
            .insert(handle.id(), handle);
        debug_assert!(previous.is_none(), "stream id registered twice");
    }

    /// Removes a completed stream. The completion signal fires only after the
    /// removal is visible.
    pub(crate) fn complete(&self, id: StreamId) -> bool {
        let removed = self
            .streams
            .lock()
            .expect("stream registry lock")
            .remove(&id)
            .is_some();
        if removed {
            self.completed.notify_one();
        }
        removed
    }

    pub(crate) fn active_requests(&self) -> usize {
        self.streams.lock().expect("stream registry lock").len()
    }

    pub(crate) fn handles(&self) -> Vec<StreamHandle> {
        self.streams
            .lock()
            .expect("stream registry lock")
            .values()
            .cloned()
            .collect()
    }

    /// Resolves once no request streams remain. Woken on every completion and
    /// re-checks the count.
    pub(crate) async fn drained(&self) {
        loop {
            if self.active_requests() == 0 {
                return;
            }
            self.completed.notified().await;
        }
    }
}
