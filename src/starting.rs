//! Startup deadlines for streams that have not yet delivered their first
//! meaningful frame.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Code, Error};
use crate::stream::StreamHandle;

enum Deadline {
    /// Not armed yet; armed by the first tick that sees the entry
    Unset,
    At(Instant),
    /// Arming overflowed the clock; the entry never expires
    Never,
}

struct Entry {
    handle: StreamHandle,
    deadline: Deadline,
}

/// Queue of streams between acceptance and their first frame, polled by the
/// heartbeat. Producers are the accept path, the single consumer is the tick.
pub(crate) struct StartingStreamQueue {
    entries: Mutex<VecDeque<Entry>>,
}

impl StartingStreamQueue {
    pub(crate) fn new() -> Self {
        StartingStreamQueue {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Called exactly once per created stream.
    pub(crate) fn enqueue(&self, handle: StreamHandle) {
        self.entries
            .lock()
            .expect("starting queue lock")
            .push_back(Entry {
                handle,
                deadline: Deadline::Unset,
            });
    }

    /// Examines each entry that was queued at tick entry exactly once;
    /// entries re-queued during the pass are left for the next tick.
    pub(crate) fn tick(&self, now: Instant, headers_timeout: Duration) {
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock().expect("starting queue lock");
            let mut pass = entries.len();
            while pass > 0 {
                pass -= 1;
                let Some(mut entry) = entries.pop_front() else {
                    break;
                };
                if entry.handle.has_started() {
                    continue;
                }
                match entry.deadline {
                    Deadline::Unset => {
                        entry.deadline = match now.checked_add(headers_timeout) {
                            Some(at) => Deadline::At(at),
                            None => Deadline::Never,
                        };
                        entries.push_back(entry);
                    }
                    Deadline::At(at) if at < now => expired.push(entry.handle),
                    Deadline::At(_) | Deadline::Never => entries.push_back(entry),
                }
            }
        }
        for handle in expired {
            let error = Error::startup_timeout();
            if handle.is_request_stream() {
                debug!(stream_id = %handle.id(), %error, "request stream expired before headers");
                handle.abort("request headers timeout", Code::H3_REQUEST_REJECTED);
            } else {
                debug!(stream_id = %handle.id(), %error, "control stream expired before its type");
                handle.abort(
                    "control stream header timeout",
                    Code::H3_STREAM_CREATION_ERROR,
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("starting queue lock").len()
    }
}
