//! Connection-wide state shared between the dispatch loop, stream workers
//! and external shutdown signals.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Code, Error};
use crate::proto::stream::StreamId;

/// Which side began the graceful close sequence.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseInitiator {
    /// This endpoint decided to drain the connection
    Server,
    /// The peer announced it will stop issuing requests
    Client,
}

/// Proof of having performed the open to closed transition.
///
/// Exactly one witness ever exists per connection. Holding it grants the
/// right to emit the terminal GOAWAY and log final closure.
#[derive(Debug)]
pub(crate) struct CloseWitness {
    _private: (),
}

const INITIATOR_NONE: u8 = 0;
const INITIATOR_SERVER: u8 = 1;
const INITIATOR_CLIENT: u8 = 2;

pub(crate) struct SharedState {
    highest_request_stream_id: AtomicU64,
    closed: AtomicBool,
    graceful_close_started: AtomicBool,
    initiator: AtomicU8,
    error_code: AtomicU64,
    // Serializes "check aborted, then act" during shutdown initiation.
    // `Some` holds the error that triggered the abort.
    abort: Mutex<Option<Error>>,
    wake: Notify,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        SharedState {
            highest_request_stream_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            graceful_close_started: AtomicBool::new(false),
            initiator: AtomicU8::new(INITIATOR_NONE),
            error_code: AtomicU64::new(Code::H3_NO_ERROR.value()),
            abort: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    /// Records an accepted request stream id. Out-of-order updates are
    /// dropped, the value never decreases.
    pub(crate) fn observe_request_stream(&self, id: StreamId) {
        self.highest_request_stream_id
            .fetch_max(id.value(), Ordering::AcqRel);
    }

    pub(crate) fn highest_request_stream_id(&self) -> StreamId {
        StreamId(self.highest_request_stream_id.load(Ordering::Acquire))
    }

    /// Performs the single 0 -> 1 closed transition. The winner receives the
    /// witness.
    pub(crate) fn try_close(&self) -> Option<CloseWitness> {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CloseWitness { _private: () })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records who initiated graceful close. Only the first call takes
    /// effect.
    pub(crate) fn initiate_close(&self, by: CloseInitiator) -> bool {
        let value = match by {
            CloseInitiator::Server => INITIATOR_SERVER,
            CloseInitiator::Client => INITIATOR_CLIENT,
        };
        self.initiator
            .compare_exchange(INITIATOR_NONE, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn initiator(&self) -> Option<CloseInitiator> {
        match self.initiator.load(Ordering::Acquire) {
            INITIATOR_SERVER => Some(CloseInitiator::Server),
            INITIATOR_CLIENT => Some(CloseInitiator::Client),
            _ => None,
        }
    }

    /// True exactly once, for the caller that first observes a non-`None`
    /// initiator.
    pub(crate) fn begin_graceful_close(&self) -> bool {
        self.graceful_close_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_error_code(&self, code: Code) {
        self.error_code.store(code.value(), Ordering::Release);
    }

    pub(crate) fn error_code(&self) -> Code {
        Code::from_value(self.error_code.load(Ordering::Acquire))
    }

    /// Marks the connection aborted, recording the triggering error. Returns
    /// false when an abort is already in progress.
    pub(crate) fn begin_abort(&self, cause: Error) -> bool {
        let mut slot = self.abort.lock().expect("abort lock");
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        true
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.lock().expect("abort lock").is_some()
    }

    pub(crate) fn abort_cause(&self) -> Option<Error> {
        self.abort.lock().expect("abort lock").clone()
    }

    /// Wakes the dispatch loop so it re-evaluates the connection state.
    pub(crate) fn kick(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn kicked(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn close_has_exactly_one_winner() {
        let shared = Arc::new(SharedState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || shared.try_close().is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert!(shared.is_closed());
        assert!(shared.try_close().is_none());
    }

    #[test]
    fn initiator_transitions_once() {
        let shared = SharedState::new();
        assert_eq!(shared.initiator(), None);
        assert!(shared.initiate_close(CloseInitiator::Client));
        assert!(!shared.initiate_close(CloseInitiator::Server));
        assert_eq!(shared.initiator(), Some(CloseInitiator::Client));
    }

    #[test]
    fn graceful_close_starts_once() {
        let shared = SharedState::new();
        assert!(shared.begin_graceful_close());
        assert!(!shared.begin_graceful_close());
    }

    #[test]
    fn abort_records_first_cause() {
        let shared = SharedState::new();
        assert!(!shared.is_aborted());
        assert!(shared.begin_abort(Error::aborted(Code::H3_SETTINGS_ERROR)));
        assert!(!shared.begin_abort(Error::aborted(Code::H3_NO_ERROR)));
        let cause = shared.abort_cause().expect("cause");
        assert_eq!(cause.try_get_code(), Some(Code::H3_SETTINGS_ERROR));
    }

    #[test]
    fn highest_stream_id_is_monotonic() {
        let shared = SharedState::new();
        shared.observe_request_stream(StreamId(8));
        shared.observe_request_stream(StreamId(4));
        assert_eq!(shared.highest_request_stream_id(), StreamId(8));
        shared.observe_request_stream(StreamId(12));
        assert_eq!(shared.highest_request_stream_id(), StreamId(12));
    }
}
