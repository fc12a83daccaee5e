//! The connection dispatcher: owns one QUIC connection for its lifetime,
//! classifies inbound streams, drives the settings exchange and sequences
//! shutdown against in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::control::{ControlChannels, PeerSettings};
use crate::error::{Code, Error, ErrorLevel};
use crate::proto::coding::Encode;
use crate::proto::frame::{SettingId, Settings};
use crate::proto::stream::{StreamId, StreamType};
use crate::quic::{self, IncomingStream, SendStream};
use crate::registry::StreamRegistry;
use crate::shared::{CloseInitiator, CloseWitness, SharedState};
use crate::starting::StartingStreamQueue;
use crate::stream::{run_inbound_uni_stream, run_request_stream, Application, StreamHandle};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct Core<T: quic::Connection> {
    id: Box<str>,
    config: Config,
    transport: T,
    shared: SharedState,
    registry: StreamRegistry,
    starting: StartingStreamQueue,
    channels: ControlChannels<T::SendStream>,
    server_settings: Settings,
}

impl<T: quic::Connection> Core<T> {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn channels(&self) -> &ControlChannels<T::SendStream> {
        &self.channels
    }

    /// Re-evaluates the shutdown state machine. Runs after every accept and
    /// every kick from a completion or an external signal.
    async fn update_connection_state(&self) -> Result<(), Error> {
        let Some(initiator) = self.shared.initiator() else {
            return Ok(());
        };
        if self.shared.begin_graceful_close() {
            debug!(connection_id = %self.id, initiated_by = ?initiator, "closing http3 connection");
            if initiator == CloseInitiator::Server && self.registry.active_requests() > 0 {
                // Announce that stream ids beyond the reserved maximum will
                // not be processed, without committing to a cutoff yet.
                self.channels.send_goaway(StreamId::MAX).await?;
            }
        }
        if self.registry.active_requests() == 0 {
            if let Some(witness) = self.shared.try_close() {
                self.close_with(witness).await;
                self.transport
                    .abort(Code::H3_NO_ERROR.value(), "connection shutdown");
            }
        }
        Ok(())
    }

    /// Emits the terminal GOAWAY and logs final closure. Consumes the close
    /// witness, so this runs at most once per connection.
    async fn close_with(&self, witness: CloseWitness) {
        let highest = self.shared.highest_request_stream_id();
        if let Err(err) = self.channels.send_goaway(highest).await {
            debug!(connection_id = %self.id, error = %err, "failed to send the final goaway");
        }
        debug!(
            connection_id = %self.id,
            highest_stream_id = highest.value(),
            "http3 connection closed"
        );
        drop(witness);
    }

    /// Marks graceful-close intent and wakes the accept loop. Idempotent and
    /// callable from any context.
    pub(crate) fn initiate_shutdown(&self, initiator: CloseInitiator) {
        self.shared.initiate_close(initiator);
        self.shared.kick();
    }

    pub(crate) fn on_inbound_goaway(&self, id: StreamId) {
        debug!(connection_id = %self.id, goaway_id = id.value(), "goaway received");
        self.initiate_shutdown(CloseInitiator::Client);
    }

    /// The QUIC transport signalled that the connection is gone. Unblocks the
    /// accept loop; idempotent.
    pub(crate) fn on_transport_closed(&self) {
        if self.shared.try_close().is_some() {
            debug!(
                connection_id = %self.id,
                highest_stream_id = self.shared.highest_request_stream_id().value(),
                "http3 connection closed"
            );
        }
        self.transport
            .abort(Code::H3_NO_ERROR.value(), "the client closed the connection");
        self.shared.kick();
    }

    /// Aborts the connection: records the error code, attempts the single
    /// terminal GOAWAY and tears down the transport.
    pub(crate) async fn abort(&self, reason: &str, code: Code) {
        self.abort_with(
            code.with_reason(reason.to_owned(), ErrorLevel::ConnectionError),
            code,
        )
        .await;
    }

    async fn abort_with(&self, cause: Error, code: Code) {
        if !self.shared.begin_abort(cause.clone()) {
            return;
        }
        self.shared.set_error_code(code);
        debug!(connection_id = %self.id, code = ?code, reason = %cause, "aborting http3 connection");
        if let Some(witness) = self.shared.try_close() {
            self.close_with(witness).await;
        }
        self.transport.abort(code.value(), &cause.to_string());
        self.shared.kick();
    }

    /// A stream worker reported a protocol violation; escalates to a
    /// connection-wide abort with the stream-supplied code.
    pub(crate) async fn on_stream_connection_error(&self, err: Error) {
        if self.shared.is_closed() || self.shared.is_aborted() {
            return;
        }
        error!(connection_id = %self.id, error = %err, "http3 connection error");
        let code = err.try_get_code().unwrap_or(Code::H3_INTERNAL_ERROR);
        self.abort_with(err, code).await;
    }

    /// A request stream worker finished; removes it and re-evaluates the
    /// shutdown state.
    pub(crate) fn on_stream_completed(&self, id: StreamId) {
        if self.registry.complete(id) {
            self.shared.kick();
        }
    }
}

/// Server side of a single HTTP/3 connection over a multiplexed QUIC
/// transport.
///
/// [`Connection::run`] drives the connection from start to full shutdown.
/// Obtain a [`ConnectionHandle`] before calling `run` to signal the
/// connection from the outside.
pub struct Connection<T: quic::Connection> {
    core: Arc<Core<T>>,
}

impl<T: quic::Connection> Connection<T> {
    /// Create a connection with default settings.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, Config::default())
    }

    pub(crate) fn with_config(transport: T, config: Config) -> Self {
        let mut server_settings = Settings::default();
        server_settings
            .insert(SettingId::QPACK_MAX_TABLE_CAPACITY, config.header_table_size)
            .expect("setting identifiers are distinct");
        server_settings
            .insert(
                SettingId::MAX_FIELD_SECTION_SIZE,
                config.max_request_header_field_size,
            )
            .expect("setting identifiers are distinct");
        let id = format!(
            "h3conn-{}",
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) + 1
        );
        Connection {
            core: Arc::new(Core {
                id: id.into_boxed_str(),
                config,
                transport,
                shared: SharedState::new(),
                registry: StreamRegistry::new(),
                starting: StartingStreamQueue::new(),
                channels: ControlChannels::new(),
                server_settings,
            }),
        }
    }

    /// A cloneable handle for signalling the running connection.
    pub fn handle(&self) -> ConnectionHandle<T> {
        ConnectionHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Drives the connection until it is fully closed: opens the outbound
    /// control stream, accepts and classifies peer streams, and sequences
    /// shutdown against in-flight requests.
    pub async fn run<A>(self, application: A) -> Result<(), Error>
    where
        A: Application<T::RecvStream, T::SendStream>,
    {
        let core = self.core;
        let application = Arc::new(application);
        // The heartbeat detaches on every exit path of `run`.
        let _heartbeat = AbortOnDropHandle::new(tokio::spawn(heartbeat(Arc::clone(&core))));

        let result = drive(&core, &application).await;
        finish(&core, result).await
    }
}

/// Cloneable handle over a running [`Connection`].
pub struct ConnectionHandle<T: quic::Connection> {
    core: Arc<Core<T>>,
}

impl<T: quic::Connection> Clone for ConnectionHandle<T> {
    fn clone(&self) -> Self {
        ConnectionHandle {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: quic::Connection> ConnectionHandle<T> {
    /// Stops processing new requests and drains the connection. Idempotent;
    /// the first caller fixes who initiated the close.
    pub fn initiate_shutdown(&self, initiator: CloseInitiator) {
        self.core.initiate_shutdown(initiator);
    }

    /// Signal that the QUIC transport observed the connection closing.
    /// Idempotent.
    pub fn on_transport_closed(&self) {
        self.core.on_transport_closed();
    }

    /// Abort the connection with an error code.
    pub async fn abort(&self, reason: &str, code: Code) {
        self.core.abort(reason, code).await;
    }

    /// Whether the connection has fully closed
    pub fn is_closed(&self) -> bool {
        self.core.shared.is_closed()
    }

    /// The number of request streams currently in flight
    pub fn active_requests(&self) -> usize {
        self.core.registry.active_requests()
    }

    /// The settings announced by the peer so far
    pub async fn peer_settings(&self) -> PeerSettings {
        self.core.channels.peer_settings().await
    }
}

async fn heartbeat<T: quic::Connection>(core: Arc<Core<T>>) {
    let mut ticker = time::interval(core.config.heartbeat_interval);
    loop {
        let now = ticker.tick().await;
        core.starting
            .tick(now, core.config.request_headers_timeout);
    }
}

/// Sends the stream type varint and the server SETTINGS before any accept
/// makes progress, so the peer never sees settings-dependent frames first.
async fn open_control_stream<T: quic::Connection>(core: &Core<T>) -> Result<(), Error> {
    let mut stream = core.transport.open_uni().await?;
    let mut buf = Vec::with_capacity(StreamType::MAX_ENCODED_SIZE + 64);
    StreamType::CONTROL.encode(&mut buf);
    core.server_settings.encode(&mut buf);
    stream.write_all(&buf).await?;
    core.channels.set_outbound(stream).await;
    trace!(connection_id = %core.id, "control stream established");
    Ok(())
}

async fn drive<T, A>(core: &Arc<Core<T>>, application: &Arc<A>) -> Result<(), Error>
where
    T: quic::Connection,
    A: Application<T::RecvStream, T::SendStream>,
{
    open_control_stream(core).await?;
    while !core.shared.is_closed() {
        tokio::select! {
            biased;
            _ = core.shared.kicked() => core.update_connection_state().await?,
            accepted = core.transport.accept() => match accepted {
                Ok(Some(stream)) => {
                    dispatch(core, stream, application);
                    core.update_connection_state().await?;
                }
                // The peer will open no further streams; in-flight requests
                // still drain.
                Ok(None) => return Ok(()),
                Err(err) => return Err(err.into()),
            },
        }
    }
    Ok(())
}

fn dispatch<T, A>(
    core: &Arc<Core<T>>,
    stream: IncomingStream<T::RecvStream, T::SendStream>,
    application: &Arc<A>,
) where
    T: quic::Connection,
    A: Application<T::RecvStream, T::SendStream>,
{
    let IncomingStream { id, recv, send } = stream;
    match send {
        None => {
            trace!(connection_id = %core.id, stream_id = %id, "inbound unidirectional stream");
            let handle = StreamHandle::new(id, false);
            core.starting.enqueue(handle.clone());
            tokio::spawn(run_inbound_uni_stream(Arc::clone(core), handle, recv));
        }
        Some(send) => {
            core.shared.observe_request_stream(id);
            let handle = StreamHandle::new(id, true);
            core.starting.enqueue(handle.clone());
            core.registry.register(handle.clone());
            trace!(
                connection_id = %core.id,
                stream_id = %id,
                protocol = "http/3",
                "request stream queued"
            );
            tokio::spawn(run_request_stream(
                Arc::clone(core),
                handle,
                recv,
                send,
                Arc::clone(application),
            ));
        }
    }
}

async fn finish<T: quic::Connection>(
    core: &Arc<Core<T>>,
    result: Result<(), Error>,
) -> Result<(), Error> {
    match drain(core, result).await {
        Ok(result) => result,
        Err(err) => {
            // A failure while shutting down; force the connection down and
            // surface the secondary error.
            core.abort("connection shutdown failed", Code::H3_NO_ERROR)
                .await;
            Err(err)
        }
    }
}

/// The shutdown path: classifies the loop-exit cause, attempts the single
/// terminal GOAWAY, aborts every registered stream and waits for the active
/// requests to complete.
async fn drain<T: quic::Connection>(
    core: &Arc<Core<T>>,
    result: Result<(), Error>,
) -> Result<Result<(), Error>, Error> {
    let mut result = match result {
        Ok(()) => Ok(()),
        // The peer closed without error, or the loop was unblocked by a local
        // abort whose real cause is re-attached below.
        Err(err) if err.is_closed() || err.is_aborted() => Ok(()),
        Err(err) => {
            classify_failure(core, &err).await;
            Err(err)
        }
    };
    if let Some(cause) = core.shared.abort_cause() {
        result = Err(cause);
    }

    if let Some(witness) = core.shared.try_close() {
        core.close_with(witness).await;
    }

    let code = core.shared.error_code();
    for handle in core.registry.handles() {
        handle.abort("connection terminated", code);
    }
    core.registry.drained().await;

    core.transport.abort(code.value(), "connection shutdown");
    Ok(result)
}

async fn classify_failure<T: quic::Connection>(core: &Arc<Core<T>>, err: &Error) {
    if let (Some(code), ErrorLevel::ConnectionError) = (err.try_get_code(), err.level()) {
        error!(connection_id = %core.id, error = %err, "http3 connection error");
        core.abort_with(err.clone(), code).await;
    } else if err.is_transport() {
        if core.registry.active_requests() > 0 {
            error!(connection_id = %core.id, error = %err, "request processing failed");
        }
        core.abort_with(Error::faulted(err.clone()), Code::H3_NO_ERROR)
            .await;
    } else {
        error!(
            connection_id = %core.id,
            error = %err,
            "unexpected error in the connection dispatch loop"
        );
        core.abort_with(err.clone(), Code::H3_INTERNAL_ERROR).await;
    }
}
