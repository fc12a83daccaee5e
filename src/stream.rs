//! Stream handles and the per-stream workers the dispatcher hands to the
//! runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use async_trait::async_trait;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, trace, warn};

use crate::connection::Core;
use crate::error::{Code, Error, ErrorLevel};
use crate::proto::coding::BufExt;
use crate::proto::frame::{Frame, FrameError};
use crate::proto::stream::{StreamId, StreamType};
use crate::quic::{self, RecvStream, SendStream};

/// Cause recorded by the first abort of a stream.
#[derive(Debug, Clone)]
pub(crate) struct AbortCause {
    pub(crate) reason: Box<str>,
    pub(crate) code: Code,
}

struct HandleInner {
    id: StreamId,
    is_request: bool,
    started: AtomicBool,
    cancel: CancellationToken,
    cause: Mutex<Option<AbortCause>>,
}

/// Shared view of an accepted stream: identity, startup progress and the
/// abort capability. The I/O halves stay with the owning worker.
#[derive(Clone)]
pub(crate) struct StreamHandle {
    inner: Arc<HandleInner>,
}

impl StreamHandle {
    pub(crate) fn new(id: StreamId, is_request: bool) -> Self {
        StreamHandle {
            inner: Arc::new(HandleInner {
                id,
                is_request,
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                cause: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn id(&self) -> StreamId {
        self.inner.id
    }

    pub(crate) fn is_request_stream(&self) -> bool {
        self.inner.is_request
    }

    /// Set once the stream has received the minimum bytes to be classified:
    /// HEADERS for a request stream, the stream-type varint for a control
    /// stream.
    pub(crate) fn mark_started(&self) {
        self.inner.started.store(true, Ordering::Release);
    }

    pub(crate) fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Aborts the stream. The first call wins and records the cause; the
    /// owning worker observes the cancellation and tears the stream down.
    pub(crate) fn abort(&self, reason: &str, code: Code) {
        {
            let mut cause = self.inner.cause.lock().expect("stream cause lock");
            if cause.is_some() {
                return;
            }
            *cause = Some(AbortCause {
                reason: reason.into(),
                code,
            });
        }
        self.inner.cancel.cancel();
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    pub(crate) fn abort_cause(&self) -> Option<AbortCause> {
        self.inner.cause.lock().expect("stream cause lock").clone()
    }
}

/// Buffered frame decoding over a transport receive stream.
pub struct FrameReader<R> {
    recv: R,
    buf: BytesMut,
}

impl<R: RecvStream> FrameReader<R> {
    pub(crate) fn new(recv: R) -> Self {
        FrameReader {
            recv,
            buf: BytesMut::new(),
        }
    }

    /// Reads the leading varint identifying a unidirectional stream's role.
    /// `None` means the peer finished the stream before sending it.
    pub(crate) async fn read_stream_type(&mut self) -> Result<Option<StreamType>, Error> {
        loop {
            let mut cursor = std::io::Cursor::new(&self.buf[..]);
            if let Ok(value) = cursor.get_var() {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);
                return Ok(Some(StreamType::from_value(value)));
            }
            match self.recv.read_chunk().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if self.buf.is_empty() => return Ok(None),
                None => {
                    return Err(Code::H3_FRAME_ERROR.with_reason(
                        "stream ended inside the stream type",
                        ErrorLevel::ConnectionError,
                    ));
                }
            }
        }
    }

    /// Decodes the next frame, reading more data as needed. `None` means the
    /// peer finished the stream on a frame boundary. `Data` frames leave
    /// their payload buffered for the stream owner.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            let mut cursor = std::io::Cursor::new(&self.buf[..]);
            match Frame::decode(&mut cursor) {
                Ok(frame) => {
                    let consumed = cursor.position() as usize;
                    self.buf.advance(consumed);
                    return Ok(Some(frame));
                }
                Err(FrameError::Incomplete(_)) => match self.recv.read_chunk().await? {
                    Some(chunk) => self.buf.extend_from_slice(&chunk),
                    None if self.buf.is_empty() => return Ok(None),
                    None => {
                        return Err(Code::H3_FRAME_ERROR.with_reason(
                            "stream ended with a truncated frame",
                            ErrorLevel::ConnectionError,
                        ));
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Discards everything the peer sends until the stream finishes.
    pub(crate) async fn drain(&mut self) -> Result<(), Error> {
        self.buf.clear();
        while self.recv.read_chunk().await?.is_some() {}
        Ok(())
    }

    /// Tell the peer to stop sending.
    pub fn stop_sending(&mut self, code: Code) {
        self.recv.stop_sending(code.value());
    }

    /// Returns the underlying stream and any bytes already buffered.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.recv, self.buf.freeze())
    }
}

/// A request stream whose HEADERS frame has arrived.
///
/// The field section is still QPACK-encoded; decoding it, along with the rest
/// of the request pipeline, is the application's concern.
pub struct IncomingRequest<R, S> {
    stream_id: StreamId,
    field_section: Bytes,
    frames: FrameReader<R>,
    send: S,
}

impl<R: RecvStream, S: SendStream> IncomingRequest<R, S> {
    /// The id of the request stream
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The encoded field section carried by the HEADERS frame
    pub fn field_section(&self) -> &Bytes {
        &self.field_section
    }

    /// Splits the request into the encoded field section, the body frame
    /// reader and the send half.
    pub fn into_parts(self) -> (Bytes, FrameReader<R>, S) {
        (self.field_section, self.frames, self.send)
    }
}

/// Services a single HTTP/3 request stream.
///
/// Errors returned here are request-processing errors: they are logged and
/// stay scoped to the one stream.
#[async_trait]
pub trait Application<R, S>: Send + Sync + 'static
where
    R: RecvStream,
    S: SendStream,
{
    async fn handle(&self, request: IncomingRequest<R, S>) -> Result<(), Error>;
}

/// Notifies the connection exactly once when a request stream worker ends,
/// on every path including panics.
struct CompletionGuard<T: quic::Connection> {
    core: Arc<Core<T>>,
    id: StreamId,
}

impl<T: quic::Connection> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        self.core.on_stream_completed(self.id);
    }
}

pub(crate) async fn run_inbound_uni_stream<T: quic::Connection>(
    core: Arc<Core<T>>,
    handle: StreamHandle,
    recv: T::RecvStream,
) {
    let mut reader = FrameReader::new(recv);
    let outcome = tokio::select! {
        biased;
        _ = handle.cancelled() => None,
        res = drive_inbound_uni(&core, &handle, &mut reader) => Some(res),
    };
    match outcome {
        None => {
            if let Some(cause) = handle.abort_cause() {
                trace!(
                    connection_id = %core.id(),
                    stream_id = %handle.id(),
                    reason = %cause.reason,
                    "unidirectional stream aborted"
                );
                reader.stop_sending(cause.code);
            }
        }
        Some(Ok(())) => {}
        Some(Err(err)) => core.on_stream_connection_error(err).await,
    }
}

async fn drive_inbound_uni<T: quic::Connection>(
    core: &Core<T>,
    handle: &StreamHandle,
    reader: &mut FrameReader<T::RecvStream>,
) -> Result<(), Error> {
    let Some(stream_type) = reader.read_stream_type().await? else {
        return Ok(());
    };
    match stream_type {
        StreamType::CONTROL => {
            if !core.channels().on_inbound_control_stream(handle.id()).await {
                return Err(Code::H3_STREAM_CREATION_ERROR.with_reason(
                    "duplicate inbound control stream",
                    ErrorLevel::ConnectionError,
                ));
            }
            handle.mark_started();
            drive_control_frames(core, reader).await
        }
        StreamType::ENCODER => {
            if !core.channels().on_inbound_encoder_stream(handle.id()).await {
                return Err(Code::H3_STREAM_CREATION_ERROR.with_reason(
                    "duplicate qpack encoder stream",
                    ErrorLevel::ConnectionError,
                ));
            }
            handle.mark_started();
            // Dynamic table updates belong to the qpack layer; nothing to do
            // with them here.
            reader.drain().await
        }
        StreamType::DECODER => {
            if !core.channels().on_inbound_decoder_stream(handle.id()).await {
                return Err(Code::H3_STREAM_CREATION_ERROR.with_reason(
                    "duplicate qpack decoder stream",
                    ErrorLevel::ConnectionError,
                ));
            }
            handle.mark_started();
            reader.drain().await
        }
        StreamType::PUSH => {
            // Clients cannot push toward a server.
            Err(Code::H3_STREAM_CREATION_ERROR.with_reason(
                "client opened a push stream",
                ErrorLevel::ConnectionError,
            ))
        }
        other => {
            trace!(
                connection_id = %core.id(),
                stream_id = %handle.id(),
                stream_type = %other,
                "refusing unknown unidirectional stream"
            );
            reader.stop_sending(Code::H3_STREAM_CREATION_ERROR);
            Ok(())
        }
    }
}

async fn drive_control_frames<T: quic::Connection>(
    core: &Core<T>,
    reader: &mut FrameReader<T::RecvStream>,
) -> Result<(), Error> {
    let mut settings_seen = false;
    while let Some(frame) = reader.next_frame().await? {
        match frame {
            Frame::Settings(settings) => {
                if settings_seen {
                    return Err(Code::H3_FRAME_UNEXPECTED.with_reason(
                        "SETTINGS received twice on the control stream",
                        ErrorLevel::ConnectionError,
                    ));
                }
                settings_seen = true;
                for (id, value) in settings.iter() {
                    core.channels()
                        .on_inbound_control_stream_setting(id, value)
                        .await?;
                }
            }
            frame if !settings_seen => {
                return Err(Code::H3_MISSING_SETTINGS.with_reason(
                    format!("control stream began with {:?}", frame),
                    ErrorLevel::ConnectionError,
                ));
            }
            Frame::Goaway(id) => core.on_inbound_goaway(id),
            frame @ (Frame::CancelPush(_) | Frame::MaxPushId(_)) => {
                warn!(connection_id = %core.id(), ?frame, "control frame ignored");
            }
            Frame::Unknown(_) => {}
            frame @ (Frame::Data(_) | Frame::Headers(_)) => {
                return Err(Code::H3_FRAME_UNEXPECTED.with_reason(
                    format!("{:?} on the control stream", frame),
                    ErrorLevel::ConnectionError,
                ));
            }
        }
    }
    Err(Code::H3_CLOSED_CRITICAL_STREAM.with_reason(
        "the peer closed the control stream",
        ErrorLevel::ConnectionError,
    ))
}

pub(crate) async fn run_request_stream<T, A>(
    core: Arc<Core<T>>,
    handle: StreamHandle,
    recv: T::RecvStream,
    send: T::SendStream,
    application: Arc<A>,
) where
    T: quic::Connection,
    A: Application<T::RecvStream, T::SendStream>,
{
    let _completion = CompletionGuard {
        core: Arc::clone(&core),
        id: handle.id(),
    };
    let mut reader = FrameReader::new(recv);
    let mut send = send;

    let first = tokio::select! {
        biased;
        _ = handle.cancelled() => None,
        frame = reader.next_frame() => Some(frame),
    };
    let Some(first) = first else {
        // Aborted before the request started. Reset both halves with the
        // recorded cause.
        let code = handle
            .abort_cause()
            .map(|cause| cause.code)
            .unwrap_or(Code::H3_REQUEST_CANCELLED);
        reader.stop_sending(code);
        send.reset(code.value());
        return;
    };

    match first {
        Ok(Some(Frame::Headers(field_section))) => {
            handle.mark_started();
            trace!(
                connection_id = %core.id(),
                stream_id = %handle.id(),
                "request headers received"
            );
            let request = IncomingRequest {
                stream_id: handle.id(),
                field_section,
                frames: reader,
                send,
            };
            let outcome = tokio::select! {
                biased;
                _ = handle.cancelled() => None,
                res = application.handle(request) => Some(res),
            };
            match outcome {
                // Aborted mid-request; the transport-level abort that follows
                // tears the stream down.
                None => {}
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    error!(
                        connection_id = %core.id(),
                        stream_id = %handle.id(),
                        error = %err,
                        "request processing failed"
                    );
                }
            }
        }
        Ok(Some(frame)) => {
            core.on_stream_connection_error(Code::H3_FRAME_UNEXPECTED.with_reason(
                format!("first request frame is {:?}, not headers", frame),
                ErrorLevel::ConnectionError,
            ))
            .await;
        }
        Ok(None) => {
            // The peer finished the stream without a request. This stays
            // stream local.
            trace!(
                connection_id = %core.id(),
                stream_id = %handle.id(),
                "request stream ended before headers"
            );
            reader.stop_sending(Code::H3_REQUEST_INCOMPLETE);
            send.reset(Code::H3_REQUEST_INCOMPLETE.value());
        }
        Err(err) => match err.level() {
            ErrorLevel::ConnectionError => core.on_stream_connection_error(err).await,
            ErrorLevel::StreamError => {
                let code = err.try_get_code().unwrap_or(Code::H3_INTERNAL_ERROR);
                reader.stop_sending(code);
                send.reset(code.value());
            }
        },
    }
}
