//! In-memory transport harness shared by the connection scenarios.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::error::Error;
use crate::proto::coding::{BufExt, BufMutExt};
use crate::proto::frame::{Frame, PayloadLen, SettingId, Settings};
use crate::proto::stream::StreamId;
use crate::quic::{self, IncomingStream, RecvStream, SendStream, TransportError};
use crate::stream::{Application, IncomingRequest};


pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Captures everything written to one send stream.
#[derive(Default)]
pub(crate) struct WriteLog {
    data: Mutex<Vec<u8>>,
    reset: Mutex<Option<u64>>,
}

impl WriteLog {
    pub(crate) fn data(&self) -> Vec<u8> {
        self.data.lock().expect("write log lock").clone()
    }

    pub(crate) fn reset_code(&self) -> Option<u64> {
        *self.reset.lock().expect("write log lock")
    }
}

pub(crate) type SharedLog = Arc<WriteLog>;

pub(crate) struct MemorySendStream {
    log: SharedLog,
}

#[async_trait]
impl SendStream for MemorySendStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.log
            .data
            .lock()
            .expect("write log lock")
            .extend_from_slice(data);
        Ok(())
    }

    fn reset(&mut self, code: u64) {
        let mut reset = self.log.reset.lock().expect("write log lock");
        if reset.is_none() {
            *reset = Some(code);
        }
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub(crate) struct MemoryRecvStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    stopped: Arc<Mutex<Option<u64>>>,
}

impl MemoryRecvStream {
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryRecvStream {
                rx,
                stopped: Arc::default(),
            },
            tx,
        )
    }
}

#[async_trait]
impl RecvStream for MemoryRecvStream {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }

    fn stop_sending(&mut self, code: u64) {
        let mut stopped = self.stopped.lock().expect("stop lock");
        if stopped.is_none() {
            *stopped = Some(code);
        }
    }
}

type Incoming = IncomingStream<MemoryRecvStream, MemorySendStream>;

pub(crate) struct MemoryTransport {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    uni_logs: Arc<Mutex<Vec<SharedLog>>>,
    aborted: Arc<Mutex<Option<(u64, String)>>>,
    abort_notify: Arc<Notify>,
}

#[async_trait]
impl quic::Connection for MemoryTransport {
    type RecvStream = MemoryRecvStream;
    type SendStream = MemorySendStream;

    async fn accept(&self) -> Result<Option<Incoming>, TransportError> {
        if self.aborted.lock().expect("abort lock").is_some() {
            return Err(TransportError::LocallyClosed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.abort_notify.notified() => Err(TransportError::LocallyClosed),
            stream = incoming.recv() => Ok(stream),
        }
    }

    async fn open_uni(&self) -> Result<MemorySendStream, TransportError> {
        let log = SharedLog::default();
        self.uni_logs
            .lock()
            .expect("uni log lock")
            .push(Arc::clone(&log));
        Ok(MemorySendStream { log })
    }

    fn abort(&self, code: u64, reason: &str) {
        let mut slot = self.aborted.lock().expect("abort lock");
        if slot.is_none() {
            *slot = Some((code, reason.to_owned()));
        }
        self.abort_notify.notify_one();
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443)
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }
}

/// Scripts the client side of a connection and exposes probes on what the
/// server sent back.
pub(crate) struct TestPeer {
    incoming: Mutex<Option<mpsc::UnboundedSender<Incoming>>>,
    uni_logs: Arc<Mutex<Vec<SharedLog>>>,
    aborted: Arc<Mutex<Option<(u64, String)>>>,
}

pub(crate) fn memory_transport() -> (MemoryTransport, TestPeer) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let uni_logs = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(Mutex::new(None));
    let transport = MemoryTransport {
        incoming: tokio::sync::Mutex::new(incoming_rx),
        uni_logs: Arc::clone(&uni_logs),
        aborted: Arc::clone(&aborted),
        abort_notify: Arc::new(Notify::new()),
    };
    let peer = TestPeer {
        incoming: Mutex::new(Some(incoming_tx)),
        uni_logs,
        aborted,
    };
    (transport, peer)
}

impl TestPeer {
    pub(crate) fn open_request_stream(&self, id: u64) -> RemoteStream {
        self.open_stream(id, true)
    }

    pub(crate) fn open_uni_stream(&self, id: u64) -> RemoteStream {
        self.open_stream(id, false)
    }

    fn open_stream(&self, id: u64, bidirectional: bool) -> RemoteStream {
        let (recv, data) = MemoryRecvStream::new();
        let stopped = Arc::clone(&recv.stopped);
        let response = SharedLog::default();
        let send = bidirectional.then(|| MemorySendStream {
            log: Arc::clone(&response),
        });
        let stream = IncomingStream {
            id: StreamId::try_from(id).expect("valid stream id"),
            recv,
            send,
        };
        self.incoming
            .lock()
            .expect("incoming lock")
            .as_ref()
            .expect("transport accepting")
            .send(stream)
            .expect("dispatcher running");
        RemoteStream {
            data: Some(data),
            stopped,
            response,
        }
    }

    /// No further streams will arrive; the dispatcher sees end of accepts.
    pub(crate) fn finish_accepts(&self) {
        *self.incoming.lock().expect("incoming lock") = None;
    }

    /// Everything written on the server's outbound control stream so far
    pub(crate) fn control_bytes(&self) -> Vec<u8> {
        self.uni_logs
            .lock()
            .expect("uni log lock")
            .first()
            .map(|log| log.data())
            .unwrap_or_default()
    }

    pub(crate) fn abort_code(&self) -> Option<u64> {
        self.aborted
            .lock()
            .expect("abort lock")
            .as_ref()
            .map(|(code, _)| *code)
    }
}

pub(crate) struct RemoteStream {
    data: Option<mpsc::UnboundedSender<Bytes>>,
    stopped: Arc<Mutex<Option<u64>>>,
    response: SharedLog,
}

impl RemoteStream {
    pub(crate) fn send(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.data {
            let _ = tx.send(Bytes::from(bytes));
        }
    }

    /// Finish the sending side of the stream.
    pub(crate) fn finish(&mut self) {
        self.data = None;
    }

    pub(crate) fn stop_code(&self) -> Option<u64> {
        *self.stopped.lock().expect("stop lock")
    }

    pub(crate) fn reset_code(&self) -> Option<u64> {
        self.response.reset_code()
    }
}

// ===== wire helpers =====

pub(crate) fn stream_type(value: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(value);
    buf
}

pub(crate) fn headers_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    Frame::Headers(Bytes::copy_from_slice(payload)).encode(&mut buf);
    buf
}

pub(crate) fn settings_frame(entries: &[(u64, u64)]) -> Vec<u8> {
    let mut settings = Settings::default();
    for (id, value) in entries {
        settings
            .insert(SettingId(*id), *value)
            .expect("distinct setting ids");
    }
    let mut buf = Vec::new();
    settings.encode(&mut buf);
    buf
}

pub(crate) fn goaway_frame(id: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    Frame::Goaway(StreamId::try_from(id).expect("valid stream id")).encode(&mut buf);
    buf
}

pub(crate) fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    Frame::Data(PayloadLen(payload.len())).encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// The GOAWAY ids on a control stream, in emission order.
pub(crate) fn decoded_goaways(control: &[u8]) -> Vec<u64> {
    let mut cursor = std::io::Cursor::new(control);
    let _stream_type = cursor.get_var().expect("control stream type");
    let mut out = Vec::new();
    loop {
        match Frame::decode(&mut cursor) {
            Ok(Frame::Goaway(id)) => out.push(id.value()),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    out
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition was not reached in time");
}

// ===== applications =====

/// Completes every request as soon as its headers arrive.
pub(crate) struct InstantApp;

#[async_trait]
impl<R: RecvStream, S: SendStream> Application<R, S> for InstantApp {
    async fn handle(&self, _request: IncomingRequest<R, S>) -> Result<(), Error> {
        Ok(())
    }
}

/// Holds every request open until the test releases it.
pub(crate) struct GateApp {
    pub(crate) started: Arc<AtomicUsize>,
    pub(crate) release: Arc<Notify>,
}

impl GateApp {
    pub(crate) fn new() -> Self {
        GateApp {
            started: Arc::new(AtomicUsize::new(0)),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl<R: RecvStream, S: SendStream> Application<R, S> for GateApp {
    async fn handle(&self, _request: IncomingRequest<R, S>) -> Result<(), Error> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(())
    }
}

/// Counts invocations and completes immediately.
pub(crate) struct CountingApp {
    pub(crate) calls: Arc<AtomicUsize>,
}

#[async_trait]
impl<R: RecvStream, S: SendStream> Application<R, S> for CountingApp {
    async fn handle(&self, _request: IncomingRequest<R, S>) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What one request looked like from the application's side.
pub(crate) struct CapturedRequest {
    pub(crate) stream_id: u64,
    pub(crate) field_section: Vec<u8>,
    pub(crate) section_via_parts: Vec<u8>,
    pub(crate) body: Vec<u8>,
}

/// Records every request it is handed: the encoded field section, and the
/// payload of the first DATA frame read through the split-off frame reader.
pub(crate) struct CaptureApp {
    pub(crate) seen: Arc<Mutex<Vec<CapturedRequest>>>,
}

#[async_trait]
impl<R: RecvStream, S: SendStream> Application<R, S> for CaptureApp {
    async fn handle(&self, request: IncomingRequest<R, S>) -> Result<(), Error> {
        let stream_id = request.stream_id().value();
        let field_section = request.field_section().to_vec();
        let (section, mut frames, _send) = request.into_parts();

        let mut body = Vec::new();
        if let Some(Frame::Data(PayloadLen(len))) = frames.next_frame().await? {
            let (mut recv, buffered) = frames.into_parts();
            body.extend_from_slice(&buffered);
            while body.len() < len {
                match recv.read_chunk().await? {
                    Some(chunk) => body.extend_from_slice(&chunk),
                    None => break,
                }
            }
            body.truncate(len);
        }

        self.seen.lock().expect("capture lock").push(CapturedRequest {
            stream_id,
            field_section,
            section_via_parts: section.to_vec(),
            body,
        });
        Ok(())
    }
}
