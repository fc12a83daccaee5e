//! HTTP/3 error types

use std::{fmt, sync::Arc};

use crate::proto::frame::FrameError;
use crate::quic::TransportError;

/// Cause of an error thrown by our own layer
type Cause = Box<dyn std::error::Error + Send + Sync>;

/// A general error that can occur when dispatching an HTTP/3 connection.
#[derive(Clone)]
pub struct Error {
    pub(crate) inner: Box<ErrorImpl>,
}

/// An HTTP/3 "application error code".
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
pub struct Code {
    code: u64,
}

impl Code {
    /// Numerical error code
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9114.html#errors>
    /// and <https://www.rfc-editor.org/rfc/rfc9000.html#error-codes>
    pub fn value(&self) -> u64 {
        self.code
    }

    pub(crate) fn from_value(code: u64) -> Self {
        Code { code }
    }
}

impl PartialEq<u64> for Code {
    fn eq(&self, other: &u64) -> bool {
        *other == self.code
    }
}

#[derive(Clone)]
pub(crate) struct ErrorImpl {
    pub(crate) kind: Kind,
    cause: Option<Arc<Cause>>,
}

/// Some errors affect the whole connection, others only one request stream.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ErrorLevel {
    /// Error that will close the whole connection
    ConnectionError,
    /// Error scoped to a single stream
    StreamError,
}

#[derive(Clone, Debug)]
pub(crate) enum Kind {
    /// Protocol violation carrying a specific HTTP/3 error code.
    Application {
        code: Code,
        reason: Option<Box<str>>,
        level: ErrorLevel,
    },
    /// The peer reset the connection at the transport layer.
    TransportReset,
    /// An I/O failure on the transport.
    Io(Arc<std::io::Error>),
    /// The connection was aborted cooperatively.
    Aborted { code: Code },
    /// The transport faulted while requests may have been in flight; the
    /// original failure is preserved as the source.
    Faulted(Arc<Error>),
    /// The peer closed the connection without error.
    Closed,
    /// A stream failed to deliver its initial frame in time.
    StartupTimeout,
}

// ===== impl Code =====

macro_rules! codes {
    (
        $(
            $(#[$docs:meta])*
            ($num:expr, $name:ident);
        )+
    ) => {
        impl Code {
        $(
            $(#[$docs])*
            pub const $name: Code = Code { code: $num };
        )+
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.code {
                $(
                    $num => f.write_str(stringify!($name)),
                )+
                    other => write!(f, "{:#x}", other),
                }
            }
        }
    }
}

codes! {
    /// No error. This is used when the connection or stream needs to be
    /// closed, but there is no error to signal.
    (0x100, H3_NO_ERROR);

    /// Peer violated protocol requirements in a way that does not match a more
    /// specific error code, or endpoint declines to use the more specific
    /// error code.
    (0x101, H3_GENERAL_PROTOCOL_ERROR);

    /// An internal error has occurred in the HTTP stack.
    (0x102, H3_INTERNAL_ERROR);

    /// The endpoint detected that its peer created a stream that it will not
    /// accept.
    (0x103, H3_STREAM_CREATION_ERROR);

    /// A stream required by the HTTP/3 connection was closed or reset.
    (0x104, H3_CLOSED_CRITICAL_STREAM);

    /// A frame was received that was not permitted in the current state or on
    /// the current stream.
    (0x105, H3_FRAME_UNEXPECTED);

    /// A frame that fails to satisfy layout requirements or with an invalid
    /// size was received.
    (0x106, H3_FRAME_ERROR);

    /// The endpoint detected that its peer is exhibiting a behavior that might
    /// be generating excessive load.
    (0x107, H3_EXCESSIVE_LOAD);

    /// A Stream ID or Push ID was used incorrectly, such as exceeding a limit,
    /// reducing a limit, or being reused.
    (0x108, H3_ID_ERROR);

    /// An endpoint detected an error in the payload of a SETTINGS frame.
    (0x109, H3_SETTINGS_ERROR);

    /// No SETTINGS frame was received at the beginning of the control stream.
    (0x10a, H3_MISSING_SETTINGS);

    /// A server rejected a request without performing any application
    /// processing.
    (0x10b, H3_REQUEST_REJECTED);

    /// The request or its response (including pushed response) is cancelled.
    (0x10c, H3_REQUEST_CANCELLED);

    /// The client's stream terminated without containing a fully-formed
    /// request.
    (0x10d, H3_REQUEST_INCOMPLETE);

    /// An HTTP message was malformed and cannot be processed.
    (0x10e, H3_MESSAGE_ERROR);

    /// The TCP connection established in response to a CONNECT request was
    /// reset or abnormally closed.
    (0x10f, H3_CONNECT_ERROR);

    /// The requested operation cannot be served over HTTP/3. The peer should
    /// retry over HTTP/1.1.
    (0x110, H3_VERSION_FALLBACK);
}

impl Code {
    pub(crate) fn with_reason<S: Into<Box<str>>>(self, reason: S, level: ErrorLevel) -> Error {
        Error::new(Kind::Application {
            code: self,
            reason: Some(reason.into()),
            level,
        })
    }
}

impl From<Code> for u64 {
    fn from(code: Code) -> u64 {
        code.code
    }
}

// ===== impl Error =====

impl Error {
    pub(crate) fn new(kind: Kind) -> Self {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    /// Returns the error code from the error if available
    pub fn try_get_code(&self) -> Option<Code> {
        match self.inner.kind {
            Kind::Application { code, .. } => Some(code),
            Kind::Aborted { code } => Some(code),
            _ => None,
        }
    }

    /// Whether the error tears down the whole connection or only one stream
    pub fn level(&self) -> ErrorLevel {
        match self.inner.kind {
            Kind::Application { level, .. } => level,
            _ => ErrorLevel::ConnectionError,
        }
    }

    pub(crate) fn aborted(code: Code) -> Self {
        Error::new(Kind::Aborted { code })
    }

    pub(crate) fn faulted(cause: Error) -> Self {
        Error::new(Kind::Faulted(Arc::new(cause)))
    }

    pub(crate) fn startup_timeout() -> Self {
        Error::new(Kind::StartupTimeout)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    pub(crate) fn is_aborted(&self) -> bool {
        matches!(self.inner.kind, Kind::Aborted { .. })
    }

    pub(crate) fn is_transport(&self) -> bool {
        matches!(self.inner.kind, Kind::TransportReset | Kind::Io(_))
    }

    pub(crate) fn with_cause<E: Into<Cause>>(mut self, cause: E) -> Self {
        self.inner.cause = Some(Arc::new(cause.into()));
        self
    }

    #[cfg(test)]
    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind.clone()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("quayside::Error");

        match self.inner.kind {
            Kind::Closed => {
                builder.field("connection closed", &true);
            }
            Kind::TransportReset => {
                builder.field("connection reset", &true);
            }
            Kind::StartupTimeout => {
                builder.field("startup timeout", &true);
            }
            Kind::Aborted { code } => {
                builder.field("aborted", &true);
                builder.field("code", &code);
            }
            Kind::Faulted(ref source) => {
                builder.field("faulted", source);
            }
            Kind::Application {
                code, ref reason, ..
            } => {
                builder.field("code", &code);
                if let Some(reason) = reason {
                    builder.field("reason", reason);
                }
            }
            Kind::Io(ref e) => {
                builder.field("io", e);
            }
        }

        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Closed => write!(f, "connection is closed")?,
            Kind::TransportReset => write!(f, "connection reset by peer")?,
            Kind::StartupTimeout => write!(f, "stream timed out before its first frame")?,
            Kind::Aborted { code } => write!(f, "connection aborted: {:?}", code)?,
            Kind::Faulted(ref source) => write!(f, "connection faulted: {}", source)?,
            Kind::Io(ref e) => write!(f, "transport i/o error: {}", e)?,
            Kind::Application {
                code, ref reason, ..
            } => {
                if let Some(reason) = reason {
                    write!(f, "application error: {}", reason)?
                } else {
                    write!(f, "application error {:?}", code)?
                }
            }
        };
        if let Some(ref cause) = self.inner.cause {
            write!(f, " cause: {}", cause)?
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.inner.kind {
            Kind::Faulted(ref source) => Some(&**source),
            _ => self.inner.cause.as_ref().map(|e| &***e as _),
        }
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Error {
        Error::new(Kind::Application {
            code,
            reason: None,
            level: ErrorLevel::ConnectionError,
        })
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Reset => Error::new(Kind::TransportReset),
            TransportError::Io(err) => Error::new(Kind::Io(Arc::new(err))),
            TransportError::ApplicationClosed { code } if Code::H3_NO_ERROR == code => {
                Error::new(Kind::Closed)
            }
            TransportError::ApplicationClosed { code } => Error::new(Kind::Application {
                code: Code::from_value(code),
                reason: None,
                level: ErrorLevel::ConnectionError,
            }),
            TransportError::LocallyClosed => Error::aborted(Code::H3_NO_ERROR),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        let code = match e {
            FrameError::Settings(_) => Code::H3_SETTINGS_ERROR,
            FrameError::UnsupportedFrame(_) => Code::H3_FRAME_UNEXPECTED,
            FrameError::InvalidStreamId(_) => Code::H3_ID_ERROR,
            FrameError::Incomplete(_) | FrameError::Malformed => Code::H3_FRAME_ERROR,
        };
        Error::from(code).with_cause(e)
    }
}
