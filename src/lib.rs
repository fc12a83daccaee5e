//! HTTP/3 connection dispatch over a multiplexed QUIC transport.
//!
//! A [`Connection`] owns one established QUIC connection for its lifetime.
//! It accepts and classifies inbound streams as request or control streams,
//! opens the outbound control stream and performs the settings exchange,
//! enforces startup deadlines on streams that never deliver their first
//! frame, tracks in-flight requests, and sequences graceful and abortive
//! shutdown, including GOAWAY emission, against those requests.
//!
//! The QUIC implementation is pluggable through the traits in [`quic`];
//! request processing is pluggable through [`Application`].
//!
//! # Example
//!
//! ```no_run
//! # async fn doc<T>(transport: T) -> Result<(), quayside::Error>
//! # where
//! # T: quayside::quic::Connection,
//! # {
//! # struct App;
//! # #[async_trait::async_trait]
//! # impl<R, S> quayside::Application<R, S> for App
//! # where
//! # R: quayside::quic::RecvStream,
//! # S: quayside::quic::SendStream,
//! # {
//! #     async fn handle(
//! #         &self,
//! #         _request: quayside::IncomingRequest<R, S>,
//! #     ) -> Result<(), quayside::Error> {
//! #         Ok(())
//! #     }
//! # }
//! let connection = quayside::builder()
//!     .max_request_header_field_size(16384)
//!     .build(transport);
//! let handle = connection.handle();
//! // wire `handle` to your shutdown signals, then drive the connection
//! connection.run(App).await
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod quic;

pub use config::{builder, Builder, Config};
pub use connection::{Connection, ConnectionHandle};
pub use control::PeerSettings;
pub use error::{Code, Error, ErrorLevel};
pub use proto::frame::{Frame, FrameType, PayloadLen, SettingId, Settings, SettingsError};
pub use proto::stream::{InvalidStreamId, StreamId, StreamType};
pub use proto::varint::VarInt;
pub use shared::CloseInitiator;
pub use stream::{Application, FrameReader, IncomingRequest};

mod connection;
mod control;
mod proto;
mod registry;
mod shared;
mod starting;
mod stream;

#[cfg(test)]
mod tests;
