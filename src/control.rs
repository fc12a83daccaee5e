//! Uniqueness of the peer-originated unidirectional stream roles and
//! ownership of the outbound control stream.

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{Code, Error, ErrorLevel};
use crate::proto::frame::{Frame, SettingId};
use crate::proto::stream::StreamId;
use crate::quic::SendStream;

/// Peer-announced settings, consumed by the QPACK collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerSettings {
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY
    pub qpack_max_table_capacity: Option<u64>,
    /// SETTINGS_MAX_FIELD_SECTION_SIZE
    pub max_field_section_size: Option<u64>,
    /// SETTINGS_QPACK_BLOCKED_STREAMS
    pub qpack_blocked_streams: Option<u64>,
}

struct Slots<S> {
    outbound: Option<S>,
    inbound_control: Option<StreamId>,
    inbound_encoder: Option<StreamId>,
    inbound_decoder: Option<StreamId>,
    peer_settings: PeerSettings,
}

/// One mutex covers all four stream slots together with GOAWAY dispatch. It
/// may be held across the GOAWAY send because the outbound control stream is
/// owned solely by this connection.
pub(crate) struct ControlChannels<S> {
    slots: Mutex<Slots<S>>,
}

impl<S: SendStream> ControlChannels<S> {
    pub(crate) fn new() -> Self {
        ControlChannels {
            slots: Mutex::new(Slots {
                outbound: None,
                inbound_control: None,
                inbound_encoder: None,
                inbound_decoder: None,
                peer_settings: PeerSettings::default(),
            }),
        }
    }

    pub(crate) async fn set_outbound(&self, stream: S) {
        let mut slots = self.slots.lock().await;
        debug_assert!(slots.outbound.is_none(), "outbound control stream opened twice");
        slots.outbound = Some(stream);
    }

    /// Claims the inbound control slot. Returns true only for the first
    /// caller; later attempts leave the slot untouched.
    pub(crate) async fn on_inbound_control_stream(&self, id: StreamId) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.inbound_control.is_some() {
            return false;
        }
        slots.inbound_control = Some(id);
        true
    }

    pub(crate) async fn on_inbound_encoder_stream(&self, id: StreamId) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.inbound_encoder.is_some() {
            return false;
        }
        slots.inbound_encoder = Some(id);
        true
    }

    pub(crate) async fn on_inbound_decoder_stream(&self, id: StreamId) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.inbound_decoder.is_some() {
            return false;
        }
        slots.inbound_decoder = Some(id);
        true
    }

    /// Records a setting received on the inbound control stream. Identifiers
    /// outside the recognized set are a connection error.
    pub(crate) async fn on_inbound_control_stream_setting(
        &self,
        id: SettingId,
        value: u64,
    ) -> Result<(), Error> {
        let mut slots = self.slots.lock().await;
        match id {
            SettingId::QPACK_MAX_TABLE_CAPACITY => {
                slots.peer_settings.qpack_max_table_capacity = Some(value);
            }
            SettingId::MAX_FIELD_SECTION_SIZE => {
                slots.peer_settings.max_field_section_size = Some(value);
            }
            SettingId::QPACK_BLOCKED_STREAMS => {
                slots.peer_settings.qpack_blocked_streams = Some(value);
            }
            other => {
                return Err(Code::H3_SETTINGS_ERROR.with_reason(
                    format!("unexpected setting 0x{:x}", other.0),
                    ErrorLevel::ConnectionError,
                ));
            }
        }
        trace!(setting = ?id, value, "peer setting received");
        Ok(())
    }

    pub(crate) async fn peer_settings(&self) -> PeerSettings {
        self.slots.lock().await.peer_settings
    }

    /// Writes a GOAWAY frame on the outbound control stream. A no-op before
    /// the control stream exists; the peer cannot expect one then.
    pub(crate) async fn send_goaway(&self, id: StreamId) -> Result<(), Error> {
        let mut slots = self.slots.lock().await;
        let Some(stream) = slots.outbound.as_mut() else {
            return Ok(());
        };
        let mut buf = Vec::with_capacity(Frame::MAX_HEADER_SIZE);
        Frame::Goaway(id).encode(&mut buf);
        stream.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MemorySendStream;

    fn channels() -> ControlChannels<MemorySendStream> {
        ControlChannels::new()
    }

    #[tokio::test]
    async fn inbound_slots_are_claimed_once() {
        let channels = channels();
        assert!(channels.on_inbound_control_stream(StreamId(2)).await);
        assert!(!channels.on_inbound_control_stream(StreamId(6)).await);

        assert!(channels.on_inbound_encoder_stream(StreamId(10)).await);
        assert!(!channels.on_inbound_encoder_stream(StreamId(14)).await);

        assert!(channels.on_inbound_decoder_stream(StreamId(18)).await);
        assert!(!channels.on_inbound_decoder_stream(StreamId(22)).await);
    }

    #[tokio::test]
    async fn recognized_settings_are_recorded() {
        let channels = channels();
        channels
            .on_inbound_control_stream_setting(SettingId::QPACK_MAX_TABLE_CAPACITY, 123)
            .await
            .expect("recognized");
        channels
            .on_inbound_control_stream_setting(SettingId::MAX_FIELD_SECTION_SIZE, 16384)
            .await
            .expect("recognized");
        channels
            .on_inbound_control_stream_setting(SettingId::QPACK_BLOCKED_STREAMS, 8)
            .await
            .expect("recognized");

        let settings = channels.peer_settings().await;
        assert_eq!(settings.qpack_max_table_capacity, Some(123));
        assert_eq!(settings.max_field_section_size, Some(16384));
        assert_eq!(settings.qpack_blocked_streams, Some(8));
    }

    #[tokio::test]
    async fn unknown_setting_is_a_connection_error() {
        let channels = channels();
        let err = channels
            .on_inbound_control_stream_setting(SettingId(0xff), 1)
            .await
            .expect_err("unknown setting");
        assert_eq!(err.try_get_code(), Some(Code::H3_SETTINGS_ERROR));
        assert_eq!(err.level(), ErrorLevel::ConnectionError);
    }

    #[tokio::test]
    async fn goaway_without_outbound_stream_is_a_noop() {
        let channels = channels();
        channels.send_goaway(StreamId(0)).await.expect("noop");
    }
}
