use bytes::{Buf, BufMut, Bytes};
use std::fmt;

use super::{
    coding::{BufExt, BufMutExt, Encode},
    stream::{InvalidStreamId, StreamId},
    varint::{UnexpectedEnd, VarInt},
};

#[derive(Debug, PartialEq)]
pub enum FrameError {
    Malformed,
    UnsupportedFrame(u64), // Known frames that are never valid toward a server
    Incomplete(usize),
    Settings(SettingsError),
    InvalidStreamId(InvalidStreamId),
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed => write!(f, "frame is malformed"),
            FrameError::UnsupportedFrame(c) => write!(f, "frame 0x{:x} is not allowed in h3", c),
            FrameError::Incomplete(x) => write!(f, "internal error: frame incomplete {}", x),
            FrameError::Settings(x) => write!(f, "invalid settings: {}", x),
            FrameError::InvalidStreamId(x) => write!(f, "invalid stream id: {}", x),
        }
    }
}

/// Represents the available data len for a `Data` frame on a receive stream
///
/// Decoding does not consume `Data` payloads. Receiving them is left to the
/// request stream owner.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PayloadLen(pub usize);

impl From<usize> for PayloadLen {
    fn from(len: usize) -> Self {
        PayloadLen(len)
    }
}

pub enum Frame {
    Data(PayloadLen),
    Headers(Bytes),
    CancelPush(VarInt),
    Settings(Settings),
    Goaway(StreamId),
    MaxPushId(VarInt),
    /// A frame type this endpoint does not recognize; its payload has been
    /// skipped already.
    Unknown(FrameType),
}

impl Frame {
    pub const MAX_HEADER_SIZE: usize = VarInt::MAX_SIZE * 2;

    pub fn decode<T: Buf>(buf: &mut T) -> Result<Self, FrameError> {
        let remaining = buf.remaining();
        let ty = FrameType::decode(buf).map_err(|_| FrameError::Incomplete(remaining + 1))?;
        let len = buf
            .get_var()
            .map_err(|_| FrameError::Incomplete(remaining + 1))?;

        if ty == FrameType::DATA {
            return Ok(Frame::Data((len as usize).into()));
        }

        if (buf.remaining() as u64) < len {
            return Err(FrameError::Incomplete(2 + len as usize));
        }

        let mut payload = buf.take(len as usize);
        let frame = match ty {
            FrameType::HEADERS => Frame::Headers(payload.copy_to_bytes(len as usize)),
            FrameType::SETTINGS => Frame::Settings(Settings::decode(&mut payload)?),
            FrameType::CANCEL_PUSH => Frame::CancelPush(VarInt::decode(&mut payload)?),
            FrameType::GOAWAY => Frame::Goaway(payload.get_var()?.try_into()?),
            FrameType::MAX_PUSH_ID => Frame::MaxPushId(VarInt::decode(&mut payload)?),
            FrameType::PUSH_PROMISE
            | FrameType::H2_PRIORITY
            | FrameType::H2_PING
            | FrameType::H2_WINDOW_UPDATE
            | FrameType::H2_CONTINUATION => return Err(FrameError::UnsupportedFrame(ty.0)),
            _ => {
                payload.advance(len as usize);
                Frame::Unknown(ty)
            }
        };
        // Redundant length encodings must be self-consistent.
        if payload.has_remaining() {
            return Err(FrameError::Malformed);
        }
        Ok(frame)
    }

    pub fn encode<T: BufMut>(&self, buf: &mut T) {
        match self {
            Frame::Data(len) => {
                FrameType::DATA.encode(buf);
                buf.write_var(len.0 as u64);
            }
            Frame::Headers(block) => {
                FrameType::HEADERS.encode(buf);
                buf.write_var(block.len() as u64);
                buf.put_slice(block);
            }
            Frame::Settings(settings) => settings.encode(buf),
            Frame::CancelPush(id) => {
                FrameType::CANCEL_PUSH.encode(buf);
                buf.write_var(id.size() as u64);
                id.encode(buf);
            }
            Frame::Goaway(id) => {
                FrameType::GOAWAY.encode(buf);
                buf.write_var(VarInt(id.0).size() as u64);
                id.encode(buf);
            }
            Frame::MaxPushId(id) => {
                FrameType::MAX_PUSH_ID.encode(buf);
                buf.write_var(id.size() as u64);
                id.encode(buf);
            }
            Frame::Unknown(ty) => {
                ty.encode(buf);
                buf.write_var(0);
            }
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data(len) => write!(f, "Data: {} bytes", len.0),
            Frame::Headers(block) => write!(f, "Headers({} bytes)", block.len()),
            Frame::Settings(_) => write!(f, "Settings"),
            Frame::CancelPush(id) => write!(f, "CancelPush({})", id),
            Frame::Goaway(id) => write!(f, "GoAway({})", id.value()),
            Frame::MaxPushId(id) => write!(f, "MaxPushId({})", id),
            Frame::Unknown(ty) => write!(f, "Unknown({:?})", ty),
        }
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType($val);)*
        }
    }
}

frame_types! {
    DATA = 0x0,
    HEADERS = 0x1,
    H2_PRIORITY = 0x2,
    CANCEL_PUSH = 0x3,
    SETTINGS = 0x4,
    PUSH_PROMISE = 0x5,
    H2_PING = 0x6,
    GOAWAY = 0x7,
    H2_WINDOW_UPDATE = 0x8,
    H2_CONTINUATION = 0x9,
    MAX_PUSH_ID = 0xD,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameType(u64);

impl FrameType {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(FrameType(buf.get_var()?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

pub(crate) trait FrameHeader {
    fn len(&self) -> usize;
    const TYPE: FrameType;
    fn encode_header<T: BufMut>(&self, buf: &mut T) {
        Self::TYPE.encode(buf);
        buf.write_var(self.len() as u64);
    }
}

/// A SETTINGS parameter identifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct SettingId(pub u64);

macro_rules! setting_identifiers {
    {$($name:ident = $val:expr,)*} => {
        impl SettingId {
            $(pub const $name: SettingId = SettingId($val);)*
        }
    }
}

setting_identifiers! {
    QPACK_MAX_TABLE_CAPACITY = 0x1,
    MAX_FIELD_SECTION_SIZE = 0x6,
    QPACK_BLOCKED_STREAMS = 0x7,
}

impl SettingId {
    /// Identifiers reserved from the HTTP/2 settings space; they must not
    /// appear in an HTTP/3 SETTINGS frame.
    fn is_forbidden(self) -> bool {
        matches!(
            self,
            SettingId(0x00) | SettingId(0x02) | SettingId(0x03) | SettingId(0x04) | SettingId(0x05)
        )
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(SettingId(buf.get_var()?))
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

/// The contents of a SETTINGS frame, in insertion order.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Settings {
    entries: Vec<(SettingId, u64)>,
}

impl FrameHeader for Settings {
    const TYPE: FrameType = FrameType::SETTINGS;
    fn len(&self) -> usize {
        self.entries.iter().fold(0, |len, (id, val)| {
            len + VarInt(id.0).size() + VarInt(*val).size()
        })
    }
}

impl Settings {
    /// The same identifier must not occur more than once per frame.
    pub fn insert(&mut self, id: SettingId, value: u64) -> Result<(), SettingsError> {
        if self.entries.iter().any(|(i, _)| *i == id) {
            return Err(SettingsError::Repeated(id));
        }
        self.entries.push((id, value));
        Ok(())
    }

    pub fn get(&self, id: SettingId) -> Option<u64> {
        self.entries
            .iter()
            .find(|(entry_id, _)| id == *entry_id)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SettingId, u64)> + '_ {
        self.entries.iter().copied()
    }

    pub(crate) fn encode<T: BufMut>(&self, buf: &mut T) {
        self.encode_header(buf);
        for (id, val) in &self.entries {
            id.encode(buf);
            buf.write_var(*val);
        }
    }

    pub(crate) fn decode<T: Buf>(buf: &mut T) -> Result<Settings, SettingsError> {
        let mut settings = Settings::default();
        while buf.has_remaining() {
            if buf.remaining() < 2 {
                // remains less than 2 * minimum-size varint
                return Err(SettingsError::Malformed);
            }

            let identifier = SettingId::decode(buf).map_err(|_| SettingsError::Malformed)?;
            let value = buf.get_var().map_err(|_| SettingsError::Malformed)?;

            if identifier.is_forbidden() {
                return Err(SettingsError::InvalidSettingId(identifier.0));
            }

            settings.insert(identifier, value)?;
        }
        Ok(settings)
    }
}

#[derive(Debug, PartialEq)]
pub enum SettingsError {
    Malformed,
    Repeated(SettingId),
    InvalidSettingId(u64),
}

impl std::error::Error for SettingsError {}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Malformed => write!(f, "malformed settings frame"),
            SettingsError::Repeated(id) => write!(f, "got setting 0x{:x} twice", id.0),
            SettingsError::InvalidSettingId(id) => write!(f, "setting id 0x{:x} is invalid", id),
        }
    }
}

impl From<SettingsError> for FrameError {
    fn from(e: SettingsError) -> Self {
        FrameError::Settings(e)
    }
}

impl From<UnexpectedEnd> for FrameError {
    fn from(e: UnexpectedEnd) -> Self {
        FrameError::Incomplete(e.0)
    }
}

impl From<InvalidStreamId> for FrameError {
    fn from(e: InvalidStreamId) -> Self {
        FrameError::InvalidStreamId(e)
    }
}
