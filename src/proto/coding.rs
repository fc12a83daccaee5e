use bytes::{Buf, BufMut};

pub use super::varint::{BufExt, BufMutExt, UnexpectedEnd};

pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B);
}

pub trait Decode: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd>;
}
