//! Wire-level types shared by the connection dispatcher.

pub mod coding;
pub mod frame;
pub mod stream;
pub mod varint;
