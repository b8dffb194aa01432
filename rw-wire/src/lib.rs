//! rw-wire: the insert-stream contract between a trajectory writer and the
//! replay server.
//!
//! Client → server messages are a discriminated union of chunks and items;
//! server → client messages are item confirmations. Payloads are encoded with
//! a hand-rolled little-endian codec and carried in u32-length-delimited
//! frames.

pub mod codec;
pub mod frame;
pub mod protocol;

pub use codec::{
    decode_request, decode_response, encode_request, encode_request_into, encode_response,
    DecodeError,
};
pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use protocol::{
    CellId, ChunkData, FlatColumn, InsertRequest, InsertResponse, ItemData, PrioritizedItem,
    SequenceRange, PROTOCOL_VERSION,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");


#[cfg(test)]
mod codec_tests;
