//! Message definitions for the bidirectional insert stream.

use rw_tensor::Tensor;

/// Bump when the on-wire layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Range of episode steps covered by a chunk.
///
/// `sparse` is set when the observed steps are not a contiguous integer range,
/// in which case per-cell offsets cannot be derived from `start` alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRange {
    pub episode_id: u64,
    pub start: u64,
    pub end: u64,
    pub sparse: bool,
}

/// A finalized batch of consecutive values from one column.
///
/// `data` always carries the batch axis as its leading dimension, also for
/// single-step chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub chunk_key: u64,
    pub column: u32,
    pub sequence_range: SequenceRange,
    pub data: Tensor,
}

/// Server-side address of one cell: a chunk and a row within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellId {
    pub chunk_key: u64,
    pub offset: u32,
}

/// One column of an item's trajectory, flattened to cell addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatColumn {
    pub cells: Vec<CellId>,
    pub squeeze: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrioritizedItem {
    pub key: u64,
    pub table: String,
    pub priority: f64,
    pub trajectory: Vec<FlatColumn>,
    /// Chunk keys the server must keep; everything else it holds for this
    /// writer may be collected.
    pub keep_chunk_keys: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemData {
    pub item: PrioritizedItem,
    pub send_confirmation: bool,
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertRequest {
    Chunk(ChunkData),
    Item(ItemData),
}

impl InsertRequest {
    pub fn is_chunk(&self) -> bool {
        matches!(self, InsertRequest::Chunk(_))
    }

    pub fn is_item(&self) -> bool {
        matches!(self, InsertRequest::Item(_))
    }
}

/// Server → client confirmation of the item with `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResponse {
    pub key: u64,
}

/// On-wire discriminant for payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Chunk = 1,
    Item = 2,
    Confirmation = 3,
}
