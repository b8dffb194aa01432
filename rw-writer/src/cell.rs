//! Cells and finalized chunks.
//!
//! A [`CellRef`] is the handle for one appended value. The owning chunker
//! holds it strongly (open buffer and keep-alive window); callers only ever
//! see `Weak` copies, so a cell "expires" exactly when the chunker lets go of
//! it. The buffered value lives inside the cell itself, which keeps the cell
//! free of any back-pointer to its chunker.

use std::sync::{Arc, Mutex};

use rw_tensor::{Dtype, Tensor};
use rw_wire::{ChunkData, SequenceRange};

/// Mints a process-unique key for chunks, items and episodes.
pub(crate) fn new_key() -> u64 {
    rand::random::<u64>()
}

/// An immutable batch of consecutive values from one column.
#[derive(Debug)]
pub struct Chunk {
    key: u64,
    column: u32,
    sequence_range: SequenceRange,
    data: Tensor,
}

impl Chunk {
    pub(crate) fn new(key: u64, column: u32, sequence_range: SequenceRange, data: Tensor) -> Self {
        Self {
            key,
            column,
            sequence_range,
            data,
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn sequence_range(&self) -> &SequenceRange {
        &self.sequence_range
    }

    /// The stacked values; the leading dimension is the batch axis.
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn to_wire(&self) -> ChunkData {
        ChunkData {
            chunk_key: self.key,
            column: self.column,
            sequence_range: self.sequence_range.clone(),
            data: self.data.clone(),
        }
    }
}

#[derive(Debug)]
enum CellState {
    /// Still sitting in the chunker's open buffer.
    Buffered { tensor: Tensor },
    /// Row `offset` of a finalized chunk.
    Ready { chunk: Arc<Chunk> },
}

/// Handle to one time-step value in one column.
///
/// The chunk key and offset are fixed at creation; only the buffered → ready
/// transition mutates the cell, and it is irreversible.
#[derive(Debug)]
pub struct CellRef {
    chunk_key: u64,
    offset: u32,
    episode_id: u64,
    episode_step: u64,
    column: u32,
    dtype: Dtype,
    shape: Vec<usize>,
    state: Mutex<CellState>,
}

impl CellRef {
    pub(crate) fn new_buffered(
        chunk_key: u64,
        offset: u32,
        episode_id: u64,
        episode_step: u64,
        column: u32,
        tensor: Tensor,
    ) -> Arc<Self> {
        Arc::new(Self {
            chunk_key,
            offset,
            episode_id,
            episode_step,
            column,
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            state: Mutex::new(CellState::Buffered { tensor }),
        })
    }

    pub fn chunk_key(&self) -> u64 {
        self.chunk_key
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn episode_id(&self) -> u64 {
        self.episode_id
    }

    pub fn episode_step(&self) -> u64 {
        self.episode_step
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Whether the owning chunk has been finalized. Never reverts.
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock().unwrap(), CellState::Ready { .. })
    }

    /// The finalized chunk, once there is one.
    pub fn chunk(&self) -> Option<Arc<Chunk>> {
        match &*self.state.lock().unwrap() {
            CellState::Buffered { .. } => None,
            CellState::Ready { chunk } => Some(Arc::clone(chunk)),
        }
    }

    /// Copies the referenced value back out, from the open buffer or from the
    /// finalized chunk.
    pub fn data(&self) -> Tensor {
        match &*self.state.lock().unwrap() {
            CellState::Buffered { tensor } => tensor.clone(),
            CellState::Ready { chunk } => chunk
                .data()
                .index_outer(self.offset as usize)
                .expect("cell offset lies within its chunk's batch axis"),
        }
    }

    pub(crate) fn finalize(&self, chunk: Arc<Chunk>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(matches!(*state, CellState::Buffered { .. }));
        *state = CellState::Ready { chunk };
    }
}
