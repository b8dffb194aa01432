//! Per-column chunking.
//!
//! A `Chunker` buffers successive values of one column, finalizes them into an
//! immutable [`Chunk`] when the buffer reaches `max_chunk_length` (or on an
//! explicit flush), and keeps the most recent `num_keep_alive_refs` cells
//! alive so items declared after the fact can still reference them. The
//! keep-alive window is the only thing standing between a caller's weak
//! handle and expiry.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use rw_tensor::{dtype_name, fmt_dims, Tensor, TensorSpec};
use rw_wire::SequenceRange;

use crate::cell::{new_key, CellRef, Chunk};
use crate::error::Status;

/// Chunking options, writer-wide defaults or per-column overrides.
///
/// Fields are signed so that out-of-range configurations can be represented
/// and rejected by [`ChunkerOptions::validate`] instead of wrapping silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerOptions {
    /// Number of values after which a column's buffer is finalized into a
    /// chunk, making pending items that reference them sendable.
    pub max_chunk_length: i32,
    /// Size of the per-column window of recent cells kept alive; the maximum
    /// number of steps a trajectory can span backwards.
    pub num_keep_alive_refs: i32,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_chunk_length: 1,
            num_keep_alive_refs: 1,
        }
    }
}

impl ChunkerOptions {
    pub fn new(max_chunk_length: i32, num_keep_alive_refs: i32) -> Self {
        Self {
            max_chunk_length,
            num_keep_alive_refs,
        }
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.max_chunk_length <= 0 {
            return Err(Status::InvalidArgument(format!(
                "max_chunk_length must be > 0 but got {}.",
                self.max_chunk_length
            )));
        }
        if self.num_keep_alive_refs <= 0 {
            return Err(Status::InvalidArgument(format!(
                "num_keep_alive_refs must be > 0 but got {}.",
                self.num_keep_alive_refs
            )));
        }
        if self.num_keep_alive_refs < self.max_chunk_length {
            return Err(Status::InvalidArgument(format!(
                "num_keep_alive_refs ({}) must be >= max_chunk_length ({}).",
                self.num_keep_alive_refs, self.max_chunk_length
            )));
        }
        Ok(())
    }
}

/// Sliding buffer and keep-alive window for one column.
pub struct Chunker {
    spec: TensorSpec,
    column: u32,
    max_chunk_length: usize,
    num_keep_alive_refs: usize,
    /// Cells of the open, not yet finalized chunk.
    buffer: Vec<Arc<CellRef>>,
    /// Most recent cells, buffered and ready alike, oldest first.
    active_refs: VecDeque<Arc<CellRef>>,
    next_chunk_key: u64,
    /// Episode of the most recent append since the last reset.
    episode: Option<u64>,
    last_step: Option<u64>,
}

impl Chunker {
    pub fn new(spec: TensorSpec, column: u32, options: ChunkerOptions) -> Result<Self, Status> {
        options.validate()?;
        Ok(Self {
            spec,
            column,
            max_chunk_length: options.max_chunk_length as usize,
            num_keep_alive_refs: options.num_keep_alive_refs as usize,
            buffer: Vec::new(),
            active_refs: VecDeque::new(),
            next_chunk_key: new_key(),
            episode: None,
            last_step: None,
        })
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn has_open_buffer(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Appends one value at `(episode_id, step)` and returns a weak handle to
    /// its cell. Finalizes the buffer when it reaches `max_chunk_length`.
    pub fn append(
        &mut self,
        tensor: Tensor,
        episode_id: u64,
        step: u64,
    ) -> Result<Weak<CellRef>, Status> {
        if tensor.dtype() != self.spec.dtype {
            return Err(Status::InvalidArgument(format!(
                "Tensor of wrong dtype provided for column {}. Got {} but expected {}.",
                self.column,
                dtype_name(tensor.dtype()),
                dtype_name(self.spec.dtype)
            )));
        }
        if !self.spec.shape.compatible_with_dims(tensor.shape()) {
            return Err(Status::InvalidArgument(format!(
                "Tensor of incompatible shape provided for column {}. Got {} which is incompatible with {}.",
                self.column,
                fmt_dims(tensor.shape()),
                self.spec.shape
            )));
        }
        if !self.buffer.is_empty() && self.episode != Some(episode_id) {
            return Err(Status::FailedPrecondition(
                "Chunker::Append called with new episode when buffer non empty.".to_string(),
            ));
        }
        if self.episode != Some(episode_id) {
            // New episode with an empty buffer; step monotonicity restarts.
            self.episode = Some(episode_id);
            self.last_step = None;
        }
        if let Some(last) = self.last_step {
            if step <= last {
                return Err(Status::FailedPrecondition(
                    "Chunker::Append called with an episode step which was not greater than \
                     already observed."
                        .to_string(),
                ));
            }
        }
        self.last_step = Some(step);

        let cell = CellRef::new_buffered(
            self.next_chunk_key,
            self.buffer.len() as u32,
            episode_id,
            step,
            self.column,
            tensor,
        );
        let weak = Arc::downgrade(&cell);
        self.buffer.push(Arc::clone(&cell));
        self.active_refs.push_back(cell);
        while self.active_refs.len() > self.num_keep_alive_refs {
            self.active_refs.pop_front();
        }
        if self.buffer.len() == self.max_chunk_length {
            self.finalize_buffer();
        }
        Ok(weak)
    }

    /// Finalizes the open buffer, if any. Never fails.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.finalize_buffer();
        }
    }

    /// Drops the open buffer and the keep-alive window, expiring every weak
    /// handle issued so far, and starts over with a fresh chunk key.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.active_refs.clear();
        self.next_chunk_key = new_key();
        self.episode = None;
        self.last_step = None;
    }

    /// Clears episode tracking so the next append may open a new episode.
    /// Callers are expected to have flushed first.
    pub fn on_episode_end(&mut self) {
        self.episode = None;
        self.last_step = None;
    }

    /// Applies new chunking parameters. The buffer must be empty; the
    /// keep-alive window is shrunk from the oldest end when the bound drops.
    pub fn apply_config(&mut self, options: ChunkerOptions) -> Result<(), Status> {
        if !self.buffer.is_empty() {
            return Err(Status::FailedPrecondition(
                "Flush must be called before ApplyConfig.".to_string(),
            ));
        }
        options.validate()?;
        self.max_chunk_length = options.max_chunk_length as usize;
        self.num_keep_alive_refs = options.num_keep_alive_refs as usize;
        while self.active_refs.len() > self.num_keep_alive_refs {
            self.active_refs.pop_front();
        }
        Ok(())
    }

    /// Distinct chunk keys of the keep-alive window, oldest occurrence first.
    /// The server must keep these chunks; anything older is fair game.
    pub fn keep_keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        for cell in &self.active_refs {
            let key = cell.chunk_key();
            if keys.last() != Some(&key) && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn finalize_buffer(&mut self) {
        let tensors: Vec<Tensor> = self.buffer.iter().map(|cell| cell.data()).collect();
        let data = Tensor::stack(&tensors).expect("buffered cells share the column spec");

        let first = self.buffer.first().expect("finalize requires a non-empty buffer");
        let last = self.buffer.last().expect("finalize requires a non-empty buffer");
        let start = first.episode_step();
        let end = last.episode_step();
        let sequence_range = SequenceRange {
            episode_id: first.episode_id(),
            start,
            end,
            sparse: end - start + 1 != self.buffer.len() as u64,
        };

        let chunk = Arc::new(Chunk::new(
            self.next_chunk_key,
            self.column,
            sequence_range,
            data,
        ));
        for cell in self.buffer.drain(..) {
            cell.finalize(Arc::clone(&chunk));
        }
        self.next_chunk_key = new_key();
    }
}
