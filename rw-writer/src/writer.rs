//! The trajectory writer facade.
//!
//! One caller thread drives `append`/`create_item`/`flush`/`end_episode`;
//! a background stream worker (see [`crate::stream`]) drains pending work.
//! All shared state sits behind a single writer-wide mutex: the per-column
//! chunkers, the pending-item table, the per-stream sent-chunk set and the
//! latched status. Two condvars hang off it, one to wake the worker and one
//! to wake callers blocked in `flush`/`end_episode`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use rw_tensor::{dtype_name, fmt_dims, Shape, Tensor, TensorSpec};

use crate::cell::{new_key, CellRef};
use crate::chunker::{Chunker, ChunkerOptions};
use crate::error::Status;
use crate::stream::{Connector, InsertStream, StreamWorker};

/// One column of a trajectory declaration: an ordered run of cells, with an
/// optional squeeze of the unit batch dimension.
#[derive(Debug, Clone)]
pub struct TrajectoryColumn {
    pub refs: Vec<Weak<CellRef>>,
    pub squeeze: bool,
}

impl TrajectoryColumn {
    pub fn new(refs: Vec<Weak<CellRef>>, squeeze: bool) -> Self {
        Self { refs, squeeze }
    }
}

pub(crate) struct ItemColumn {
    /// Strong refs: data referenced by a pending item must survive keep-alive
    /// eviction until the item is on the wire.
    pub(crate) refs: Vec<Arc<CellRef>>,
    pub(crate) squeeze: bool,
}

pub(crate) struct PendingItem {
    pub(crate) key: u64,
    pub(crate) table: String,
    pub(crate) priority: f64,
    pub(crate) columns: Vec<ItemColumn>,
    /// Written on the current stream, awaiting confirmation.
    pub(crate) sent: bool,
}

pub(crate) struct State {
    /// One slot per column seen in any step; a chunker exists once the column
    /// has received data.
    pub(crate) chunkers: Vec<Option<Chunker>>,
    /// Configs recorded for columns not yet observed.
    pub(crate) pending_configs: FxHashMap<usize, ChunkerOptions>,
    /// Pending items in creation order; removed on confirmation.
    pub(crate) items: Vec<PendingItem>,
    /// Chunk keys written on the current stream.
    pub(crate) streamed_keys: FxHashSet<u64>,
    /// Permanent failure; returned verbatim by every subsequent operation.
    pub(crate) error: Option<Status>,
    pub(crate) closed: bool,
    /// Set by the confirmation reader when the stream dies under an idle
    /// worker.
    pub(crate) stream_broken: bool,
    pub(crate) current_stream: Option<Arc<dyn InsertStream>>,
    pub(crate) episode_id: u64,
    pub(crate) episode_step: u64,
    /// Columns already written for the step currently being assembled with
    /// `append_partial`.
    pub(crate) partial_columns: FxHashSet<usize>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    /// Wakes the stream worker.
    pub(crate) work_cv: Condvar,
    /// Wakes callers blocked in flush/end_episode.
    pub(crate) done_cv: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                chunkers: Vec::new(),
                pending_configs: FxHashMap::default(),
                items: Vec::new(),
                streamed_keys: FxHashSet::default(),
                error: None,
                closed: false,
                stream_broken: false,
                current_stream: None,
                episode_id: new_key(),
                episode_step: 0,
                partial_columns: FxHashSet::default(),
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        }
    }
}

/// Client-side trajectory writer.
///
/// Not thread-safe for concurrent callers; `append` and `create_item` never
/// block on the network, while `flush`, `end_episode` and `Drop` do.
pub struct TrajectoryWriter {
    shared: Arc<Shared>,
    options: ChunkerOptions,
    worker: Option<JoinHandle<()>>,
}

impl TrajectoryWriter {
    /// Starts the stream worker on `connector` with writer-wide default
    /// chunking options.
    pub fn new(connector: Box<dyn Connector>, options: ChunkerOptions) -> Result<Self, Status> {
        options.validate()?;
        let shared = Arc::new(Shared::new());
        let worker = StreamWorker::new(Arc::clone(&shared), connector);
        let handle = thread::Builder::new()
            .name("rw-stream-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Status::Internal(format!("failed to spawn stream worker: {e}")))?;
        Ok(Self {
            shared,
            options,
            worker: Some(handle),
        })
    }

    /// The current episode id. Changes on `end_episode`.
    pub fn episode_id(&self) -> u64 {
        self.shared.state.lock().unwrap().episode_id
    }

    /// Appends one step and advances the step counter. `None` columns receive
    /// no data; the returned vector holds a weak cell handle wherever data was
    /// appended.
    ///
    /// The first value observed in a column fixes that column's dtype and
    /// shape; later appends must stay compatible.
    pub fn append(
        &mut self,
        step: Vec<Option<Tensor>>,
    ) -> Result<Vec<Option<Weak<CellRef>>>, Status> {
        self.append_inner(step, true)
    }

    /// Appends data for the current step without closing it, so one step can
    /// be assembled over several calls. A later `append` closes the step.
    pub fn append_partial(
        &mut self,
        step: Vec<Option<Tensor>>,
    ) -> Result<Vec<Option<Weak<CellRef>>>, Status> {
        self.append_inner(step, false)
    }

    fn append_inner(
        &mut self,
        step: Vec<Option<Tensor>>,
        advance: bool,
    ) -> Result<Vec<Option<Weak<CellRef>>>, Status> {
        let mut state = self.lock_checked()?;
        if step.len() > state.chunkers.len() {
            state.chunkers.resize_with(step.len(), || None);
        }
        let episode_id = state.episode_id;
        let episode_step = state.episode_step;

        let mut refs = vec![None; step.len()];
        for (i, slot) in step.into_iter().enumerate() {
            let Some(tensor) = slot else { continue };
            if state.partial_columns.contains(&i) {
                return Err(Status::InvalidArgument(format!(
                    "Column {i} has already been provided for the current step."
                )));
            }
            if state.chunkers[i].is_none() {
                let options = state.pending_configs.remove(&i).unwrap_or(self.options);
                let spec = TensorSpec::of_tensor(i.to_string(), &tensor);
                state.chunkers[i] = Some(Chunker::new(spec, i as u32, options)?);
            }
            let chunker = state.chunkers[i].as_mut().expect("chunker just ensured");
            refs[i] = Some(chunker.append(tensor, episode_id, episode_step)?);
            state.partial_columns.insert(i);
        }
        if advance {
            state.episode_step += 1;
            state.partial_columns.clear();
        }
        drop(state);
        // A chunk may have been finalized; give the worker a chance to ship it.
        self.shared.work_cv.notify_one();
        Ok(refs)
    }

    /// Reconfigures an existing column's chunker, or records the options for a
    /// column that has not produced data yet.
    pub fn configure_chunker(
        &mut self,
        column: usize,
        options: ChunkerOptions,
    ) -> Result<(), Status> {
        let mut state = self.lock_checked()?;
        if let Some(Some(chunker)) = state.chunkers.get_mut(column) {
            chunker.apply_config(options)
        } else {
            options.validate()?;
            state.pending_configs.insert(column, options);
            Ok(())
        }
    }

    /// Validates `trajectory` and enqueues an item for transmission. Never
    /// blocks on the network; call `flush` to wait for confirmation.
    pub fn create_item(
        &mut self,
        table: &str,
        priority: f64,
        trajectory: Vec<TrajectoryColumn>,
    ) -> Result<(), Status> {
        let mut state = self.lock_checked()?;
        if trajectory.is_empty() || trajectory.iter().any(|column| column.refs.is_empty()) {
            return Err(Status::InvalidArgument(
                "trajectory must not be empty.".to_string(),
            ));
        }

        let mut columns = Vec::with_capacity(trajectory.len());
        for (i, column) in trajectory.iter().enumerate() {
            let mut refs = Vec::with_capacity(column.refs.len());
            for weak in &column.refs {
                let Some(cell) = weak.upgrade() else {
                    return Err(Status::InvalidArgument(format!(
                        "Error in column {i}: Column contains expired CellRef."
                    )));
                };
                refs.push(cell);
            }
            if column.squeeze && refs.len() != 1 {
                return Err(Status::InvalidArgument(format!(
                    "Error in column {i}: TrajectoryColumn must contain exactly one row when \
                     squeeze is set but got {}.",
                    refs.len()
                )));
            }
            let first = &refs[0];
            for (j, cell) in refs.iter().enumerate().skip(1) {
                if cell.dtype() != first.dtype() {
                    return Err(Status::InvalidArgument(format!(
                        "Error in column {i}: Column references tensors with different dtypes: \
                         {} (index 0) != {} (index {j}).",
                        dtype_name(first.dtype()),
                        dtype_name(cell.dtype())
                    )));
                }
                if !Shape::from_dims(first.shape()).compatible_with_dims(cell.shape()) {
                    return Err(Status::InvalidArgument(format!(
                        "Error in column {i}: Column references tensors with incompatible \
                         shapes: {} (index 0) not compatible with {} (index {j}).",
                        fmt_dims(first.shape()),
                        fmt_dims(cell.shape())
                    )));
                }
            }
            columns.push(ItemColumn {
                refs,
                squeeze: column.squeeze,
            });
        }

        state.items.push(PendingItem {
            key: new_key(),
            table: table.to_string(),
            priority,
            columns,
            sent: false,
        });
        drop(state);
        self.shared.work_cv.notify_one();
        Ok(())
    }

    /// Finalizes every open buffer still holding cells that the pending items
    /// (except the last `ignore_last_num_items`) reference, then waits until
    /// those items are written and confirmed, or until `timeout`.
    ///
    /// Buffers no selected item depends on stay open.
    pub fn flush(
        &mut self,
        ignore_last_num_items: usize,
        timeout: Option<Duration>,
    ) -> Result<(), Status> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock_checked()?;

        let selected = state.items.len().saturating_sub(ignore_last_num_items);
        let keys: Vec<u64> = state.items[..selected].iter().map(|item| item.key).collect();

        let mut columns_to_flush = FxHashSet::default();
        for item in &state.items[..selected] {
            for column in &item.columns {
                for cell in &column.refs {
                    if !cell.is_ready() {
                        columns_to_flush.insert(cell.column() as usize);
                    }
                }
            }
        }
        for column in columns_to_flush {
            if let Some(Some(chunker)) = state.chunkers.get_mut(column) {
                chunker.flush();
            }
        }
        self.shared.work_cv.notify_one();

        let (_state, result) = self.wait_for_items(state, &keys, deadline);
        result
    }

    /// Flushes **all** chunkers (even ones no item references), waits like
    /// `flush`, then starts a new episode. With `clear_buffers` every
    /// outstanding cell handle is expired as well.
    ///
    /// The episode id and step counter are advanced even when the wait times
    /// out; only the wait is interrupted.
    pub fn end_episode(
        &mut self,
        clear_buffers: bool,
        timeout: Option<Duration>,
    ) -> Result<(), Status> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock_checked()?;

        for chunker in state.chunkers.iter_mut().flatten() {
            chunker.flush();
        }
        self.shared.work_cv.notify_one();

        let keys: Vec<u64> = state.items.iter().map(|item| item.key).collect();
        let (mut state, result) = self.wait_for_items(state, &keys, deadline);

        state.episode_id = new_key();
        state.episode_step = 0;
        state.partial_columns.clear();
        for chunker in state.chunkers.iter_mut().flatten() {
            if clear_buffers {
                chunker.reset();
            } else {
                chunker.on_episode_end();
            }
        }
        result
    }

    /// Abandons pending work and terminates the stream worker. Every
    /// subsequent operation fails with `FailedPrecondition`. Idempotent.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(stream) = state.current_stream.take() {
                stream.abort();
            }
        }
        self.shared.work_cv.notify_all();
        self.shared.done_cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn lock_checked(&self) -> Result<MutexGuard<'_, State>, Status> {
        let state = self.shared.state.lock().unwrap();
        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        if state.closed {
            return Err(Status::FailedPrecondition(
                "the writer has been closed.".to_string(),
            ));
        }
        Ok(state)
    }

    /// Waits until none of `keys` remains pending. Returns the guard so
    /// callers can keep mutating state after the wait.
    fn wait_for_items<'a>(
        &self,
        mut state: MutexGuard<'a, State>,
        keys: &[u64],
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, State>, Result<(), Status>) {
        loop {
            if let Some(error) = state.error.clone() {
                return (state, Err(error));
            }
            if state.closed {
                return (
                    state,
                    Err(Status::Cancelled(
                        "writer closed while waiting for pending items.".to_string(),
                    )),
                );
            }

            let mut waiting = 0usize;
            let mut awaiting_confirmation = 0usize;
            for item in &state.items {
                if keys.contains(&item.key) {
                    if item.sent {
                        awaiting_confirmation += 1;
                    } else {
                        waiting += 1;
                    }
                }
            }
            if waiting == 0 && awaiting_confirmation == 0 {
                return (state, Ok(()));
            }

            match deadline {
                None => {
                    state = self.shared.done_cv.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (
                            state,
                            Err(Status::DeadlineExceeded(format!(
                                "Timeout exceeded with {waiting} items waiting to be written \
                                 and {awaiting_confirmation} items awaiting confirmation."
                            ))),
                        );
                    }
                    let (guard, _) = self
                        .shared
                        .done_cv
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
        }
    }
}

impl Drop for TrajectoryWriter {
    fn drop(&mut self) {
        // Block until everything pending is sent and confirmed, or the writer
        // has permanently failed; then tear the worker down.
        let _ = self.flush(0, None);
        self.close();
    }
}
