//! The stream worker: background transmission of chunks and items.
//!
//! The worker owns the bidirectional insert stream. Chunks are written as soon
//! as they are finalized and some pending item needs them; an item follows
//! once every chunk it references is on the current stream. A separate reader
//! thread consumes item confirmations. Transient transport failures
//! (Unavailable) are invisible to the caller: the worker reconnects and
//! resends every chunk that any unconfirmed item still depends on, then the
//! items themselves. Anything else latches the writer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustc_hash::FxHashSet;

use rw_wire::{CellId, FlatColumn, InsertRequest, ItemData, PrioritizedItem};

use crate::cell::Chunk;
use crate::error::Status;
use crate::writer::{PendingItem, Shared, State};

/// A bidirectional insert stream. `write`/`read` may be called concurrently
/// from different threads; `abort` unblocks both.
pub trait InsertStream: Send + Sync {
    /// Writes one message; `false` means the stream has broken and `finish`
    /// carries the terminal status.
    fn write(&self, request: &InsertRequest) -> bool;

    /// Blocks for the next item confirmation; `None` when the stream closed.
    fn read(&self) -> Option<u64>;

    /// Terminal status of the stream. `Ok(())` is a clean close.
    fn finish(&self) -> Result<(), Status>;

    /// Best-effort unblocking of concurrent `write`/`read` callers.
    fn abort(&self) {}
}

/// Opens insert streams. Called again after every stream failure.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Arc<dyn InsertStream>, Status>;
}

const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

enum StreamEnd {
    /// The writer was closed; stop for good.
    Closed,
    /// The stream broke; classification comes from `finish`.
    Broken,
}

pub(crate) struct StreamWorker {
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
}

impl StreamWorker {
    pub(crate) fn new(shared: Arc<Shared>, connector: Box<dyn Connector>) -> Self {
        Self { shared, connector }
    }

    /// Runs until the writer is closed or a permanent error is latched.
    pub(crate) fn run(mut self) {
        loop {
            if self.shared.state.lock().unwrap().closed {
                return;
            }
            let stream = match self.connector.connect() {
                Ok(stream) => stream,
                Err(status) if status.is_transient() => {
                    tracing::warn!(error = %status, "connect failed; retrying");
                    thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
                Err(status) => {
                    self.latch(status);
                    return;
                }
            };

            // Fresh stream: the server behind it may not have anything we sent
            // before, so chunk dedup and sent-markers start over.
            {
                let mut state = self.shared.state.lock().unwrap();
                state.streamed_keys.clear();
                state.stream_broken = false;
                for item in &mut state.items {
                    item.sent = false;
                }
                state.current_stream = Some(Arc::clone(&stream));
            }

            let reader = {
                let shared = Arc::clone(&self.shared);
                let stream = Arc::clone(&stream);
                thread::Builder::new()
                    .name("rw-confirmations".to_string())
                    .spawn(move || read_confirmations(stream, shared))
            };

            let end = self.drive(stream.as_ref());

            {
                let mut state = self.shared.state.lock().unwrap();
                state.current_stream = None;
            }
            stream.abort();
            if let Ok(handle) = reader {
                let _ = handle.join();
            }

            match end {
                StreamEnd::Closed => {
                    let _ = stream.finish();
                    return;
                }
                StreamEnd::Broken => match stream.finish() {
                    Ok(()) => {
                        tracing::warn!("insert stream closed; reconnecting");
                    }
                    Err(status) if status.is_transient() => {
                        tracing::warn!(error = %status, "insert stream failed; reconnecting");
                    }
                    Err(status) => {
                        tracing::error!(error = %status, "insert stream failed permanently");
                        self.latch(status);
                        return;
                    }
                },
            }
        }
    }

    /// Pumps send jobs onto `stream` until it breaks or the writer closes.
    fn drive(&self, stream: &dyn InsertStream) -> StreamEnd {
        loop {
            let jobs = {
                let mut state = self.shared.state.lock().unwrap();
                loop {
                    if state.closed {
                        return StreamEnd::Closed;
                    }
                    if state.stream_broken {
                        return StreamEnd::Broken;
                    }
                    let jobs = collect_jobs(&state);
                    if !jobs.is_empty() {
                        break jobs;
                    }
                    state = self.shared.work_cv.wait(state).unwrap();
                }
            };

            for job in jobs {
                match job {
                    Job::Chunk(chunk) => {
                        tracing::debug!(chunk_key = chunk.key(), column = chunk.column(), "sending chunk");
                        if !stream.write(&InsertRequest::Chunk(chunk.to_wire())) {
                            return StreamEnd::Broken;
                        }
                        let mut state = self.shared.state.lock().unwrap();
                        if state.closed {
                            return StreamEnd::Closed;
                        }
                        state.streamed_keys.insert(chunk.key());
                    }
                    Job::Item(key) => {
                        // Built under the lock so keep_chunk_keys reflects
                        // exactly what is on this stream at write time.
                        let request = {
                            let state = self.shared.state.lock().unwrap();
                            match state.items.iter().find(|item| item.key == key) {
                                Some(item) => build_item_request(&state, item),
                                // Confirmed in the meantime; nothing to do.
                                None => continue,
                            }
                        };
                        tracing::debug!(item_key = key, "sending item");
                        if !stream.write(&request) {
                            return StreamEnd::Broken;
                        }
                        let mut state = self.shared.state.lock().unwrap();
                        if state.closed {
                            return StreamEnd::Closed;
                        }
                        if let Some(item) = state.items.iter_mut().find(|item| item.key == key) {
                            item.sent = true;
                        }
                    }
                }
            }
        }
    }

    fn latch(&self, status: Status) {
        let mut state = self.shared.state.lock().unwrap();
        state.error = Some(status);
        drop(state);
        self.shared.done_cv.notify_all();
    }
}

enum Job {
    Chunk(Arc<Chunk>),
    Item(u64),
}

/// Scans pending items in creation order. Every finalized chunk an unsent item
/// needs goes out as soon as it exists; the item itself only once all of its
/// chunks are on the wire. Items with unfinished chunks are skipped, not
/// waited for, so independent items pipeline freely.
fn collect_jobs(state: &State) -> Vec<Job> {
    let mut jobs = Vec::new();
    let mut queued: FxHashSet<u64> = FxHashSet::default();
    for item in &state.items {
        if item.sent {
            continue;
        }
        let mut all_ready = true;
        for column in &item.columns {
            for cell in &column.refs {
                match cell.chunk() {
                    Some(chunk) => {
                        let key = chunk.key();
                        if !state.streamed_keys.contains(&key) && queued.insert(key) {
                            jobs.push(Job::Chunk(chunk));
                        }
                    }
                    None => all_ready = false,
                }
            }
        }
        if all_ready {
            jobs.push(Job::Item(item.key));
        }
    }
    jobs
}

fn build_item_request(state: &State, item: &PendingItem) -> InsertRequest {
    // The server may only be told to keep chunks it has actually received:
    // live keep-alive keys intersected with what this stream has seen.
    let mut keep_chunk_keys = Vec::new();
    let mut seen: FxHashSet<u64> = FxHashSet::default();
    for chunker in state.chunkers.iter().flatten() {
        for key in chunker.keep_keys() {
            if state.streamed_keys.contains(&key) && seen.insert(key) {
                keep_chunk_keys.push(key);
            }
        }
    }

    let trajectory = item
        .columns
        .iter()
        .map(|column| FlatColumn {
            cells: column
                .refs
                .iter()
                .map(|cell| CellId {
                    chunk_key: cell.chunk_key(),
                    offset: cell.offset(),
                })
                .collect(),
            squeeze: column.squeeze,
        })
        .collect();

    InsertRequest::Item(ItemData {
        item: PrioritizedItem {
            key: item.key,
            table: item.table.clone(),
            priority: item.priority,
            trajectory,
            keep_chunk_keys,
        },
        send_confirmation: true,
    })
}

/// Reader-thread body: marks items confirmed until the stream closes, then
/// flags the stream as broken so an idle worker notices.
fn read_confirmations(stream: Arc<dyn InsertStream>, shared: Arc<Shared>) {
    while let Some(key) = stream.read() {
        let mut state = shared.state.lock().unwrap();
        if let Some(pos) = state.items.iter().position(|item| item.key == key) {
            state.items.remove(pos);
            drop(state);
            shared.done_cv.notify_all();
        } else {
            tracing::debug!(item_key = key, "confirmation for unknown item");
        }
    }
    let mut state = shared.state.lock().unwrap();
    state.stream_broken = true;
    drop(state);
    shared.work_cv.notify_all();
}
