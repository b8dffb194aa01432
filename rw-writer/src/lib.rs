//! rw-writer: the client half of the rewind experience-replay service.
//!
//! A worker appends per-column tensor steps; each column's [`Chunker`] batches
//! them into immutable, key-addressed chunks and keeps a bounded window of
//! recent cells alive so trajectories can be declared after the fact. The
//! [`TrajectoryWriter`] validates appends and items, tracks which chunks every
//! pending item needs, and hands the work to a background [`stream`] worker
//! that ships chunks and items over a bidirectional insert stream, riding out
//! transient transport failures by reconnecting and resending.
//!
//! The writer is a library: no CLI, no persistence, one caller at a time.

pub mod cell;
pub mod chunker;
pub mod error;
pub mod stream;
pub mod transport;
pub mod writer;

pub use cell::{CellRef, Chunk};
pub use chunker::{Chunker, ChunkerOptions};
pub use error::{Code, Status};
pub use stream::{Connector, InsertStream};
pub use transport::{TcpConnector, TcpInsertStream};
pub use writer::{TrajectoryColumn, TrajectoryWriter};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
