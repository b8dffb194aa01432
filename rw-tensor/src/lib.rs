//! rw-tensor: dense tensor values and spec compatibility for rewind.
//!
//! Columns are described by a [`TensorSpec`] (name, dtype, shape with unknown
//! dimensions) while appended values are concrete [`Tensor`]s backed by raw
//! little-endian bytes. The only structural operations the writer needs are
//! stacking along a new leading axis and slicing that axis back out.

pub mod spec;
pub mod tensor;

pub use safetensors::Dtype;
pub use spec::{dtype_name, fmt_dims, Shape, TensorSpec};
pub use tensor::{Element, Tensor, TensorError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
