//! Column specs and shape compatibility.
//!
//! Shapes follow the usual convention for learned schemas: a dimension of `-1`
//! is unknown and matches anything. Compatibility is symmetric and requires
//! equal rank.

use std::fmt;

use safetensors::Dtype;

use crate::tensor::Tensor;

/// A possibly-partial shape. `-1` marks an unknown dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<i64>,
}

impl Shape {
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims }
    }

    /// A fully-known shape taken from a concrete tensor.
    pub fn from_dims(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|&d| d as i64).collect(),
        }
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Two shapes are compatible when ranks match and every pair of
    /// dimensions is equal or unknown on either side.
    pub fn compatible_with(&self, other: &Shape) -> bool {
        self.dims.len() == other.dims.len()
            && self
                .dims
                .iter()
                .zip(&other.dims)
                .all(|(&a, &b)| a == -1 || b == -1 || a == b)
    }

    /// Compatibility against a concrete tensor shape.
    pub fn compatible_with_dims(&self, dims: &[usize]) -> bool {
        self.dims.len() == dims.len()
            && self
                .dims
                .iter()
                .zip(dims)
                .all(|(&a, &b)| a == -1 || a == b as i64)
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Self::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if *d == -1 {
                write!(f, "?")?;
            } else {
                write!(f, "{d}")?;
            }
        }
        write!(f, "]")
    }
}

/// Dtype and shape a column has committed to.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: Dtype, shape: impl Into<Shape>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.into(),
        }
    }

    /// Spec inferred from the first value observed in a column.
    pub fn of_tensor(name: impl Into<String>, tensor: &Tensor) -> Self {
        Self {
            name: name.into(),
            dtype: tensor.dtype(),
            shape: Shape::from_dims(tensor.shape()),
        }
    }
}

/// Human name of a dtype for diagnostics.
pub fn dtype_name(dtype: Dtype) -> &'static str {
    match dtype {
        Dtype::BOOL => "bool",
        Dtype::U8 => "uint8",
        Dtype::I8 => "int8",
        Dtype::U16 => "uint16",
        Dtype::I16 => "int16",
        Dtype::F16 => "float16",
        Dtype::BF16 => "bfloat16",
        Dtype::U32 => "uint32",
        Dtype::I32 => "int32",
        Dtype::F32 => "float32",
        Dtype::U64 => "uint64",
        Dtype::I64 => "int64",
        Dtype::F64 => "float64",
        _ => "unknown",
    }
}

/// Renders a concrete tensor shape like `[2, 1]` for diagnostics.
pub fn fmt_dims(dims: &[usize]) -> String {
    Shape::from_dims(dims).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_dims_match_anything() {
        let spec = Shape::new(vec![-1, 3]);
        assert!(spec.compatible_with_dims(&[7, 3]));
        assert!(spec.compatible_with_dims(&[1, 3]));
        assert!(!spec.compatible_with_dims(&[7, 4]));
        assert!(!spec.compatible_with_dims(&[3]));
    }

    #[test]
    fn display_marks_unknown_dims() {
        assert_eq!(Shape::new(vec![-1, 3]).to_string(), "[?, 3]");
        assert_eq!(Shape::new(vec![1]).to_string(), "[1]");
        assert_eq!(fmt_dims(&[2, 1]), "[2, 1]");
    }

    #[test]
    fn compatibility_is_symmetric() {
        let a = Shape::new(vec![-1, 3]);
        let b = Shape::new(vec![5, -1]);
        assert!(a.compatible_with(&b));
        assert!(b.compatible_with(&a));
    }
}
