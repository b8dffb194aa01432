use bytemuck::Pod;
use safetensors::Dtype;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("data length {got} does not match {want} bytes implied by shape and dtype")]
    LengthMismatch { got: usize, want: usize },
    #[error("cannot build a typed view of a {got:?} tensor as {want:?}")]
    ViewDtype { got: Dtype, want: Dtype },
    #[error("cannot stack an empty list of tensors")]
    EmptyStack,
    #[error("stack requires all tensors to share dtype and shape")]
    HeterogeneousStack,
    #[error("index {index} out of bounds for leading dimension of size {dim}")]
    IndexOutOfBounds { index: usize, dim: usize },
    #[error("tensor of rank 0 has no leading axis")]
    NoLeadingAxis,
}

/// Rust scalar types that map onto a wire dtype.
pub trait Element: Pod + private::Sealed {
    const DTYPE: Dtype;
}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: Dtype = Dtype::$dtype;
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

/// A dense tensor: dtype, shape and little-endian bytes.
///
/// Equality is structural (dtype, shape and bytes), which is what the writer
/// needs to compare appended values with data read back from chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Builds a tensor from raw little-endian bytes.
    pub fn from_raw(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, TensorError> {
        let want = shape.iter().product::<usize>() * dtype.size();
        if data.len() != want {
            return Err(TensorError::LengthMismatch {
                got: data.len(),
                want,
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Builds a tensor from a typed slice.
    pub fn from_slice<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, TensorError> {
        Self::from_raw(T::DTYPE, shape, bytemuck::cast_slice(values).to_vec())
    }

    /// A tensor with every element set to `value`.
    pub fn splat<T: Element>(shape: Vec<usize>, value: T) -> Self {
        let numel = shape.iter().product::<usize>();
        let values = vec![value; numel];
        Self::from_slice(shape, &values).expect("splat length always matches")
    }

    /// An all-zero tensor of the given dtype and shape.
    pub fn zeros(dtype: Dtype, shape: Vec<usize>) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Copies the elements out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        if self.dtype != T::DTYPE {
            return Err(TensorError::ViewDtype {
                got: self.dtype,
                want: T::DTYPE,
            });
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Stacks `parts` along a new leading axis of size `parts.len()`.
    ///
    /// The batch axis is always added, also for a single part.
    pub fn stack(parts: &[Tensor]) -> Result<Tensor, TensorError> {
        let first = parts.first().ok_or(TensorError::EmptyStack)?;
        if parts
            .iter()
            .any(|t| t.dtype != first.dtype || t.shape != first.shape)
        {
            return Err(TensorError::HeterogeneousStack);
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(parts.len());
        shape.extend_from_slice(&first.shape);
        let mut data = Vec::with_capacity(first.byte_len() * parts.len());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Ok(Tensor {
            dtype: first.dtype,
            shape,
            data,
        })
    }

    /// Slices out row `index` of the leading axis, squeezing that axis.
    ///
    /// Inverse of [`Tensor::stack`] for a single row.
    pub fn index_outer(&self, index: usize) -> Result<Tensor, TensorError> {
        let dim = *self.shape.first().ok_or(TensorError::NoLeadingAxis)?;
        if index >= dim {
            return Err(TensorError::IndexOutOfBounds { index, dim });
        }
        let row_len = self.data.len() / dim.max(1);
        let start = index * row_len;
        Ok(Tensor {
            dtype: self.dtype,
            shape: self.shape[1..].to_vec(),
            data: self.data[start..start + row_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_roundtrips() {
        let t = Tensor::from_slice::<i32>(vec![2, 2], &[1, 2, 3, 4]).unwrap();
        assert_eq!(t.dtype(), Dtype::I32);
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn from_raw_rejects_bad_length() {
        let err = Tensor::from_raw(Dtype::F32, vec![2], vec![0u8; 7]).unwrap_err();
        assert!(matches!(err, TensorError::LengthMismatch { got: 7, want: 8 }));
    }

    #[test]
    fn stack_adds_leading_axis_even_for_one_part() {
        let t = Tensor::from_slice::<f32>(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let stacked = Tensor::stack(std::slice::from_ref(&t)).unwrap();
        assert_eq!(stacked.shape(), &[1, 3]);

        let both = Tensor::stack(&[t.clone(), t]).unwrap();
        assert_eq!(both.shape(), &[2, 3]);
        assert_eq!(
            both.to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn index_outer_is_inverse_of_stack() {
        let a = Tensor::from_slice::<i64>(vec![2], &[1, 2]).unwrap();
        let b = Tensor::from_slice::<i64>(vec![2], &[3, 4]).unwrap();
        let stacked = Tensor::stack(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(stacked.index_outer(0).unwrap(), a);
        assert_eq!(stacked.index_outer(1).unwrap(), b);
        assert!(matches!(
            stacked.index_outer(2),
            Err(TensorError::IndexOutOfBounds { index: 2, dim: 2 })
        ));
    }

    #[test]
    fn stack_rejects_mixed_parts() {
        let a = Tensor::from_slice::<i32>(vec![2], &[1, 2]).unwrap();
        let b = Tensor::from_slice::<i32>(vec![3], &[1, 2, 3]).unwrap();
        assert!(matches!(
            Tensor::stack(&[a, b]),
            Err(TensorError::HeterogeneousStack)
        ));
    }
}
