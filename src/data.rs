use num_traits::{One, Zero};

use crate::errors::{FlintError, FlintResult};

/// The four element types a tensor can hold.
///
/// Binary operations promote to the higher-ranked type, in the order
/// `I32 < I64 < F32 < F64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Promotion rank; the derive on `Ord` follows declaration order, this
    /// accessor exists for explicitness at call sites.
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn is_int(self) -> bool {
        matches!(self, DataType::I32 | DataType::I64)
    }

    pub fn is_float(self) -> bool {
        !self.is_int()
    }

    pub fn size_of(self) -> usize {
        match self {
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    /// The larger of the two types, used for binary operation results.
    pub fn promote(self, other: DataType) -> DataType {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    /// Type name as it appears in OpenCL kernel sources.
    pub fn ocl_name(self) -> &'static str {
        match self {
            DataType::I32 => "int",
            DataType::I64 => "long",
            DataType::F32 => "float",
            DataType::F64 => "double",
        }
    }
}

/// One of the four supported element types, with C-style conversions
/// between all of them. The conversions intentionally mirror `as` casts so
/// host kernels and generated device code agree.
pub trait TensorElement:
    Copy
    + PartialOrd
    + PartialEq
    + Zero
    + One
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
    const DATA_TYPE: DataType;

    fn from_i32(v: i32) -> Self;
    fn from_i64(v: i64) -> Self;
    fn from_f32(v: f32) -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    fn wrap_vec(v: Vec<Self>) -> TensorData;
    fn slice_of(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr, $variant:ident) => {
        impl TensorElement for $t {
            const DATA_TYPE: DataType = $dtype;

            fn from_i32(v: i32) -> Self {
                v as $t
            }
            fn from_i64(v: i64) -> Self {
                v as $t
            }
            fn from_f32(v: f32) -> Self {
                v as $t
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }

            fn wrap_vec(v: Vec<Self>) -> TensorData {
                TensorData::$variant(v)
            }
            fn slice_of(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(i32, DataType::I32, I32);
impl_element!(i64, DataType::I64, I64);
impl_element!(f32, DataType::F32, F32);
impl_element!(f64, DataType::F64, F64);

/// A host buffer in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn zeros(dtype: DataType, len: usize) -> TensorData {
        match dtype {
            DataType::I32 => TensorData::I32(vec![0; len]),
            DataType::I64 => TensorData::I64(vec![0; len]),
            DataType::F32 => TensorData::F32(vec![0.0; len]),
            DataType::F64 => TensorData::F64(vec![0.0; len]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TensorData::I32(_) => DataType::I32,
            TensorData::I64(_) => DataType::I64,
            TensorData::F32(_) => DataType::F32,
            TensorData::F64(_) => DataType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `i`, cast to `T` the way a C cast would.
    #[inline]
    pub fn get<T: TensorElement>(&self, i: usize) -> T {
        match self {
            TensorData::I32(v) => T::from_i32(v[i]),
            TensorData::I64(v) => T::from_i64(v[i]),
            TensorData::F32(v) => T::from_f32(v[i]),
            TensorData::F64(v) => T::from_f64(v[i]),
        }
    }

    #[inline]
    pub fn get_f64(&self, i: usize) -> f64 {
        self.get::<f64>(i)
    }

    pub fn as_slice<T: TensorElement>(&self) -> FlintResult<&[T]> {
        T::slice_of(self).ok_or_else(|| {
            FlintError::InternalError(format!(
                "buffer holds {:?}, not {:?}",
                self.data_type(),
                T::DATA_TYPE
            ))
        })
    }

    /// Copies the buffer into a `Vec<T>`, casting elementwise.
    pub fn to_vec<T: TensorElement>(&self) -> Vec<T> {
        (0..self.len()).map(|i| self.get::<T>(i)).collect()
    }

    /// Runs `f` over mutable chunks of at most `chunk_size` elements,
    /// passing each chunk's global element offset. Chunks run on the rayon
    /// pool when the feature is enabled, serially otherwise; the first
    /// error cancels the remaining chunks.
    pub fn apply_chunks<F>(&mut self, chunk_size: usize, parallel: bool, f: F) -> FlintResult<()>
    where
        F: Fn(OutChunk<'_>, usize) -> FlintResult<()> + Send + Sync,
    {
        macro_rules! run {
            ($v:expr, $variant:ident) => {{
                #[cfg(feature = "rayon")]
                if parallel {
                    use rayon::prelude::*;
                    return $v
                        .par_chunks_mut(chunk_size)
                        .enumerate()
                        .try_for_each(|(i, c)| f(OutChunk::$variant(c), i * chunk_size));
                }
                let _ = parallel;
                $v.chunks_mut(chunk_size)
                    .enumerate()
                    .try_for_each(|(i, c)| f(OutChunk::$variant(c), i * chunk_size))
            }};
        }
        match self {
            TensorData::I32(v) => run!(v, I32),
            TensorData::I64(v) => run!(v, I64),
            TensorData::F32(v) => run!(v, F32),
            TensorData::F64(v) => run!(v, F64),
        }
    }
}

/// A mutable window into one result buffer, handed to CPU kernels. The
/// kernel writes `out[i]` for `i` in `0..out.len()`; the global linear
/// position of `out[i]` is `from + i`.
pub enum OutChunk<'a> {
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
}

impl<'a> OutChunk<'a> {
    pub fn len(&self) -> usize {
        match self {
            OutChunk::I32(s) => s.len(),
            OutChunk::I64(s) => s.len(),
            OutChunk::F32(s) => s.len(),
            OutChunk::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dispatches an [`OutChunk`] to a generic kernel body. The body is
/// instantiated once per element type.
#[macro_export]
macro_rules! dispatch_chunk {
    ($out:expr, |$slice:ident| $body:expr) => {
        match $out {
            $crate::data::OutChunk::I32($slice) => $body,
            $crate::data::OutChunk::I64($slice) => $body,
            $crate::data::OutChunk::F32($slice) => $body,
            $crate::data::OutChunk::F64($slice) => $body,
        }
    };
}
