//! Minimal self-describing tensor used on both sides of the link.
//!
//! The transport never touches accelerator memory. A [`Tensor`] keeps its
//! elements in a host buffer and records where the owning runtime placed it;
//! moving between placements is always an explicit call.

use crate::error::{Result, SplitError};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Memory placement of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Npu(u32),
    Cuda(u32),
}

impl Device {
    /// Whether the buffer is host-addressable.
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Npu(i) => write!(f, "npu:{}", i),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
        }
    }
}

impl FromStr for Device {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, idx)) => {
                let idx = idx.parse::<u32>().map_err(|_| {
                    SplitError::invalid_record(format!("invalid device ordinal in '{}'", s))
                })?;
                (kind, idx)
            }
            None => (s, 0),
        };
        match kind.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "npu" => Ok(Device::Npu(ordinal)),
            "cuda" => Ok(Device::Cuda(ordinal)),
            _ => Err(SplitError::invalid_record(format!("unknown device '{}'", s))),
        }
    }
}

/// Element type of a tensor. The discriminant is the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    Bool = 1,
    U8 = 2,
    I32 = 3,
    I64 = 4,
    F16 = 5,
    BF16 = 6,
    F32 = 7,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DType::Bool),
            2 => Some(DType::U8),
            3 => Some(DType::I32),
            4 => Some(DType::I64),
            5 => Some(DType::F16),
            6 => Some(DType::BF16),
            7 => Some(DType::F32),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DType::U8 | DType::I32 | DType::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Rust scalar that maps onto a [`DType`]. Elements are stored little-endian.
pub trait Element: Copy + Sized {
    const DTYPE: DType;

    fn extend_le(self, out: &mut Vec<u8>);

    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn extend_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_element!(u8, DType::U8);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(f32, DType::F32);
impl_element!(half::f16, DType::F16);
impl_element!(half::bf16, DType::BF16);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn extend_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn from_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Dense, contiguous, row-major tensor.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
    device: Device,
}

impl Tensor {
    /// Build a host tensor from typed values.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self> {
        let numel = checked_numel(&shape)?;
        if numel != values.len() {
            return Err(SplitError::invalid_record(format!(
                "shape {:?} holds {} elements but {} were given",
                shape,
                numel,
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(numel * T::DTYPE.size());
        for &v in values {
            v.extend_le(&mut data);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data: Bytes::from(data),
            device: Device::Cpu,
        })
    }

    /// Build a host tensor from raw little-endian element bytes.
    pub fn from_raw(dtype: DType, shape: Vec<usize>, data: Bytes) -> Result<Self> {
        let expected = checked_numel(&shape)?
            .checked_mul(dtype.size())
            .ok_or_else(|| SplitError::invalid_record("tensor byte size overflows"))?;
        if data.len() != expected {
            return Err(SplitError::invalid_record(format!(
                "{} tensor of shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data,
            device: Device::Cpu,
        })
    }

    /// Zero-filled host tensor.
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let len = checked_numel(&shape)?
            .checked_mul(dtype.size())
            .ok_or_else(|| SplitError::invalid_record("tensor byte size overflows"))?;
        Self::from_raw(dtype, shape, Bytes::from(vec![0u8; len]))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Size of dimension `i`, if the tensor has that many dimensions.
    pub fn dim(&self, i: usize) -> Option<usize> {
        self.shape.get(i).copied()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy of this tensor placed on `device`.
    pub fn to(&self, device: Device) -> Tensor {
        Tensor {
            device,
            ..self.clone()
        }
    }

    pub fn cpu(&self) -> Tensor {
        self.to(Device::Cpu)
    }

    /// Decode the elements as `T`. The dtype must match exactly.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(SplitError::invalid_record(format!(
                "cannot read {} tensor as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::from_le)
            .collect())
    }

    /// Integer elements widened to `i64`.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self.dtype {
            DType::I64 => self.to_vec::<i64>(),
            DType::I32 => Ok(self.to_vec::<i32>()?.into_iter().map(i64::from).collect()),
            DType::U8 => Ok(self.to_vec::<u8>()?.into_iter().map(i64::from).collect()),
            other => Err(SplitError::invalid_record(format!(
                "expected an integer tensor, got {}",
                other
            ))),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, shape={:?}, device={})",
            self.dtype, self.shape, self.device
        )
    }
}

fn checked_numel(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| SplitError::invalid_record(format!("shape {:?} overflows", shape)))
}
