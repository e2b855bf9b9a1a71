//! Device buffers
//!
//! A [`HipBuffer`] is a typed, reference-counted device allocation. Storage
//! keeps the element type the framework asked for (f16, bf16 or f32); kernels
//! widen to f32 on load and round back on store.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::config::Bf16Rounding;
use crate::error::{FlashError, FlashResult};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Element type of attention tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "fp16")]
    F16,
    #[serde(rename = "bf16")]
    Bf16,
    #[serde(rename = "fp32")]
    F32,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::F16, DataType::Bf16, DataType::F32];

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F16 | DataType::Bf16 => 2,
            DataType::F32 => 4,
        }
    }

    /// Short name used in kernel symbols
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F16 => "fp16",
            DataType::Bf16 => "bf16",
            DataType::F32 => "fp32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fp16" | "f16" | "half" | "float16" => Ok(DataType::F16),
            "bf16" | "bfloat16" => Ok(DataType::Bf16),
            "fp32" | "f32" | "float" | "float32" => Ok(DataType::F32),
            _ => Err(FlashError::InvalidConfiguration(format!(
                "unknown data type {:?}",
                s
            ))),
        }
    }
}

/// Typed element storage behind a buffer
#[derive(Debug)]
pub(crate) enum BufferStorage {
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    F32(Vec<f32>),
}

impl BufferStorage {
    fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::F16 => BufferStorage::F16(vec![f16::ZERO; len]),
            DataType::Bf16 => BufferStorage::Bf16(vec![bf16::ZERO; len]),
            DataType::F32 => BufferStorage::F32(vec![0.0; len]),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            BufferStorage::F16(v) => v.len(),
            BufferStorage::Bf16(v) => v.len(),
            BufferStorage::F32(v) => v.len(),
        }
    }

    /// Element `idx` widened to f32
    #[inline]
    pub(crate) fn load(&self, idx: usize) -> f32 {
        match self {
            BufferStorage::F16(v) => v[idx].to_f32(),
            BufferStorage::Bf16(v) => v[idx].to_f32(),
            BufferStorage::F32(v) => v[idx],
        }
    }

    /// Store `value` at `idx`, rounding to the element type
    #[inline]
    pub(crate) fn store(&mut self, idx: usize, value: f32, rounding: Bf16Rounding) {
        match self {
            BufferStorage::F16(v) => v[idx] = f16::from_f32(value),
            BufferStorage::Bf16(v) => v[idx] = round_bf16(value, rounding),
            BufferStorage::F32(v) => v[idx] = value,
        }
    }
}

/// f32 -> bf16 with the configured rounding
pub(crate) fn round_bf16(value: f32, rounding: Bf16Rounding) -> bf16 {
    match rounding {
        Bf16Rounding::NearestEven => bf16::from_f32(value),
        Bf16Rounding::TowardZero => {
            if value.is_nan() {
                bf16::NAN
            } else {
                bf16::from_bits((value.to_bits() >> 16) as u16)
            }
        }
    }
}

/// Device buffer handle. Clones share the allocation.
#[derive(Debug, Clone)]
pub struct HipBuffer {
    inner: Arc<HipBufferInner>,
}

#[derive(Debug)]
struct HipBufferInner {
    id: u64,
    dtype: DataType,
    len: usize,
    storage: RwLock<BufferStorage>,
    // Fingerprint of the forward call that last wrote this buffer as its stats
    tag: Mutex<Option<u64>>,
}

impl HipBuffer {
    /// Allocate `len` zeroed elements of `dtype`
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        if len == 0 {
            tracing::warn!("HipBuffer::zeros: zero-length {} allocation", dtype);
        }
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "HipBuffer::zeros: buffer {} with {} x {} ({} bytes)",
            id,
            len,
            dtype,
            len * dtype.size_in_bytes()
        );
        HipBuffer {
            inner: Arc::new(HipBufferInner {
                id,
                dtype,
                len,
                storage: RwLock::new(BufferStorage::zeros(dtype, len)),
                tag: Mutex::new(None),
            }),
        }
    }

    /// Allocate and upload `data` (rounded to nearest for narrow types)
    pub fn from_host(dtype: DataType, data: &[f32]) -> Self {
        let buffer = HipBuffer::zeros(dtype, data.len());
        if let Ok(mut storage) = buffer.inner.storage.write() {
            for (i, &value) in data.iter().enumerate() {
                storage.store(i, value, Bf16Rounding::NearestEven);
            }
        }
        buffer
    }

    /// Upload `data` into the start of the buffer
    pub fn copy_from_host(&self, data: &[f32]) -> FlashResult<()> {
        if data.len() > self.inner.len {
            return Err(FlashError::InvalidParameters(format!(
                "copy_from_host: {} elements into buffer {} of {} elements",
                data.len(),
                self.inner.id,
                self.inner.len
            )));
        }
        let mut storage = self.write()?;
        for (i, &value) in data.iter().enumerate() {
            storage.store(i, value, Bf16Rounding::NearestEven);
        }
        Ok(())
    }

    /// Download the whole buffer as f32
    pub fn to_host(&self) -> FlashResult<Vec<f32>> {
        let storage = self.read()?;
        Ok((0..storage.len()).map(|i| storage.load(i)).collect())
    }

    /// Download the start of the buffer into `out`
    pub fn copy_to_host(&self, out: &mut [f32]) -> FlashResult<()> {
        if out.len() > self.inner.len {
            return Err(FlashError::InvalidParameters(format!(
                "copy_to_host: {} elements requested from buffer {} of {} elements",
                out.len(),
                self.inner.id,
                self.inner.len
            )));
        }
        let storage = self.read()?;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = storage.load(i);
        }
        Ok(())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.inner.len * self.inner.dtype.size_in_bytes()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True if both handles refer to the same allocation
    pub fn same_allocation(&self, other: &HipBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self) -> FlashResult<RwLockReadGuard<'_, BufferStorage>> {
        Ok(self.inner.storage.read()?)
    }

    pub(crate) fn write(&self) -> FlashResult<RwLockWriteGuard<'_, BufferStorage>> {
        Ok(self.inner.storage.write()?)
    }

    pub(crate) fn set_tag(&self, tag: Option<u64>) -> FlashResult<()> {
        *self.inner.tag.lock()? = tag;
        Ok(())
    }

    pub(crate) fn tag(&self) -> FlashResult<Option<u64>> {
        Ok(*self.inner.tag.lock()?)
    }

    #[cfg(test)]
    pub(crate) fn poison_tag(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.inner.tag.lock();
                    panic!("tag holder panicked");
                })
                .join();
        });
    }
}
