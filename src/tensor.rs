//! Tensor schema consumed from the graph layer.
//!
//! The backend only reads shapes, byte strides, element types and the
//! backend tag; graph construction and scheduling stay on the caller's
//! side. A GPU-resident tensor carries its device [`Buffer`] directly.

use crate::memory::Buffer;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    F32,
    F16,
    /// 4-bit blocks of 32 values with a shared f16 scale. The device-side
    /// layout is fixed by the dequantization shaders; the host only needs
    /// the byte size per block.
    Q4_0,
}

impl TensorType {
    /// Bytes per block of this type.
    pub fn type_size(self) -> usize {
        match self {
            TensorType::F32 => 4,
            TensorType::F16 => 2,
            TensorType::Q4_0 => 18,
        }
    }

    /// Elements per block of this type.
    pub fn block_size(self) -> usize {
        match self {
            TensorType::F32 | TensorType::F16 => 1,
            TensorType::Q4_0 => 32,
        }
    }

    /// True for block-quantized types.
    pub fn is_quantized(self) -> bool {
        matches!(self, TensorType::Q4_0)
    }

    /// Byte length of one logical row of `n` elements.
    pub fn row_size(self, n: i64) -> usize {
        self.type_size() * n as usize / self.block_size()
    }
}

/// Where a tensor's data currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorBackend {
    Cpu,
    Gpu,
    GpuSplit,
}

/// Operation attached to a destination tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOp {
    None,
    Mul,
    MulMat,
}

/// Storage behind a tensor descriptor.
pub enum TensorData {
    None,
    /// CPU-resident bytes, owned by the graph layer.
    Host(*mut u8),
    /// GPU-resident buffer, owned by this backend.
    Device(Box<Buffer>),
}

impl TensorData {
    pub fn host_ptr(&self) -> *mut u8 {
        match self {
            TensorData::Host(p) => *p,
            _ => panic!("tensor data is not host-resident"),
        }
    }

    pub fn device_buffer(&self) -> &Buffer {
        match self {
            TensorData::Device(b) => b,
            _ => panic!("tensor data is not device-resident"),
        }
    }
}

/// 4-D tensor descriptor. `ne` holds element counts, `nb` byte strides
/// per dimension (`nb[0]` is the element/block stride).
pub struct Tensor {
    pub ty: TensorType,
    pub backend: TensorBackend,
    pub op: TensorOp,
    pub ne: [i64; 4],
    pub nb: [usize; 4],
    pub data: TensorData,
}

// Host pointers are handed in by the graph layer, which guarantees they
// stay valid and unaliased for the duration of a compute call.
unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

impl Tensor {
    /// Contiguous CPU tensor with derived strides.
    pub fn new(ty: TensorType, ne: [i64; 4], data: *mut u8) -> Self {
        let ts = ty.type_size();
        let bs = ty.block_size();
        let nb0 = ts;
        let nb1 = ts * ne[0] as usize / bs;
        let nb2 = nb1 * ne[1] as usize;
        let nb3 = nb2 * ne[2] as usize;
        Tensor {
            ty,
            backend: TensorBackend::Cpu,
            op: TensorOp::None,
            ne,
            nb: [nb0, nb1, nb2, nb3],
            data: TensorData::Host(data),
        }
    }

    /// Total element count.
    pub fn nelements(&self) -> i64 {
        self.ne[0] * self.ne[1] * self.ne[2] * self.ne[3]
    }
}

/// Which phase of a graph task is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Init,
    Compute,
    Finalize,
}

/// Per-worker task parameters handed down by the graph scheduler.
pub struct ComputeParams {
    pub phase: TaskPhase,
    /// Worker index; only worker 0 performs GPU work.
    pub ith: usize,
    pub nth: usize,
}

impl ComputeParams {
    pub fn compute_root() -> Self {
        ComputeParams { phase: TaskPhase::Compute, ith: 0, nth: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_metadata() {
        assert_eq!(TensorType::F32.type_size(), 4);
        assert_eq!(TensorType::F16.type_size(), 2);
        assert_eq!(TensorType::Q4_0.type_size(), 18);
        assert_eq!(TensorType::Q4_0.block_size(), 32);
        assert!(TensorType::Q4_0.is_quantized());
        assert!(!TensorType::F16.is_quantized());
    }

    #[test]
    fn row_size_accounts_for_blocks() {
        assert_eq!(TensorType::F32.row_size(128), 512);
        assert_eq!(TensorType::F16.row_size(128), 256);
        // 128 elements = 4 blocks of 18 bytes
        assert_eq!(TensorType::Q4_0.row_size(128), 72);
    }

    #[test]
    fn contiguous_strides() {
        let t = Tensor::new(TensorType::F32, [8, 4, 2, 1], std::ptr::null_mut());
        assert_eq!(t.nb, [4, 32, 128, 256]);
        assert_eq!(t.nelements(), 64);
    }
}
