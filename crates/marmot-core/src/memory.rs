// Memory spaces — host blocks, the accelerator trait, and the simulated device
//
// A SyncedBuffer keeps up to two copies of its bytes: one in host memory
// (a HostBlock) and one in accelerator memory (a DevicePtr handed out by a
// DeviceMemory implementation). The physical transfer primitives live
// behind the DeviceMemory trait so the coherency protocol can be exercised
// without real hardware; SimulatedDevice backs "device memory" with host
// vectors and counts every transfer.
//
// Which memory spaces a buffer may use is decided by the MemoryContext it is
// constructed with, not by process-wide state. Host-only and accelerated
// buffers can therefore live side by side.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// The two memory spaces a buffer can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Host,
    Device,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Host => write!(f, "host"),
            MemorySpace::Device => write!(f, "device"),
        }
    }
}

// HostBlock

/// A zero-initialized, 8-byte aligned block of host memory.
///
/// Backed by `u64` words so the bytes can be reinterpreted as `f32` with
/// `bytemuck` without any alignment check failing.
#[derive(Clone, PartialEq, Eq)]
pub struct HostBlock {
    words: Vec<u64>,
    len: usize,
}

impl HostBlock {
    /// Allocate `len` zeroed bytes. Fails with [`Error::Allocation`] instead
    /// of aborting when the allocator cannot satisfy the request.
    pub fn zeroed(len: usize) -> Result<Self> {
        let n_words = len.div_ceil(8);
        let mut words: Vec<u64> = Vec::new();
        words
            .try_reserve_exact(n_words)
            .map_err(|_| Error::Allocation {
                space: MemorySpace::Host,
                bytes: len,
            })?;
        words.resize(n_words, 0);
        Ok(HostBlock { words, len })
    }

    /// Copy raw bytes into a new block.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut block = Self::zeroed(bytes.len())?;
        block.as_bytes_mut().copy_from_slice(bytes);
        Ok(block)
    }

    /// Copy f32 values into a new block.
    pub fn from_f32(values: &[f32]) -> Result<Self> {
        Self::from_bytes(bytemuck::cast_slice(values))
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    /// The block viewed as f32 values (trailing bytes that do not form a
    /// whole f32 are not visible).
    pub fn as_f32(&self) -> &[f32] {
        &bytemuck::cast_slice::<u64, f32>(&self.words)[..self.len / 4]
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        let n = self.len / 4;
        &mut bytemuck::cast_slice_mut::<u64, f32>(&mut self.words)[..n]
    }
}

impl fmt::Debug for HostBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostBlock({} bytes)", self.len)
    }
}

// DeviceMemory

/// Opaque handle to an accelerator allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Accelerator memory primitives used by [`SyncedBuffer`](crate::SyncedBuffer).
///
/// Implementations must be shareable across threads; buffers hold them as
/// `Arc<dyn DeviceMemory>`.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Human-readable device name (e.g. "sim:0").
    fn name(&self) -> String;

    /// Allocate `bytes` zeroed bytes.
    fn alloc_zeroed(&self, bytes: usize) -> Result<DevicePtr>;

    /// Release an allocation made by [`alloc_zeroed`](Self::alloc_zeroed).
    fn free(&self, ptr: DevicePtr);

    /// Blocking copy of `src` into the start of `dst`.
    fn copy_host_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()>;

    /// Blocking copy of the start of `src` into `dst`.
    fn copy_device_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Enqueue a host → device copy without waiting for it.
    fn enqueue_host_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        self.copy_host_to_device(src, dst)
    }

    /// Zero the first `bytes` bytes of an allocation.
    fn fill_zero(&self, ptr: DevicePtr, bytes: usize) -> Result<()>;
}

/// Snapshot of a [`SimulatedDevice`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Blocking host → device copies.
    pub host_to_device: u64,
    /// Blocking device → host copies.
    pub device_to_host: u64,
    /// Enqueued (asynchronous) host → device copies.
    pub async_pushes: u64,
    pub allocations: u64,
    pub frees: u64,
    /// Bytes currently allocated.
    pub bytes_in_use: usize,
}

/// An accelerator simulated in host memory.
///
/// Every allocation is a separate byte vector keyed by its pointer value.
/// An optional capacity makes allocations fail once the simulated memory is
/// exhausted, which is how allocation errors are exercised in tests.
pub struct SimulatedDevice {
    ordinal: usize,
    capacity: Option<usize>,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    next_ptr: AtomicU64,
    bytes_in_use: AtomicUsize,

    host_to_device: AtomicU64,
    device_to_host: AtomicU64,
    async_pushes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl SimulatedDevice {
    /// An unbounded simulated device.
    pub fn new(ordinal: usize) -> Self {
        SimulatedDevice {
            ordinal,
            capacity: None,
            blocks: Mutex::new(HashMap::new()),
            next_ptr: AtomicU64::new(1),
            bytes_in_use: AtomicUsize::new(0),
            host_to_device: AtomicU64::new(0),
            device_to_host: AtomicU64::new(0),
            async_pushes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    /// A simulated device that refuses to hold more than `bytes` at once.
    pub fn with_capacity(ordinal: usize, bytes: usize) -> Self {
        SimulatedDevice {
            capacity: Some(bytes),
            ..Self::new(ordinal)
        }
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            host_to_device: self.host_to_device.load(Ordering::Relaxed),
            device_to_host: self.device_to_host.load(Ordering::Relaxed),
            async_pushes: self.async_pushes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            bytes_in_use: self.bytes_in_use.load(Ordering::Relaxed),
        }
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.blocks.lock().expect("device lock poisoned").len()
    }

    /// Whether `ptr` still refers to a live allocation.
    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.blocks
            .lock()
            .expect("device lock poisoned")
            .contains_key(&ptr.0)
    }

    /// Copy an allocation's contents out, bypassing the transfer counters.
    /// Stands in for inspecting device memory with a debugger.
    pub fn peek(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.blocks
            .lock()
            .expect("device lock poisoned")
            .get(&ptr.0)
            .cloned()
    }

    /// Overwrite the start of an allocation, bypassing the transfer counters.
    /// Stands in for a device kernel writing its output.
    pub fn poke(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock().expect("device lock poisoned");
        let block = blocks
            .get_mut(&ptr.0)
            .ok_or_else(|| Error::msg(format!("unknown device pointer {:?}", ptr)))?;
        copy_prefix(bytes, block)
    }

    fn with_block<R>(&self, ptr: DevicePtr, f: impl FnOnce(&mut Vec<u8>) -> Result<R>) -> Result<R> {
        let mut blocks = self.blocks.lock().expect("device lock poisoned");
        let block = blocks
            .get_mut(&ptr.0)
            .ok_or_else(|| Error::msg(format!("unknown device pointer {:?}", ptr)))?;
        f(block)
    }
}

fn copy_prefix(src: &[u8], dst: &mut [u8]) -> Result<()> {
    if src.len() > dst.len() {
        return Err(Error::msg(format!(
            "copy of {} bytes into an allocation of {} bytes",
            src.len(),
            dst.len()
        )));
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("ordinal", &self.ordinal)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DeviceMemory for SimulatedDevice {
    fn name(&self) -> String {
        format!("sim:{}", self.ordinal)
    }

    fn alloc_zeroed(&self, bytes: usize) -> Result<DevicePtr> {
        let failed = || Error::Allocation {
            space: MemorySpace::Device,
            bytes,
        };
        let in_use = self.bytes_in_use.load(Ordering::Relaxed);
        if let Some(cap) = self.capacity {
            if in_use.checked_add(bytes).map_or(true, |total| total > cap) {
                return Err(failed());
            }
        }
        let mut block: Vec<u8> = Vec::new();
        block.try_reserve_exact(bytes).map_err(|_| failed())?;
        block.resize(bytes, 0);
        let id = self.next_ptr.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .lock()
            .expect("device lock poisoned")
            .insert(id, block);
        self.bytes_in_use.fetch_add(bytes, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DevicePtr(id))
    }

    fn free(&self, ptr: DevicePtr) {
        let removed = self
            .blocks
            .lock()
            .expect("device lock poisoned")
            .remove(&ptr.0);
        if let Some(block) = removed {
            self.bytes_in_use.fetch_sub(block.len(), Ordering::Relaxed);
            self.frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn copy_host_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        self.with_block(dst, |block| copy_prefix(src, block))?;
        self.host_to_device.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy_device_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.with_block(src, |block| {
            if dst.len() > block.len() {
                return Err(Error::msg(format!(
                    "copy of {} bytes out of an allocation of {} bytes",
                    dst.len(),
                    block.len()
                )));
            }
            dst.copy_from_slice(&block[..dst.len()]);
            Ok(())
        })?;
        self.device_to_host.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn enqueue_host_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        self.with_block(dst, |block| copy_prefix(src, block))?;
        self.async_pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fill_zero(&self, ptr: DevicePtr, bytes: usize) -> Result<()> {
        self.with_block(ptr, |block| {
            let n = bytes.min(block.len());
            block[..n].fill(0);
            Ok(())
        })
    }
}

// MemoryContext

/// Which memory spaces a buffer may use.
///
/// Passed explicitly to every buffer at construction.
#[derive(Debug, Clone, Default)]
pub enum MemoryContext {
    /// Host memory only; device accessors fail with [`Error::NoDevice`].
    #[default]
    HostOnly,
    /// Host memory plus the given accelerator.
    Accelerated(Arc<dyn DeviceMemory>),
}

impl MemoryContext {
    /// Accelerated context on a fresh unbounded [`SimulatedDevice`]. The
    /// device handle is returned too so callers can read its statistics.
    pub fn simulated() -> (Self, Arc<SimulatedDevice>) {
        let device = Arc::new(SimulatedDevice::new(0));
        (MemoryContext::Accelerated(device.clone()), device)
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceMemory>> {
        match self {
            MemoryContext::HostOnly => None,
            MemoryContext::Accelerated(dev) => Some(dev),
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, MemoryContext::Accelerated(_))
    }
}
