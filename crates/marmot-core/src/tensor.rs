use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::memory::MemoryContext;
use crate::shape::Shape;
use crate::synced::SyncedBuffer;

// Tensor — a named array with a values buffer and a gradient buffer
//
// Tensors live in a graph's arena and are addressed by TensorId; nodes store
// ids, never references. Both buffers are SyncedBuffers behind
// Arc<RwLock<_>>:
//
//   - the Arc lets parameters alias another tensor's buffer (weight tying,
//     cross-graph sharing); the buffer lives as long as its longest holder
//   - the RwLock lets forward/backward mutate through `&Tensor`, which is
//     what makes an in-place node (top and bottom are the same tensor) work
//
// CAPACITY:
//
//   A tensor remembers how many bytes its buffers hold. Reshaping to an equal
//   or smaller element count reuses them; growing swaps in fresh buffers
//   *inside* the existing locks, so every alias sees the new storage.
//
// Value accessors always go through the host copy. Reading may sync from
// the device; writing marks the device copy stale.

/// Index of a tensor in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct Tensor {
    id: TensorId,
    name: String,
    shape: RwLock<Shape>,
    data: Arc<RwLock<SyncedBuffer>>,
    diff: Arc<RwLock<SyncedBuffer>>,
    ctx: MemoryContext,
}

impl Tensor {
    /// A tensor of the given shape. No memory is allocated until first use.
    pub fn new(id: TensorId, name: impl Into<String>, shape: impl Into<Shape>, ctx: MemoryContext) -> Self {
        let shape = shape.into();
        let bytes = shape.byte_size();
        Tensor {
            id,
            name: name.into(),
            data: Arc::new(RwLock::new(SyncedBuffer::new(bytes, ctx.clone()))),
            diff: Arc::new(RwLock::new(SyncedBuffer::new(bytes, ctx.clone()))),
            shape: RwLock::new(shape),
            ctx,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Shape {
        self.shape.read().expect("shape lock poisoned").clone()
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.shape.read().expect("shape lock poisoned").elem_count()
    }

    pub fn context(&self) -> &MemoryContext {
        &self.ctx
    }

    /// Bytes reserved by the values buffer.
    pub fn capacity_bytes(&self) -> usize {
        self.data.read().expect("buffer lock poisoned").size()
    }

    /// Change the shape. Buffers are only replaced when the new shape needs
    /// more bytes than they hold.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        let bytes = shape.checked_byte_size()?;
        for buf in [&self.data, &self.diff] {
            let mut guard = buf.write().expect("buffer lock poisoned");
            if bytes > guard.size() {
                *guard = SyncedBuffer::new(bytes, self.ctx.clone());
            }
        }
        *self.shape.write().expect("shape lock poisoned") = shape;
        Ok(())
    }

    // Values

    /// Copy of the values.
    pub fn values(&self) -> Result<Vec<f32>> {
        self.with_values(|v| v.to_vec())
    }

    pub fn with_values<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let n = self.count();
        let mut buf = self.data.write().expect("buffer lock poisoned");
        Ok(f(&buf.host_f32()?[..n]))
    }

    pub fn with_values_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        let n = self.count();
        let mut buf = self.data.write().expect("buffer lock poisoned");
        Ok(f(&mut buf.mutable_host_f32()?[..n]))
    }

    /// Overwrite the values. `values` must hold exactly `count()` elements.
    pub fn set_values(&self, values: &[f32]) -> Result<()> {
        self.check_len(values.len())?;
        self.with_values_mut(|dst| dst.copy_from_slice(values))
    }

    pub fn sum_values(&self) -> Result<f32> {
        self.with_values(|v| v.iter().sum())
    }

    /// Sum of absolute values.
    pub fn asum_values(&self) -> Result<f32> {
        self.with_values(|v| v.iter().map(|x| x.abs()).sum())
    }

    // Gradients

    /// Copy of the gradients.
    pub fn grads(&self) -> Result<Vec<f32>> {
        self.with_grads(|g| g.to_vec())
    }

    pub fn with_grads<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let n = self.count();
        let mut buf = self.diff.write().expect("buffer lock poisoned");
        Ok(f(&buf.host_f32()?[..n]))
    }

    pub fn with_grads_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        let n = self.count();
        let mut buf = self.diff.write().expect("buffer lock poisoned");
        Ok(f(&mut buf.mutable_host_f32()?[..n]))
    }

    /// Overwrite the gradients.
    pub fn set_grads(&self, grads: &[f32]) -> Result<()> {
        self.check_len(grads.len())?;
        self.with_grads_mut(|dst| dst.copy_from_slice(grads))
    }

    /// Add `delta` element-wise into the gradients.
    pub fn accumulate_grads(&self, delta: &[f32]) -> Result<()> {
        self.check_len(delta.len())?;
        self.with_grads_mut(|dst| {
            for (d, x) in dst.iter_mut().zip(delta) {
                *d += x;
            }
        })
    }

    pub fn fill_grads(&self, value: f32) -> Result<()> {
        self.with_grads_mut(|dst| dst.fill(value))
    }

    /// Zero the gradients in whichever space the context computes in. On an
    /// accelerated context the device copy is cleared and becomes
    /// authoritative.
    pub fn zero_grads(&self) -> Result<()> {
        match self.ctx.device() {
            Some(dev) => {
                let bytes = self.shape().byte_size();
                let mut buf = self.diff.write().expect("buffer lock poisoned");
                let ptr = buf.mutable_device_data()?;
                dev.fill_zero(ptr, bytes)
            }
            None => self.fill_grads(0.0),
        }
    }

    pub fn asum_grads(&self) -> Result<f32> {
        self.with_grads(|g| g.iter().map(|x| x.abs()).sum())
    }

    /// Apply the accumulated gradient: `values -= grads`.
    pub fn update(&self) -> Result<()> {
        let grads = self.grads()?;
        self.with_values_mut(|v| {
            for (x, g) in v.iter_mut().zip(&grads) {
                *x -= g;
            }
        })
    }

    // Sharing

    /// Alias `other`'s values buffer. Both tensors must hold the same number
    /// of elements.
    pub fn share_values(&mut self, other: &Tensor) -> Result<()> {
        self.check_len(other.count())?;
        self.data = other.data.clone();
        Ok(())
    }

    /// Alias `other`'s gradient buffer.
    pub fn share_grads(&mut self, other: &Tensor) -> Result<()> {
        self.check_len(other.count())?;
        self.diff = other.diff.clone();
        Ok(())
    }

    pub fn shares_values_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn shares_grads_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.diff, &other.diff)
    }

    /// Direct access to the values buffer, for device-side users.
    pub fn data_buffer(&self) -> RwLockWriteGuard<'_, SyncedBuffer> {
        self.data.write().expect("buffer lock poisoned")
    }

    /// Direct access to the gradient buffer.
    pub fn diff_buffer(&self) -> RwLockWriteGuard<'_, SyncedBuffer> {
        self.diff.write().expect("buffer lock poisoned")
    }

    fn check_len(&self, got: usize) -> Result<()> {
        let shape = self.shape();
        let expected = shape.elem_count();
        if got != expected {
            return Err(Error::ElementCountMismatch { shape, expected, got });
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({} '{}', shape={})", self.id, self.name, self.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synced::SyncedHead;

    fn host_tensor(shape: impl Into<Shape>) -> Tensor {
        Tensor::new(TensorId(0), "t", shape, MemoryContext::HostOnly)
    }

    #[test]
    fn test_new_tensor_reads_zero() {
        let t = host_tensor((2, 3));
        assert_eq!(t.count(), 6);
        assert_eq!(t.values().unwrap(), vec![0.0; 6]);
        assert_eq!(t.grads().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_set_values_checks_length() {
        let t = host_tensor(3);
        t.set_values(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(t.sum_values().unwrap(), 6.0);
        let err = t.set_values(&[1.0]).unwrap_err();
        assert!(matches!(err, Error::ElementCountMismatch { expected: 3, got: 1, .. }));
    }

    #[test]
    fn test_accumulate_grads_adds() {
        let t = host_tensor(2);
        t.accumulate_grads(&[1.0, 2.0]).unwrap();
        t.accumulate_grads(&[0.5, 0.5]).unwrap();
        assert_eq!(t.grads().unwrap(), vec![1.5, 2.5]);
        t.zero_grads().unwrap();
        assert_eq!(t.grads().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_update_subtracts_grads() {
        let t = host_tensor(2);
        t.set_values(&[1.0, 1.0]).unwrap();
        t.set_grads(&[0.25, -0.5]).unwrap();
        t.update().unwrap();
        assert_eq!(t.values().unwrap(), vec![0.75, 1.5]);
    }

    #[test]
    fn test_reshape_reuses_capacity() {
        let t = host_tensor(4);
        t.set_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        t.reshape(2).unwrap();
        assert_eq!(t.capacity_bytes(), 16);
        assert_eq!(t.values().unwrap(), vec![1.0, 2.0]);

        t.reshape((2, 4)).unwrap();
        assert_eq!(t.capacity_bytes(), 32);
        assert_eq!(t.values().unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn test_reshape_rejects_oversized_shape() {
        let t = host_tensor(4);
        let err = t.reshape(vec![usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
        assert_eq!(t.shape(), Shape::from(4));
        assert_eq!(t.capacity_bytes(), 16);
    }

    #[test]
    fn test_share_values_keeps_grads_independent() {
        let owner = host_tensor(2);
        let mut sharer = Tensor::new(TensorId(1), "s", 2, MemoryContext::HostOnly);
        owner.set_values(&[3.0, 4.0]).unwrap();
        sharer.share_values(&owner).unwrap();

        assert!(sharer.shares_values_with(&owner));
        assert!(!sharer.shares_grads_with(&owner));
        assert_eq!(sharer.values().unwrap(), vec![3.0, 4.0]);

        sharer.accumulate_grads(&[1.0, 1.0]).unwrap();
        assert_eq!(owner.grads().unwrap(), vec![0.0, 0.0]);

        sharer.set_values(&[5.0, 6.0]).unwrap();
        assert_eq!(owner.values().unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_share_rejects_count_mismatch() {
        let owner = host_tensor(3);
        let mut sharer = host_tensor(2);
        assert!(sharer.share_values(&owner).is_err());
    }

    #[test]
    fn test_zero_grads_on_device() {
        let (ctx, dev) = MemoryContext::simulated();
        let t = Tensor::new(TensorId(0), "t", 2, ctx);
        t.set_grads(&[1.0, 2.0]).unwrap();
        t.zero_grads().unwrap();
        assert_eq!(t.diff_buffer().head(), SyncedHead::AtDevice);
        assert_eq!(t.grads().unwrap(), vec![0.0, 0.0]);
        assert_eq!(dev.stats().device_to_host, 1);
    }

    #[test]
    fn test_values_buffer_pushed_to_device() {
        let (ctx, dev) = MemoryContext::simulated();
        let t = Tensor::new(TensorId(0), "t", 2, ctx);
        t.set_values(&[1.0, 2.0]).unwrap();
        t.data_buffer().async_device_push().unwrap();
        assert_eq!(t.data_buffer().head(), SyncedHead::Synced);
        assert_eq!(dev.stats().async_pushes, 1);
        assert_eq!(t.values().unwrap(), vec![1.0, 2.0]);
    }
}
