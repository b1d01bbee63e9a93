// SyncedBuffer — one logical byte buffer with a host copy and a device copy
//
// The head state records which copy is authoritative:
//
//   Uninitialized  nothing allocated yet
//   AtHost         host copy is valid, device copy (if any) is stale
//   AtDevice       device copy is valid, host copy (if any) is stale
//   Synced         both copies hold the same bytes
//
// Transitions happen only inside the accessors:
//
//   host_data            Uninitialized → AtHost (zeroed),   AtDevice → Synced (copy)
//   mutable_host_data    as host_data, then → AtHost
//   device_data          Uninitialized → AtDevice (zeroed), AtHost → Synced (copy)
//   mutable_device_data  as device_data, then → AtDevice
//   set_host_data        → AtHost, host copy not owned
//   set_device_data      → AtDevice, device copy not owned
//   async_device_push    AtHost → Synced (enqueued copy)
//
// Allocation is lazy. A write never copies eagerly to the other side; it
// only marks that side stale, keeping its allocation for the next sync.

use std::fmt;

use crate::error::{Error, Result};
use crate::memory::{DeviceMemory, DevicePtr, HostBlock, MemoryContext};

/// Which copy of a [`SyncedBuffer`] is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncedHead {
    Uninitialized,
    AtHost,
    AtDevice,
    Synced,
}

/// A byte buffer kept coherent between host and accelerator memory.
pub struct SyncedBuffer {
    size: usize,
    host: Option<HostBlock>,
    device: Option<DevicePtr>,
    own_host: bool,
    own_device: bool,
    head: SyncedHead,
    ctx: MemoryContext,
}

impl SyncedBuffer {
    /// A buffer of `size` bytes. Nothing is allocated until first access.
    pub fn new(size: usize, ctx: MemoryContext) -> Self {
        SyncedBuffer {
            size,
            host: None,
            device: None,
            own_host: false,
            own_device: false,
            head: SyncedHead::Uninitialized,
            ctx,
        }
    }

    pub fn head(&self) -> SyncedHead {
        self.head
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn context(&self) -> &MemoryContext {
        &self.ctx
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn owns_host(&self) -> bool {
        self.host.is_some() && self.own_host
    }

    pub fn owns_device(&self) -> bool {
        self.device.is_some() && self.own_device
    }

    fn device_handle(&self) -> Result<&dyn DeviceMemory> {
        self.ctx.device().map(|d| d.as_ref()).ok_or(Error::NoDevice)
    }

    fn to_host(&mut self) -> Result<()> {
        match self.head {
            SyncedHead::Uninitialized => {
                self.host = Some(HostBlock::zeroed(self.size)?);
                self.own_host = true;
                self.head = SyncedHead::AtHost;
            }
            SyncedHead::AtDevice => {
                if self.host.is_none() {
                    self.host = Some(HostBlock::zeroed(self.size)?);
                    self.own_host = true;
                }
                let src = self
                    .device
                    .ok_or_else(|| Error::InvalidState("head at device without an allocation".into()))?;
                let dev = self.ctx.device().ok_or(Error::NoDevice)?;
                if let Some(host) = self.host.as_mut() {
                    dev.copy_device_to_host(src, host.as_bytes_mut())?;
                }
                tracing::trace!(bytes = self.size, "synced device -> host");
                self.head = SyncedHead::Synced;
            }
            SyncedHead::AtHost | SyncedHead::Synced => {}
        }
        Ok(())
    }

    fn to_device(&mut self) -> Result<()> {
        self.device_handle()?;
        match self.head {
            SyncedHead::Uninitialized => {
                let ptr = self.device_handle()?.alloc_zeroed(self.size)?;
                self.device = Some(ptr);
                self.own_device = true;
                self.head = SyncedHead::AtDevice;
            }
            SyncedHead::AtHost => {
                let dst = self.ensure_device_alloc()?;
                if let Some(host) = self.host.as_ref() {
                    self.device_handle()?
                        .copy_host_to_device(host.as_bytes(), dst)?;
                }
                tracing::trace!(bytes = self.size, "synced host -> device");
                self.head = SyncedHead::Synced;
            }
            SyncedHead::AtDevice | SyncedHead::Synced => {}
        }
        Ok(())
    }

    fn ensure_device_alloc(&mut self) -> Result<DevicePtr> {
        match self.device {
            Some(ptr) => Ok(ptr),
            None => {
                let ptr = self.device_handle()?.alloc_zeroed(self.size)?;
                self.device = Some(ptr);
                self.own_device = true;
                Ok(ptr)
            }
        }
    }

    fn host_block(&self) -> Result<&HostBlock> {
        self.host
            .as_ref()
            .ok_or_else(|| Error::InvalidState("host copy missing after sync".into()))
    }

    fn host_block_mut(&mut self) -> Result<&mut HostBlock> {
        self.host
            .as_mut()
            .ok_or_else(|| Error::InvalidState("host copy missing after sync".into()))
    }

    /// Read access to the host copy, syncing from the device if needed.
    pub fn host_data(&mut self) -> Result<&[u8]> {
        self.to_host()?;
        Ok(self.host_block()?.as_bytes())
    }

    /// Write access to the host copy. The device copy becomes stale.
    pub fn mutable_host_data(&mut self) -> Result<&mut [u8]> {
        self.to_host()?;
        self.head = SyncedHead::AtHost;
        Ok(self.host_block_mut()?.as_bytes_mut())
    }

    /// The host copy viewed as f32, syncing from the device if needed.
    pub fn host_f32(&mut self) -> Result<&[f32]> {
        self.to_host()?;
        Ok(self.host_block()?.as_f32())
    }

    /// Mutable f32 view of the host copy. The device copy becomes stale.
    pub fn mutable_host_f32(&mut self) -> Result<&mut [f32]> {
        self.to_host()?;
        self.head = SyncedHead::AtHost;
        Ok(self.host_block_mut()?.as_f32_mut())
    }

    /// Read access to the device copy, syncing from the host if needed.
    pub fn device_data(&mut self) -> Result<DevicePtr> {
        self.to_device()?;
        self.device
            .ok_or_else(|| Error::InvalidState("device copy missing after sync".into()))
    }

    /// Write access to the device copy. The host copy becomes stale.
    pub fn mutable_device_data(&mut self) -> Result<DevicePtr> {
        let ptr = self.device_data()?;
        self.head = SyncedHead::AtDevice;
        Ok(ptr)
    }

    /// Adopt an externally provided host block.
    ///
    /// An owned host copy is dropped. A previously adopted block is not ours
    /// to release and is handed back to the caller.
    pub fn set_host_data(&mut self, block: HostBlock) -> Result<Option<HostBlock>> {
        if block.len() < self.size {
            return Err(Error::msg(format!(
                "adopted host block of {} bytes is smaller than the buffer ({} bytes)",
                block.len(),
                self.size
            )));
        }
        let previous = self.host.replace(block);
        let handed_back = if self.own_host { None } else { previous };
        self.own_host = false;
        self.head = SyncedHead::AtHost;
        Ok(handed_back)
    }

    /// Adopt an externally owned device allocation. An owned device copy is
    /// freed; the adopted one will never be freed by this buffer.
    pub fn set_device_data(&mut self, ptr: DevicePtr) -> Result<()> {
        let dev = self.device_handle()?;
        if let Some(old) = self.device {
            if self.own_device && old != ptr {
                dev.free(old);
            }
        }
        self.device = Some(ptr);
        self.own_device = false;
        self.head = SyncedHead::AtDevice;
        Ok(())
    }

    /// Enqueue a host → device copy without waiting for it. Requires the
    /// host copy to be authoritative.
    pub fn async_device_push(&mut self) -> Result<()> {
        if self.head != SyncedHead::AtHost {
            return Err(Error::InvalidState(format!(
                "async push requires the head at host, found {:?}",
                self.head
            )));
        }
        let dst = self.ensure_device_alloc()?;
        let dev = self.device_handle()?;
        dev.enqueue_host_to_device(self.host_block()?.as_bytes(), dst)?;
        self.head = SyncedHead::Synced;
        Ok(())
    }
}

impl Drop for SyncedBuffer {
    fn drop(&mut self) {
        if let (Some(ptr), true) = (self.device, self.own_device) {
            if let Some(dev) = self.ctx.device() {
                dev.free(ptr);
            }
        }
    }
}

impl fmt::Debug for SyncedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedBuffer")
            .field("size", &self.size)
            .field("head", &self.head)
            .field("host", &self.host.is_some())
            .field("device", &self.device)
            .finish()
    }
}
