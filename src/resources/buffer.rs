//! GPU buffers.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::queue::NativeHandle;
use crate::sync::BufferSyncState;
use crate::types::{BufferDescriptor, BufferUsage};

/// A GPU buffer.
///
/// The native buffer is destroyed once the last reference is gone and no
/// GPU work submitted before that point can still read it.
pub struct Buffer {
    shared: Arc<DeviceShared>,
    handle: vk::Buffer,
    descriptor: BufferDescriptor,
    sync: Arc<BufferSyncState>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("label", &self.descriptor.label)
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(shared: Arc<DeviceShared>, descriptor: &BufferDescriptor) -> RhiResult<Self> {
        if descriptor.size == 0 {
            return Err(RhiError::invalid_state("buffer size must be non-zero"));
        }
        let handle = shared.driver.create_buffer(descriptor)?;
        Ok(Self {
            shared,
            handle,
            descriptor: descriptor.clone(),
            sync: Arc::new(BufferSyncState::new(handle)),
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.descriptor.usage
    }

    /// State carried between command lists.
    pub fn sync_state(&self) -> &Arc<BufferSyncState> {
        &self.sync
    }

    fn check_host_range(&self, offset: u64, len: usize) -> RhiResult<()> {
        if !self.descriptor.location.is_host_visible() {
            return Err(RhiError::invalid_state(format!(
                "buffer {:?} is not host visible",
                self.descriptor.label
            )));
        }
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.descriptor.size) {
            return Err(RhiError::invalid_state(format!(
                "host access of {} bytes at {} exceeds buffer size {}",
                len, offset, self.descriptor.size
            )));
        }
        Ok(())
    }

    /// Write into a host-visible buffer.
    ///
    /// The caller must make sure no pending GPU work reads the range.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.check_host_range(offset, data.len())?;
        self.shared.driver.write_buffer(self.handle, offset, data)
    }

    /// Read from a host-visible buffer.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        self.check_host_range(offset, out.len())?;
        self.shared.driver.read_buffer(self.handle, offset, out)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.shared.destroy_deferred(NativeHandle::Buffer(self.handle));
    }
}
