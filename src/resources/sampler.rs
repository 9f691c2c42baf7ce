//! Samplers and semaphores.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::RhiResult;
use crate::queue::NativeHandle;
use crate::types::SamplerDescriptor;

pub struct Sampler {
    shared: Arc<DeviceShared>,
    handle: vk::Sampler,
    descriptor: SamplerDescriptor,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

impl Sampler {
    pub(crate) fn new(shared: Arc<DeviceShared>, descriptor: &SamplerDescriptor) -> RhiResult<Self> {
        let handle = shared.driver.create_sampler(descriptor)?;
        Ok(Self {
            shared,
            handle,
            descriptor: descriptor.clone(),
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.descriptor
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shared.destroy_deferred(NativeHandle::Sampler(self.handle));
    }
}

/// A binary semaphore ordering work between submissions.
pub struct Semaphore {
    shared: Arc<DeviceShared>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore").field("handle", &self.handle).finish()
    }
}

impl Semaphore {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> RhiResult<Self> {
        let handle = shared.driver.create_semaphore()?;
        Ok(Self { shared, handle })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.shared.destroy_deferred(NativeHandle::Semaphore(self.handle));
    }
}
