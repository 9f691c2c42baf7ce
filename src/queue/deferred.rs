//! Deferred destruction of native handles.
//!
//! GPU work runs asynchronously: when the last CPU reference to a resource
//! goes away, command buffers submitted earlier may still read it. Instead
//! of calling the native destroy function right away, the handle is queued
//! together with a snapshot of every queue's submission counter. Once each
//! queue has completed at least that many jobs, nothing submitted before
//! the drop can still be using the handle and it is destroyed.
//!
//! ```text
//! Drop(Resource)
//!   snapshot = [submitted(graphics), submitted(compute), submitted(transfer)]
//!   if completed >= snapshot on every queue -> destroy now
//!   else                                     -> queue (snapshot, handle)
//!
//! Job retired on queue q
//!   completed(q) = job value
//!   destroy every queued handle whose snapshot is reached
//! ```

use ash::vk;

use crate::backend::Driver;
use crate::types::QueueType;

/// Per-queue job counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimelineSnapshot(pub [u64; 3]);

impl TimelineSnapshot {
    pub fn get(&self, queue: QueueType) -> u64 {
        self.0[queue.index()]
    }

    /// Every queue in `completed` has caught up with this snapshot.
    pub fn is_reached_by(&self, completed: &TimelineSnapshot) -> bool {
        self.0.iter().zip(completed.0.iter()).all(|(needed, done)| done >= needed)
    }
}

/// A native handle waiting for the GPU to let go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    ShaderModule(vk::ShaderModule),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
}

impl NativeHandle {
    /// Destroy the handle now.
    ///
    /// The caller must make sure no pending GPU work references it.
    pub fn destroy(self, driver: &dyn Driver) {
        match self {
            NativeHandle::Buffer(buffer) => driver.destroy_buffer(buffer),
            NativeHandle::Image(image) => driver.destroy_image(image),
            NativeHandle::ImageView(view) => driver.destroy_image_view(view),
            NativeHandle::Sampler(sampler) => driver.destroy_sampler(sampler),
            NativeHandle::ShaderModule(module) => driver.destroy_shader_module(module),
            NativeHandle::Pipeline(pipeline) => driver.destroy_pipeline(pipeline),
            NativeHandle::PipelineLayout(layout) => driver.destroy_pipeline_layout(layout),
            NativeHandle::RenderPass(render_pass) => driver.destroy_render_pass(render_pass),
            NativeHandle::Framebuffer(framebuffer) => driver.destroy_framebuffer(framebuffer),
            NativeHandle::Semaphore(semaphore) => driver.destroy_semaphore(semaphore),
            NativeHandle::Fence(fence) => driver.destroy_fence(fence),
        }
    }
}

/// Queue of handles waiting for their submission snapshot to complete.
#[derive(Default)]
pub struct DeferredDestructor {
    pending: Vec<(TimelineSnapshot, NativeHandle)>,
}

impl std::fmt::Debug for DeferredDestructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestructor")
            .field("pending_count", &self.pending.len())
            .finish()
    }
}

impl DeferredDestructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `handle` until every queue has completed `snapshot`.
    pub fn queue(&mut self, snapshot: TimelineSnapshot, handle: NativeHandle) {
        self.pending.push((snapshot, handle));
    }

    /// Take the handles whose snapshot is reached by `completed`.
    ///
    /// Destruction is left to the caller so that it can happen outside
    /// whatever lock guards the destructor.
    pub fn collect(&mut self, completed: &TimelineSnapshot) -> Vec<NativeHandle> {
        let mut ready = Vec::new();
        self.pending.retain(|(snapshot, handle)| {
            if snapshot.is_reached_by(completed) {
                ready.push(*handle);
                false
            } else {
                true
            }
        });
        ready
    }

    /// Destroy everything regardless of timing.
    ///
    /// Only valid once the device is idle.
    pub fn flush_all(&mut self, driver: &dyn Driver) -> usize {
        let count = self.pending.len();
        for (_, handle) in self.pending.drain(..) {
            handle.destroy(driver);
        }
        if count > 0 {
            log::debug!("Flushed {} deferred handles", count);
        }
        count
    }

    /// Number of handles still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullDriver;
    use crate::types::{BufferDescriptor, BufferUsage};

    #[test]
    fn test_snapshot_reached() {
        let snapshot = TimelineSnapshot([3, 0, 1]);
        assert!(!snapshot.is_reached_by(&TimelineSnapshot([2, 5, 5])));
        assert!(!snapshot.is_reached_by(&TimelineSnapshot([3, 0, 0])));
        assert!(snapshot.is_reached_by(&TimelineSnapshot([3, 0, 1])));
        assert!(snapshot.is_reached_by(&TimelineSnapshot([4, 1, 2])));
        assert_eq!(snapshot.get(QueueType::Transfer), 1);
    }

    #[test]
    fn test_collect_only_reached_handles() {
        let driver = NullDriver::default();
        let a = driver
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::UNIFORM))
            .unwrap();
        let b = driver
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::UNIFORM))
            .unwrap();

        let mut destructor = DeferredDestructor::new();
        destructor.queue(TimelineSnapshot([1, 0, 0]), NativeHandle::Buffer(a));
        destructor.queue(TimelineSnapshot([2, 0, 0]), NativeHandle::Buffer(b));
        assert_eq!(destructor.pending_count(), 2);

        let ready = destructor.collect(&TimelineSnapshot([1, 0, 0]));
        assert_eq!(ready, vec![NativeHandle::Buffer(a)]);
        for handle in ready {
            handle.destroy(&driver);
        }
        assert!(!driver.is_alive(a));
        assert!(driver.is_alive(b));

        assert_eq!(destructor.flush_all(&driver), 1);
        assert_eq!(destructor.pending_count(), 0);
        assert!(!driver.is_alive(b));
    }
}
