//! The device: resource factory, queues and shared caches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{create_driver, Driver};
use crate::command::CommandBufferAllocator;
use crate::descriptor::DescriptorSetLayoutCache;
use crate::error::{RhiError, RhiResult};
use crate::instance::{BackendKind, DeviceParameters};
use crate::queue::{CommandQueue, DeferredDestructor, NativeHandle, TimelineSnapshot};
use crate::resources::{
    Buffer, ComputePipelineDescriptor, Framebuffer, GraphicsPipelineDescriptor, Image,
    ImageView, Pipeline, RenderPass, Sampler, Semaphore, ShaderDescriptor, ShaderKey,
    ShaderModule,
};
use crate::types::{
    BufferDescriptor, BufferUsage, ImageDescriptor, ImageUsage, ImageViewDescriptor,
    MemoryLocation, QueueType, RenderPassDescriptor, SamplerDescriptor,
};

/// State shared by the device, its queues and every resource it created.
pub(crate) struct DeviceShared {
    pub driver: Arc<dyn Driver>,
    pub params: DeviceParameters,
    /// Jobs submitted per queue.
    submitted: [AtomicU64; 3],
    /// Jobs known to have completed per queue.
    completed: [AtomicU64; 3],
    deferred: Mutex<DeferredDestructor>,
    pub command_allocator: CommandBufferAllocator,
    pub layout_cache: DescriptorSetLayoutCache,
}

impl std::fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceShared")
            .field("driver", &self.driver.name())
            .field("submitted", &self.submitted_snapshot())
            .field("completed", &self.completed_snapshot())
            .field("deferred", &self.deferred_count())
            .finish()
    }
}

impl DeviceShared {
    fn new(driver: Arc<dyn Driver>, params: DeviceParameters) -> Self {
        Self {
            command_allocator: CommandBufferAllocator::new(driver.clone()),
            layout_cache: DescriptorSetLayoutCache::new(
                driver.clone(),
                params.descriptor_sets_per_pool,
            ),
            driver,
            params,
            submitted: Default::default(),
            completed: Default::default(),
            deferred: Mutex::new(DeferredDestructor::new()),
        }
    }

    pub fn submitted_snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot(std::array::from_fn(|i| {
            self.submitted[i].load(Ordering::Acquire)
        }))
    }

    pub fn completed_snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot(std::array::from_fn(|i| {
            self.completed[i].load(Ordering::Acquire)
        }))
    }

    /// Claim the next job value on `queue`. Called once the job is submitted.
    pub fn mark_submitted(&self, queue: QueueType) -> u64 {
        self.submitted[queue.index()].fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn mark_completed(&self, queue: QueueType, value: u64) {
        self.completed[queue.index()].fetch_max(value, Ordering::AcqRel);
    }

    /// Destroy `handle` once no job submitted so far can still use it.
    pub fn destroy_deferred(&self, handle: NativeHandle) {
        let snapshot = self.submitted_snapshot();
        if snapshot.is_reached_by(&self.completed_snapshot()) {
            handle.destroy(self.driver.as_ref());
            return;
        }
        self.deferred.lock().queue(snapshot, handle);
    }

    /// Destroy every queued handle whose jobs have completed.
    pub fn collect_garbage(&self) {
        let ready = self.deferred.lock().collect(&self.completed_snapshot());
        if !ready.is_empty() {
            log::trace!("Destroying {} deferred handles", ready.len());
        }
        for handle in ready {
            handle.destroy(self.driver.as_ref());
        }
    }

    /// Destroy every queued handle. The device must be idle.
    pub fn flush_deferred(&self) -> usize {
        self.deferred.lock().flush_all(self.driver.as_ref())
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().pending_count()
    }
}

/// A logical GPU device.
///
/// Creates resources, owns one [`CommandQueue`] per [`QueueType`] and the
/// caches shared by everything recorded on it. Dropping the device waits
/// for all GPU work and destroys what is left.
pub struct Device {
    shared: Arc<DeviceShared>,
    queues: [Arc<CommandQueue>; 3],
    shader_cache: Mutex<HashMap<ShaderKey, Arc<ShaderModule>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.shared.driver.name())
            .field("layouts", &self.shared.layout_cache.len())
            .field("shaders", &self.shader_cache.lock().len())
            .finish()
    }
}

impl Device {
    /// Create a device on the driver selected by `params.backend`.
    pub fn new(params: DeviceParameters) -> RhiResult<Self> {
        let driver = create_driver(&params)?;
        Self::with_driver(driver, params)
    }

    /// Create a device on an existing driver.
    pub fn with_driver(driver: Arc<dyn Driver>, params: DeviceParameters) -> RhiResult<Self> {
        let shared = Arc::new(DeviceShared::new(driver, params));
        let queues = [
            CommandQueue::new(shared.clone(), QueueType::Graphics)?,
            CommandQueue::new(shared.clone(), QueueType::Compute)?,
            CommandQueue::new(shared.clone(), QueueType::Transfer)?,
        ];
        log::info!(
            "Created device on {} ({} frames in flight, {} jobs per queue)",
            shared.driver.name(),
            shared.params.frame_count(),
            shared.params.max_jobs_in_flight
        );
        Ok(Self {
            shared,
            queues,
            shader_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.shared.driver
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.shared.driver.kind()
    }

    pub fn parameters(&self) -> &DeviceParameters {
        &self.shared.params
    }

    pub fn queue(&self, queue: QueueType) -> &Arc<CommandQueue> {
        &self.queues[queue.index()]
    }

    pub fn layout_cache(&self) -> &DescriptorSetLayoutCache {
        &self.shared.layout_cache
    }

    pub fn command_allocator(&self) -> &CommandBufferAllocator {
        &self.shared.command_allocator
    }

    /// Handles waiting for the GPU before they can be destroyed.
    pub fn deferred_count(&self) -> usize {
        self.shared.deferred_count()
    }

    // === Buffers ===

    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> RhiResult<Arc<Buffer>> {
        Ok(Arc::new(Buffer::new(self.shared.clone(), descriptor)?))
    }

    /// Create a buffer holding `data`.
    ///
    /// Host-visible buffers are written directly. Device-local ones are
    /// filled through a staging buffer on the transfer queue; the call
    /// returns once the copy has completed.
    pub fn create_buffer_init(
        &self,
        descriptor: &BufferDescriptor,
        data: &[u8],
    ) -> RhiResult<Arc<Buffer>> {
        if data.len() as u64 > descriptor.size {
            return Err(RhiError::invalid_state(format!(
                "{} bytes of initial data for a {} byte buffer",
                data.len(),
                descriptor.size
            )));
        }
        if descriptor.location.is_host_visible() {
            let buffer = self.create_buffer(descriptor)?;
            buffer.write(0, data)?;
            return Ok(buffer);
        }
        if !descriptor.usage.contains(BufferUsage::COPY_DST) {
            return Err(RhiError::invalid_state(
                "device-local buffer with initial data needs COPY_DST usage",
            ));
        }

        let buffer = self.create_buffer(descriptor)?;
        if data.is_empty() {
            return Ok(buffer);
        }
        let staging = self.create_staging(data)?;
        let queue = self.queue(QueueType::Transfer);
        let list = queue.create_command_list(Some("buffer upload"));
        let mut context = list.begin()?;
        context.copy_buffer(&staging, 0, &buffer, 0, data.len() as u64)?;
        context.finish()?;
        list.commit()?;
        // TODO: batch initial uploads instead of waiting on each one.
        queue.flush(true)?;
        Ok(buffer)
    }

    /// [`create_buffer_init`](Self::create_buffer_init) for plain-old-data slices.
    pub fn create_buffer_from_slice<T: bytemuck::Pod>(
        &self,
        descriptor: &BufferDescriptor,
        data: &[T],
    ) -> RhiResult<Arc<Buffer>> {
        self.create_buffer_init(descriptor, bytemuck::cast_slice(data))
    }

    fn create_staging(&self, data: &[u8]) -> RhiResult<Arc<Buffer>> {
        let staging = self.create_buffer(
            &BufferDescriptor::new(data.len() as u64, BufferUsage::COPY_SRC)
                .with_label("staging")
                .with_location(MemoryLocation::CpuToGpu),
        )?;
        staging.write(0, data)?;
        Ok(staging)
    }

    /// Copy the contents of a host-visible buffer into `out`.
    pub fn read_buffer(&self, buffer: &Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        buffer.read(offset, out)
    }

    // === Images ===

    /// Create an image. Its contents start out undefined.
    pub fn create_image(&self, descriptor: &ImageDescriptor) -> RhiResult<Arc<Image>> {
        Ok(Arc::new(Image::new(self.shared.clone(), descriptor)?))
    }

    /// Create an image with mip 0 of every layer filled from `data` and
    /// left in the descriptor's default state. Blocks until the upload has
    /// completed.
    pub fn create_image_init(
        &self,
        descriptor: &ImageDescriptor,
        data: &[u8],
    ) -> RhiResult<Arc<Image>> {
        let expected = descriptor.level0_size();
        if (data.len() as u64) < expected {
            return Err(RhiError::invalid_state(format!(
                "image needs {} bytes of initial data, got {}",
                expected,
                data.len()
            )));
        }
        if !descriptor.usage.contains(ImageUsage::COPY_DST) {
            return Err(RhiError::invalid_state(
                "image with initial data needs COPY_DST usage",
            ));
        }

        let image = self.create_image(descriptor)?;
        let staging = self.create_staging(&data[..expected as usize])?;
        let queue = self.queue(QueueType::Transfer);
        let list = queue.create_command_list(Some("image upload"));
        let mut context = list.begin()?;
        context.copy_buffer_to_image(&staging, 0, &image, 0)?;
        context.transition_image(&image, None, descriptor.default_state)?;
        context.finish()?;
        list.commit()?;
        queue.flush(true)?;
        Ok(image)
    }

    pub fn create_image_view(
        &self,
        image: &Arc<Image>,
        descriptor: &ImageViewDescriptor,
    ) -> RhiResult<Arc<ImageView>> {
        Ok(Arc::new(ImageView::new(self.shared.clone(), image, descriptor)?))
    }

    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> RhiResult<Arc<Sampler>> {
        Ok(Arc::new(Sampler::new(self.shared.clone(), descriptor)?))
    }

    pub fn create_semaphore(&self) -> RhiResult<Arc<Semaphore>> {
        Ok(Arc::new(Semaphore::new(self.shared.clone())?))
    }

    // === Shaders and pipelines ===

    /// Create a shader module, or return the cached one with the same key.
    pub fn create_shader(&self, descriptor: &ShaderDescriptor) -> RhiResult<Arc<ShaderModule>> {
        let mut cache = self.shader_cache.lock();
        if let Some(module) = cache.get(&descriptor.key) {
            return Ok(module.clone());
        }
        let module = Arc::new(ShaderModule::new(self.shared.clone(), descriptor)?);
        log::debug!(
            "Created shader module {} ({:016x})",
            descriptor.key.source_path,
            descriptor.key.content_hash()
        );
        cache.insert(descriptor.key.clone(), module.clone());
        Ok(module)
    }

    /// Cached shader module for `key`, if any.
    pub fn cached_shader(&self, key: &ShaderKey) -> Option<Arc<ShaderModule>> {
        self.shader_cache.lock().get(key).cloned()
    }

    pub fn create_render_pass(
        &self,
        descriptor: &RenderPassDescriptor,
    ) -> RhiResult<Arc<RenderPass>> {
        Ok(Arc::new(RenderPass::new(self.shared.clone(), descriptor)?))
    }

    pub fn create_framebuffer(
        &self,
        render_pass: &Arc<RenderPass>,
        attachments: &[Arc<ImageView>],
    ) -> RhiResult<Arc<Framebuffer>> {
        Ok(Arc::new(Framebuffer::new(
            self.shared.clone(),
            render_pass,
            attachments,
        )?))
    }

    pub fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Arc<Pipeline>> {
        Ok(Arc::new(Pipeline::new_graphics(
            self.shared.clone(),
            descriptor,
        )?))
    }

    pub fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> RhiResult<Arc<Pipeline>> {
        Ok(Arc::new(Pipeline::new_compute(
            self.shared.clone(),
            descriptor,
        )?))
    }

    // === Lifetime ===

    /// Wait for every queue, retire all jobs and destroy deferred handles.
    pub fn wait_idle(&self) -> RhiResult<()> {
        crate::profile_scope!("device_wait_idle");
        self.shared.driver.device_wait_idle()?;
        for queue in &self.queues {
            queue.wait_idle()?;
        }
        self.shared.collect_garbage();
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to drain GPU work on device drop: {}", e);
        }
        self.shader_cache.lock().clear();
        for queue in &self.queues {
            queue.destroy();
        }
        self.shared.command_allocator.clear();
        self.shared.layout_cache.clear();
        let flushed = self.shared.flush_deferred();
        log::info!(
            "Destroyed device on {} ({} deferred handles flushed)",
            self.shared.driver.name(),
            flushed
        );
    }
}
