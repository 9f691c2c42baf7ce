//! Native driver abstraction.
//!
//! Everything above this module talks to the GPU through the [`Driver`]
//! trait, a thin Vulkan-shaped interface over raw `ash::vk` handles. The
//! driver is picked once, at device creation time:
//!
//! - [`vulkan::AshDriver`] (`vulkan-backend` feature): native Vulkan via ash
//!   and gpu-allocator.
//! - [`null::NullDriver`]: headless driver that records every command and
//!   simulates queues and fences. Used by tests and on machines without a GPU.
//!
//! Command recording functions never fail; creation, submission and
//! synchronization functions return [`RhiResult`].

pub mod null;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::error::RhiResult;
use crate::instance::{BackendKind, DeviceParameters};
use crate::sync::{BarrierBatch, SubresourceRange};
use crate::types::{
    BufferDescriptor, ClearValue, DescriptorType, GraphicsState, ImageDescriptor, ImageFormat,
    QueueType, RenderPassDescriptor, ResourceBinding, SamplerDescriptor, ShaderStages,
};

/// Parameters of a native image view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageViewCreateInfo {
    pub image: vk::Image,
    pub format: ImageFormat,
    pub view_type: vk::ImageViewType,
    pub aspect_mask: vk::ImageAspectFlags,
    pub range: SubresourceRange,
}

/// Resource written into one descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Sampler(vk::Sampler),
    CombinedImageSampler {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
}

/// One element of a descriptor set update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub ty: DescriptorType,
    pub resource: DescriptorResource,
}

/// Render pass state inherited by a secondary command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

/// One batch of a queue submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitBatch {
    pub wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// A shader entry point bound to one pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct ShaderStageInfo<'a> {
    pub stage: ShaderStages,
    pub module: vk::ShaderModule,
    pub entry_point: &'a str,
}

/// Everything a native graphics pipeline is built from.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineCreateInfo<'a> {
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub stages: &'a [ShaderStageInfo<'a>],
    pub state: &'a GraphicsState,
    pub color_attachment_count: u32,
    pub samples: u32,
}

/// Arguments of `vkCmdBeginRenderPass`.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub area: vk::Rect2D,
    pub clear_values: &'a [ClearValue],
    pub contents: vk::SubpassContents,
}

/// The native graphics API as seen by the RHI core.
///
/// Implementations must be callable from any thread. Command pools and the
/// command buffers allocated from them are externally synchronized by the
/// caller, as in Vulkan.
pub trait Driver: Send + Sync {
    /// Which driver this is.
    fn kind(&self) -> BackendKind;

    /// Human-readable adapter name.
    fn name(&self) -> &str;

    // === Resources ===

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RhiResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Copy `data` into a host-visible buffer.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Copy from a host-visible buffer into `out`.
    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()>;

    fn create_image(&self, descriptor: &ImageDescriptor) -> RhiResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> RhiResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> RhiResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    // === Descriptors ===

    fn create_descriptor_set_layout(
        &self,
        bindings: &[ResourceBinding],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create a pool whose sets can be freed individually.
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet)
        -> RhiResult<()>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // === Pipelines ===

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        stage: &ShaderStageInfo<'_>,
    ) -> RhiResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> RhiResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        layers: u32,
    ) -> RhiResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // === Command buffers ===

    /// Create a pool whose buffers can be reset individually.
    fn create_command_pool(&self, queue: QueueType) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> RhiResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Begin one-time-submit recording; secondary buffers pass their render pass.
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> RhiResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    // === Commands ===

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch);
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>);
    fn cmd_next_subpass(&self, command_buffer: vk::CommandBuffer, contents: vk::SubpassContents);
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    );

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    );
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, u64)],
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &vk::Viewport);
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_set_blend_constants(&self, command_buffer: vk::CommandBuffer, constants: [f32; 4]);
    fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32);

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );
    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    fn cmd_resolve_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    );

    // === Synchronization ===

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until the fence signals. Returns `false` if `timeout` expired first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<bool>;
    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submit batches in order; `fence` signals when all of them completed.
    ///
    /// An empty `batches` slice only signals the fence once earlier work on
    /// the queue is done.
    fn queue_submit(
        &self,
        queue: QueueType,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> RhiResult<()>;
    fn queue_wait_idle(&self, queue: QueueType) -> RhiResult<()>;
    fn device_wait_idle(&self) -> RhiResult<()>;
}

/// Create the driver selected by `params.backend`.
///
/// `Auto` tries Vulkan first and falls back to the headless driver.
pub fn create_driver(params: &DeviceParameters) -> RhiResult<Arc<dyn Driver>> {
    match params.backend {
        BackendKind::Null => {
            log::info!("Using headless driver");
            Ok(Arc::new(null::NullDriver::new(params.null_completion)))
        }
        BackendKind::Vulkan => create_vulkan_driver(params),
        BackendKind::Auto => match create_vulkan_driver(params) {
            Ok(driver) => Ok(driver),
            Err(e) => {
                log::warn!("Failed to create Vulkan driver: {}", e);
                log::info!("Using headless driver");
                Ok(Arc::new(null::NullDriver::new(params.null_completion)))
            }
        },
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan_driver(params: &DeviceParameters) -> RhiResult<Arc<dyn Driver>> {
    let driver = vulkan::AshDriver::new(params)?;
    log::info!("Using Vulkan driver ({})", driver.name());
    Ok(Arc::new(driver))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan_driver(_params: &DeviceParameters) -> RhiResult<Arc<dyn Driver>> {
    Err(crate::error::RhiError::InitializationFailed(
        "built without the vulkan-backend feature".to_string(),
    ))
}
