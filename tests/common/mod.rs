//! Common utilities for the RHI integration tests.
//!
//! Every test runs on the headless [`NullDriver`], which records commands
//! instead of executing them. Tests keep a handle to the driver to inspect
//! what was submitted and which native objects are still alive.

#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use redlilium_rhi::backend::null::{NullDriver, RecordedCommand, Submission};
use redlilium_rhi::sync::ImageBarrier;
use redlilium_rhi::{
    AttachmentDescriptor, Buffer, BufferDescriptor, BufferUsage, CommandQueue, DescriptorType,
    Device, DeviceParameters, Framebuffer, GraphicsPipelineDescriptor, GraphicsState, Image,
    ImageDescriptor, ImageFormat, ImageUsage, ImageView, ImageViewDescriptor, MemoryLocation,
    NullCompletion, Pipeline, QueueType, RenderPass, RenderPassDescriptor, ResourceBinding,
    ShaderDescriptor, ShaderKey, ShaderStages,
};

/// SPIR-V magic number; the null driver accepts any non-empty code.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic byte pattern for upload tests.
pub fn generate_test_pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// A color target with its render pass and framebuffer.
pub struct RenderTarget {
    pub image: Arc<Image>,
    pub view: Arc<ImageView>,
    pub render_pass: Arc<RenderPass>,
    pub framebuffer: Arc<Framebuffer>,
}

/// A device on a null driver the test can inspect.
pub struct TestContext {
    pub driver: Arc<NullDriver>,
    pub device: Device,
}

impl TestContext {
    pub fn new(completion: NullCompletion) -> Self {
        Self::with_parameters(DeviceParameters::headless(completion))
    }

    pub fn with_parameters(params: DeviceParameters) -> Self {
        init_logging();
        let driver = Arc::new(NullDriver::new(params.null_completion));
        let device =
            Device::with_driver(driver.clone(), params).expect("Failed to create device");
        Self { driver, device }
    }

    pub fn queue(&self, queue: QueueType) -> &Arc<CommandQueue> {
        self.device.queue(queue)
    }

    /// Host-visible buffer filled with `data`, usable as a copy source.
    pub fn create_staging(&self, data: &[u8]) -> Arc<Buffer> {
        self.device
            .create_buffer_init(
                &BufferDescriptor::new(data.len() as u64, BufferUsage::COPY_SRC)
                    .with_label("staging")
                    .with_location(MemoryLocation::CpuToGpu),
                data,
            )
            .expect("Failed to create staging buffer")
    }

    pub fn create_gpu_buffer(&self, size: u64, usage: BufferUsage) -> Arc<Buffer> {
        self.device
            .create_buffer(&BufferDescriptor::new(size, usage | BufferUsage::COPY_DST))
            .expect("Failed to create buffer")
    }

    /// Sampled RGBA8 texture with a view over all of it.
    pub fn create_texture(&self, width: u32, height: u32) -> (Arc<Image>, Arc<ImageView>) {
        let image = self
            .device
            .create_image(
                &ImageDescriptor::new_2d(
                    width,
                    height,
                    ImageFormat::Rgba8Unorm,
                    ImageUsage::SAMPLED | ImageUsage::COPY_DST,
                )
                .with_label("texture"),
            )
            .expect("Failed to create texture");
        let view = self
            .device
            .create_image_view(&image, &ImageViewDescriptor::default())
            .expect("Failed to create texture view");
        (image, view)
    }

    /// Single-subpass color target left readable by shaders.
    pub fn create_render_target(&self, width: u32, height: u32) -> RenderTarget {
        let image = self
            .device
            .create_image(
                &ImageDescriptor::new_2d(
                    width,
                    height,
                    ImageFormat::Rgba8Unorm,
                    ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
                )
                .with_label("render target"),
            )
            .expect("Failed to create render target");
        let view = self
            .device
            .create_image_view(&image, &ImageViewDescriptor::default())
            .expect("Failed to create render target view");
        let render_pass = self
            .device
            .create_render_pass(
                &RenderPassDescriptor::single_pass(
                    &[AttachmentDescriptor::color(ImageFormat::Rgba8Unorm)],
                    None,
                )
                .with_label("color pass"),
            )
            .expect("Failed to create render pass");
        let framebuffer = self
            .device
            .create_framebuffer(&render_pass, &[view.clone()])
            .expect("Failed to create framebuffer");
        RenderTarget {
            image,
            view,
            render_pass,
            framebuffer,
        }
    }

    /// Pipeline sampling one texture at set 0, binding 0 of the fragment stage.
    pub fn create_textured_pipeline(&self, render_pass: &Arc<RenderPass>) -> Arc<Pipeline> {
        let vertex = self
            .device
            .create_shader(&ShaderDescriptor::new(
                ShaderKey::new("shaders/fullscreen.vert", "spirv-1.3", "main"),
                ShaderStages::VERTEX,
                vec![SPIRV_MAGIC],
            ))
            .expect("Failed to create vertex shader");
        let fragment = self
            .device
            .create_shader(
                &ShaderDescriptor::new(
                    ShaderKey::new("shaders/textured.frag", "spirv-1.3", "main"),
                    ShaderStages::FRAGMENT,
                    vec![SPIRV_MAGIC],
                )
                .with_resource(
                    0,
                    ResourceBinding::new(0, DescriptorType::SampledImage, ShaderStages::FRAGMENT),
                ),
            )
            .expect("Failed to create fragment shader");
        self.device
            .create_graphics_pipeline(
                &GraphicsPipelineDescriptor::new(
                    vec![vertex, fragment],
                    GraphicsState::default(),
                    render_pass.clone(),
                )
                .with_label("textured"),
            )
            .expect("Failed to create pipeline")
    }

    /// Submissions carrying command buffers, skipping bare frame fences.
    pub fn job_submissions(&self) -> Vec<Submission> {
        self.driver
            .submissions()
            .into_iter()
            .filter(|submission| !submission.batches.is_empty())
            .collect()
    }
}

/// Image barriers of `submission` that touch `image`, in execution order.
pub fn image_barriers(submission: &Submission, image: vk::Image) -> Vec<ImageBarrier> {
    submission
        .commands
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::PipelineBarrier(batch) => Some(batch.image_barriers()),
            _ => None,
        })
        .flatten()
        .filter(|barrier| barrier.image == image)
        .copied()
        .collect()
}

/// Names of the recorded commands, for asserting command order.
pub fn command_names(commands: &[RecordedCommand]) -> Vec<&'static str> {
    commands
        .iter()
        .map(|command| match command {
            RecordedCommand::PipelineBarrier(_) => "barrier",
            RecordedCommand::BeginRenderPass { .. } => "begin_render_pass",
            RecordedCommand::NextSubpass(_) => "next_subpass",
            RecordedCommand::EndRenderPass => "end_render_pass",
            RecordedCommand::ExecuteCommands(_) => "execute_commands",
            RecordedCommand::BindPipeline { .. } => "bind_pipeline",
            RecordedCommand::BindDescriptorSet { .. } => "bind_descriptor_set",
            RecordedCommand::BindVertexBuffers { .. } => "bind_vertex_buffers",
            RecordedCommand::BindIndexBuffer { .. } => "bind_index_buffer",
            RecordedCommand::SetViewport(_) => "set_viewport",
            RecordedCommand::SetScissor(_) => "set_scissor",
            RecordedCommand::SetBlendConstants(_) => "set_blend_constants",
            RecordedCommand::SetStencilReference(_) => "set_stencil_reference",
            RecordedCommand::Draw { .. } => "draw",
            RecordedCommand::DrawIndexed { .. } => "draw_indexed",
            RecordedCommand::Dispatch { .. } => "dispatch",
            RecordedCommand::CopyBuffer { .. } => "copy_buffer",
            RecordedCommand::CopyBufferToImage { .. } => "copy_buffer_to_image",
            RecordedCommand::CopyImage { .. } => "copy_image",
            RecordedCommand::CopyImageToBuffer { .. } => "copy_image_to_buffer",
            RecordedCommand::BlitImage { .. } => "blit_image",
            RecordedCommand::ResolveImage { .. } => "resolve_image",
        })
        .collect()
}
