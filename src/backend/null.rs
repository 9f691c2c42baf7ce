//! Headless driver for testing and GPU-less machines.
//!
//! The null driver performs no rendering. It hands out unique handles,
//! keeps track of which of them are alive, records every command into a
//! per-command-buffer log and simulates queues: submitted work completes
//! immediately or when the test calls [`NullDriver::complete_next`],
//! depending on [`NullCompletion`]. Buffer contents live in host memory and
//! buffer-to-buffer copies are carried out when the work completes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use parking_lot::{Condvar, Mutex};

use super::{
    CommandBufferInheritance, DescriptorWrite, Driver, GraphicsPipelineCreateInfo,
    ImageViewCreateInfo, RenderPassBegin, ShaderStageInfo, SubmitBatch,
};
use crate::error::{RhiError, RhiResult};
use crate::instance::{BackendKind, NullCompletion};
use crate::sync::BarrierBatch;
use crate::types::{
    BufferDescriptor, ImageDescriptor, QueueType, RenderPassDescriptor, ResourceBinding,
    SamplerDescriptor,
};

/// One command recorded into a command buffer.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    PipelineBarrier(BarrierBatch),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_value_count: usize,
        contents: vk::SubpassContents,
    },
    NextSubpass(vk::SubpassContents),
    EndRenderPass,
    ExecuteCommands(Vec<vk::CommandBuffer>),
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(vk::Buffer, u64)>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SetBlendConstants([f32; 4]),
    SetStencilReference(u32),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    ResolveImage {
        src: vk::Image,
        dst: vk::Image,
        regions: Vec<vk::ImageResolve>,
    },
}

/// A queue submission as seen by the driver.
#[derive(Debug, Clone)]
pub struct Submission {
    pub queue: QueueType,
    pub batches: Vec<SubmitBatch>,
    pub fence: vk::Fence,
    /// Commands of every submitted buffer in execution order, with
    /// executed secondary buffers inlined after their `ExecuteCommands`.
    pub commands: Vec<RecordedCommand>,
}

impl Submission {
    pub fn image_barrier_count(&self) -> usize {
        self.commands
            .iter()
            .map(|command| match command {
                RecordedCommand::PipelineBarrier(batch) => batch.image_barriers().len(),
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug)]
struct InFlight {
    fence: vk::Fence,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug, Default)]
struct NullState {
    live: HashMap<u64, &'static str>,
    buffers: HashMap<u64, Vec<u8>>,
    recordings: HashMap<u64, Vec<RecordedCommand>>,
    command_buffer_pools: HashMap<u64, u64>,
    descriptor_pools: HashMap<u64, (u32, u32)>,
    descriptor_set_pools: HashMap<u64, u64>,
    fences: HashMap<u64, bool>,
    in_flight: VecDeque<InFlight>,
    submissions: Vec<Submission>,
    descriptor_set_allocations: usize,
    descriptor_updates: Vec<(vk::DescriptorSet, Vec<DescriptorWrite>)>,
}

impl NullState {
    fn record(&mut self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        match self.recordings.get_mut(&command_buffer.as_raw()) {
            Some(commands) => commands.push(command),
            None => log::error!(
                "NullDriver: recording into unknown command buffer {:?}",
                command_buffer
            ),
        }
    }

    /// Commands of a buffer with executed secondaries inlined.
    fn flatten(&self, command_buffer: vk::CommandBuffer, out: &mut Vec<RecordedCommand>) {
        let Some(commands) = self.recordings.get(&command_buffer.as_raw()) else {
            return;
        };
        for command in commands {
            out.push(command.clone());
            if let RecordedCommand::ExecuteCommands(secondaries) = command {
                for secondary in secondaries {
                    self.flatten(*secondary, out);
                }
            }
        }
    }

    fn execute(&mut self, work: InFlight) {
        for command in &work.commands {
            if let RecordedCommand::CopyBuffer { src, dst, regions } = command {
                for region in regions {
                    self.copy_buffer(*src, *dst, region);
                }
            }
        }
        if work.fence != vk::Fence::null() {
            self.fences.insert(work.fence.as_raw(), true);
        }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: &vk::BufferCopy) {
        let src_range = region.src_offset as usize..(region.src_offset + region.size) as usize;
        let Some(data) = self
            .buffers
            .get(&src.as_raw())
            .and_then(|bytes| bytes.get(src_range))
            .map(|bytes| bytes.to_vec())
        else {
            log::error!("NullDriver: copy source out of range");
            return;
        };
        let dst_range = region.dst_offset as usize..(region.dst_offset + region.size) as usize;
        match self
            .buffers
            .get_mut(&dst.as_raw())
            .and_then(|bytes| bytes.get_mut(dst_range))
        {
            Some(target) => target.copy_from_slice(&data),
            None => log::error!("NullDriver: copy destination out of range"),
        }
    }
}

/// Headless [`Driver`].
#[derive(Debug)]
pub struct NullDriver {
    completion: NullCompletion,
    next_handle: AtomicU64,
    state: Mutex<NullState>,
    signaled: Condvar,
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new(NullCompletion::Immediate)
    }
}

impl NullDriver {
    pub fn new(completion: NullCompletion) -> Self {
        Self {
            completion,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(NullState::default()),
            signaled: Condvar::new(),
        }
    }

    pub fn completion(&self) -> NullCompletion {
        self.completion
    }

    fn create<H: Handle>(&self, kind: &'static str) -> H {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.state.lock().live.insert(raw, kind);
        log::trace!("NullDriver: created {} {:#x}", kind, raw);
        H::from_raw(raw)
    }

    fn release<H: Handle>(&self, handle: H, kind: &'static str) {
        let raw = handle.as_raw();
        let mut state = self.state.lock();
        match state.live.remove(&raw) {
            Some(live_kind) if live_kind == kind => {}
            Some(live_kind) => log::error!(
                "NullDriver: destroying {} {:#x} as a {}",
                live_kind,
                raw,
                kind
            ),
            None => log::error!("NullDriver: {} {:#x} destroyed twice or never created", kind, raw),
        }
    }

    /// Complete the oldest in-flight submission. Returns `false` if idle.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        let Some(work) = state.in_flight.pop_front() else {
            return false;
        };
        state.execute(work);
        drop(state);
        self.signaled.notify_all();
        true
    }

    /// Complete every in-flight submission. Returns how many there were.
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Submissions not yet completed.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of live native objects of every kind.
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of live native objects of one kind (`"buffer"`, `"descriptor_set"`, ...).
    pub fn live_count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|live_kind| **live_kind == kind)
            .count()
    }

    pub fn is_alive<H: Handle>(&self, handle: H) -> bool {
        self.state.lock().live.contains_key(&handle.as_raw())
    }

    /// Every submission so far, in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Commands of all submissions, in order.
    pub fn submitted_commands(&self) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .submissions
            .iter()
            .flat_map(|submission| submission.commands.iter().cloned())
            .collect()
    }

    /// Current contents of a command buffer.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .recordings
            .get(&command_buffer.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Total descriptor sets ever allocated.
    pub fn descriptor_set_allocations(&self) -> usize {
        self.state.lock().descriptor_set_allocations
    }

    /// Every descriptor set update, in order.
    pub fn descriptor_updates(&self) -> Vec<(vk::DescriptorSet, Vec<DescriptorWrite>)> {
        self.state.lock().descriptor_updates.clone()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.as_raw()).cloned()
    }
}

impl Driver for NullDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn name(&self) -> &str {
        "Null Driver"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RhiResult<vk::Buffer> {
        log::trace!(
            "NullDriver: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let buffer: vk::Buffer = self.create("buffer");
        self.state
            .lock()
            .buffers
            .insert(buffer.as_raw(), vec![0; descriptor.size as usize]);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer.as_raw());
        self.release(buffer, "buffer");
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let target = state
            .buffers
            .get_mut(&buffer.as_raw())
            .and_then(|bytes| bytes.get_mut(offset as usize..offset as usize + data.len()))
            .ok_or_else(|| RhiError::invalid_state("buffer write out of range"))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let state = self.state.lock();
        let source = state
            .buffers
            .get(&buffer.as_raw())
            .and_then(|bytes| bytes.get(offset as usize..offset as usize + out.len()))
            .ok_or_else(|| RhiError::invalid_state("buffer read out of range"))?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> RhiResult<vk::Image> {
        log::trace!(
            "NullDriver: creating image {:?} ({}x{}x{})",
            descriptor.label,
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.extent.depth
        );
        Ok(self.create("image"))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.release(image, "image");
    }

    fn create_image_view(&self, _info: &ImageViewCreateInfo) -> RhiResult<vk::ImageView> {
        Ok(self.create("image_view"))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.release(view, "image_view");
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> RhiResult<vk::Sampler> {
        log::trace!("NullDriver: creating sampler {:?}", descriptor.label);
        Ok(self.create("sampler"))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.release(sampler, "sampler");
    }

    fn create_shader_module(&self, _code: &[u32]) -> RhiResult<vk::ShaderModule> {
        Ok(self.create("shader_module"))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.release(module, "shader_module");
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[ResourceBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(self.create("descriptor_set_layout"))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.release(layout, "descriptor_set_layout");
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let pool: vk::DescriptorPool = self.create("descriptor_pool");
        self.state
            .lock()
            .descriptor_pools
            .insert(pool.as_raw(), (max_sets, 0));
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        {
            let mut state = self.state.lock();
            state.descriptor_pools.remove(&pool.as_raw());
            let owned: Vec<u64> = state
                .descriptor_set_pools
                .iter()
                .filter(|(_, owner)| **owner == pool.as_raw())
                .map(|(set, _)| *set)
                .collect();
            for set in owned {
                state.descriptor_set_pools.remove(&set);
                state.live.remove(&set);
            }
        }
        self.release(pool, "descriptor_pool");
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        {
            let mut state = self.state.lock();
            let (max_sets, live) = state
                .descriptor_pools
                .get_mut(&pool.as_raw())
                .ok_or_else(|| RhiError::invalid_state("unknown descriptor pool"))?;
            if *live >= *max_sets {
                return Err(RhiError::native(
                    "vkAllocateDescriptorSets",
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY,
                ));
            }
            *live += 1;
            state.descriptor_set_allocations += 1;
        }
        let set: vk::DescriptorSet = self.create("descriptor_set");
        self.state
            .lock()
            .descriptor_set_pools
            .insert(set.as_raw(), pool.as_raw());
        Ok(set)
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> RhiResult<()> {
        {
            let mut state = self.state.lock();
            if state.descriptor_set_pools.remove(&set.as_raw()) != Some(pool.as_raw()) {
                return Err(RhiError::invalid_state(
                    "descriptor set freed into the wrong pool",
                ));
            }
            if let Some((_, live)) = state.descriptor_pools.get_mut(&pool.as_raw()) {
                *live = live.saturating_sub(1);
            }
        }
        self.release(set, "descriptor_set");
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.state
            .lock()
            .descriptor_updates
            .push((set, writes.to_vec()));
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<vk::PipelineLayout> {
        Ok(self.create("pipeline_layout"))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.release(layout, "pipeline_layout");
    }

    fn create_graphics_pipeline(
        &self,
        _info: &GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        Ok(self.create("pipeline"))
    }

    fn create_compute_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        _stage: &ShaderStageInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        Ok(self.create("pipeline"))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.release(pipeline, "pipeline");
    }

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> RhiResult<vk::RenderPass> {
        if descriptor.subpasses.is_empty() {
            return Err(RhiError::invalid_state("render pass without subpasses"));
        }
        Ok(self.create("render_pass"))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.release(render_pass, "render_pass");
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
        _layers: u32,
    ) -> RhiResult<vk::Framebuffer> {
        Ok(self.create("framebuffer"))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.release(framebuffer, "framebuffer");
    }

    fn create_command_pool(&self, queue: QueueType) -> RhiResult<vk::CommandPool> {
        log::trace!("NullDriver: creating command pool for {:?}", queue);
        Ok(self.create("command_pool"))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        {
            let mut state = self.state.lock();
            let owned: Vec<u64> = state
                .command_buffer_pools
                .iter()
                .filter(|(_, owner)| **owner == pool.as_raw())
                .map(|(buffer, _)| *buffer)
                .collect();
            for buffer in owned {
                state.command_buffer_pools.remove(&buffer);
                state.recordings.remove(&buffer);
                state.live.remove(&buffer);
            }
        }
        self.release(pool, "command_pool");
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> RhiResult<vk::CommandBuffer> {
        let command_buffer: vk::CommandBuffer = self.create("command_buffer");
        let mut state = self.state.lock();
        state
            .command_buffer_pools
            .insert(command_buffer.as_raw(), pool.as_raw());
        state.recordings.insert(command_buffer.as_raw(), Vec::new());
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        {
            let mut state = self.state.lock();
            state.command_buffer_pools.remove(&command_buffer.as_raw());
            state.recordings.remove(&command_buffer.as_raw());
        }
        self.release(command_buffer, "command_buffer");
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        match self.state.lock().recordings.get_mut(&command_buffer.as_raw()) {
            Some(commands) => {
                commands.clear();
                Ok(())
            }
            None => Err(RhiError::invalid_state("reset of unknown command buffer")),
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _inheritance: Option<&CommandBufferInheritance>,
    ) -> RhiResult<()> {
        self.reset_command_buffer(command_buffer)
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        Ok(())
    }

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::PipelineBarrier(barriers.clone()));
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
                area: begin.area,
                clear_value_count: begin.clear_values.len(),
                contents: begin.contents,
            },
        );
    }

    fn cmd_next_subpass(&self, command_buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::NextSubpass(contents));
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::EndRenderPass);
    }

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::ExecuteCommands(secondaries.to_vec()),
        );
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BindDescriptorSet {
                bind_point,
                layout,
                set_index,
                set,
            },
        );
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, u64)],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
            },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            },
        );
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &vk::Viewport) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::SetViewport(*viewport));
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::SetScissor(scissor));
    }

    fn cmd_set_blend_constants(&self, command_buffer: vk::CommandBuffer, constants: [f32; 4]) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::SetBlendConstants(constants));
    }

    fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::SetStencilReference(reference));
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        );
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::Dispatch { x, y, z });
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BlitImage {
                src,
                dst,
                regions: regions.to_vec(),
                filter,
            },
        );
    }

    fn cmd_resolve_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::ResolveImage {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence: vk::Fence = self.create("fence");
        self.state.lock().fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
        self.release(fence, "fence");
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match state.fences.get(&fence.as_raw()).copied() {
                Some(true) => return Ok(true),
                Some(false) => {}
                None => return Err(RhiError::invalid_state("wait on unknown fence")),
            }
            if self.signaled.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.fences.get(&fence.as_raw()).copied().unwrap_or(false));
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or_else(|| RhiError::invalid_state("status of unknown fence"))
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        match self.state.lock().fences.get_mut(&fence.as_raw()) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(RhiError::invalid_state("reset of unknown fence")),
        }
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(self.create("semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.release(semaphore, "semaphore");
    }

    fn queue_submit(
        &self,
        queue: QueueType,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let mut state = self.state.lock();
        if fence != vk::Fence::null() && state.fences.get(&fence.as_raw()) == Some(&true) {
            return Err(RhiError::invalid_state("submitted with a signaled fence"));
        }

        let mut commands = Vec::new();
        for batch in batches {
            for command_buffer in &batch.command_buffers {
                if !state.recordings.contains_key(&command_buffer.as_raw()) {
                    return Err(RhiError::invalid_state("submitted an unknown command buffer"));
                }
                state.flatten(*command_buffer, &mut commands);
            }
        }
        log::trace!(
            "NullDriver: {:?} submission of {} batches, {} commands",
            queue,
            batches.len(),
            commands.len()
        );
        state.submissions.push(Submission {
            queue,
            batches: batches.to_vec(),
            fence,
            commands: commands.clone(),
        });

        let work = InFlight { fence, commands };
        match self.completion {
            NullCompletion::Immediate => {
                state.execute(work);
                drop(state);
                self.signaled.notify_all();
            }
            NullCompletion::Manual => state.in_flight.push_back(work),
        }
        Ok(())
    }

    /// Waiting for idle completes every outstanding submission.
    fn queue_wait_idle(&self, _queue: QueueType) -> RhiResult<()> {
        self.complete_all();
        Ok(())
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        self.complete_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_tracked() {
        let driver = NullDriver::default();
        let buffer = driver
            .create_buffer(&BufferDescriptor::new(16, Default::default()))
            .unwrap();
        assert!(driver.is_alive(buffer));
        assert_eq!(driver.live_count("buffer"), 1);

        driver.destroy_buffer(buffer);
        assert!(!driver.is_alive(buffer));
        assert_eq!(driver.live_handles(), 0);
    }

    #[test]
    fn test_manual_fence_completion() {
        let driver = NullDriver::new(NullCompletion::Manual);
        let fence = driver.create_fence(false).unwrap();
        driver.queue_submit(QueueType::Graphics, &[], fence).unwrap();

        assert!(!driver.fence_signaled(fence).unwrap());
        assert!(!driver
            .wait_for_fence(fence, Duration::from_millis(10))
            .unwrap());

        assert!(driver.complete_next());
        assert!(driver.wait_for_fence(fence, Duration::ZERO).unwrap());
        assert!(!driver.complete_next());
    }

    #[test]
    fn test_wait_is_woken_by_completion() {
        let driver = std::sync::Arc::new(NullDriver::new(NullCompletion::Manual));
        let fence = driver.create_fence(false).unwrap();
        driver.queue_submit(QueueType::Compute, &[], fence).unwrap();

        let completer = {
            let driver = driver.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                driver.complete_all()
            })
        };
        assert!(driver.wait_for_fence(fence, Duration::from_secs(5)).unwrap());
        assert_eq!(completer.join().unwrap(), 1);
    }

    #[test]
    fn test_buffer_copy_executes_on_completion() {
        let driver = NullDriver::new(NullCompletion::Manual);
        let src = driver
            .create_buffer(&BufferDescriptor::new(4, Default::default()))
            .unwrap();
        let dst = driver
            .create_buffer(&BufferDescriptor::new(4, Default::default()))
            .unwrap();
        driver.write_buffer(src, 0, &[1, 2, 3, 4]).unwrap();

        let pool = driver.create_command_pool(QueueType::Transfer).unwrap();
        let cmd = driver
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        driver.begin_command_buffer(cmd, None).unwrap();
        driver.cmd_copy_buffer(
            cmd,
            src,
            dst,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            }],
        );
        driver.end_command_buffer(cmd).unwrap();

        let batch = SubmitBatch {
            command_buffers: vec![cmd],
            ..Default::default()
        };
        driver
            .queue_submit(QueueType::Transfer, &[batch], vk::Fence::null())
            .unwrap();
        assert_eq!(driver.buffer_contents(dst), Some(vec![0; 4]));

        driver.complete_all();
        assert_eq!(driver.buffer_contents(dst), Some(vec![1, 2, 3, 4]));

        driver.destroy_command_pool(pool);
        assert!(!driver.is_alive(cmd));
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let driver = NullDriver::default();
        let layout = driver.create_descriptor_set_layout(&[]).unwrap();
        let pool = driver.create_descriptor_pool(1, &[]).unwrap();
        let set = driver.allocate_descriptor_set(pool, layout).unwrap();
        assert!(driver.allocate_descriptor_set(pool, layout).is_err());

        driver.free_descriptor_set(pool, set).unwrap();
        assert!(driver.allocate_descriptor_set(pool, layout).is_ok());
    }
}
