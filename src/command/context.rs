//! Deferred recording contexts.
//!
//! A [`DeferredContext`] wraps one native command buffer. Standalone
//! contexts record a primary buffer (copies, dispatches, explicit
//! transitions); subpass contexts record a secondary buffer inheriting the
//! render pass of their [`RenderPassContext`](super::RenderPassContext).
//!
//! Resource bindings are collected in a [`ResourceBindings`] table and only
//! turned into descriptor sets right before a draw or dispatch. Every
//! resolved set is freshly allocated; sets are returned to their pool by
//! the owning command list once its GPU job has completed.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use super::{CommandBufferHandle, CommandList, RecordingState};
use crate::backend::{DescriptorResource, DescriptorWrite, Driver};
use crate::descriptor::{BindingInfo, DescriptorSetLayout, ResourceBindings};
use crate::error::{RhiError, RhiResult};
use crate::resources::{Buffer, Image, ImageView, Pipeline, Sampler};
use crate::sync::{AccessRecord, SubresourceRange};
use crate::types::{DescriptorType, IndexFormat, ResourceState, ShaderStages};

/// Records commands into one native command buffer of a [`CommandList`].
pub struct DeferredContext<'a> {
    list: &'a CommandList,
    command_buffer: Option<CommandBufferHandle>,
    /// Subpass this context records into; `None` for standalone contexts.
    subpass: Option<u32>,
    area: vk::Rect2D,
    pipeline: Option<Arc<Pipeline>>,
    bindings: ResourceBindings,
    /// Layout last bound at each set index.
    bound_layouts: Vec<Option<Arc<DescriptorSetLayout>>>,
    /// States set by explicit transitions since the last command. A
    /// command needing exactly that state consumes it without another
    /// transition.
    declared_images: Vec<(vk::Image, SubresourceRange, ResourceState)>,
    declared_buffers: Vec<(vk::Buffer, ResourceState)>,
    /// Storage resources bound in a standalone context, keyed by
    /// `(set, binding, element)`. Each dispatch tracks them as writes again.
    storage_writes: BTreeMap<(u32, u32, u32), StorageTarget>,
    /// The bound pipeline's set layouts have all been bound since the last
    /// `bind_pipeline`.
    layouts_resolved: bool,
}

#[derive(Debug, Clone)]
enum StorageTarget {
    Buffer(Arc<Buffer>),
    Image(Arc<ImageView>),
}

impl std::fmt::Debug for DeferredContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredContext")
            .field("subpass", &self.subpass)
            .field("pipeline", &self.pipeline.as_ref().map(|p| p.handle()))
            .field("bindings", &self.bindings.len())
            .field("finished", &self.command_buffer.is_none())
            .finish()
    }
}

impl<'a> DeferredContext<'a> {
    pub(crate) fn new_primary(list: &'a CommandList, command_buffer: CommandBufferHandle) -> Self {
        Self {
            list,
            command_buffer: Some(command_buffer),
            subpass: None,
            area: vk::Rect2D::default(),
            pipeline: None,
            bindings: ResourceBindings::new(),
            bound_layouts: Vec::new(),
            declared_images: Vec::new(),
            declared_buffers: Vec::new(),
            storage_writes: BTreeMap::new(),
            layouts_resolved: false,
        }
    }

    pub(crate) fn new_secondary(
        list: &'a CommandList,
        command_buffer: CommandBufferHandle,
        subpass: u32,
        area: vk::Rect2D,
    ) -> Self {
        Self {
            list,
            command_buffer: Some(command_buffer),
            subpass: Some(subpass),
            area,
            pipeline: None,
            bindings: ResourceBindings::new(),
            bound_layouts: Vec::new(),
            declared_images: Vec::new(),
            declared_buffers: Vec::new(),
            storage_writes: BTreeMap::new(),
            layouts_resolved: false,
        }
    }

    fn driver(&self) -> &dyn Driver {
        self.list.shared().driver.as_ref()
    }

    fn raw(&self) -> RhiResult<vk::CommandBuffer> {
        self.command_buffer
            .as_ref()
            .map(|buffer| buffer.raw())
            .ok_or_else(|| RhiError::invalid_state("context already finished"))
    }

    /// The context records inside a render pass.
    pub fn is_render_pass_context(&self) -> bool {
        self.subpass.is_some()
    }

    pub fn subpass(&self) -> Option<u32> {
        self.subpass
    }

    pub fn bindings(&self) -> &ResourceBindings {
        &self.bindings
    }

    pub fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipeline.as_ref()
    }

    fn require_primary(&self, operation: &str) -> RhiResult<vk::CommandBuffer> {
        if self.subpass.is_some() {
            return Err(RhiError::invalid_state(format!(
                "{} is not allowed inside a render pass",
                operation
            )));
        }
        self.raw()
    }

    fn require_render_pass(&self, operation: &str) -> RhiResult<vk::CommandBuffer> {
        if self.subpass.is_none() {
            return Err(RhiError::invalid_state(format!(
                "{} requires an active render pass",
                operation
            )));
        }
        self.raw()
    }

    /// Shader stages a bound resource is read from.
    fn binding_stages(&self) -> ShaderStages {
        if self.subpass.is_some() {
            ShaderStages::GRAPHICS
        } else {
            ShaderStages::COMPUTE
        }
    }

    // === State ===

    /// Bind `pipeline`. Graphics pipelines reset the dynamic state to the
    /// render area: viewport and scissor cover it, blend constants and the
    /// stencil reference are zero.
    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> RhiResult<()> {
        let command_buffer = self.raw()?;
        match (pipeline.is_compute(), self.subpass) {
            (true, Some(_)) => {
                return Err(RhiError::invalid_state(
                    "compute pipeline bound inside a render pass",
                ))
            }
            (false, None) => {
                return Err(RhiError::invalid_state(
                    "graphics pipeline bound outside a render pass",
                ))
            }
            (false, Some(subpass)) => {
                if let Some((_, pipeline_subpass)) = pipeline.render_pass() {
                    if pipeline_subpass != subpass {
                        return Err(RhiError::invalid_state(format!(
                            "pipeline built for subpass {} bound in subpass {}",
                            pipeline_subpass, subpass
                        )));
                    }
                }
            }
            (true, None) => {}
        }

        let driver = self.driver();
        driver.cmd_bind_pipeline(command_buffer, pipeline.bind_point(), pipeline.handle());
        if !pipeline.is_compute() {
            let viewport = vk::Viewport {
                x: self.area.offset.x as f32,
                y: self.area.offset.y as f32,
                width: self.area.extent.width as f32,
                height: self.area.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            driver.cmd_set_viewport(command_buffer, &viewport);
            driver.cmd_set_scissor(command_buffer, self.area);
            driver.cmd_set_blend_constants(command_buffer, [0.0; 4]);
            driver.cmd_set_stencil_reference(command_buffer, 0);
        }
        self.list.retain(pipeline.clone());
        self.pipeline = Some(pipeline.clone());
        self.layouts_resolved = false;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("set_viewport")?;
        self.driver().cmd_set_viewport(command_buffer, &viewport);
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("set_scissor")?;
        self.driver().cmd_set_scissor(command_buffer, scissor);
        Ok(())
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("set_blend_constants")?;
        self.driver().cmd_set_blend_constants(command_buffer, constants);
        Ok(())
    }

    pub fn set_stencil_reference(&mut self, reference: u32) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("set_stencil_reference")?;
        self.driver().cmd_set_stencil_reference(command_buffer, reference);
        Ok(())
    }

    // === Resource binding ===

    pub fn bind_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: Option<u64>,
    ) -> RhiResult<()> {
        self.raw()?;
        self.track_buffer(buffer, AccessRecord::from_state(ResourceState::ConstantBuffer));
        self.bind_buffer(set, binding, element, buffer, offset, range);
        Ok(())
    }

    pub fn bind_storage_buffer(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: Option<u64>,
    ) -> RhiResult<()> {
        self.raw()?;
        self.bind_buffer(set, binding, element, buffer, offset, range);
        if self.subpass.is_some() {
            self.track_buffer(buffer, AccessRecord::shader_write(self.binding_stages()));
        } else {
            self.list.retain(buffer.clone());
            self.storage_writes
                .insert((set, binding, element), StorageTarget::Buffer(buffer.clone()));
        }
        Ok(())
    }

    fn bind_buffer(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: Option<u64>,
    ) {
        self.set_binding(
            set,
            binding,
            element,
            Some(BindingInfo::Buffer {
                buffer: buffer.clone(),
                offset,
                range,
            }),
        );
    }

    /// Bind `view` for sampling. The view's range is tracked as a shader read.
    pub fn bind_image_view(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        view: &Arc<ImageView>,
    ) -> RhiResult<()> {
        self.raw()?;
        self.track_view(view, AccessRecord::shader_read(self.binding_stages()));
        self.set_binding(set, binding, element, Some(BindingInfo::ImageView(view.clone())));
        Ok(())
    }

    /// Bind `view` as a storage image, tracked as a shader write in `GENERAL`.
    /// Standalone contexts track the write again before every dispatch.
    pub fn bind_storage_image(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        view: &Arc<ImageView>,
    ) -> RhiResult<()> {
        self.raw()?;
        self.set_binding(set, binding, element, Some(BindingInfo::ImageView(view.clone())));
        if self.subpass.is_some() {
            self.track_view(view, AccessRecord::shader_write(self.binding_stages()));
        } else {
            self.list.retain(view.clone());
            self.storage_writes
                .insert((set, binding, element), StorageTarget::Image(view.clone()));
        }
        Ok(())
    }

    pub fn bind_sampler(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        sampler: &Arc<Sampler>,
    ) -> RhiResult<()> {
        self.raw()?;
        self.list.retain(sampler.clone());
        self.set_binding(set, binding, element, Some(BindingInfo::Sampler(sampler.clone())));
        Ok(())
    }

    pub fn bind_combined_image_sampler(
        &mut self,
        set: u32,
        binding: u32,
        element: u32,
        view: &Arc<ImageView>,
        sampler: &Arc<Sampler>,
    ) -> RhiResult<()> {
        self.raw()?;
        self.track_view(view, AccessRecord::shader_read(self.binding_stages()));
        self.list.retain(sampler.clone());
        self.set_binding(
            set,
            binding,
            element,
            Some(BindingInfo::CombinedImageSampler {
                view: view.clone(),
                sampler: sampler.clone(),
            }),
        );
        Ok(())
    }

    /// Texel buffer views are not supported.
    pub fn bind_texel_buffer(
        &mut self,
        _set: u32,
        _binding: u32,
        _element: u32,
        _buffer: &Arc<Buffer>,
    ) -> RhiResult<()> {
        Err(RhiError::Unimplemented("bind_texel_buffer"))
    }

    /// Remove whatever is bound at `(set, binding, element)`.
    pub fn unbind(&mut self, set: u32, binding: u32, element: u32) {
        self.set_binding(set, binding, element, None);
    }

    fn set_binding(&mut self, set: u32, binding: u32, element: u32, info: Option<BindingInfo>) {
        self.storage_writes.remove(&(set, binding, element));
        self.bindings.bind(set, binding, element, info);
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(&Arc<Buffer>, u64)],
    ) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("bind_vertex_buffers")?;
        let mut raw = Vec::with_capacity(buffers.len());
        for (buffer, offset) in buffers {
            self.track_buffer(buffer, AccessRecord::from_state(ResourceState::VertexBuffer));
            raw.push((buffer.handle(), *offset));
        }
        self.driver()
            .cmd_bind_vertex_buffers(command_buffer, first_binding, &raw);
        Ok(())
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        format: IndexFormat,
    ) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("bind_index_buffer")?;
        self.track_buffer(buffer, AccessRecord::from_state(ResourceState::IndexBuffer));
        self.driver()
            .cmd_bind_index_buffer(command_buffer, buffer.handle(), offset, format.to_vk());
        Ok(())
    }

    // === Tracking ===

    fn track_view(&self, view: &Arc<ImageView>, access: AccessRecord) {
        let image = view.image();
        self.list
            .inner
            .lock()
            .tracker
            .transition_image(image.sync_state(), view.range(), access);
        self.list.retain(view.clone());
    }

    fn track_image(&self, image: &Arc<Image>, range: SubresourceRange, access: AccessRecord) {
        self.list
            .inner
            .lock()
            .tracker
            .transition_image(image.sync_state(), range, access);
        self.list.retain(image.clone());
    }

    fn track_buffer(&self, buffer: &Arc<Buffer>, access: AccessRecord) {
        self.list
            .inner
            .lock()
            .tracker
            .transition_buffer(buffer.sync_state(), access);
        self.list.retain(buffer.clone());
    }

    /// Bring `range` of `image` into `state` for the next command.
    fn require_image_state(
        &mut self,
        image: &Arc<Image>,
        range: SubresourceRange,
        state: ResourceState,
    ) -> AccessRecord {
        let access = AccessRecord::from_state(state);
        let declared = self.declared_images.iter().any(|(handle, declared, s)| {
            *handle == image.handle() && *s == state && declared.contains(&range)
        });
        if !declared {
            self.track_image(image, range, access);
        }
        access
    }

    fn require_buffer_state(&mut self, buffer: &Arc<Buffer>, state: ResourceState) {
        let declared = self
            .declared_buffers
            .iter()
            .any(|(handle, s)| *handle == buffer.handle() && *s == state);
        if !declared {
            self.track_buffer(buffer, AccessRecord::from_state(state));
        }
    }

    /// Track every storage binding of a standalone context as a write by
    /// the next dispatch.
    fn track_storage_writes(&self) {
        let access = AccessRecord::shader_write(self.binding_stages());
        let mut inner = self.list.inner.lock();
        for target in self.storage_writes.values() {
            match target {
                StorageTarget::Buffer(buffer) => {
                    inner.tracker.transition_buffer(buffer.sync_state(), access)
                }
                StorageTarget::Image(view) => {
                    inner
                        .tracker
                        .transition_image(view.image().sync_state(), view.range(), access)
                }
            }
        }
    }

    /// A command was recorded; explicit transitions have been consumed.
    fn command_recorded(&mut self) {
        self.declared_images.clear();
        self.declared_buffers.clear();
    }

    /// Move `range` of `image` (the whole image when `None`) into `state`.
    ///
    /// The barrier is recorded before the next command of a standalone
    /// context, or before the render pass begins for a subpass context.
    pub fn transition_image(
        &mut self,
        image: &Arc<Image>,
        range: Option<SubresourceRange>,
        state: ResourceState,
    ) -> RhiResult<()> {
        self.raw()?;
        let range = range.unwrap_or_else(|| image.full_range());
        self.track_image(image, range, AccessRecord::from_state(state));
        self.declared_images.push((image.handle(), range, state));
        Ok(())
    }

    pub fn transition_buffer(&mut self, buffer: &Arc<Buffer>, state: ResourceState) -> RhiResult<()> {
        self.raw()?;
        self.track_buffer(buffer, AccessRecord::from_state(state));
        self.declared_buffers.push((buffer.handle(), state));
        Ok(())
    }

    /// Record every pending barrier. Only standalone contexts can record
    /// barriers; subpass contexts leave them to the render pass.
    pub fn deploy_barriers(&mut self) -> RhiResult<bool> {
        let command_buffer = self.require_primary("deploy_barriers")?;
        crate::profile_scope!("deploy_barriers");
        let driver = self.list.shared().driver.clone();
        let mut inner = self.list.inner.lock();
        inner.tracker.deploy_barriers(driver.as_ref(), command_buffer)
    }

    // === Binding resolution ===

    /// Write and bind a fresh descriptor set for every set of the bound
    /// pipeline whose bindings changed or whose layout differs from the one
    /// bound before.
    pub fn resolve_bindings(&mut self) -> RhiResult<()> {
        crate::profile_scope!("resolve_bindings");
        let command_buffer = self.raw()?;
        let pipeline = self
            .pipeline
            .clone()
            .ok_or_else(|| RhiError::invalid_state("no pipeline bound"))?;
        if self.layouts_resolved && !self.bindings.is_dirty() {
            return Ok(());
        }

        for layout in pipeline.set_layouts() {
            let set_index = layout.set_index();
            let slot = set_index as usize;
            if self.bound_layouts.len() <= slot {
                self.bound_layouts.resize(slot + 1, None);
            }
            let same_layout = matches!(
                &self.bound_layouts[slot],
                Some(bound) if Arc::ptr_eq(bound, layout)
            );
            if same_layout && !self.bindings.is_set_dirty(set_index) {
                continue;
            }
            if layout.bindings().is_empty() {
                self.bound_layouts[slot] = Some(layout.clone());
                self.bindings.clear_set_dirty(set_index);
                continue;
            }

            let writes = self.descriptor_writes(&pipeline, layout)?;
            let set = layout.allocate_set()?;
            let driver = self.driver();
            driver.update_descriptor_set(set, &writes);
            driver.cmd_bind_descriptor_set(
                command_buffer,
                pipeline.bind_point(),
                pipeline.layout_handle(),
                set_index,
                set,
            );
            log::trace!(
                "Bound descriptor set {:?} at index {} ({} writes)",
                set,
                set_index,
                writes.len()
            );

            let owner = layout.clone();
            self.list.defer(move || {
                if let Err(e) = owner.free_set(set) {
                    log::error!("Failed to free descriptor set {:?}: {}", set, e);
                }
            });
            self.bound_layouts[slot] = Some(layout.clone());
            self.bindings.clear_set_dirty(set_index);
        }
        self.layouts_resolved = true;
        Ok(())
    }

    fn descriptor_writes(
        &self,
        pipeline: &Pipeline,
        layout: &DescriptorSetLayout,
    ) -> RhiResult<Vec<DescriptorWrite>> {
        let set_index = layout.set_index();
        let mut writes = Vec::new();
        for ((binding, element), info) in self.bindings.entries(set_index) {
            let slot = pipeline.native_slot(set_index, binding);
            let Some(declared) = layout.binding(slot) else {
                log::debug!(
                    "Binding {} of set {} is not used by the pipeline",
                    binding,
                    set_index
                );
                continue;
            };
            if element >= declared.count {
                return Err(RhiError::invalid_state(format!(
                    "array element {} out of range for set {} binding {} (count {})",
                    element, set_index, binding, declared.count
                )));
            }
            writes.push(DescriptorWrite {
                binding: slot,
                array_element: element,
                ty: declared.ty,
                resource: descriptor_resource(declared.ty, info).ok_or_else(|| {
                    RhiError::invalid_state(format!(
                        "set {} binding {} expects {:?}",
                        set_index, binding, declared.ty
                    ))
                })?,
            });
        }
        Ok(writes)
    }

    // === Draws and dispatches ===

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("draw")?;
        self.resolve_bindings()?;
        self.driver().cmd_draw(
            command_buffer,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        self.command_recorded();
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        let command_buffer = self.require_render_pass("draw_indexed")?;
        self.resolve_bindings()?;
        self.driver().cmd_draw_indexed(
            command_buffer,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        self.command_recorded();
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        let command_buffer = self.require_primary("dispatch")?;
        self.resolve_bindings()?;
        self.track_storage_writes();
        self.deploy_barriers()?;
        self.driver().cmd_dispatch(command_buffer, x, y, z);
        self.command_recorded();
        Ok(())
    }

    // === Copies ===

    pub fn copy_buffer(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        let command_buffer = self.require_primary("copy_buffer")?;
        let in_range = |offset: u64, buffer: &Buffer| {
            offset
                .checked_add(size)
                .map_or(false, |end| end <= buffer.size())
        };
        if !in_range(src_offset, src) || !in_range(dst_offset, dst) {
            return Err(RhiError::invalid_state(format!(
                "buffer copy of {} bytes out of range",
                size
            )));
        }
        self.require_buffer_state(src, ResourceState::CopySource);
        self.require_buffer_state(dst, ResourceState::CopyDest);
        self.deploy_barriers()?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        self.driver()
            .cmd_copy_buffer(command_buffer, src.handle(), dst.handle(), &[region]);
        self.command_recorded();
        Ok(())
    }

    /// Copy tightly packed texels from `src` into every layer of one mip of `dst`.
    pub fn copy_buffer_to_image(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Image>,
        mip_level: u32,
    ) -> RhiResult<()> {
        let command_buffer = self.require_primary("copy_buffer_to_image")?;
        let range = mip_range(dst, mip_level)?;
        self.require_buffer_state(src, ResourceState::CopySource);
        let access = self.require_image_state(dst, range, ResourceState::CopyDest);
        self.deploy_barriers()?;
        let region = buffer_image_region(dst, src_offset, mip_level);
        self.driver().cmd_copy_buffer_to_image(
            command_buffer,
            src.handle(),
            dst.handle(),
            access.layout,
            &[region],
        );
        self.command_recorded();
        Ok(())
    }

    /// Read back every layer of one mip of `src` into `dst`, tightly packed.
    pub fn copy_image_to_buffer(
        &mut self,
        src: &Arc<Image>,
        mip_level: u32,
        dst: &Arc<Buffer>,
        dst_offset: u64,
    ) -> RhiResult<()> {
        let command_buffer = self.require_primary("copy_image_to_buffer")?;
        let range = mip_range(src, mip_level)?;
        let access = self.require_image_state(src, range, ResourceState::CopySource);
        self.require_buffer_state(dst, ResourceState::CopyDest);
        self.deploy_barriers()?;
        let region = buffer_image_region(src, dst_offset, mip_level);
        self.driver().cmd_copy_image_to_buffer(
            command_buffer,
            src.handle(),
            access.layout,
            dst.handle(),
            &[region],
        );
        self.command_recorded();
        Ok(())
    }

    /// Copy one mip of `src` into the same mip of `dst`. Extents must match.
    pub fn copy_image(&mut self, src: &Arc<Image>, dst: &Arc<Image>, mip_level: u32) -> RhiResult<()> {
        let command_buffer = self.require_primary("copy_image")?;
        let src_range = mip_range(src, mip_level)?;
        let dst_range = mip_range(dst, mip_level)?;
        let extent = src.extent().mip_level(mip_level);
        if extent != dst.extent().mip_level(mip_level) || src_range.layer_count != dst_range.layer_count
        {
            return Err(RhiError::invalid_state("copy_image between different sizes"));
        }
        let src_access = self.require_image_state(src, src_range, ResourceState::CopySource);
        let dst_access = self.require_image_state(dst, dst_range, ResourceState::CopyDest);
        self.deploy_barriers()?;
        let region = vk::ImageCopy {
            src_subresource: layers(src, mip_level),
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers(dst, mip_level),
            dst_offset: vk::Offset3D::default(),
            extent: extent.to_vk(),
        };
        self.driver().cmd_copy_image(
            command_buffer,
            src.handle(),
            src_access.layout,
            dst.handle(),
            dst_access.layout,
            &[region],
        );
        self.command_recorded();
        Ok(())
    }

    /// Scaled copy of one mip of `src` into one mip of `dst`.
    pub fn blit_image(
        &mut self,
        src: &Arc<Image>,
        src_mip: u32,
        dst: &Arc<Image>,
        dst_mip: u32,
        filter: vk::Filter,
    ) -> RhiResult<()> {
        let command_buffer = self.require_primary("blit_image")?;
        let src_range = mip_range(src, src_mip)?;
        let dst_range = mip_range(dst, dst_mip)?;
        let src_access = self.require_image_state(src, src_range, ResourceState::CopySource);
        let dst_access = self.require_image_state(dst, dst_range, ResourceState::CopyDest);
        self.deploy_barriers()?;
        let region = vk::ImageBlit {
            src_subresource: layers(src, src_mip),
            src_offsets: [vk::Offset3D::default(), far_corner(src, src_mip)],
            dst_subresource: layers(dst, dst_mip),
            dst_offsets: [vk::Offset3D::default(), far_corner(dst, dst_mip)],
        };
        self.driver().cmd_blit_image(
            command_buffer,
            src.handle(),
            src_access.layout,
            dst.handle(),
            dst_access.layout,
            &[region],
            filter,
        );
        self.command_recorded();
        Ok(())
    }

    /// Resolve a multisampled color image into a single-sampled one.
    pub fn resolve_image(&mut self, src: &Arc<Image>, dst: &Arc<Image>) -> RhiResult<()> {
        let command_buffer = self.require_primary("resolve_image")?;
        if src.format().is_depth() {
            return Err(RhiError::Unimplemented("depth/stencil resolve"));
        }
        if src.descriptor().samples <= 1 || dst.descriptor().samples != 1 {
            return Err(RhiError::invalid_state(
                "resolve needs a multisampled source and a single-sampled destination",
            ));
        }
        if src.extent() != dst.extent() {
            return Err(RhiError::invalid_state("resolve between different sizes"));
        }
        let src_range = mip_range(src, 0)?;
        let dst_range = mip_range(dst, 0)?;
        let src_access = self.require_image_state(src, src_range, ResourceState::ResolveSource);
        let dst_access = self.require_image_state(dst, dst_range, ResourceState::ResolveDest);
        self.deploy_barriers()?;
        let region = vk::ImageResolve {
            src_subresource: layers(src, 0),
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers(dst, 0),
            dst_offset: vk::Offset3D::default(),
            extent: src.extent().to_vk(),
        };
        self.driver().cmd_resolve_image(
            command_buffer,
            src.handle(),
            src_access.layout,
            dst.handle(),
            dst_access.layout,
            &[region],
        );
        self.command_recorded();
        Ok(())
    }

    // === Completion ===

    /// End recording. Standalone buffers join the list's submission;
    /// subpass buffers join their subpass.
    pub fn finish(mut self) -> RhiResult<()> {
        if self.subpass.is_none() {
            self.deploy_barriers()?;
        }
        let command_buffer = self
            .command_buffer
            .take()
            .ok_or_else(|| RhiError::invalid_state("context already finished"))?;
        if let Err(e) = command_buffer.end() {
            self.abandon();
            return Err(e);
        }

        let mut inner = self.list.inner.lock();
        match self.subpass {
            None => {
                inner.command_buffers.push(command_buffer);
                inner.recording = RecordingState::Finished;
                drop(inner);
                self.list.release_recording();
            }
            Some(subpass) => {
                let Some(active) = inner.render_pass.as_mut() else {
                    return Err(RhiError::invalid_state("render pass ended before its subpass"));
                };
                match active.subpasses.get_mut(subpass as usize) {
                    Some(buffers) => buffers.push(command_buffer),
                    None => {
                        return Err(RhiError::invalid_state(format!(
                            "subpass {} out of range",
                            subpass
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn abandon(&mut self) {
        let mut inner = self.list.inner.lock();
        inner.recording = RecordingState::Abandoned;
        if self.subpass.is_none() {
            drop(inner);
            self.list.release_recording();
        }
    }
}

impl Drop for DeferredContext<'_> {
    fn drop(&mut self) {
        if self.command_buffer.is_some() {
            log::warn!("Deferred context dropped without finishing; command list abandoned");
            self.command_buffer = None;
            self.abandon();
        }
    }
}

fn descriptor_resource(ty: DescriptorType, info: &BindingInfo) -> Option<DescriptorResource> {
    match (ty, info) {
        (
            DescriptorType::UniformBuffer | DescriptorType::StorageBuffer,
            BindingInfo::Buffer {
                buffer,
                offset,
                range,
            },
        ) => Some(DescriptorResource::Buffer {
            buffer: buffer.handle(),
            offset: *offset,
            range: range.unwrap_or(vk::WHOLE_SIZE),
        }),
        (DescriptorType::SampledImage | DescriptorType::InputAttachment, BindingInfo::ImageView(view)) => {
            Some(DescriptorResource::Image {
                view: view.handle(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
        }
        (DescriptorType::StorageImage, BindingInfo::ImageView(view)) => {
            Some(DescriptorResource::Image {
                view: view.handle(),
                layout: vk::ImageLayout::GENERAL,
            })
        }
        (DescriptorType::Sampler, BindingInfo::Sampler(sampler)) => {
            Some(DescriptorResource::Sampler(sampler.handle()))
        }
        (
            DescriptorType::CombinedImageSampler,
            BindingInfo::CombinedImageSampler { view, sampler },
        ) => Some(DescriptorResource::CombinedImageSampler {
            view: view.handle(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler: sampler.handle(),
        }),
        _ => None,
    }
}

fn mip_range(image: &Image, mip_level: u32) -> RhiResult<SubresourceRange> {
    let full = image.full_range();
    if mip_level >= full.level_count {
        return Err(RhiError::invalid_state(format!(
            "mip level {} out of range ({} levels)",
            mip_level, full.level_count
        )));
    }
    Ok(SubresourceRange::new(mip_level, 1, 0, full.layer_count))
}

fn layers(image: &Image, mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: image.aspect_mask(),
        mip_level,
        base_array_layer: 0,
        layer_count: image.full_range().layer_count,
    }
}

fn buffer_image_region(image: &Image, buffer_offset: u64, mip_level: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: layers(image, mip_level),
        image_offset: vk::Offset3D::default(),
        image_extent: image.extent().mip_level(mip_level).to_vk(),
    }
}

fn far_corner(image: &Image, mip_level: u32) -> vk::Offset3D {
    let extent = image.extent().mip_level(mip_level);
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}
