//! Native Vulkan driver using ash.
//!
//! Memory for buffers and images comes from gpu-allocator. Allocations are
//! owned by the driver and keyed by the raw handle, so the core only ever
//! sees plain `vk` handles. Validation layers are enabled through
//! [`DeviceParameters::validation`](crate::DeviceParameters).

mod allocator;
mod conversion;
mod debug;
mod device;
mod instance;

use std::collections::HashMap;
use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use parking_lot::Mutex;

use self::conversion::{
    convert_address_mode, convert_attachments, convert_blend_state, convert_buffer_usage,
    convert_compare_function, convert_cull_mode, convert_filter_mode, convert_front_face,
    convert_image_usage, convert_mipmap_filter_mode, convert_sample_count, convert_topology,
};
use self::device::QueueFamilies;
use super::{
    CommandBufferInheritance, DescriptorResource, DescriptorWrite, Driver,
    GraphicsPipelineCreateInfo, ImageViewCreateInfo, RenderPassBegin, ShaderStageInfo,
    SubmitBatch,
};
use crate::error::{RhiError, RhiResult, VkResultExt};
use crate::instance::{BackendKind, DeviceParameters};
use crate::sync::BarrierBatch;
use crate::types::{
    BufferDescriptor, ImageDescriptor, QueueType, RenderPassDescriptor, ResourceBinding,
    SamplerDescriptor,
};

fn allocation_error(e: gpu_allocator::AllocationError) -> RhiError {
    match e {
        gpu_allocator::AllocationError::OutOfMemory => RhiError::OutOfMemory,
        e => RhiError::Allocation(e.to_string()),
    }
}

fn entry_point_name(entry_point: &str) -> RhiResult<CString> {
    CString::new(entry_point).map_err(|e| {
        RhiError::invalid_state(format!(
            "Invalid entry point name (contains null byte): {}",
            e
        ))
    })
}

/// Vulkan [`Driver`].
pub struct AshDriver {
    _entry: ash::Entry,
    instance: ash::Instance,
    validation: Option<debug::ValidationMessenger>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    device_name: String,
    families: QueueFamilies,
    /// One lock per distinct native queue; `queue_slots` maps a
    /// [`QueueType`] index onto it.
    queues: Vec<Mutex<vk::Queue>>,
    queue_slots: [usize; 3],
    allocator: ManuallyDrop<Mutex<Allocator>>,
    buffer_allocations: Mutex<HashMap<u64, Allocation>>,
    image_allocations: Mutex<HashMap<u64, Allocation>>,
}

impl std::fmt::Debug for AshDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AshDriver")
            .field("device_name", &self.device_name)
            .field("families", &self.families)
            .finish()
    }
}

impl AshDriver {
    pub fn new(params: &DeviceParameters) -> RhiResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            RhiError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let bundle =
            instance::create_instance(&entry, &params.application_name, params.validation)?;
        let instance = bundle.instance;

        let selected = device::select_physical_device(&instance).and_then(|(physical, name)| {
            let families = device::find_queue_families(&instance, physical)?;
            let device = device::create_logical_device(&instance, physical, &families)?;
            Ok((physical, name, families, device))
        });
        let (physical_device, device_name, families, device) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                unsafe {
                    if let Some(validation) = &bundle.validation {
                        validation.destroy();
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let allocator =
            match allocator::create_allocator(&instance, physical_device, device.clone()) {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe {
                        device.destroy_device(None);
                        if let Some(validation) = &bundle.validation {
                            validation.destroy();
                        }
                        instance.destroy_instance(None);
                    }
                    return Err(e);
                }
            };

        let unique = families.unique();
        let queues = unique
            .iter()
            .map(|family| Mutex::new(unsafe { device.get_device_queue(*family, 0) }))
            .collect();
        let mut queue_slots = [0; 3];
        for queue in QueueType::ALL {
            let family = families.family(queue);
            queue_slots[queue.index()] = unique.iter().position(|f| *f == family).unwrap_or(0);
        }

        log::info!(
            "Vulkan driver initialized on {} (validation: {}, families: {:?})",
            device_name,
            bundle.validation.is_some(),
            families
        );

        Ok(Self {
            _entry: entry,
            instance,
            validation: bundle.validation,
            physical_device,
            device,
            device_name,
            families,
            queues,
            queue_slots,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            buffer_allocations: Mutex::new(HashMap::new()),
            image_allocations: Mutex::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self, queue: QueueType) -> u32 {
        self.families.family(queue)
    }

    fn queue(&self, queue: QueueType) -> &Mutex<vk::Queue> {
        &self.queues[self.queue_slots[queue.index()]]
    }

    /// Resources are shared between every queue family in use, so no
    /// ownership transfers are needed.
    fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        let unique = self.families.unique();
        if unique.len() > 1 {
            (vk::SharingMode::CONCURRENT, unique)
        } else {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        }
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free GPU allocation: {}", e);
        }
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let leaked: Vec<Allocation> = self
                .buffer_allocations
                .lock()
                .drain()
                .chain(self.image_allocations.lock().drain())
                .map(|(_, allocation)| allocation)
                .collect();
            if !leaked.is_empty() {
                log::warn!("{} GPU allocations alive at driver shutdown", leaked.len());
            }
            for allocation in leaked {
                self.free_allocation(allocation);
            }

            // The allocator must go before the device it allocates from.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(validation) = &self.validation {
                validation.destroy();
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl Driver for AshDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn name(&self) -> &str {
        &self.device_name
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RhiResult<vk::Buffer> {
        let (sharing_mode, families) = self.sharing();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size.max(1))
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);

        let buffer =
            unsafe { self.device.create_buffer(&buffer_info, None) }.call("vkCreateBuffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("buffer"),
                requirements,
                location: allocator::memory_location(descriptor.location),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_error);
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .call("vkBindBufferMemory");
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_allocation(allocation);
            return Err(e);
        }

        self.buffer_allocations
            .lock()
            .insert(buffer.as_raw(), allocation);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = self.buffer_allocations.lock().remove(&buffer.as_raw()) {
            self.free_allocation(allocation);
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut allocations = self.buffer_allocations.lock();
        let allocation = allocations
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RhiError::invalid_state("write to unknown buffer"))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::invalid_state("buffer is not host visible"))?;
        let start = offset as usize;
        let target = mapped
            .get_mut(start..start + data.len())
            .ok_or_else(|| RhiError::invalid_state("buffer write out of range"))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let allocations = self.buffer_allocations.lock();
        let allocation = allocations
            .get(&buffer.as_raw())
            .ok_or_else(|| RhiError::invalid_state("read from unknown buffer"))?;
        let mapped = allocation
            .mapped_slice()
            .ok_or_else(|| RhiError::invalid_state("buffer is not host visible"))?;
        let start = offset as usize;
        let source = mapped
            .get(start..start + out.len())
            .ok_or_else(|| RhiError::invalid_state("buffer read out of range"))?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> RhiResult<vk::Image> {
        let image_type = if descriptor.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let (sharing_mode, families) = self.sharing();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(descriptor.format.to_vk())
            .extent(descriptor.extent.to_vk())
            .mip_levels(descriptor.mip_levels)
            .array_layers(descriptor.array_layers)
            .samples(convert_sample_count(descriptor.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_image_usage(descriptor.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }.call("vkCreateImage")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("image"),
                requirements,
                location: gpu_allocator::MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_error);
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .call("vkBindImageMemory");
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            self.free_allocation(allocation);
            return Err(e);
        }

        self.image_allocations
            .lock()
            .insert(image.as_raw(), allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = self.image_allocations.lock().remove(&image.as_raw()) {
            self.free_allocation(allocation);
        }
    }

    fn create_image_view(&self, info: &ImageViewCreateInfo) -> RhiResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(info.image)
            .view_type(info.view_type)
            .format(info.format.to_vk())
            .components(vk::ComponentMapping::default())
            .subresource_range(info.range.to_vk(info.aspect_mask));

        unsafe { self.device.create_image_view(&view_info, None) }.call("vkCreateImageView")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> RhiResult<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter_mode(descriptor.mag_filter))
            .min_filter(convert_filter_mode(descriptor.min_filter))
            .mipmap_mode(convert_mipmap_filter_mode(descriptor.mipmap_filter))
            .address_mode_u(convert_address_mode(descriptor.address_mode_u))
            .address_mode_v(convert_address_mode(descriptor.address_mode_v))
            .address_mode_w(convert_address_mode(descriptor.address_mode_w))
            .mip_lod_bias(0.0)
            .anisotropy_enable(descriptor.anisotropy_clamp > 1)
            .max_anisotropy(descriptor.anisotropy_clamp.max(1) as f32)
            .compare_enable(descriptor.compare.is_some())
            .compare_op(
                descriptor
                    .compare
                    .map(convert_compare_function)
                    .unwrap_or(vk::CompareOp::ALWAYS),
            )
            .min_lod(descriptor.lod_min_clamp)
            .max_lod(descriptor.lod_max_clamp)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false);

        unsafe { self.device.create_sampler(&sampler_info, None) }.call("vkCreateSampler")
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .call("vkCreateShaderModule")
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[ResourceBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty.to_vk())
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages.to_vk())
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .call("vkCreateDescriptorSetLayout")
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        // Layouts without bindings still need a non-empty size list.
        let fallback = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLER,
            descriptor_count: 1,
        }];
        let sizes = if sizes.is_empty() { &fallback[..] } else { sizes };

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);

        unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .call("vkCreateDescriptorPool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .call("vkAllocateDescriptorSets")?;
        sets.into_iter().next().ok_or_else(|| {
            RhiError::native("vkAllocateDescriptorSets", vk::Result::ERROR_UNKNOWN)
        })
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> RhiResult<()> {
        unsafe { self.device.free_descriptor_sets(pool, &[set]) }.call("vkFreeDescriptorSets")
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut image_infos = Vec::with_capacity(writes.len());
        for write in writes {
            match write.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }),
                DescriptorResource::Image { view, layout } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: layout,
                    })
                }
                DescriptorResource::Sampler(sampler) => image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }),
                DescriptorResource::CombinedImageSampler {
                    view,
                    layout,
                    sampler,
                } => image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }),
            }
        }

        let mut next_buffer = 0;
        let mut next_image = 0;
        let native: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|write| {
                let native = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.ty.to_vk());
                match write.resource {
                    DescriptorResource::Buffer { .. } => {
                        next_buffer += 1;
                        native.buffer_info(&buffer_infos[next_buffer - 1..next_buffer])
                    }
                    _ => {
                        next_image += 1;
                        native.image_info(&image_infos[next_image - 1..next_image])
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&native, &[]) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .call("vkCreatePipelineLayout")
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        let entry_points = info
            .stages
            .iter()
            .map(|stage| entry_point_name(stage.entry_point))
            .collect::<RhiResult<Vec<_>>>()?;
        let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = info
            .stages
            .iter()
            .zip(&entry_points)
            .map(|(stage, name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage.to_vk())
                    .module(stage.module)
                    .name(name)
            })
            .collect();

        let state = info.state;
        let binding_descriptions: Vec<vk::VertexInputBindingDescription> = state
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| {
                vk::VertexInputBindingDescription::default()
                    .binding(i as u32)
                    .stride(buffer.stride)
                    .input_rate(if buffer.per_instance {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    })
            })
            .collect();
        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = state
            .vertex_buffers
            .iter()
            .enumerate()
            .flat_map(|(i, buffer)| {
                buffer.attributes.iter().map(move |attr| {
                    vk::VertexInputAttributeDescription::default()
                        .location(attr.location)
                        .binding(i as u32)
                        .format(attr.format.to_vk())
                        .offset(attr.offset)
                })
            })
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert_topology(state.topology))
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(convert_cull_mode(state.cull_mode))
            .front_face(convert_front_face(state.front_face))
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(convert_sample_count(info.samples));

        let depth = state.depth.unwrap_or_default();
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth.is_some() && depth.test)
            .depth_write_enable(state.depth.is_some() && depth.write)
            .depth_compare_op(convert_compare_function(depth.compare))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..info
            .color_attachment_count
            as usize)
            .map(|i| convert_blend_state(state.blend.get(i).copied().unwrap_or_default()))
            .collect();
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(info.layout)
            .render_pass(info.render_pass)
            .subpass(info.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| RhiError::native("vkCreateGraphicsPipelines", e))?;

        pipelines.into_iter().next().ok_or_else(|| {
            RhiError::native("vkCreateGraphicsPipelines", vk::Result::ERROR_UNKNOWN)
        })
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        stage: &ShaderStageInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        let name = entry_point_name(stage.entry_point)?;
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(stage.module)
            .name(&name);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| RhiError::native("vkCreateComputePipelines", e))?;

        pipelines.into_iter().next().ok_or_else(|| {
            RhiError::native("vkCreateComputePipelines", vk::Result::ERROR_UNKNOWN)
        })
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> RhiResult<vk::RenderPass> {
        let attachments = convert_attachments(descriptor);

        let reference = |attachment: u32, layout: vk::ImageLayout| vk::AttachmentReference {
            attachment,
            layout,
        };
        let colors: Vec<Vec<vk::AttachmentReference>> = descriptor
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .colors
                    .iter()
                    .map(|a| reference(*a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect()
            })
            .collect();
        let resolves: Vec<Vec<vk::AttachmentReference>> = descriptor
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .resolves
                    .iter()
                    .map(|a| reference(*a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect()
            })
            .collect();
        let inputs: Vec<Vec<vk::AttachmentReference>> = descriptor
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .inputs
                    .iter()
                    .map(|a| reference(*a, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                    .collect()
            })
            .collect();
        let depths: Vec<Option<vk::AttachmentReference>> = descriptor
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .depth_stencil
                    .map(|a| reference(a, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL))
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription> = (0..descriptor.subpasses.len())
            .map(|i| {
                let mut subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&colors[i])
                    .input_attachments(&inputs[i]);
                if !resolves[i].is_empty() {
                    subpass = subpass.resolve_attachments(&resolves[i]);
                }
                if let Some(depth) = &depths[i] {
                    subpass = subpass.depth_stencil_attachment(depth);
                }
                subpass
            })
            .collect();

        let dependencies: Vec<vk::SubpassDependency> = (1..descriptor.subpasses.len() as u32)
            .map(|dst| {
                vk::SubpassDependency::default()
                    .src_subpass(dst - 1)
                    .dst_subpass(dst)
                    .src_stage_mask(
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    )
                    .dst_stage_mask(
                        vk::PipelineStageFlags::FRAGMENT_SHADER
                            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                            | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    )
                    .src_access_mask(
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    )
                    .dst_access_mask(
                        vk::AccessFlags::INPUT_ATTACHMENT_READ
                            | vk::AccessFlags::SHADER_READ
                            | vk::AccessFlags::COLOR_ATTACHMENT_READ
                            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    )
                    .dependency_flags(vk::DependencyFlags::BY_REGION)
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { self.device.create_render_pass(&create_info, None) }.call("vkCreateRenderPass")
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        layers: u32,
    ) -> RhiResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);

        unsafe { self.device.create_framebuffer(&create_info, None) }.call("vkCreateFramebuffer")
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_command_pool(&self, queue: QueueType) -> RhiResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.families.family(queue));

        unsafe { self.device.create_command_pool(&pool_info, None) }.call("vkCreateCommandPool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .call("vkAllocateCommandBuffers")?;
        buffers.into_iter().next().ok_or_else(|| {
            RhiError::native("vkAllocateCommandBuffers", vk::Result::ERROR_UNKNOWN)
        })
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .call("vkResetCommandBuffer")
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> RhiResult<()> {
        let inheritance_info = inheritance.map(|inheritance| {
            vk::CommandBufferInheritanceInfo::default()
                .render_pass(inheritance.render_pass)
                .subpass(inheritance.subpass)
                .framebuffer(inheritance.framebuffer)
        });

        let mut begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Some(inheritance_info) = &inheritance_info {
            begin_info = begin_info
                .flags(
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                        | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                )
                .inheritance_info(inheritance_info);
        }

        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .call("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }.call("vkEndCommandBuffer")
    }

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch) {
        let memory_barriers: Vec<vk::MemoryBarrier> = barriers
            .memory_barriers()
            .iter()
            .map(|barrier| {
                vk::MemoryBarrier::default()
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
            })
            .collect();
        let image_barriers: Vec<vk::ImageMemoryBarrier> = barriers
            .image_barriers()
            .iter()
            .map(|barrier| barrier.to_vk())
            .collect();

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                barriers.src_stages(),
                barriers.dst_stages(),
                vk::DependencyFlags::empty(),
                &memory_barriers,
                &[],
                &image_barriers,
            );
        }
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let clear_values: Vec<vk::ClearValue> =
            begin.clear_values.iter().map(|value| value.to_vk()).collect();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.area)
            .clear_values(&clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &begin_info, begin.contents);
        }
    }

    fn cmd_next_subpass(&self, command_buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        unsafe { self.device.cmd_next_subpass(command_buffer, contents) };
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) };
    }

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        if secondaries.is_empty() {
            return;
        }
        unsafe { self.device.cmd_execute_commands(command_buffer, secondaries) };
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        };
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[(vk::Buffer, u64)],
    ) {
        let (handles, offsets): (Vec<vk::Buffer>, Vec<u64>) = buffers.iter().copied().unzip();
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, first_binding, &handles, &offsets);
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type);
        }
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &vk::Viewport) {
        unsafe {
            self.device
                .cmd_set_viewport(command_buffer, 0, std::slice::from_ref(viewport));
        }
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(command_buffer, 0, &[scissor]) };
    }

    fn cmd_set_blend_constants(&self, command_buffer: vk::CommandBuffer, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(command_buffer, &constants) };
    }

    fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32) {
        unsafe {
            self.device.cmd_set_stencil_reference(
                command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            );
        }
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
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
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions);
        }
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
        unsafe {
            self.device
                .cmd_copy_image(command_buffer, src, src_layout, dst, dst_layout, regions);
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(command_buffer, src, src_layout, dst, regions);
        }
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device.cmd_blit_image(
                command_buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
                filter,
            );
        }
    }

    fn cmd_resolve_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        unsafe {
            self.device
                .cmd_resolve_image(command_buffer, src, src_layout, dst, dst_layout, regions);
        }
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);

        unsafe { self.device.create_fence(&fence_info, None) }.call("vkCreateFence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<bool> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(RhiError::native("vkWaitForFences", e)),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        unsafe { self.device.get_fence_status(fence) }.call("vkGetFenceStatus")
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.call("vkResetFences")
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&semaphore_info, None) }.call("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn queue_submit(
        &self,
        queue: QueueType,
        batches: &[SubmitBatch],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let waits: Vec<(Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>)> = batches
            .iter()
            .map(|batch| batch.wait_semaphores.iter().copied().unzip())
            .collect();
        let submits: Vec<vk::SubmitInfo> = batches
            .iter()
            .zip(&waits)
            .map(|(batch, (semaphores, stages))| {
                vk::SubmitInfo::default()
                    .wait_semaphores(semaphores)
                    .wait_dst_stage_mask(stages)
                    .command_buffers(&batch.command_buffers)
                    .signal_semaphores(&batch.signal_semaphores)
            })
            .collect();

        let native_queue = self.queue(queue).lock();
        unsafe { self.device.queue_submit(*native_queue, &submits, fence) }.call("vkQueueSubmit")
    }

    fn queue_wait_idle(&self, queue: QueueType) -> RhiResult<()> {
        let native_queue = self.queue(queue).lock();
        unsafe { self.device.queue_wait_idle(*native_queue) }.call("vkQueueWaitIdle")
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        // Host access to every queue must be synchronized.
        let _locks: Vec<_> = self.queues.iter().map(|queue| queue.lock()).collect();
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }
}
