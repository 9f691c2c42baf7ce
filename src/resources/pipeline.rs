//! Graphics and compute pipelines.
//!
//! A pipeline's descriptor set layouts come from the descriptor layout
//! cache. By default they are derived from the resources its shaders
//! declare, merged per set in order of first appearance; a descriptor can
//! override the bindings of individual sets instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ash::vk;

use crate::backend::{GraphicsPipelineCreateInfo, ShaderStageInfo};
use crate::descriptor::DescriptorSetLayout;
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::queue::NativeHandle;
use crate::types::{GraphicsState, ResourceBinding, ShaderStages};

use super::{RenderPass, ShaderModule};

/// Describes a graphics pipeline.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub shaders: Vec<Arc<ShaderModule>>,
    pub state: GraphicsState,
    pub render_pass: Arc<RenderPass>,
    pub subpass: u32,
    /// Explicit bindings for some sets, replacing the reflected ones.
    pub set_layouts: BTreeMap<u32, Vec<ResourceBinding>>,
}

impl GraphicsPipelineDescriptor {
    pub fn new(
        shaders: Vec<Arc<ShaderModule>>,
        state: GraphicsState,
        render_pass: Arc<RenderPass>,
    ) -> Self {
        Self {
            label: None,
            shaders,
            state,
            render_pass,
            subpass: 0,
            set_layouts: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_subpass(mut self, subpass: u32) -> Self {
        self.subpass = subpass;
        self
    }

    pub fn with_set_layout(mut self, set: u32, bindings: Vec<ResourceBinding>) -> Self {
        self.set_layouts.insert(set, bindings);
        self
    }
}

/// Describes a compute pipeline.
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: Arc<ShaderModule>,
    pub set_layouts: BTreeMap<u32, Vec<ResourceBinding>>,
}

impl ComputePipelineDescriptor {
    pub fn new(shader: Arc<ShaderModule>) -> Self {
        Self {
            label: None,
            shader,
            set_layouts: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_set_layout(mut self, set: u32, bindings: Vec<ResourceBinding>) -> Self {
        self.set_layouts.insert(set, bindings);
        self
    }
}

/// Merge the declared resources of `shaders` into per-set binding lists
/// keyed by native slot. Stages of a slot used by several shaders are
/// combined.
pub(crate) fn merge_shader_bindings(
    shaders: &[Arc<ShaderModule>],
) -> RhiResult<BTreeMap<u32, Vec<ResourceBinding>>> {
    let mut sets: BTreeMap<u32, Vec<ResourceBinding>> = BTreeMap::new();
    for shader in shaders {
        for resource in shader.resources() {
            let slot = shader.native_slot(resource.set, resource.binding.binding);
            let bindings = sets.entry(resource.set).or_default();
            match bindings.iter_mut().find(|b| b.binding == slot) {
                Some(existing) => {
                    if existing.ty != resource.binding.ty || existing.count != resource.binding.count
                    {
                        return Err(RhiError::invalid_state(format!(
                            "set {} slot {} declared as {:?} and {:?}",
                            resource.set, slot, existing.ty, resource.binding.ty
                        )));
                    }
                    existing.stages |= resource.binding.stages | shader.stage();
                }
                None => bindings.push(ResourceBinding {
                    binding: slot,
                    stages: resource.binding.stages | shader.stage(),
                    ..resource.binding
                }),
            }
        }
    }
    Ok(sets)
}

/// A compiled pipeline with its layout.
pub struct Pipeline {
    shared: Arc<DeviceShared>,
    label: Option<String>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    remap: HashMap<(u32, u32), u32>,
    shaders: Vec<Arc<ShaderModule>>,
    render_pass: Option<Arc<RenderPass>>,
    subpass: u32,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("label", &self.label)
            .field("handle", &self.handle)
            .field("bind_point", &self.bind_point)
            .field("set_layouts", &self.set_layouts.len())
            .finish()
    }
}

/// Set layouts and native pipeline layout shared by both pipeline kinds.
struct LayoutParts {
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    layout: vk::PipelineLayout,
    remap: HashMap<(u32, u32), u32>,
}

impl LayoutParts {
    fn new(
        shared: &DeviceShared,
        shaders: &[Arc<ShaderModule>],
        overrides: &BTreeMap<u32, Vec<ResourceBinding>>,
    ) -> RhiResult<Self> {
        let mut sets = merge_shader_bindings(shaders)?;
        for (set, bindings) in overrides {
            sets.insert(*set, bindings.clone());
        }

        let mut remap = HashMap::new();
        for shader in shaders {
            for resource in shader.resources() {
                let key = (resource.set, resource.binding.binding);
                remap.insert(key, shader.native_slot(key.0, key.1));
            }
        }

        // Native pipeline layouts are dense: unused set indices get empty layouts.
        let set_count = sets.keys().next_back().map(|last| last + 1).unwrap_or(0);
        let mut set_layouts = Vec::with_capacity(set_count as usize);
        for set_index in 0..set_count {
            let bindings = sets.get(&set_index).map(Vec::as_slice).unwrap_or(&[]);
            match shared.layout_cache.get_or_create(set_index, bindings) {
                Ok(layout) => set_layouts.push(layout),
                Err(e) => {
                    Self::release_layouts(shared, &set_layouts);
                    return Err(e);
                }
            }
        }

        let handles: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|layout| layout.handle()).collect();
        let layout = match shared.driver.create_pipeline_layout(&handles) {
            Ok(layout) => layout,
            Err(e) => {
                Self::release_layouts(shared, &set_layouts);
                return Err(e);
            }
        };
        Ok(Self {
            set_layouts,
            layout,
            remap,
        })
    }

    fn release_layouts(shared: &DeviceShared, layouts: &[Arc<DescriptorSetLayout>]) {
        for layout in layouts {
            shared.layout_cache.release(layout);
        }
    }

    fn discard(self, shared: &DeviceShared) {
        shared.driver.destroy_pipeline_layout(self.layout);
        Self::release_layouts(shared, &self.set_layouts);
    }
}

impl Pipeline {
    pub(crate) fn new_graphics(
        shared: Arc<DeviceShared>,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Self> {
        if descriptor.subpass >= descriptor.render_pass.subpass_count() {
            return Err(RhiError::invalid_state(format!(
                "subpass {} out of range",
                descriptor.subpass
            )));
        }
        if !descriptor
            .shaders
            .iter()
            .any(|shader| shader.stage() == ShaderStages::VERTEX)
        {
            return Err(RhiError::invalid_state("graphics pipeline needs a vertex shader"));
        }
        if let Some(shader) = descriptor
            .shaders
            .iter()
            .find(|shader| shader.stage() == ShaderStages::COMPUTE)
        {
            return Err(RhiError::invalid_state(format!(
                "compute shader {} in a graphics pipeline",
                shader.key().source_path
            )));
        }

        let parts = LayoutParts::new(&shared, &descriptor.shaders, &descriptor.set_layouts)?;
        let stages: Vec<ShaderStageInfo<'_>> = descriptor
            .shaders
            .iter()
            .map(|shader| ShaderStageInfo {
                stage: shader.stage(),
                module: shader.handle(),
                entry_point: shader.entry_point(),
            })
            .collect();
        let render_pass = &descriptor.render_pass;
        let created = shared
            .driver
            .create_graphics_pipeline(&GraphicsPipelineCreateInfo {
                layout: parts.layout,
                render_pass: render_pass.handle(),
                subpass: descriptor.subpass,
                stages: &stages,
                state: &descriptor.state,
                color_attachment_count: render_pass.color_attachment_count(descriptor.subpass),
                samples: render_pass.samples(descriptor.subpass),
            });
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                parts.discard(&shared);
                return Err(e);
            }
        };
        log::debug!(
            "Created graphics pipeline {:?} with {} set layouts",
            descriptor.label,
            parts.set_layouts.len()
        );

        Ok(Self {
            shared,
            label: descriptor.label.clone(),
            handle,
            layout: parts.layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            set_layouts: parts.set_layouts,
            remap: parts.remap,
            shaders: descriptor.shaders.clone(),
            render_pass: Some(render_pass.clone()),
            subpass: descriptor.subpass,
        })
    }

    pub(crate) fn new_compute(
        shared: Arc<DeviceShared>,
        descriptor: &ComputePipelineDescriptor,
    ) -> RhiResult<Self> {
        let shader = &descriptor.shader;
        if shader.stage() != ShaderStages::COMPUTE {
            return Err(RhiError::invalid_state(format!(
                "{} is not a compute shader",
                shader.key().source_path
            )));
        }
        let shaders = [shader.clone()];
        let parts = LayoutParts::new(&shared, &shaders, &descriptor.set_layouts)?;
        let created = shared.driver.create_compute_pipeline(
            parts.layout,
            &ShaderStageInfo {
                stage: shader.stage(),
                module: shader.handle(),
                entry_point: shader.entry_point(),
            },
        );
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                parts.discard(&shared);
                return Err(e);
            }
        };

        Ok(Self {
            shared,
            label: descriptor.label.clone(),
            handle,
            layout: parts.layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            set_layouts: parts.set_layouts,
            remap: parts.remap,
            shaders: shaders.to_vec(),
            render_pass: None,
            subpass: 0,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn layout_handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub fn is_compute(&self) -> bool {
        self.bind_point == vk::PipelineBindPoint::COMPUTE
    }

    /// Descriptor set layouts indexed by set.
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)
    }

    pub fn shaders(&self) -> &[Arc<ShaderModule>] {
        &self.shaders
    }

    /// Render pass and subpass a graphics pipeline was built for.
    pub fn render_pass(&self) -> Option<(&Arc<RenderPass>, u32)> {
        self.render_pass.as_ref().map(|rp| (rp, self.subpass))
    }

    /// Native slot of a declared binding.
    pub fn native_slot(&self, set: u32, binding: u32) -> u32 {
        self.remap.get(&(set, binding)).copied().unwrap_or(binding)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for layout in &self.set_layouts {
            self.shared.layout_cache.release(layout);
        }
        self.shared.destroy_deferred(NativeHandle::Pipeline(self.handle));
        self.shared
            .destroy_deferred(NativeHandle::PipelineLayout(self.layout));
    }
}
