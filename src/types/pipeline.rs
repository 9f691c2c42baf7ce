//! Shader interface, fixed-function and render pass description types.

use ash::vk;
use bitflags::bitflags;

use super::{ImageFormat, ResourceState};

bitflags! {
    /// Shader stages a resource is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

impl ShaderStages {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        let mut flags = vk::ShaderStageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(Self::FRAGMENT) {
            flags |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(Self::COMPUTE) {
            flags |= vk::ShaderStageFlags::COMPUTE;
        }
        flags
    }

    /// Pipeline stages in which shaders of these kinds execute.
    pub fn to_pipeline_stages(self) -> vk::PipelineStageFlags {
        let mut flags = vk::PipelineStageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::PipelineStageFlags::VERTEX_SHADER;
        }
        if self.contains(Self::FRAGMENT) {
            flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        }
        if self.contains(Self::COMPUTE) {
            flags |= vk::PipelineStageFlags::COMPUTE_SHADER;
        }
        flags
    }
}

/// Kind of resource bound at a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    CombinedImageSampler,
    InputAttachment,
    UniformTexelBuffer,
}

impl DescriptorType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            Self::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        }
    }

    pub fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }
}

/// One slot of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBinding {
    /// Binding index inside the set.
    pub binding: u32,
    /// Resource kind.
    pub ty: DescriptorType,
    /// Array size.
    pub count: u32,
    /// Stages that access the binding.
    pub stages: ShaderStages,
}

impl ResourceBinding {
    pub fn new(binding: u32, ty: DescriptorType, stages: ShaderStages) -> Self {
        Self {
            binding,
            ty,
            count: 1,
            stages,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Per-vertex attribute formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Unorm8x4,
}

impl VertexFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Float32 => vk::Format::R32_SFLOAT,
            Self::Float32x2 => vk::Format::R32G32_SFLOAT,
            Self::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            Self::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            Self::Uint32 => vk::Format::R32_UINT,
            Self::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Layout of one bound vertex buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub per_instance: bool,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            Self::Uint16 => vk::IndexType::UINT16,
            Self::Uint32 => vk::IndexType::UINT32,
        }
    }
}

/// Color blending for one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendState {
    /// Source replaces destination.
    #[default]
    Replace,
    /// Premultiplied-free alpha blending.
    Alpha,
    /// Source is added to destination.
    Additive,
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: super::CompareFunction,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: super::CompareFunction::Less,
        }
    }
}

/// Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphicsState {
    pub topology: PrimitiveTopology,
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth: Option<DepthState>,
    /// One entry per color attachment of the subpass; missing entries replace.
    pub blend: Vec<BlendState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescriptor {
    pub format: ImageFormat,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    /// State the attachment is transitioned into before the pass begins.
    pub initial_state: ResourceState,
    /// State the attachment is left in when the pass ends.
    pub final_state: ResourceState,
}

impl AttachmentDescriptor {
    /// A cleared color target left readable by shaders.
    pub fn color(format: ImageFormat) -> Self {
        Self {
            format,
            samples: 1,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::ShaderResource,
        }
    }

    /// A cleared depth target left in depth-write state.
    pub fn depth(format: ImageFormat) -> Self {
        Self {
            format,
            samples: 1,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_state: ResourceState::Undefined,
            final_state: ResourceState::DepthWrite,
        }
    }

    pub fn with_states(mut self, initial: ResourceState, final_state: ResourceState) -> Self {
        self.initial_state = initial;
        self.final_state = final_state;
        self
    }

    pub fn with_ops(mut self, load_op: LoadOp, store_op: StoreOp) -> Self {
        self.load_op = load_op;
        self.store_op = store_op;
        self
    }
}

/// Attachment references of one subpass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SubpassDescriptor {
    pub colors: Vec<u32>,
    /// Resolve targets, parallel to `colors` when non-empty.
    pub resolves: Vec<u32>,
    pub depth_stencil: Option<u32>,
    pub inputs: Vec<u32>,
}

/// Attachments and subpasses of a render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub attachments: Vec<AttachmentDescriptor>,
    pub subpasses: Vec<SubpassDescriptor>,
}

impl RenderPassDescriptor {
    /// Single subpass writing every color attachment and the optional depth target.
    pub fn single_pass(colors: &[AttachmentDescriptor], depth: Option<AttachmentDescriptor>) -> Self {
        let mut attachments = colors.to_vec();
        let depth_stencil = depth.map(|d| {
            attachments.push(d);
            (attachments.len() - 1) as u32
        });
        Self {
            label: None,
            attachments,
            subpasses: vec![SubpassDescriptor {
                colors: (0..colors.len() as u32).collect(),
                resolves: Vec::new(),
                depth_stencil,
                inputs: Vec::new(),
            }],
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// State an attachment is left in when the pass ends. An undefined
    /// final state keeps the state of the first subpass using it.
    pub fn resolved_final_state(&self, attachment: u32) -> ResourceState {
        let declared = self
            .attachments
            .get(attachment as usize)
            .map(|a| a.final_state)
            .unwrap_or(ResourceState::Undefined);
        if declared != ResourceState::Undefined {
            return declared;
        }
        for subpass in &self.subpasses {
            if subpass.colors.contains(&attachment) || subpass.resolves.contains(&attachment) {
                return ResourceState::RenderTarget;
            }
            if subpass.depth_stencil == Some(attachment) {
                return ResourceState::DepthWrite;
            }
            if subpass.inputs.contains(&attachment) {
                return ResourceState::ShaderResource;
            }
        }
        ResourceState::Common
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphics_stages() {
        assert_eq!(
            ShaderStages::GRAPHICS.to_pipeline_stages(),
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert_eq!(
            ShaderStages::COMPUTE.to_vk(),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn test_single_pass_layout() {
        let desc = RenderPassDescriptor::single_pass(
            &[AttachmentDescriptor::color(ImageFormat::Rgba8Unorm)],
            Some(AttachmentDescriptor::depth(ImageFormat::Depth32Float)),
        );
        assert_eq!(desc.attachments.len(), 2);
        assert_eq!(desc.subpasses[0].colors, vec![0]);
        assert_eq!(desc.subpasses[0].depth_stencil, Some(1));
    }

    #[test]
    fn test_undefined_final_state_follows_subpass() {
        let color = AttachmentDescriptor::color(ImageFormat::Rgba8Unorm)
            .with_states(ResourceState::Undefined, ResourceState::Undefined);
        let desc = RenderPassDescriptor::single_pass(
            &[color],
            Some(AttachmentDescriptor::depth(ImageFormat::Depth32Float)),
        );
        assert_eq!(desc.resolved_final_state(0), ResourceState::RenderTarget);
        assert_eq!(desc.resolved_final_state(1), ResourceState::DepthWrite);
    }
}
