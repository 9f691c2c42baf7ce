//! Common types and descriptors for RHI resources.
//!
//! This module contains format enums, usage flags, resource states and the
//! descriptor structs consumed by the [`Device`](crate::Device) factory.

mod buffer;
mod image;
mod pipeline;
mod sampler;
mod state;

pub use buffer::{BufferDescriptor, BufferUsage, MemoryLocation};
pub use image::{ImageDescriptor, ImageFormat, ImageUsage, ImageViewDescriptor};
pub use pipeline::{
    AttachmentDescriptor, BlendState, CullMode, DepthState, DescriptorType, FrontFace,
    GraphicsState, IndexFormat, LoadOp, PrimitiveTopology, RenderPassDescriptor,
    ResourceBinding, ShaderStages, StoreOp, SubpassDescriptor, VertexAttribute,
    VertexBufferLayout, VertexFormat,
};
pub use sampler::{AddressMode, CompareFunction, FilterMode, SamplerDescriptor};
pub use state::ResourceState;

use ash::vk;

/// Hardware queue a command list is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

impl QueueType {
    /// All queue types, in index order.
    pub const ALL: [QueueType; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// Dense index used for per-queue arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
        }
    }
}

/// 3D extent for images and copy regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth in pixels (1 for 2D images).
    pub depth: u32,
}

impl Extent3d {
    /// Create a new 2D extent.
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    /// Create a new 3D extent.
    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Extent of the given mip level, never smaller than one texel.
    pub fn mip_level(&self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }

    pub(crate) fn to_vk(self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }
}

/// Clear value for render pass attachments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Clear a color attachment.
    Color([f32; 4]),
    /// Clear a depth/stencil attachment.
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        Self::Color([0.0; 4])
    }
}

impl ClearValue {
    pub(crate) fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_indices_are_dense() {
        for (i, queue) in QueueType::ALL.iter().enumerate() {
            assert_eq!(queue.index(), i);
        }
    }

    #[test]
    fn test_extent_mip_level() {
        let extent = Extent3d::new_2d(256, 64);
        assert_eq!(extent.mip_level(2), Extent3d::new_2d(64, 16));
        assert_eq!(extent.mip_level(8), Extent3d::new_2d(1, 1));
    }
}
