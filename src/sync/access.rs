//! Access records: how a resource is used at one point in time.

use ash::vk;

use crate::types::{ResourceState, ShaderStages};

/// Access bits that modify memory. Everything else is a read.
const WRITE_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw(),
);

const ALL_SHADERS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

const FRAGMENT_TESTS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

/// Access mask, pipeline stages and image layout of one use of a resource.
///
/// Buffers ignore the layout and keep it `UNDEFINED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessRecord {
    pub access: vk::AccessFlags,
    pub stages: vk::PipelineStageFlags,
    pub layout: vk::ImageLayout,
}

impl Default for AccessRecord {
    fn default() -> Self {
        Self::undefined()
    }
}

impl AccessRecord {
    pub const fn new(
        access: vk::AccessFlags,
        stages: vk::PipelineStageFlags,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            access,
            stages,
            layout,
        }
    }

    /// Nothing has touched the resource yet; contents are undefined.
    pub const fn undefined() -> Self {
        Self::new(
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::ImageLayout::UNDEFINED,
        )
    }

    /// Read from shaders of the given stages as a sampled image.
    pub fn shader_read(stages: ShaderStages) -> Self {
        Self::new(
            vk::AccessFlags::SHADER_READ,
            stages.to_pipeline_stages(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    /// Read and written from shaders of the given stages.
    pub fn shader_write(stages: ShaderStages) -> Self {
        Self::new(
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            stages.to_pipeline_stages(),
            vk::ImageLayout::GENERAL,
        )
    }

    pub fn from_state(state: ResourceState) -> Self {
        use vk::AccessFlags as A;
        use vk::ImageLayout as L;
        use vk::PipelineStageFlags as S;

        match state {
            ResourceState::Undefined => Self::undefined(),
            ResourceState::Common => Self::new(
                A::MEMORY_READ | A::MEMORY_WRITE,
                S::ALL_COMMANDS,
                L::GENERAL,
            ),
            ResourceState::VertexBuffer => {
                Self::new(A::VERTEX_ATTRIBUTE_READ, S::VERTEX_INPUT, L::UNDEFINED)
            }
            ResourceState::IndexBuffer => Self::new(A::INDEX_READ, S::VERTEX_INPUT, L::UNDEFINED),
            ResourceState::ConstantBuffer => Self::new(A::UNIFORM_READ, ALL_SHADERS, L::UNDEFINED),
            ResourceState::IndirectArgument => {
                Self::new(A::INDIRECT_COMMAND_READ, S::DRAW_INDIRECT, L::UNDEFINED)
            }
            ResourceState::RenderTarget => Self::new(
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
                S::COLOR_ATTACHMENT_OUTPUT,
                L::COLOR_ATTACHMENT_OPTIMAL,
            ),
            ResourceState::UnorderedAccess => Self::new(
                A::SHADER_READ | A::SHADER_WRITE,
                ALL_SHADERS,
                L::GENERAL,
            ),
            ResourceState::DepthWrite => Self::new(
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
                FRAGMENT_TESTS,
                L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
            ResourceState::DepthRead => Self::new(
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ,
                FRAGMENT_TESTS | S::FRAGMENT_SHADER,
                L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ),
            ResourceState::ShaderResource => {
                Self::new(A::SHADER_READ, ALL_SHADERS, L::SHADER_READ_ONLY_OPTIMAL)
            }
            ResourceState::CopySource | ResourceState::ResolveSource => {
                Self::new(A::TRANSFER_READ, S::TRANSFER, L::TRANSFER_SRC_OPTIMAL)
            }
            ResourceState::CopyDest | ResourceState::ResolveDest => {
                Self::new(A::TRANSFER_WRITE, S::TRANSFER, L::TRANSFER_DST_OPTIMAL)
            }
            ResourceState::Present => {
                Self::new(A::empty(), S::BOTTOM_OF_PIPE, L::PRESENT_SRC_KHR)
            }
        }
    }

    /// Same record with the layout cleared, as tracked for buffers.
    pub fn without_layout(self) -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            ..self
        }
    }

    pub fn is_write(&self) -> bool {
        self.access.intersects(WRITE_ACCESS)
    }

    pub fn is_read_only(&self) -> bool {
        !self.is_write()
    }

    /// Union of two reads that share a layout.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            access: self.access | other.access,
            stages: self.stages | other.stages,
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_partition() {
        assert!(AccessRecord::undefined().is_read_only());
        assert!(AccessRecord::from_state(ResourceState::ShaderResource).is_read_only());
        assert!(AccessRecord::from_state(ResourceState::CopySource).is_read_only());
        assert!(AccessRecord::from_state(ResourceState::Present).is_read_only());
        assert!(AccessRecord::from_state(ResourceState::CopyDest).is_write());
        assert!(AccessRecord::from_state(ResourceState::RenderTarget).is_write());
        assert!(AccessRecord::from_state(ResourceState::UnorderedAccess).is_write());
        assert!(AccessRecord::from_state(ResourceState::Common).is_write());
    }

    #[test]
    fn test_state_layouts() {
        assert_eq!(
            AccessRecord::from_state(ResourceState::CopyDest).layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            AccessRecord::from_state(ResourceState::ShaderResource).access,
            vk::AccessFlags::SHADER_READ
        );
    }

    #[test]
    fn test_merge_unions_access_and_stages() {
        let fragment = AccessRecord::shader_read(ShaderStages::FRAGMENT);
        let vertex = AccessRecord::shader_read(ShaderStages::VERTEX);
        let merged = fragment.merge(&vertex);
        assert_eq!(merged.access, vk::AccessFlags::SHADER_READ);
        assert_eq!(
            merged.stages,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert_eq!(merged.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}
