//! Barrier synthesis and batching.
//!
//! Barriers are collected into a [`BarrierBatch`] while commands are
//! recorded, then emitted as a single pipeline barrier right before the
//! command that needs them.

use ash::vk;

use super::{AccessRecord, SubresourceRange};
use crate::backend::Driver;
use crate::error::RhiResult;

/// What it takes to order a new access after an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Read after read in the same layout. The accesses are merged.
    None,
    /// Stage ordering only; nothing needs to be made visible.
    Execution,
    /// Read followed by a layout change. The image barrier carries no
    /// source access bits.
    Layout,
    /// The old access wrote; its writes must be made visible.
    Memory,
}

impl Dependency {
    /// Dependency between two accesses to the same image subresources.
    ///
    /// A new layout of `UNDEFINED` means the contents may be discarded and
    /// never requests a layout change.
    pub fn for_image(old: &AccessRecord, new: &AccessRecord) -> Self {
        let same_layout = old.layout == new.layout || new.layout == vk::ImageLayout::UNDEFINED;
        match (old.is_read_only(), new.is_read_only(), same_layout) {
            (false, _, _) => Self::Memory,
            (true, true, true) => Self::None,
            (true, false, true) => Self::Execution,
            (true, _, false) => Self::Layout,
        }
    }

    /// Dependency between two accesses to the same buffer.
    pub fn for_buffer(old: &AccessRecord, new: &AccessRecord) -> Self {
        match (old.is_read_only(), new.is_read_only()) {
            (false, _) => Self::Memory,
            (true, true) => Self::None,
            (true, false) => Self::Execution,
        }
    }
}

/// One image memory barrier over a subresource rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect_mask: vk::ImageAspectFlags,
    pub range: SubresourceRange,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

impl ImageBarrier {
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.range.to_vk(self.aspect_mask))
    }
}

/// A global memory barrier, used for buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Barriers to submit together as one `vkCmdPipelineBarrier`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarrierBatch {
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    memory_barriers: Vec<MemoryBarrier>,
    image_barriers: Vec<ImageBarrier>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// No dependency of any kind was added.
    pub fn is_empty(&self) -> bool {
        self.src_stages.is_empty()
            && self.dst_stages.is_empty()
            && self.memory_barriers.is_empty()
            && self.image_barriers.is_empty()
    }

    pub fn src_stages(&self) -> vk::PipelineStageFlags {
        if self.src_stages.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            self.src_stages
        }
    }

    pub fn dst_stages(&self) -> vk::PipelineStageFlags {
        if self.dst_stages.is_empty() {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            self.dst_stages
        }
    }

    pub fn image_barriers(&self) -> &[ImageBarrier] {
        &self.image_barriers
    }

    pub fn memory_barriers(&self) -> &[MemoryBarrier] {
        &self.memory_barriers
    }

    /// Order `new` after `old` over `range` of an image.
    pub fn add_image_transition(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        range: SubresourceRange,
        old: &AccessRecord,
        new: &AccessRecord,
    ) -> Dependency {
        let dependency = Dependency::for_image(old, new);
        let new_layout = if new.layout == vk::ImageLayout::UNDEFINED {
            old.layout
        } else {
            new.layout
        };

        let (src_access, dst_access) = match dependency {
            Dependency::None => return dependency,
            Dependency::Execution => {
                self.add_execution_dependency(old.stages, new.stages);
                return dependency;
            }
            Dependency::Layout if new.is_read_only() => {
                (vk::AccessFlags::empty(), vk::AccessFlags::empty())
            }
            Dependency::Layout => (vk::AccessFlags::empty(), new.access),
            Dependency::Memory => (old.access, new.access),
        };

        self.add_execution_dependency(old.stages, new.stages);
        self.image_barriers.push(ImageBarrier {
            image,
            aspect_mask,
            range,
            src_access,
            dst_access,
            old_layout: old.layout,
            new_layout,
        });
        dependency
    }

    /// Order `new` after `old` for a whole buffer.
    pub fn add_buffer_transition(&mut self, old: &AccessRecord, new: &AccessRecord) -> Dependency {
        let dependency = Dependency::for_buffer(old, new);
        match dependency {
            Dependency::None => {}
            Dependency::Execution | Dependency::Layout => {
                self.add_execution_dependency(old.stages, new.stages);
            }
            Dependency::Memory => {
                self.add_execution_dependency(old.stages, new.stages);
                self.memory_barriers.push(MemoryBarrier {
                    src_access: old.access,
                    dst_access: new.access,
                });
            }
        }
        dependency
    }

    pub fn add_execution_dependency(
        &mut self,
        src: vk::PipelineStageFlags,
        dst: vk::PipelineStageFlags,
    ) {
        self.src_stages |= src;
        self.dst_stages |= dst;
    }

    /// Move every barrier of `other` into this batch.
    pub fn append(&mut self, other: &mut BarrierBatch) {
        self.src_stages |= other.src_stages;
        self.dst_stages |= other.dst_stages;
        self.memory_barriers.append(&mut other.memory_barriers);
        self.image_barriers.append(&mut other.image_barriers);
        other.clear();
    }

    /// Record the batch into `command_buffer` and clear it.
    ///
    /// Does nothing if the batch is empty.
    pub fn record(&mut self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) -> RhiResult<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        crate::profile_scope!("record_barriers");
        log::trace!(
            "Recording barrier: {} image, {} memory, {:?} -> {:?}",
            self.image_barriers.len(),
            self.memory_barriers.len(),
            self.src_stages(),
            self.dst_stages()
        );
        driver.cmd_pipeline_barrier(command_buffer, self);
        self.clear();
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.src_stages = vk::PipelineStageFlags::empty();
        self.dst_stages = vk::PipelineStageFlags::empty();
        self.memory_barriers.clear();
        self.image_barriers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceState, ShaderStages};
    use ash::vk::Handle;

    fn state(state: ResourceState) -> AccessRecord {
        AccessRecord::from_state(state)
    }

    fn transition(old: ResourceState, new: ResourceState) -> (BarrierBatch, Dependency) {
        let mut batch = BarrierBatch::new();
        let dependency = batch.add_image_transition(
            vk::Image::from_raw(7),
            vk::ImageAspectFlags::COLOR,
            SubresourceRange::new(0, 1, 0, 1),
            &state(old),
            &state(new),
        );
        (batch, dependency)
    }

    #[test]
    fn test_batch_empty() {
        let batch = BarrierBatch::new();
        assert!(batch.is_empty());
        assert!(batch.image_barriers().is_empty());
    }

    #[test]
    fn test_read_after_read_is_skipped() {
        let (batch, dependency) =
            transition(ResourceState::ShaderResource, ResourceState::ShaderResource);
        assert_eq!(dependency, Dependency::None);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_read_after_read_layout_change_has_no_access_bits() {
        let (batch, dependency) =
            transition(ResourceState::ShaderResource, ResourceState::CopySource);
        assert_eq!(dependency, Dependency::Layout);
        let barrier = &batch.image_barriers()[0];
        assert!(barrier.src_access.is_empty());
        assert!(barrier.dst_access.is_empty());
        assert_eq!(barrier.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }

    #[test]
    fn test_write_after_read_same_layout_is_execution_only() {
        let old = AccessRecord::new(
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::ImageLayout::GENERAL,
        );
        let new = AccessRecord::shader_write(ShaderStages::COMPUTE);
        let mut batch = BarrierBatch::new();
        let dependency = batch.add_image_transition(
            vk::Image::from_raw(7),
            vk::ImageAspectFlags::COLOR,
            SubresourceRange::new(0, 1, 0, 1),
            &old,
            &new,
        );
        assert_eq!(dependency, Dependency::Execution);
        assert!(batch.image_barriers().is_empty());
        assert!(!batch.is_empty());
        assert_eq!(batch.src_stages(), vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn test_write_makes_memory_visible() {
        let (batch, dependency) =
            transition(ResourceState::CopyDest, ResourceState::ShaderResource);
        assert_eq!(dependency, Dependency::Memory);
        let barrier = &batch.image_barriers()[0];
        assert_eq!(barrier.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_discard_keeps_layout() {
        let (batch, _) = transition(ResourceState::RenderTarget, ResourceState::Undefined);
        let barrier = &batch.image_barriers()[0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn test_buffer_transitions() {
        let mut batch = BarrierBatch::new();
        let vertex = state(ResourceState::VertexBuffer);
        let copy_dst = state(ResourceState::CopyDest);

        assert_eq!(batch.add_buffer_transition(&vertex, &vertex), Dependency::None);
        assert!(batch.is_empty());

        assert_eq!(
            batch.add_buffer_transition(&vertex, &copy_dst),
            Dependency::Execution
        );
        assert!(batch.memory_barriers().is_empty());

        assert_eq!(
            batch.add_buffer_transition(&copy_dst, &vertex),
            Dependency::Memory
        );
        assert_eq!(batch.memory_barriers().len(), 1);
    }

    #[test]
    fn test_append_moves_barriers() {
        let (mut a, _) = transition(ResourceState::CopyDest, ResourceState::ShaderResource);
        let (mut b, _) = transition(ResourceState::Undefined, ResourceState::CopyDest);
        a.append(&mut b);
        assert_eq!(a.image_barriers().len(), 2);
        assert!(b.is_empty());
    }
}
