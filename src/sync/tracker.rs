//! Per-command-list access tracking.
//!
//! For every image a command list touches the tracker keeps two partitions
//! of its subresource space:
//!
//! * *first access*: the state each touched rectangle must be in when the
//!   command list starts executing. Resolved against the image's persistent
//!   state at submission, producing the pre-command-buffer barriers.
//! * *last access*: the most recent access recorded for each rectangle,
//!   used as the source of the barrier when a new access arrives.
//!
//! Both partitions cover exactly the rectangles touched so far.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use super::{AccessRecord, BarrierBatch, Dependency, RangeMap, SubresourceRange};
use crate::backend::Driver;
use crate::error::RhiResult;

/// Persistent state of an image between command lists.
///
/// The global partition always covers the full image.
#[derive(Debug)]
pub struct ImageSyncState {
    handle: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    full_range: SubresourceRange,
    global: Mutex<RangeMap<AccessRecord>>,
}

impl ImageSyncState {
    pub fn new(
        handle: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        full_range: SubresourceRange,
    ) -> Self {
        Self {
            handle,
            aspect_mask,
            full_range,
            global: Mutex::new(RangeMap::filled(full_range, AccessRecord::undefined())),
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.aspect_mask
    }

    pub fn full_range(&self) -> SubresourceRange {
        self.full_range
    }

    /// Last known state of one subresource.
    pub fn state_at(&self, mip_level: u32, array_layer: u32) -> Option<AccessRecord> {
        self.global.lock().get(mip_level, array_layer).copied()
    }

    /// Snapshot of the persistent partition.
    pub fn states(&self) -> Vec<(SubresourceRange, AccessRecord)> {
        self.global
            .lock()
            .iter()
            .map(|(range, access)| (*range, *access))
            .collect()
    }
}

/// Persistent state of a buffer between command lists.
#[derive(Debug)]
pub struct BufferSyncState {
    handle: vk::Buffer,
    global: Mutex<AccessRecord>,
}

impl BufferSyncState {
    pub fn new(handle: vk::Buffer) -> Self {
        Self {
            handle,
            global: Mutex::new(AccessRecord::undefined()),
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn state(&self) -> AccessRecord {
        *self.global.lock()
    }
}

#[derive(Debug, Clone)]
struct TrackedImage {
    state: Arc<ImageSyncState>,
    first: RangeMap<AccessRecord>,
    last: RangeMap<AccessRecord>,
}

#[derive(Debug, Clone)]
struct TrackedBuffer {
    state: Arc<BufferSyncState>,
    first: AccessRecord,
    last: AccessRecord,
}

/// Tracker contents and the persistent states of everything it touches,
/// taken before a resolution so a failed submission can be undone.
#[derive(Debug)]
pub struct TrackerCheckpoint {
    images: BTreeMap<u64, TrackedImage>,
    buffers: BTreeMap<u64, TrackedBuffer>,
    image_states: Vec<RangeMap<AccessRecord>>,
    buffer_states: Vec<AccessRecord>,
}

/// Hazard tracker of one command list.
#[derive(Debug, Default)]
pub struct AccessTracker {
    images: BTreeMap<u64, TrackedImage>,
    buffers: BTreeMap<u64, TrackedBuffer>,
    pending: BarrierBatch,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing was recorded since the last resolution.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty() && self.pending.is_empty()
    }

    pub fn touches_image(&self, image: vk::Image) -> bool {
        self.images.contains_key(&image.as_raw())
    }

    pub fn tracked_images(&self) -> usize {
        self.images.len()
    }

    /// Barriers waiting to be recorded before the next command.
    pub fn pending_barriers(&self) -> &BarrierBatch {
        &self.pending
    }

    /// Rectangles of the last-access partition of an image.
    pub fn last_accesses(&self, image: vk::Image) -> Vec<(SubresourceRange, AccessRecord)> {
        self.images
            .get(&image.as_raw())
            .map(|tracked| {
                tracked
                    .last
                    .iter()
                    .map(|(range, access)| (*range, *access))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rectangles of the first-access partition of an image.
    pub fn first_accesses(&self, image: vk::Image) -> Vec<(SubresourceRange, AccessRecord)> {
        self.images
            .get(&image.as_raw())
            .map(|tracked| {
                tracked
                    .first
                    .iter()
                    .map(|(range, access)| (*range, *access))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record that `range` of `image` is accessed as `access` from now on.
    ///
    /// Overlaps with earlier accesses in this list produce barriers in the
    /// pending batch; rectangles seen for the first time become first
    /// accesses, resolved at submission.
    pub fn transition_image(
        &mut self,
        image: &Arc<ImageSyncState>,
        range: SubresourceRange,
        access: AccessRecord,
    ) {
        let Some(range) = range.intersect(&image.full_range) else {
            return;
        };
        let handle = image.handle;
        let aspect_mask = image.aspect_mask;
        let pending = &mut self.pending;
        let TrackedImage { first, last, .. } = self
            .images
            .entry(handle.as_raw())
            .or_insert_with(|| TrackedImage {
                state: image.clone(),
                first: RangeMap::new(),
                last: RangeMap::new(),
            });

        let gaps = last.update(range, |overlap, old| {
            match pending.add_image_transition(handle, aspect_mask, *overlap, old, &access) {
                Dependency::None => {
                    let merged = old.merge(&access);
                    first.update(*overlap, |_, first_access| {
                        if first_access == old {
                            merged
                        } else {
                            *first_access
                        }
                    });
                    merged
                }
                _ => access,
            }
        });
        for gap in gaps {
            last.insert_disjoint(gap, access);
            first.insert_disjoint(gap, access);
        }
    }

    /// Record that `range` of `image` is now in `access` without a barrier.
    ///
    /// Used after implicit transitions performed by the native API, such as
    /// the final layout of a render pass attachment.
    pub fn assume_image_state(
        &mut self,
        image: &Arc<ImageSyncState>,
        range: SubresourceRange,
        access: AccessRecord,
    ) {
        let Some(range) = range.intersect(&image.full_range) else {
            return;
        };
        let tracked = self
            .images
            .entry(image.handle.as_raw())
            .or_insert_with(|| TrackedImage {
                state: image.clone(),
                first: RangeMap::new(),
                last: RangeMap::new(),
            });
        for gap in tracked.last.overwrite(range, access, |_, _| access) {
            tracked.first.insert_disjoint(gap, access);
        }
    }

    /// Record a whole-buffer access.
    pub fn transition_buffer(&mut self, buffer: &Arc<BufferSyncState>, access: AccessRecord) {
        let access = access.without_layout();
        let key = buffer.handle.as_raw();
        let Some(tracked) = self.buffers.get_mut(&key) else {
            self.buffers.insert(
                key,
                TrackedBuffer {
                    state: buffer.clone(),
                    first: access,
                    last: access,
                },
            );
            return;
        };
        match self.pending.add_buffer_transition(&tracked.last, &access) {
            Dependency::None => {
                let merged = tracked.last.merge(&access);
                if tracked.first == tracked.last {
                    tracked.first = merged;
                }
                tracked.last = merged;
            }
            _ => tracked.last = access,
        }
    }

    /// Record the pending barriers into `command_buffer`.
    pub fn deploy_barriers(
        &mut self,
        driver: &dyn Driver,
        command_buffer: vk::CommandBuffer,
    ) -> RhiResult<bool> {
        self.pending.record(driver, command_buffer)
    }

    /// Hand the pending barriers to the caller.
    pub fn take_pending(&mut self) -> BarrierBatch {
        std::mem::take(&mut self.pending)
    }

    /// Barriers from each resource's persistent state into this list's
    /// first accesses.
    ///
    /// Afterwards the persistent states hold this list's last accesses and
    /// the tracker is empty. Must be called in submission order.
    pub fn resolve_first_accesses(&mut self) -> BarrierBatch {
        crate::profile_scope!("resolve_first_accesses");
        let mut batch = BarrierBatch::new();

        for tracked in std::mem::take(&mut self.images).into_values() {
            let image = &tracked.state;
            let mut global = image.global.lock();
            for (range, first) in tracked.first.iter() {
                global.for_each_overlap(*range, |overlap, current| {
                    batch.add_image_transition(
                        image.handle,
                        image.aspect_mask,
                        *overlap,
                        current,
                        first,
                    );
                });
            }
            for (range, last) in tracked.last.iter() {
                global.overwrite(*range, *last, |_, _| *last);
            }
        }

        for tracked in std::mem::take(&mut self.buffers).into_values() {
            let mut global = tracked.state.global.lock();
            batch.add_buffer_transition(&global, &tracked.first);
            *global = tracked.last;
        }

        if !self.pending.is_empty() {
            log::warn!("Access tracker resolved with unrecorded barriers; dropping them");
            self.pending.clear();
        }
        batch
    }

    /// Save what [`resolve_first_accesses`](Self::resolve_first_accesses)
    /// would consume and overwrite.
    pub fn checkpoint(&self) -> TrackerCheckpoint {
        TrackerCheckpoint {
            images: self.images.clone(),
            buffers: self.buffers.clone(),
            image_states: self
                .images
                .values()
                .map(|tracked| tracked.state.global.lock().clone())
                .collect(),
            buffer_states: self
                .buffers
                .values()
                .map(|tracked| *tracked.state.global.lock())
                .collect(),
        }
    }

    /// Undo a resolution: persistent states go back to what they were at
    /// `checkpoint` and the tracked accesses are reinstalled. Checkpoints
    /// of lists resolved in sequence must be restored in reverse order.
    pub fn restore(&mut self, checkpoint: TrackerCheckpoint) {
        for (tracked, saved) in checkpoint.images.values().zip(checkpoint.image_states) {
            *tracked.state.global.lock() = saved;
        }
        for (tracked, saved) in checkpoint.buffers.values().zip(checkpoint.buffer_states) {
            *tracked.state.global.lock() = saved;
        }
        self.images = checkpoint.images;
        self.buffers = checkpoint.buffers;
    }

    /// Forget everything recorded so far.
    pub fn clear(&mut self) {
        self.images.clear();
        self.buffers.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceState, ShaderStages};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn image(mips: u32, layers: u32) -> Arc<ImageSyncState> {
        Arc::new(ImageSyncState::new(
            vk::Image::from_raw(0x1000),
            vk::ImageAspectFlags::COLOR,
            SubresourceRange::new(0, mips, 0, layers),
        ))
    }

    fn state(state: ResourceState) -> AccessRecord {
        AccessRecord::from_state(state)
    }

    fn assert_partition(entries: &[(SubresourceRange, AccessRecord)]) {
        for (i, (a, _)) in entries.iter().enumerate() {
            for (b, _) in &entries[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_first_access_has_no_barrier() {
        let img = image(1, 1);
        let mut tracker = AccessTracker::new();
        tracker.transition_image(&img, img.full_range(), state(ResourceState::CopyDest));

        assert!(tracker.pending_barriers().is_empty());
        assert_eq!(
            tracker.first_accesses(img.handle()),
            vec![(img.full_range(), state(ResourceState::CopyDest))]
        );
    }

    #[test]
    fn test_write_then_read_barrier() {
        let img = image(1, 1);
        let mut tracker = AccessTracker::new();
        tracker.transition_image(&img, img.full_range(), state(ResourceState::CopyDest));
        tracker.transition_image(&img, img.full_range(), state(ResourceState::ShaderResource));

        let barriers = tracker.pending_barriers().image_barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[0].dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(barriers[0].range, img.full_range());
    }

    #[test]
    fn test_partial_overlap_barrier_covers_overlap_only() {
        let img = image(4, 1);
        let mut tracker = AccessTracker::new();
        tracker.transition_image(
            &img,
            SubresourceRange::new(0, 2, 0, 1),
            state(ResourceState::RenderTarget),
        );
        tracker.transition_image(&img, img.full_range(), state(ResourceState::ShaderResource));

        let barriers = tracker.pending_barriers().image_barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, SubresourceRange::new(0, 2, 0, 1));

        // Mips 2..4 were first touched by the read.
        let first = tracker.first_accesses(img.handle());
        assert!(first.contains(&(
            SubresourceRange::new(2, 2, 0, 1),
            state(ResourceState::ShaderResource)
        )));
    }

    #[test]
    fn test_read_after_read_merges_stages() {
        let img = image(1, 1);
        let mut tracker = AccessTracker::new();
        tracker.transition_image(&img, img.full_range(), AccessRecord::shader_read(ShaderStages::FRAGMENT));
        tracker.transition_image(&img, img.full_range(), AccessRecord::shader_read(ShaderStages::VERTEX));

        assert!(tracker.pending_barriers().is_empty());
        let merged = AccessRecord::shader_read(ShaderStages::GRAPHICS);
        assert_eq!(tracker.last_accesses(img.handle()), vec![(img.full_range(), merged)]);
        assert_eq!(tracker.first_accesses(img.handle()), vec![(img.full_range(), merged)]);
    }

    #[test]
    fn test_resolve_updates_global_state() {
        let img = image(1, 1);
        let mut tracker = AccessTracker::new();
        tracker.transition_image(&img, img.full_range(), state(ResourceState::CopyDest));
        tracker.transition_image(&img, img.full_range(), state(ResourceState::ShaderResource));
        let main = tracker.take_pending();
        assert_eq!(main.image_barriers().len(), 1);

        let pre = tracker.resolve_first_accesses();
        assert_eq!(pre.image_barriers().len(), 1);
        let barrier = pre.image_barriers()[0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(barrier.src_access.is_empty());

        assert!(tracker.is_empty());
        assert_eq!(img.state_at(0, 0), Some(state(ResourceState::ShaderResource)));
    }

    #[test]
    fn test_restore_undoes_resolution() {
        let img = image(2, 1);
        let buffer = Arc::new(BufferSyncState::new(vk::Buffer::from_raw(9)));
        let mut tracker = AccessTracker::new();
        tracker.transition_image(&img, img.full_range(), state(ResourceState::CopyDest));
        tracker.transition_buffer(&buffer, state(ResourceState::CopySource));

        let checkpoint = tracker.checkpoint();
        let first = tracker.resolve_first_accesses();
        assert!(tracker.is_empty());
        assert_eq!(
            img.state_at(0, 0).map(|access| access.layout),
            Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        );

        tracker.restore(checkpoint);
        assert_eq!(
            img.state_at(1, 0).map(|access| access.layout),
            Some(vk::ImageLayout::UNDEFINED)
        );
        assert_eq!(buffer.state(), AccessRecord::undefined());
        assert!(tracker.touches_image(img.handle()));

        // Resolving again yields the same barriers.
        let again = tracker.resolve_first_accesses();
        assert_eq!(again.image_barriers(), first.image_barriers());
        assert_eq!(again.memory_barriers(), first.memory_barriers());
    }

    #[test]
    fn test_second_list_starts_from_global_state() {
        let img = image(1, 1);
        let mut first_list = AccessTracker::new();
        first_list.transition_image(&img, img.full_range(), state(ResourceState::ShaderResource));
        first_list.resolve_first_accesses();

        let mut second_list = AccessTracker::new();
        second_list.transition_image(&img, img.full_range(), state(ResourceState::ShaderResource));
        assert!(second_list.resolve_first_accesses().is_empty());
    }

    #[test]
    fn test_assume_state_records_without_barrier() {
        let img = image(1, 1);
        let mut tracker = AccessTracker::new();
        tracker.transition_image(&img, img.full_range(), state(ResourceState::RenderTarget));
        tracker.assume_image_state(&img, img.full_range(), state(ResourceState::ShaderResource));
        assert!(tracker.pending_barriers().is_empty());
        assert_eq!(
            tracker.last_accesses(img.handle()),
            vec![(img.full_range(), state(ResourceState::ShaderResource))]
        );
    }

    #[test]
    fn test_buffer_hazards() {
        let buffer = Arc::new(BufferSyncState::new(vk::Buffer::from_raw(0x2000)));
        let mut tracker = AccessTracker::new();
        tracker.transition_buffer(&buffer, state(ResourceState::CopyDest));
        tracker.transition_buffer(&buffer, state(ResourceState::VertexBuffer));
        assert_eq!(tracker.pending_barriers().memory_barriers().len(), 1);
        tracker.take_pending();

        tracker.transition_buffer(&buffer, state(ResourceState::IndexBuffer));
        assert!(tracker.pending_barriers().is_empty());

        let pre = tracker.resolve_first_accesses();
        assert!(pre.memory_barriers().is_empty());
        assert!(!pre.is_empty());
        assert_eq!(
            buffer.state().access,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ
        );
    }

    /// After any sequence of transitions both partitions stay disjoint,
    /// cover the same subresources and the last partition holds the most
    /// recent state of every touched subresource.
    #[test]
    fn test_random_transitions_keep_partition() {
        const MIPS: u32 = 5;
        const LAYERS: u32 = 7;
        let states = [
            ResourceState::ShaderResource,
            ResourceState::CopyDest,
            ResourceState::CopySource,
            ResourceState::RenderTarget,
            ResourceState::UnorderedAccess,
        ];
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let img = image(MIPS, LAYERS);
            let mut tracker = AccessTracker::new();
            let mut touched = [[None; LAYERS as usize]; MIPS as usize];

            for _ in 0..rng.gen_range(1..20) {
                let base_mip = rng.gen_range(0..MIPS);
                let base_layer = rng.gen_range(0..LAYERS);
                let range = SubresourceRange::new(
                    base_mip,
                    rng.gen_range(1..=MIPS - base_mip),
                    base_layer,
                    rng.gen_range(1..=LAYERS - base_layer),
                );
                let access = state(states[rng.gen_range(0..states.len())]);
                tracker.transition_image(&img, range, access);

                for mip in range.base_mip_level..range.mip_end() {
                    for layer in range.base_array_layer..range.layer_end() {
                        touched[mip as usize][layer as usize] = Some(access.layout);
                    }
                }

                let last = tracker.last_accesses(img.handle());
                let first = tracker.first_accesses(img.handle());
                assert_partition(&last);
                assert_partition(&first);

                for mip in 0..MIPS {
                    for layer in 0..LAYERS {
                        let in_last: Vec<_> = last
                            .iter()
                            .filter(|(r, _)| r.contains_subresource(mip, layer))
                            .collect();
                        let in_first = first
                            .iter()
                            .filter(|(r, _)| r.contains_subresource(mip, layer))
                            .count();
                        match touched[mip as usize][layer as usize] {
                            Some(layout) => {
                                assert_eq!(in_last.len(), 1);
                                assert_eq!(in_first, 1);
                                assert_eq!(in_last[0].1.layout, layout);
                            }
                            None => {
                                assert!(in_last.is_empty());
                                assert_eq!(in_first, 0);
                            }
                        }
                    }
                }
            }
        }
    }
}
