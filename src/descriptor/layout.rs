//! Descriptor set layouts and their device-wide cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::pool::DescriptorPoolAllocator;
use crate::backend::Driver;
use crate::error::RhiResult;
use crate::types::ResourceBinding;

/// Structural identity of a layout: set index plus the ordered bindings,
/// each flattened to `[binding, type, count, stages]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LayoutKey {
    set_index: u32,
    bindings: Vec<[u32; 4]>,
}

impl LayoutKey {
    fn new(set_index: u32, bindings: &[ResourceBinding]) -> Self {
        Self {
            set_index,
            bindings: bindings
                .iter()
                .map(|b| [b.binding, b.ty as u32, b.count, b.stages.bits()])
                .collect(),
        }
    }
}

/// An immutable descriptor set layout together with the pools its sets
/// are allocated from.
pub struct DescriptorSetLayout {
    driver: Arc<dyn Driver>,
    handle: vk::DescriptorSetLayout,
    set_index: u32,
    bindings: Vec<ResourceBinding>,
    ref_count: AtomicU32,
    pools: spin::Mutex<DescriptorPoolAllocator>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("set_index", &self.set_index)
            .field("bindings", &self.bindings)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl DescriptorSetLayout {
    fn new(
        driver: Arc<dyn Driver>,
        set_index: u32,
        bindings: &[ResourceBinding],
        sets_per_pool: u32,
    ) -> RhiResult<Self> {
        let handle = driver.create_descriptor_set_layout(bindings)?;
        let pools = match DescriptorPoolAllocator::new(driver.as_ref(), bindings, sets_per_pool) {
            Ok(pools) => pools,
            Err(e) => {
                driver.destroy_descriptor_set_layout(handle);
                return Err(e);
            }
        };
        Ok(Self {
            driver,
            handle,
            set_index,
            bindings: bindings.to_vec(),
            ref_count: AtomicU32::new(1),
            pools: spin::Mutex::new(pools),
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    pub fn bindings(&self) -> &[ResourceBinding] {
        &self.bindings
    }

    /// The slot with the given binding index.
    pub fn binding(&self, binding: u32) -> Option<&ResourceBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Number of cache lookups that resolved to this layout and were not released.
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().pool_count()
    }

    pub fn live_sets(&self) -> usize {
        self.pools.lock().live_sets()
    }

    /// Allocate a fresh descriptor set of this layout.
    pub fn allocate_set(&self) -> RhiResult<vk::DescriptorSet> {
        self.pools.lock().allocate(self.driver.as_ref(), self.handle)
    }

    /// Return a set to the pool it was allocated from.
    ///
    /// The set must no longer be referenced by pending GPU work.
    pub fn free_set(&self, set: vk::DescriptorSet) -> RhiResult<()> {
        self.pools.lock().free(self.driver.as_ref(), set)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.pools.get_mut().destroy(self.driver.as_ref());
        self.driver.destroy_descriptor_set_layout(self.handle);
    }
}

/// Device-wide cache sharing layouts by structure.
///
/// Lookups with the same set index and the same bindings in the same order
/// return the same layout. Layouts are never evicted: pending command
/// lists may still free sets into a layout's pools after every pipeline
/// using it is gone.
pub struct DescriptorSetLayoutCache {
    driver: Arc<dyn Driver>,
    sets_per_pool: u32,
    layouts: Mutex<HashMap<LayoutKey, Arc<DescriptorSetLayout>>>,
}

impl std::fmt::Debug for DescriptorSetLayoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayoutCache")
            .field("sets_per_pool", &self.sets_per_pool)
            .field("len", &self.len())
            .finish()
    }
}

impl DescriptorSetLayoutCache {
    pub fn new(driver: Arc<dyn Driver>, sets_per_pool: u32) -> Self {
        Self {
            driver,
            sets_per_pool,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Find or create the layout for `bindings` at `set_index`.
    pub fn get_or_create(
        &self,
        set_index: u32,
        bindings: &[ResourceBinding],
    ) -> RhiResult<Arc<DescriptorSetLayout>> {
        let key = LayoutKey::new(set_index, bindings);
        let mut layouts = self.layouts.lock();
        if let Some(layout) = layouts.get(&key) {
            layout.ref_count.fetch_add(1, Ordering::AcqRel);
            return Ok(layout.clone());
        }

        log::debug!(
            "Creating descriptor set layout for set {} with {} bindings",
            set_index,
            bindings.len()
        );
        let layout = Arc::new(DescriptorSetLayout::new(
            self.driver.clone(),
            set_index,
            bindings,
            self.sets_per_pool,
        )?);
        layouts.insert(key, layout.clone());
        Ok(layout)
    }

    /// Drop one reference obtained from [`get_or_create`](Self::get_or_create).
    pub fn release(&self, layout: &DescriptorSetLayout) {
        let previous = layout
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        if previous.is_err() {
            log::warn!("Descriptor set layout {:?} released too often", layout.handle);
        }
    }

    /// Number of distinct layouts.
    pub fn len(&self) -> usize {
        self.layouts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.lock().is_empty()
    }

    /// Forget every layout. Layouts still referenced elsewhere stay alive
    /// until their last user drops them.
    pub fn clear(&self) {
        self.layouts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullDriver;
    use crate::types::{DescriptorType, ShaderStages};

    fn cache(driver: &Arc<NullDriver>) -> DescriptorSetLayoutCache {
        DescriptorSetLayoutCache::new(driver.clone(), 4)
    }

    #[test]
    fn test_structural_sharing() {
        let driver = Arc::new(NullDriver::default());
        let cache = cache(&driver);
        let bindings = [
            ResourceBinding::new(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX),
            ResourceBinding::new(1, DescriptorType::SampledImage, ShaderStages::FRAGMENT),
        ];

        let a = cache.get_or_create(0, &bindings).unwrap();
        let b = cache.get_or_create(0, &bindings).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(a.pool_count(), 1);

        // Same bindings at another set index are a different layout.
        let c = cache.get_or_create(1, &bindings).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_binding_order_is_part_of_identity() {
        let driver = Arc::new(NullDriver::default());
        let cache = cache(&driver);
        let uniform = ResourceBinding::new(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX);
        let texture = ResourceBinding::new(1, DescriptorType::SampledImage, ShaderStages::FRAGMENT);

        let forward = cache.get_or_create(0, &[uniform, texture]).unwrap();
        let reversed = cache.get_or_create(0, &[texture, uniform]).unwrap();
        assert!(!Arc::ptr_eq(&forward, &reversed));

        let wider = cache
            .get_or_create(0, &[uniform, texture.with_count(4)])
            .unwrap();
        assert!(!Arc::ptr_eq(&forward, &wider));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_release_never_evicts() {
        let driver = Arc::new(NullDriver::default());
        let cache = cache(&driver);
        let bindings = [ResourceBinding::new(
            0,
            DescriptorType::StorageBuffer,
            ShaderStages::COMPUTE,
        )];

        let layout = cache.get_or_create(0, &bindings).unwrap();
        cache.release(&layout);
        cache.release(&layout);
        assert_eq!(layout.ref_count(), 0);
        assert_eq!(cache.len(), 1);

        let again = cache.get_or_create(0, &bindings).unwrap();
        assert!(Arc::ptr_eq(&layout, &again));
    }

    #[test]
    fn test_sets_come_from_own_pools() {
        let driver = Arc::new(NullDriver::default());
        let cache = cache(&driver);
        let layout = cache
            .get_or_create(
                0,
                &[ResourceBinding::new(0, DescriptorType::Sampler, ShaderStages::FRAGMENT)],
            )
            .unwrap();

        let sets: Vec<_> = (0..5).map(|_| layout.allocate_set().unwrap()).collect();
        assert_eq!(layout.pool_count(), 2);
        assert_eq!(layout.live_sets(), 5);
        for set in sets {
            layout.free_set(set).unwrap();
        }
        assert_eq!(driver.live_count("descriptor_set"), 0);

        drop(layout);
        cache.clear();
        assert_eq!(driver.live_handles(), 0);
    }
}
