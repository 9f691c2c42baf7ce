//! Pooled descriptor set allocation for one layout.

use std::collections::HashMap;

use ash::vk;
use ash::vk::Handle;

use crate::backend::Driver;
use crate::error::{RhiError, RhiResult};
use crate::types::ResourceBinding;

#[derive(Debug)]
struct PoolSlot {
    pool: vk::DescriptorPool,
    live: u32,
}

/// Fixed-capacity native pools of one layout, grown on demand.
///
/// Allocation scans the pools from a cursor and creates a new pool when
/// all of them are full. Freeing a set rewinds the cursor to the pool it
/// came from so partially emptied pools are refilled first.
#[derive(Debug)]
pub(crate) struct DescriptorPoolAllocator {
    sizes: Vec<vk::DescriptorPoolSize>,
    capacity: u32,
    pools: Vec<PoolSlot>,
    cursor: usize,
    owners: HashMap<u64, usize>,
}

/// Descriptor counts for `capacity` sets of the given bindings.
fn pool_sizes(bindings: &[ResourceBinding], capacity: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let ty = binding.ty.to_vk();
        let count = binding.count.max(1) * capacity;
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

fn is_pool_exhausted(error: &RhiError) -> bool {
    matches!(
        error,
        RhiError::Native {
            result: vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
            ..
        }
    )
}

impl DescriptorPoolAllocator {
    /// Create the allocator together with its first pool.
    pub fn new(driver: &dyn Driver, bindings: &[ResourceBinding], capacity: u32) -> RhiResult<Self> {
        let capacity = capacity.max(1);
        let mut allocator = Self {
            sizes: pool_sizes(bindings, capacity),
            capacity,
            pools: Vec::new(),
            cursor: 0,
            owners: HashMap::new(),
        };
        allocator.grow(driver)?;
        Ok(allocator)
    }

    fn grow(&mut self, driver: &dyn Driver) -> RhiResult<usize> {
        let pool = driver.create_descriptor_pool(self.capacity, &self.sizes)?;
        self.pools.push(PoolSlot { pool, live: 0 });
        if self.pools.len() > 1 {
            log::debug!(
                "Descriptor pool allocator grew to {} pools of {} sets",
                self.pools.len(),
                self.capacity
            );
        }
        Ok(self.pools.len() - 1)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn live_sets(&self) -> usize {
        self.owners.len()
    }

    pub fn allocate(
        &mut self,
        driver: &dyn Driver,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        for index in self.cursor..self.pools.len() {
            if self.pools[index].live >= self.capacity {
                continue;
            }
            match driver.allocate_descriptor_set(self.pools[index].pool, layout) {
                Ok(set) => return Ok(self.register(index, set)),
                // The driver ran out before the set count did; treat the pool as full.
                Err(e) if is_pool_exhausted(&e) => self.pools[index].live = self.capacity,
                Err(e) => return Err(e),
            }
        }

        let index = self.grow(driver)?;
        let set = driver.allocate_descriptor_set(self.pools[index].pool, layout)?;
        Ok(self.register(index, set))
    }

    fn register(&mut self, index: usize, set: vk::DescriptorSet) -> vk::DescriptorSet {
        self.pools[index].live += 1;
        self.owners.insert(set.as_raw(), index);
        self.cursor = index;
        set
    }

    pub fn free(&mut self, driver: &dyn Driver, set: vk::DescriptorSet) -> RhiResult<()> {
        let index = self
            .owners
            .remove(&set.as_raw())
            .ok_or_else(|| RhiError::invalid_state("descriptor set not allocated by this layout"))?;
        let slot = &mut self.pools[index];
        driver.free_descriptor_set(slot.pool, set)?;
        slot.live = slot.live.saturating_sub(1);
        self.cursor = index;
        Ok(())
    }

    /// Destroy every pool, and with them every set still allocated.
    pub fn destroy(&mut self, driver: &dyn Driver) {
        for slot in self.pools.drain(..) {
            driver.destroy_descriptor_pool(slot.pool);
        }
        self.owners.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullDriver;
    use crate::types::{DescriptorType, ShaderStages};

    fn bindings() -> Vec<ResourceBinding> {
        vec![
            ResourceBinding::new(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX),
            ResourceBinding::new(1, DescriptorType::SampledImage, ShaderStages::FRAGMENT)
                .with_count(2),
            ResourceBinding::new(2, DescriptorType::UniformBuffer, ShaderStages::FRAGMENT),
        ]
    }

    #[test]
    fn test_pool_sizes_group_by_type() {
        let sizes = pool_sizes(&bindings(), 10);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 20);
        assert_eq!(sizes[1].descriptor_count, 20);
    }

    #[test]
    fn test_grows_when_full_and_reuses_freed_slots() {
        let driver = NullDriver::default();
        let layout = driver.create_descriptor_set_layout(&bindings()).unwrap();
        let mut allocator = DescriptorPoolAllocator::new(&driver, &bindings(), 2).unwrap();
        assert_eq!(allocator.pool_count(), 1);

        let a = allocator.allocate(&driver, layout).unwrap();
        let _b = allocator.allocate(&driver, layout).unwrap();
        let _c = allocator.allocate(&driver, layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.live_sets(), 3);

        // Freeing from the first pool makes it the allocation target again.
        allocator.free(&driver, a).unwrap();
        let d = allocator.allocate(&driver, layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.owners[&d.as_raw()], 0);

        assert!(allocator.free(&driver, a).is_err());

        allocator.destroy(&driver);
        driver.destroy_descriptor_set_layout(layout);
        assert_eq!(driver.live_handles(), 0);
    }
}
