//! Sparse table of bound shader resources.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::resources::{Buffer, ImageView, Sampler};

/// Resource bound to one array element of one binding.
#[derive(Debug, Clone)]
pub enum BindingInfo {
    Buffer {
        buffer: Arc<Buffer>,
        offset: u64,
        /// Bytes visible to the shader; `None` means up to the end of the buffer.
        range: Option<u64>,
    },
    ImageView(Arc<ImageView>),
    Sampler(Arc<Sampler>),
    CombinedImageSampler {
        view: Arc<ImageView>,
        sampler: Arc<Sampler>,
    },
}

#[derive(Debug, Default, Clone)]
struct SetBindings {
    entries: BTreeMap<(u32, u32), BindingInfo>,
    dirty: bool,
}

/// `set → (binding, array element) → resource`, with a dirty bit per set
/// and one for the whole table.
#[derive(Debug, Default, Clone)]
pub struct ResourceBindings {
    sets: BTreeMap<u32, SetBindings>,
    dirty: bool,
}

impl ResourceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `info` at `(set, binding, element)`; `None` unbinds.
    pub fn bind(&mut self, set: u32, binding: u32, element: u32, info: Option<BindingInfo>) {
        let entry = self.sets.entry(set).or_default();
        match info {
            Some(info) => {
                entry.entries.insert((binding, element), info);
            }
            None => {
                entry.entries.remove(&(binding, element));
            }
        }
        entry.dirty = true;
        self.dirty = true;
    }

    pub fn get(&self, set: u32, binding: u32, element: u32) -> Option<&BindingInfo> {
        self.sets
            .get(&set)
            .and_then(|bindings| bindings.entries.get(&(binding, element)))
    }

    /// Entries of one set in `(binding, element)` order.
    pub fn entries(&self, set: u32) -> impl Iterator<Item = ((u32, u32), &BindingInfo)> {
        self.sets
            .get(&set)
            .into_iter()
            .flat_map(|bindings| bindings.entries.iter().map(|(key, info)| (*key, info)))
    }

    /// Some set changed since it was last written to the GPU.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_set_dirty(&self, set: u32) -> bool {
        self.sets.get(&set).map(|bindings| bindings.dirty).unwrap_or(false)
    }

    /// Mark one set as written to the GPU.
    pub fn clear_set_dirty(&mut self, set: u32) {
        if let Some(bindings) = self.sets.get_mut(&set) {
            bindings.dirty = false;
        }
        self.dirty = self.sets.values().any(|bindings| bindings.dirty);
    }

    /// Number of bound entries across all sets.
    pub fn len(&self) -> usize {
        self.sets.values().map(|bindings| bindings.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullDriver;
    use crate::device::Device;
    use crate::instance::{DeviceParameters, NullCompletion};
    use crate::types::{BufferDescriptor, BufferUsage, SamplerDescriptor};

    fn device() -> Device {
        let driver = Arc::new(NullDriver::new(NullCompletion::Immediate));
        Device::with_driver(driver, DeviceParameters::headless(NullCompletion::Immediate))
            .unwrap()
    }

    fn buffer_info(device: &Device) -> BindingInfo {
        let buffer = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::UNIFORM))
            .unwrap();
        BindingInfo::Buffer {
            buffer,
            offset: 0,
            range: None,
        }
    }

    #[test]
    fn test_bind_marks_set_dirty() {
        let device = device();
        let mut bindings = ResourceBindings::new();
        assert!(!bindings.is_dirty());
        assert!(bindings.is_empty());

        bindings.bind(1, 0, 0, Some(buffer_info(&device)));
        assert!(bindings.is_dirty());
        assert!(bindings.is_set_dirty(1));
        assert!(!bindings.is_set_dirty(0));
        assert!(matches!(bindings.get(1, 0, 0), Some(BindingInfo::Buffer { .. })));
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn test_table_bit_follows_sets() {
        let device = device();
        let sampler = device.create_sampler(&SamplerDescriptor::default()).unwrap();
        let mut bindings = ResourceBindings::new();
        bindings.bind(0, 0, 0, Some(buffer_info(&device)));
        bindings.bind(2, 1, 0, Some(BindingInfo::Sampler(sampler)));

        bindings.clear_set_dirty(0);
        assert!(!bindings.is_set_dirty(0));
        // Set 2 still needs writing.
        assert!(bindings.is_dirty());

        bindings.clear_set_dirty(2);
        assert!(!bindings.is_dirty());

        // Clearing a set nothing was bound to changes nothing.
        bindings.clear_set_dirty(5);
        assert!(!bindings.is_dirty());
    }

    #[test]
    fn test_unbind_removes_entry_and_dirties_set() {
        let device = device();
        let mut bindings = ResourceBindings::new();
        bindings.bind(0, 3, 1, Some(buffer_info(&device)));
        bindings.bind(0, 3, 0, Some(buffer_info(&device)));
        bindings.clear_set_dirty(0);

        bindings.bind(0, 3, 1, None);
        assert!(bindings.get(0, 3, 1).is_none());
        assert!(bindings.is_set_dirty(0));
        assert!(bindings.is_dirty());
        let keys: Vec<_> = bindings.entries(0).map(|(key, _)| key).collect();
        assert_eq!(keys, vec![(3, 0)]);

        // Unbinding an empty slot still forces a rewrite.
        bindings.clear_set_dirty(0);
        bindings.bind(0, 9, 0, None);
        assert!(bindings.is_set_dirty(0));
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn test_entries_are_ordered() {
        let device = device();
        let mut bindings = ResourceBindings::new();
        for (binding, element) in [(4, 0), (0, 2), (0, 0), (1, 0)] {
            bindings.bind(0, binding, element, Some(buffer_info(&device)));
        }
        let keys: Vec<_> = bindings.entries(0).map(|(key, _)| key).collect();
        assert_eq!(keys, vec![(0, 0), (0, 2), (1, 0), (4, 0)]);
        assert_eq!(bindings.entries(1).count(), 0);
    }
}
