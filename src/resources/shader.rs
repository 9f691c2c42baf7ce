//! Shader modules and their resource interface.
//!
//! Reflection and cross-compilation happen outside this crate. A shader
//! arrives as a [`ShaderDescriptor`]: compiled code, the resources it
//! declares and a remap table from declared bindings to the native slots
//! the compiler assigned. The device caches modules by [`ShaderKey`].

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::queue::NativeHandle;
use crate::types::{ResourceBinding, ShaderStages};

/// Identity of a compiled shader: where it came from and how it was built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    pub source_path: String,
    /// Compilation target, e.g. `"spirv-1.3"`.
    pub target: String,
    pub entry_point: String,
}

impl ShaderKey {
    pub fn new(
        source_path: impl Into<String>,
        target: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            target: target.into(),
            entry_point: entry_point.into(),
        }
    }

    /// Content hash of the key.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A resource declared by a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResource {
    pub set: u32,
    pub binding: ResourceBinding,
}

impl ShaderResource {
    pub fn new(set: u32, binding: ResourceBinding) -> Self {
        Self { set, binding }
    }
}

/// Maps a declared `(set, binding)` to the native binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRemap {
    pub set: u32,
    pub binding: u32,
    pub slot: u32,
}

/// Everything needed to create a [`ShaderModule`].
#[derive(Debug, Clone)]
pub struct ShaderDescriptor {
    pub key: ShaderKey,
    pub stage: ShaderStages,
    /// Compiled SPIR-V words.
    pub code: Vec<u32>,
    pub resources: Vec<ShaderResource>,
    /// Bindings missing from the table keep their declared slot.
    pub remap: Vec<BindingRemap>,
}

impl ShaderDescriptor {
    pub fn new(key: ShaderKey, stage: ShaderStages, code: Vec<u32>) -> Self {
        Self {
            key,
            stage,
            code,
            resources: Vec::new(),
            remap: Vec::new(),
        }
    }

    pub fn with_resource(mut self, set: u32, binding: ResourceBinding) -> Self {
        self.resources.push(ShaderResource::new(set, binding));
        self
    }

    pub fn with_remap(mut self, set: u32, binding: u32, slot: u32) -> Self {
        self.remap.push(BindingRemap { set, binding, slot });
        self
    }
}

/// A compiled shader stage.
pub struct ShaderModule {
    shared: Arc<DeviceShared>,
    handle: vk::ShaderModule,
    key: ShaderKey,
    stage: ShaderStages,
    resources: Vec<ShaderResource>,
    remap: HashMap<(u32, u32), u32>,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .field("key", &self.key)
            .field("stage", &self.stage)
            .finish()
    }
}

impl ShaderModule {
    pub(crate) fn new(shared: Arc<DeviceShared>, descriptor: &ShaderDescriptor) -> RhiResult<Self> {
        if descriptor.code.is_empty() {
            return Err(RhiError::invalid_state(format!(
                "shader {} has no code",
                descriptor.key.source_path
            )));
        }
        if descriptor.stage.bits().count_ones() != 1 {
            return Err(RhiError::invalid_state(format!(
                "shader {} must target exactly one stage, got {:?}",
                descriptor.key.source_path, descriptor.stage
            )));
        }
        let handle = shared.driver.create_shader_module(&descriptor.code)?;
        let remap = descriptor
            .remap
            .iter()
            .map(|entry| ((entry.set, entry.binding), entry.slot))
            .collect();
        Ok(Self {
            shared,
            handle,
            key: descriptor.key.clone(),
            stage: descriptor.stage,
            resources: descriptor.resources.clone(),
            remap,
        })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn key(&self) -> &ShaderKey {
        &self.key
    }

    pub fn stage(&self) -> ShaderStages {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.key.entry_point
    }

    pub fn resources(&self) -> &[ShaderResource] {
        &self.resources
    }

    /// Native slot of a declared binding.
    pub fn native_slot(&self, set: u32, binding: u32) -> u32 {
        self.remap.get(&(set, binding)).copied().unwrap_or(binding)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.shared
            .destroy_deferred(NativeHandle::ShaderModule(self.handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_is_content_based() {
        let a = ShaderKey::new("shaders/blit.hlsl", "spirv", "main");
        let b = ShaderKey::new("shaders/blit.hlsl", "spirv", "main");
        let c = ShaderKey::new("shaders/blit.hlsl", "spirv", "vs_main");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }
}
