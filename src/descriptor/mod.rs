//! Descriptor set layouts, pooled set allocation and the binding table.
//!
//! Layouts are shared device-wide by structure through
//! [`DescriptorSetLayoutCache`]. Every layout owns the native pools its
//! sets come from. Sets are never updated in place once bound: a context
//! writes a fresh set whenever bindings or layouts change, and returns the
//! set to its pool once the GPU job that used it has completed.

mod bindings;
mod layout;
mod pool;

pub use bindings::{BindingInfo, ResourceBindings};
pub use layout::{DescriptorSetLayout, DescriptorSetLayoutCache};
