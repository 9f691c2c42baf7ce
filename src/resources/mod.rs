//! GPU resource objects.
//!
//! Every resource is created by the [`Device`](crate::Device) and handed
//! out as an `Arc`. Command lists keep the resources they reference alive
//! until their GPU job completes; the native handle itself is destroyed
//! through the device's deferred destructor once no submitted work can
//! still use it.

mod buffer;
mod image;
mod pipeline;
mod render_pass;
mod sampler;
mod shader;

pub use buffer::Buffer;
pub use image::{Image, ImageView};
pub use pipeline::{ComputePipelineDescriptor, GraphicsPipelineDescriptor, Pipeline};
pub use render_pass::{Framebuffer, RenderPass};
pub use sampler::{Sampler, Semaphore};
pub use shader::{BindingRemap, ShaderDescriptor, ShaderKey, ShaderModule, ShaderResource};
