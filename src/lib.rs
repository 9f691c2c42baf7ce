//! RedLilium RHI - render hardware interface over Vulkan.
//!
//! The crate sits between a renderer and the native graphics API. It keeps
//! track of how every image subresource and buffer is accessed, synthesizes
//! the barriers between those accesses, caches descriptor set layouts and
//! pools descriptor sets, recycles command buffers per thread, and submits
//! recorded work in fenced jobs with a bounded number of frames in flight.
//!
//! # Overview
//!
//! ```text
//! Device ──creates──> Buffer / Image / ImageView / Sampler / Pipeline / ...
//!   │
//!   └─ CommandQueue (graphics, compute, transfer)
//!        └─ CommandList ──> DeferredContext      (copies, dispatches)
//!                       └─> RenderPassContext    (subpasses)
//!                              └─> DeferredContext (draws, secondary buffers)
//! ```
//!
//! Every command list owns an [`AccessTracker`](sync::AccessTracker). Barriers
//! inside a list are recorded as the list is built; the barriers from the
//! state a resource was left in by earlier lists are resolved at submission
//! and recorded into a separate buffer executed right before the list.
//!
//! # Example
//!
//! ```ignore
//! use redlilium_rhi::*;
//!
//! let device = Device::new(DeviceParameters::from_env())?;
//! let queue = device.queue(QueueType::Graphics);
//! let list = queue.create_command_list(Some("frame"));
//! {
//!     let pass = list.begin_render_pass(&framebuffer, &[ClearValue::Color([0.0; 4])])?;
//!     let mut draws = pass.subpass_context()?;
//!     draws.bind_pipeline(&pipeline)?;
//!     draws.bind_image_view(0, 0, 0, &texture_view)?;
//!     draws.draw(3, 1, 0, 0)?;
//!     draws.finish()?;
//!     pass.finish()?;
//! }
//! list.commit()?;
//! queue.submit_frame()?;
//! ```

pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod instance;
pub mod profiling;
pub mod queue;
pub mod resources;
pub mod sync;
pub mod types;

pub use backend::Driver;
pub use command::{
    CommandBufferAllocator, CommandList, DeferredContext, RecordingKind, RecordingState,
    RenderPassContext, SubmissionState,
};
pub use descriptor::{BindingInfo, DescriptorSetLayout, DescriptorSetLayoutCache, ResourceBindings};
pub use device::Device;
pub use error::{RhiError, RhiResult};
pub use instance::{BackendKind, DeviceParameters, NullCompletion};
pub use queue::CommandQueue;
pub use resources::{
    Buffer, ComputePipelineDescriptor, Framebuffer, GraphicsPipelineDescriptor, Image, ImageView,
    Pipeline, RenderPass, Sampler, Semaphore, ShaderDescriptor, ShaderKey, ShaderModule,
};
pub use sync::{AccessRecord, SubresourceRange};
pub use types::*;
