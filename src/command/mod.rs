//! Command recording.
//!
//! Command buffers come from per-thread pools ([`CommandBufferAllocator`])
//! and are recorded through [`DeferredContext`]s owned by a
//! [`CommandList`]. Render passes are recorded with a
//! [`RenderPassContext`], whose subpass contexts fill secondary buffers.

mod allocator;
mod context;
mod list;
mod render_pass;

pub use allocator::{CommandBufferAllocator, CommandBufferHandle, ThreadCommandPool};
pub use context::DeferredContext;
pub use list::{CommandList, RecordingKind, RecordingState, SubmissionState};
pub(crate) use list::PreparedList;
pub use render_pass::RenderPassContext;
