//! Resource state tracking and barrier synthesis.
//!
//! Images are tracked per subresource rectangle (mip levels × array layers),
//! buffers as a whole. Each command list owns one [`AccessTracker`]; the
//! persistent state that outlives a command list lives in
//! [`ImageSyncState`] and [`BufferSyncState`], shared with the resource
//! objects.

mod access;
mod barriers;
mod range;
mod tracker;

pub use access::AccessRecord;
pub use barriers::{BarrierBatch, Dependency, ImageBarrier, MemoryBarrier};
pub use range::{RangeMap, SubresourceRange};
pub use tracker::{AccessTracker, BufferSyncState, ImageSyncState, TrackerCheckpoint};
