//! High-level resource states.
//!
//! Callers name the state a resource must be in; the access tracker
//! turns it into an access mask, pipeline stages and image layout
//! (see [`AccessRecord::from_state`](crate::sync::AccessRecord::from_state)).

/// How a resource is about to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Contents are undefined or may be discarded.
    #[default]
    Undefined,
    /// Any access, general layout.
    Common,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    IndirectArgument,
    /// Written as a color attachment.
    RenderTarget,
    /// Read and written from shaders (storage image/buffer).
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    /// Sampled or read from shaders.
    ShaderResource,
    CopySource,
    CopyDest,
    ResolveSource,
    ResolveDest,
    /// Handed to the presentation engine.
    Present,
}
