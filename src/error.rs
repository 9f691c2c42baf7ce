//! RHI error types.

use ash::vk;
use thiserror::Error;

/// Errors that can occur in the render hardware interface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// A native API call failed.
    #[error("{call} failed: {result:?}")]
    Native {
        /// Name of the failing native call.
        call: &'static str,
        /// Result code reported by the driver.
        result: vk::Result,
    },
    /// The caller broke a usage contract (wrong recording state, bad parameter, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A command list was recorded from two places at once.
    #[error("command list is already being recorded")]
    ConcurrentRecording,
    /// The operation exists in the API but this backend does not implement it.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
    /// A bounded fence wait expired.
    #[error("timed out waiting for a fence")]
    FenceTimeout,
    /// Out of device or host memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// Failed to initialize the backend.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// The memory allocator rejected a request.
    #[error("allocation failed: {0}")]
    Allocation(String),
}

/// Result alias used across the crate.
pub type RhiResult<T> = Result<T, RhiError>;

impl RhiError {
    /// Wrap a native result code, folding memory and device-loss codes
    /// into their dedicated variants.
    pub fn native(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            result => Self::Native { call, result },
        }
    }

    /// Shorthand for a contract violation.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Map a native result into an [`RhiError`] naming the call.
pub(crate) trait VkResultExt<T> {
    fn call(self, name: &'static str) -> RhiResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn call(self, name: &'static str) -> RhiResult<T> {
        self.map_err(|result| RhiError::native(name, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RhiError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = RhiError::invalid_state("no active render pass");
        assert_eq!(err.to_string(), "invalid state: no active render pass");
    }

    #[test]
    fn test_native_error_folding() {
        assert_eq!(
            RhiError::native("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RhiError::OutOfMemory
        );
        assert_eq!(
            RhiError::native("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost
        );
        assert_eq!(
            RhiError::native("vkCreateImage", vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            RhiError::Native {
                call: "vkCreateImage",
                result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED
            }
        );
    }
}
