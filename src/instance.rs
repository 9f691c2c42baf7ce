//! Device configuration.
//!
//! [`DeviceParameters`] collects everything a [`Device`](crate::Device) needs at
//! creation time: which driver to load, validation, frame pacing depth and the
//! descriptor pool sizing.
//!
//! # Example
//!
//! ```ignore
//! let params = DeviceParameters::default()
//!     .with_backend(BackendKind::Vulkan)
//!     .with_frames_in_flight(3)
//!     .with_validation(true);
//! let device = Device::new(params)?;
//! ```

use std::time::Duration;

/// Upper bound for the frame ring.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Descriptor sets per native descriptor pool.
pub const DEFAULT_SETS_PER_POOL: u32 = 50;

/// Which native driver backs a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Try Vulkan first, fall back to the headless driver.
    #[default]
    Auto,
    /// Native Vulkan through ash.
    Vulkan,
    /// Headless driver that records commands without a GPU.
    Null,
}

impl BackendKind {
    /// Parse a backend name (`auto`, `vulkan`, `null`), case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "vulkan" | "vk" => Some(Self::Vulkan),
            "null" | "dummy" | "headless" => Some(Self::Null),
            _ => None,
        }
    }
}

/// When the headless driver signals the fences of submitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NullCompletion {
    /// Work completes as soon as it is submitted.
    #[default]
    Immediate,
    /// Work stays in flight until the driver is told to complete it.
    Manual,
}

/// Parameters for creating a [`Device`](crate::Device).
#[derive(Debug, Clone)]
pub struct DeviceParameters {
    /// Driver selection.
    pub backend: BackendKind,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Application name reported to the driver.
    pub application_name: String,
    /// Number of frame slots in the frame ring.
    pub frames_in_flight: usize,
    /// Number of GPU jobs a queue may have in flight before submission blocks.
    pub max_jobs_in_flight: usize,
    /// Capacity of each native descriptor pool, in sets.
    pub descriptor_sets_per_pool: u32,
    /// Upper bound for every blocking fence wait.
    pub fence_timeout: Duration,
    /// Completion mode of the headless driver.
    pub null_completion: NullCompletion,
}

impl Default for DeviceParameters {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            validation: cfg!(debug_assertions),
            application_name: "RedLilium".to_string(),
            frames_in_flight: 2,
            max_jobs_in_flight: 8,
            descriptor_sets_per_pool: DEFAULT_SETS_PER_POOL,
            fence_timeout: Duration::from_secs(10),
            null_completion: NullCompletion::Immediate,
        }
    }
}

impl DeviceParameters {
    /// Defaults overridden by the `RHI_BACKEND` environment variable.
    pub fn from_env() -> Self {
        let mut params = Self::default();
        if let Ok(value) = std::env::var("RHI_BACKEND") {
            match BackendKind::parse(&value) {
                Some(kind) => params.backend = kind,
                None => log::warn!("Ignoring unknown RHI_BACKEND value '{}'", value),
            }
        }
        params
    }

    /// Headless configuration used by tests.
    pub fn headless(completion: NullCompletion) -> Self {
        Self {
            backend: BackendKind::Null,
            validation: false,
            null_completion: completion,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the frame ring depth, clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.clamp(1, MAX_FRAMES_IN_FLIGHT);
        self
    }

    pub fn with_max_jobs_in_flight(mut self, jobs: usize) -> Self {
        self.max_jobs_in_flight = jobs.max(1);
        self
    }

    pub fn with_descriptor_sets_per_pool(mut self, sets: u32) -> Self {
        self.descriptor_sets_per_pool = sets.max(1);
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Frame ring depth after clamping.
    pub(crate) fn frame_count(&self) -> usize {
        self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("Vulkan"), Some(BackendKind::Vulkan));
        assert_eq!(BackendKind::parse(" null "), Some(BackendKind::Null));
        assert_eq!(BackendKind::parse("auto"), Some(BackendKind::Auto));
        assert_eq!(BackendKind::parse("d3d11"), None);
    }

    #[test]
    fn test_frames_in_flight_clamped() {
        let params = DeviceParameters::default().with_frames_in_flight(8);
        assert_eq!(params.frames_in_flight, MAX_FRAMES_IN_FLIGHT);

        let params = DeviceParameters::default().with_frames_in_flight(0);
        assert_eq!(params.frame_count(), 1);
    }

    #[test]
    fn test_headless_defaults() {
        let params = DeviceParameters::headless(NullCompletion::Manual);
        assert_eq!(params.backend, BackendKind::Null);
        assert_eq!(params.null_completion, NullCompletion::Manual);
        assert_eq!(params.descriptor_sets_per_pool, DEFAULT_SETS_PER_POOL);
    }
}
