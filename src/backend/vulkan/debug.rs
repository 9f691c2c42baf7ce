//! Validation messages forwarded to `log` under the `redlilium_rhi::validation`
//! target.
//!
//! Errors and warnings keep their level; informational layer chatter is
//! demoted to `debug` so it stays out of normal runs.

use std::ffi::{c_void, CStr};

use ash::vk;

use crate::error::{RhiError, RhiResult};

const LOG_TARGET: &str = "redlilium_rhi::validation";

/// A `VK_EXT_debug_utils` messenger and the loader that owns it.
pub struct ValidationMessenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl ValidationMessenger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> RhiResult<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(forward_message));

        let handle = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| {
                RhiError::InitializationFailed(format!("validation messenger: {:?}", e))
            })?;
        Ok(Self { loader, handle })
    }

    /// Destroy the messenger. Must run before the instance is destroyed.
    ///
    /// # Safety
    /// No other use of the messenger may follow.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_debug_utils_messenger(self.handle, None);
    }
}

fn log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    }
}

fn message_kind(kind: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// # Safety
/// `text` is null or a nul-terminated string valid for the call.
unsafe fn lossy(text: *const std::ffi::c_char) -> Option<String> {
    if text.is_null() {
        None
    } else {
        Some(CStr::from_ptr(text).to_string_lossy().into_owned())
    }
}

unsafe extern "system" fn forward_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let level = log_level(severity);
    if !log::log_enabled!(target: LOG_TARGET, level) {
        return vk::FALSE;
    }

    let (id, message, objects) = match data.as_ref() {
        Some(data) => (
            lossy(data.p_message_id_name),
            lossy(data.p_message),
            data.object_count,
        ),
        None => (None, None, 0),
    };
    log::log!(
        target: LOG_TARGET,
        level,
        "{} {} ({} objects): {}",
        message_kind(kind),
        id.as_deref().unwrap_or("-"),
        objects,
        message.as_deref().unwrap_or("<no message>")
    );

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_is_demoted() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(log_level(S::ERROR), log::Level::Error);
        assert_eq!(log_level(S::WARNING), log::Level::Warn);
        assert_eq!(log_level(S::INFO), log::Level::Debug);
        assert_eq!(log_level(S::VERBOSE), log::Level::Trace);
        assert_eq!(log_level(S::WARNING | S::INFO), log::Level::Warn);
    }

    #[test]
    fn test_validation_wins_over_other_kinds() {
        use vk::DebugUtilsMessageTypeFlagsEXT as T;
        assert_eq!(message_kind(T::VALIDATION | T::PERFORMANCE), "validation");
        assert_eq!(message_kind(T::PERFORMANCE), "performance");
        assert_eq!(message_kind(T::GENERAL), "general");
    }

    #[test]
    fn test_null_text_is_none() {
        assert_eq!(unsafe { lossy(std::ptr::null()) }, None);
        assert_eq!(
            unsafe { lossy(c"VUID-vkCmdDraw".as_ptr()) }.as_deref(),
            Some("VUID-vkCmdDraw")
        );
    }
}
