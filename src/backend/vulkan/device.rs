//! Physical device selection and logical device creation.

use std::ffi::CStr;

use ash::vk;

use crate::error::RhiError;
use crate::types::QueueType;

/// Queue family chosen for each [`QueueType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn family(&self, queue: QueueType) -> u32 {
        match queue {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
        }
    }

    /// Distinct families, in queue order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.compute, self.transfer] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Pick the best physical device. Discrete GPUs win over integrated ones.
pub fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, String), RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        RhiError::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e))
    })?;

    if devices.is_empty() {
        return Err(RhiError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        score += properties.limits.max_image_dimension2_d / 1024;

        // SAFETY: device_name is a null-terminated string filled in by the driver
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best = Some((device, device_name));
        }
    }

    best.ok_or_else(|| RhiError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Choose queue families. Dedicated compute and transfer families are
/// preferred; missing ones fall back to the graphics family.
pub fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilies, RhiError> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
        families
            .iter()
            .position(|family| {
                family.queue_count > 0
                    && family.queue_flags.contains(required)
                    && !family.queue_flags.intersects(excluded)
            })
            .map(|index| index as u32)
    };

    let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty()).ok_or_else(|| {
        RhiError::InitializationFailed("No graphics queue family found".to_string())
    })?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
    let transfer = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .unwrap_or(compute);

    Ok(QueueFamilies {
        graphics,
        compute,
        transfer,
    })
}

/// Create a logical device with one queue per distinct family.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<ash::Device, RhiError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let supported = unsafe { instance.get_physical_device_features(physical_device) };
    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);

    #[allow(unused_mut)]
    let mut device_extensions: Vec<*const std::ffi::c_char> = Vec::new();

    #[cfg(target_os = "macos")]
    {
        device_extensions.push(ash::khr::portability_subset::NAME.as_ptr());
    }

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        RhiError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_families() {
        let shared = QueueFamilies {
            graphics: 0,
            compute: 0,
            transfer: 0,
        };
        assert_eq!(shared.unique(), vec![0]);

        let dedicated = QueueFamilies {
            graphics: 0,
            compute: 2,
            transfer: 1,
        };
        assert_eq!(dedicated.unique(), vec![0, 2, 1]);
        assert_eq!(dedicated.family(QueueType::Transfer), 1);
    }
}
