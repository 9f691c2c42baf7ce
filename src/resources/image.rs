//! Images and image views.

use std::sync::Arc;

use ash::vk;

use crate::backend::ImageViewCreateInfo;
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::queue::NativeHandle;
use crate::sync::{ImageSyncState, SubresourceRange};
use crate::types::{Extent3d, ImageDescriptor, ImageFormat, ImageUsage, ImageViewDescriptor};

/// A GPU image.
///
/// The image's last known state per subresource lives in its
/// [`ImageSyncState`], shared with every command list that touches it.
pub struct Image {
    shared: Arc<DeviceShared>,
    handle: vk::Image,
    descriptor: ImageDescriptor,
    sync: Arc<ImageSyncState>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("label", &self.descriptor.label)
            .field("format", &self.descriptor.format)
            .field("extent", &self.descriptor.extent)
            .finish()
    }
}

impl Image {
    pub(crate) fn new(shared: Arc<DeviceShared>, descriptor: &ImageDescriptor) -> RhiResult<Self> {
        let extent = descriptor.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(RhiError::invalid_state("image extent must be non-zero"));
        }
        let handle = shared.driver.create_image(descriptor)?;
        let sync = Arc::new(ImageSyncState::new(
            handle,
            descriptor.format.aspect_mask(),
            descriptor.full_range(),
        ));
        Ok(Self {
            shared,
            handle,
            descriptor: descriptor.clone(),
            sync,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    pub fn format(&self) -> ImageFormat {
        self.descriptor.format
    }

    pub fn extent(&self) -> Extent3d {
        self.descriptor.extent
    }

    pub fn usage(&self) -> ImageUsage {
        self.descriptor.usage
    }

    pub fn full_range(&self) -> SubresourceRange {
        self.descriptor.full_range()
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.descriptor.format.aspect_mask()
    }

    pub fn sync_state(&self) -> &Arc<ImageSyncState> {
        &self.sync
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.shared.destroy_deferred(NativeHandle::Image(self.handle));
    }
}

/// A view of a subresource range of an image. Keeps the image alive.
pub struct ImageView {
    shared: Arc<DeviceShared>,
    handle: vk::ImageView,
    image: Arc<Image>,
    range: SubresourceRange,
    format: ImageFormat,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .field("image", &self.image.handle)
            .field("range", &self.range)
            .field("format", &self.format)
            .finish()
    }
}

impl ImageView {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        image: &Arc<Image>,
        descriptor: &ImageViewDescriptor,
    ) -> RhiResult<Self> {
        let full = image.full_range();
        let range = descriptor.range.unwrap_or(full);
        if range.is_empty() || !full.contains(&range) {
            return Err(RhiError::invalid_state(format!(
                "view range {:?} outside image range {:?}",
                range, full
            )));
        }
        let format = descriptor.format.unwrap_or(image.format());
        let view_type = if range.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else if image.extent().depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let handle = shared.driver.create_image_view(&ImageViewCreateInfo {
            image: image.handle,
            format,
            view_type,
            aspect_mask: format.aspect_mask(),
            range,
        })?;
        Ok(Self {
            shared,
            handle,
            image: image.clone(),
            range,
            format,
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn range(&self) -> SubresourceRange {
        self.range
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Size of the first viewed mip level.
    pub fn extent(&self) -> Extent3d {
        self.image.extent().mip_level(self.range.base_mip_level)
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.shared.destroy_deferred(NativeHandle::ImageView(self.handle));
    }
}
