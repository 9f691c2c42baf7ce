//! Image types and descriptors.

use ash::vk;
use bitflags::bitflags;

use super::{Extent3d, ResourceState};
use crate::sync::SubresourceRange;

/// Pixel formats supported for images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8Unorm,
    Rg8Unorm,
    R16Float,
    R32Float,
    R32Uint,
    Rg16Float,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rg32Float,
    Rgba32Float,
    Depth16Unorm,
    Depth32Float,
    Depth24PlusStencil8,
    Depth32FloatStencil8,
}

impl ImageFormat {
    /// Native format.
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::Rg8Unorm => vk::Format::R8G8_UNORM,
            Self::R16Float => vk::Format::R16_SFLOAT,
            Self::R32Float => vk::Format::R32_SFLOAT,
            Self::R32Uint => vk::Format::R32_UINT,
            Self::Rg16Float => vk::Format::R16G16_SFLOAT,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rg32Float => vk::Format::R32G32_SFLOAT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::Depth16Unorm => vk::Format::D16_UNORM,
            Self::Depth32Float => vk::Format::D32_SFLOAT,
            Self::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
            Self::Depth32FloatStencil8 => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    /// Size of one texel in bytes.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float | Self::Depth16Unorm => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::Rg16Float
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth32Float
            | Self::Depth24PlusStencil8 => 4,
            Self::Rgba16Float | Self::Rg32Float | Self::Depth32FloatStencil8 => 8,
            Self::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm
                | Self::Depth32Float
                | Self::Depth24PlusStencil8
                | Self::Depth32FloatStencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }

    /// Aspects covered by a full subresource of this format.
    pub fn aspect_mask(self) -> vk::ImageAspectFlags {
        if self.has_stencil() {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else if self.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }
}

bitflags! {
    /// Usage flags for images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Image can be copied from.
        const COPY_SRC = 1 << 0;
        /// Image can be copied to.
        const COPY_DST = 1 << 1;
        /// Image can be sampled in shaders.
        const SAMPLED = 1 << 2;
        /// Image can be used as a storage image.
        const STORAGE = 1 << 3;
        /// Image can be used as a color attachment.
        const COLOR_ATTACHMENT = 1 << 4;
        /// Image can be used as a depth/stencil attachment.
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        /// Image can be read as an input attachment.
        const INPUT_ATTACHMENT = 1 << 6;
    }
}

impl Default for ImageUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    /// Debug label for the image.
    pub label: Option<String>,
    /// Texel format.
    pub format: ImageFormat,
    /// Size of mip level 0.
    pub extent: Extent3d,
    /// Number of mip levels.
    pub mip_levels: u32,
    /// Number of array layers.
    pub array_layers: u32,
    /// Samples per texel.
    pub samples: u32,
    /// Usage flags.
    pub usage: ImageUsage,
    /// State the image settles into between command lists.
    pub default_state: ResourceState,
}

impl ImageDescriptor {
    /// Create a single-mip, single-layer 2D image descriptor.
    pub fn new_2d(width: u32, height: u32, format: ImageFormat, usage: ImageUsage) -> Self {
        Self {
            label: None,
            format,
            extent: Extent3d::new_2d(width, height),
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage,
            default_state: ResourceState::ShaderResource,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers.max(1);
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn with_default_state(mut self, state: ResourceState) -> Self {
        self.default_state = state;
        self
    }

    /// The whole mip × layer space of the image.
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::new(0, self.mip_levels, 0, self.array_layers)
    }

    /// Bytes needed to hold mip level 0 of every layer tightly packed.
    pub fn level0_size(&self) -> u64 {
        self.extent.width as u64
            * self.extent.height as u64
            * self.extent.depth as u64
            * self.array_layers as u64
            * self.format.bytes_per_pixel() as u64
    }
}

/// Descriptor for creating an image view.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImageViewDescriptor {
    /// View format, defaults to the image format.
    pub format: Option<ImageFormat>,
    /// Viewed subresources, defaults to the whole image.
    pub range: Option<SubresourceRange>,
}

impl ImageViewDescriptor {
    pub fn with_range(mut self, range: SubresourceRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_aspects() {
        assert_eq!(
            ImageFormat::Rgba8Unorm.aspect_mask(),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            ImageFormat::Depth32Float.aspect_mask(),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            ImageFormat::Depth24PlusStencil8.aspect_mask(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_level0_size() {
        let desc = ImageDescriptor::new_2d(256, 256, ImageFormat::Rgba8Unorm, ImageUsage::SAMPLED)
            .with_array_layers(2);
        assert_eq!(desc.level0_size(), 256 * 256 * 4 * 2);
        assert_eq!(desc.full_range(), SubresourceRange::new(0, 1, 0, 2));
    }
}
