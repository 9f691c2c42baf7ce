//! Render passes and framebuffers.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::queue::NativeHandle;
use crate::types::RenderPassDescriptor;

use super::ImageView;

pub struct RenderPass {
    shared: Arc<DeviceShared>,
    handle: vk::RenderPass,
    descriptor: RenderPassDescriptor,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("label", &self.descriptor.label)
            .field("attachments", &self.descriptor.attachments.len())
            .field("subpasses", &self.descriptor.subpasses.len())
            .finish()
    }
}

impl RenderPass {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        descriptor: &RenderPassDescriptor,
    ) -> RhiResult<Self> {
        if descriptor.subpasses.is_empty() {
            return Err(RhiError::invalid_state("render pass needs at least one subpass"));
        }
        let attachment_count = descriptor.attachments.len() as u32;
        for subpass in &descriptor.subpasses {
            let references = subpass
                .colors
                .iter()
                .chain(&subpass.resolves)
                .chain(&subpass.inputs)
                .chain(subpass.depth_stencil.iter());
            for &reference in references {
                if reference >= attachment_count {
                    return Err(RhiError::invalid_state(format!(
                        "subpass references attachment {} of {}",
                        reference, attachment_count
                    )));
                }
            }
            if !subpass.resolves.is_empty() && subpass.resolves.len() != subpass.colors.len() {
                return Err(RhiError::invalid_state(
                    "resolve attachments must match color attachments",
                ));
            }
        }
        let handle = shared.driver.create_render_pass(descriptor)?;
        Ok(Self {
            shared,
            handle,
            descriptor: descriptor.clone(),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn descriptor(&self) -> &RenderPassDescriptor {
        &self.descriptor
    }

    pub fn subpass_count(&self) -> u32 {
        self.descriptor.subpasses.len() as u32
    }

    /// Color attachments written by a subpass.
    pub fn color_attachment_count(&self, subpass: u32) -> u32 {
        self.descriptor
            .subpasses
            .get(subpass as usize)
            .map(|s| s.colors.len() as u32)
            .unwrap_or(0)
    }

    /// Sample count of the attachments a subpass renders to.
    pub fn samples(&self, subpass: u32) -> u32 {
        self.descriptor
            .subpasses
            .get(subpass as usize)
            .and_then(|s| s.colors.first().or(s.depth_stencil.as_ref()))
            .and_then(|&index| self.descriptor.attachments.get(index as usize))
            .map(|attachment| attachment.samples)
            .unwrap_or(1)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.shared
            .destroy_deferred(NativeHandle::RenderPass(self.handle));
    }
}

/// Image views bound to the attachments of a render pass.
pub struct Framebuffer {
    shared: Arc<DeviceShared>,
    handle: vk::Framebuffer,
    render_pass: Arc<RenderPass>,
    attachments: Vec<Arc<ImageView>>,
    extent: vk::Extent2D,
    layers: u32,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("render_pass", &self.render_pass.handle)
            .field("attachments", &self.attachments.len())
            .field("extent", &self.extent)
            .finish()
    }
}

impl Framebuffer {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        render_pass: &Arc<RenderPass>,
        attachments: &[Arc<ImageView>],
    ) -> RhiResult<Self> {
        let expected = render_pass.descriptor.attachments.len();
        if attachments.len() != expected {
            return Err(RhiError::invalid_state(format!(
                "framebuffer has {} attachments, render pass expects {}",
                attachments.len(),
                expected
            )));
        }
        let first = attachments
            .first()
            .ok_or_else(|| RhiError::invalid_state("framebuffer without attachments"))?;
        let size = first.extent();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let layers = first.range().layer_count;
        for (view, attachment) in attachments.iter().zip(&render_pass.descriptor.attachments) {
            let size = view.extent();
            if size.width != extent.width || size.height != extent.height {
                return Err(RhiError::invalid_state("framebuffer attachments differ in size"));
            }
            if view.format() != attachment.format {
                return Err(RhiError::invalid_state(format!(
                    "attachment format {:?} does not match render pass format {:?}",
                    view.format(),
                    attachment.format
                )));
            }
        }

        let views: Vec<vk::ImageView> = attachments.iter().map(|view| view.handle()).collect();
        let handle =
            shared
                .driver
                .create_framebuffer(render_pass.handle, &views, extent, layers)?;
        Ok(Self {
            shared,
            handle,
            render_pass: render_pass.clone(),
            attachments: attachments.to_vec(),
            extent,
            layers,
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn attachments(&self) -> &[Arc<ImageView>] {
        &self.attachments
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// The whole framebuffer area.
    pub fn area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.shared
            .destroy_deferred(NativeHandle::Framebuffer(self.handle));
    }
}
