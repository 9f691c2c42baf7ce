//! Render pass recording.

use std::sync::Arc;

use ash::vk;

use super::{CommandList, DeferredContext, RecordingState};
use crate::backend::{CommandBufferInheritance, RenderPassBegin};
use crate::error::{RhiError, RhiResult};
use crate::resources::Framebuffer;
use crate::sync::AccessRecord;
use crate::types::{AttachmentDescriptor, ClearValue, ResourceState};

/// A render pass being recorded into a [`CommandList`].
///
/// Draws go through [`subpass_context`](Self::subpass_context), which hands
/// out secondary command buffers; any number of them may record the same
/// subpass in parallel. [`finish`](Self::finish) builds the primary buffer
/// that begins the pass, executes every subpass's secondaries in order and
/// ends the pass.
pub struct RenderPassContext<'a> {
    list: &'a CommandList,
    framebuffer: Arc<Framebuffer>,
    clear_values: Vec<ClearValue>,
    subpass: u32,
    finished: bool,
}

impl std::fmt::Debug for RenderPassContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPassContext")
            .field("framebuffer", &self.framebuffer.handle())
            .field("subpass", &self.subpass)
            .finish()
    }
}

impl<'a> RenderPassContext<'a> {
    pub(crate) fn new(
        list: &'a CommandList,
        framebuffer: Arc<Framebuffer>,
        clear_values: &[ClearValue],
    ) -> Self {
        Self {
            list,
            framebuffer,
            clear_values: clear_values.to_vec(),
            subpass: 0,
            finished: false,
        }
    }

    pub fn framebuffer(&self) -> &Arc<Framebuffer> {
        &self.framebuffer
    }

    pub fn subpass(&self) -> u32 {
        self.subpass
    }

    /// A context recording a secondary buffer for the current subpass.
    pub fn subpass_context(&self) -> RhiResult<DeferredContext<'_>> {
        let shared = self.list.shared();
        let buffer = shared
            .command_allocator
            .acquire_secondary(self.list.queue_type())?;
        buffer.begin(Some(&CommandBufferInheritance {
            render_pass: self.framebuffer.render_pass().handle(),
            subpass: self.subpass,
            framebuffer: self.framebuffer.handle(),
        }))?;
        Ok(DeferredContext::new_secondary(
            self.list,
            buffer,
            self.subpass,
            self.framebuffer.area(),
        ))
    }

    pub fn next_subpass(&mut self) -> RhiResult<()> {
        let count = self.framebuffer.render_pass().subpass_count();
        if self.subpass + 1 >= count {
            return Err(RhiError::invalid_state(format!(
                "render pass has only {} subpasses",
                count
            )));
        }
        self.subpass += 1;
        if let Some(active) = self.list.inner.lock().render_pass.as_mut() {
            active.subpass = self.subpass;
        }
        Ok(())
    }

    /// Record the render pass into a new primary buffer of the list.
    pub fn finish(mut self) -> RhiResult<()> {
        crate::profile_scope!("finish_render_pass");
        let shared = self.list.shared().clone();
        let driver = shared.driver.as_ref();
        let render_pass = self.framebuffer.render_pass().clone();
        let descriptor = render_pass.descriptor();

        let primary = shared
            .command_allocator
            .acquire_primary(self.list.queue_type())?;
        primary.begin(None)?;

        let mut inner = self.list.inner.lock();
        let active = inner
            .render_pass
            .take()
            .ok_or_else(|| RhiError::invalid_state("no active render pass"))?;
        if inner.recording == RecordingState::Abandoned {
            return Err(RhiError::invalid_state(
                "a subpass context was dropped without finishing",
            ));
        }

        for (view, attachment) in self
            .framebuffer
            .attachments()
            .iter()
            .zip(&descriptor.attachments)
        {
            inner.tracker.transition_image(
                view.image().sync_state(),
                view.range(),
                attachment_entry_access(attachment),
            );
        }
        inner.tracker.deploy_barriers(driver, primary.raw())?;

        let begin = RenderPassBegin {
            render_pass: render_pass.handle(),
            framebuffer: self.framebuffer.handle(),
            area: self.framebuffer.area(),
            clear_values: &self.clear_values,
            contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        };
        driver.cmd_begin_render_pass(primary.raw(), &begin);
        let mut executed = Vec::new();
        for (index, secondaries) in active.subpasses.into_iter().enumerate() {
            if index > 0 {
                driver.cmd_next_subpass(
                    primary.raw(),
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
            }
            if !secondaries.is_empty() {
                let raw: Vec<vk::CommandBuffer> =
                    secondaries.iter().map(|buffer| buffer.raw()).collect();
                driver.cmd_execute_commands(primary.raw(), &raw);
            }
            executed.extend(secondaries);
        }
        driver.cmd_end_render_pass(primary.raw());
        primary.end()?;

        for (index, view) in self.framebuffer.attachments().iter().enumerate() {
            let state = descriptor.resolved_final_state(index as u32);
            inner.tracker.assume_image_state(
                view.image().sync_state(),
                view.range(),
                AccessRecord::from_state(state),
            );
            inner.retained.push(view.clone());
        }

        log::trace!(
            "Recorded render pass {:?} with {} secondary buffers",
            descriptor.label,
            executed.len()
        );
        inner.command_buffers.push(primary);
        inner.executed.extend(executed);
        inner.recording = RecordingState::Finished;
        drop(inner);

        self.finished = true;
        self.list.release_recording();
        Ok(())
    }
}

impl Drop for RenderPassContext<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("Render pass context dropped without finishing; command list abandoned");
        let mut inner = self.list.inner.lock();
        inner.render_pass = None;
        inner.recording = RecordingState::Abandoned;
        drop(inner);
        self.list.release_recording();
    }
}

/// Access with which the pass takes over an attachment.
///
/// An undefined initial state discards the contents: the pass writes the
/// attachment without a layout change, so only earlier accesses are ordered.
fn attachment_entry_access(attachment: &AttachmentDescriptor) -> AccessRecord {
    if attachment.initial_state != ResourceState::Undefined {
        return AccessRecord::from_state(attachment.initial_state);
    }
    let written = if attachment.format.is_depth() {
        ResourceState::DepthWrite
    } else {
        ResourceState::RenderTarget
    };
    AccessRecord {
        layout: vk::ImageLayout::UNDEFINED,
        ..AccessRecord::from_state(written)
    }
}
