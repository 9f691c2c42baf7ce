//! Command lists: recorded work plus everything it keeps alive.
//!
//! A command list collects the command buffers of the contexts recorded
//! into it, one access tracker spanning all of them, the resources they
//! reference and deferred deleters. Two state machines govern it:
//!
//! ```text
//! recording:  Idle -> Recording(Copy | Render) -> Finished -> Recording ...
//!                               \-> Abandoned (context dropped unfinished)
//! submission: Idle -> Enqueued -> Committed -> InFlight -> Retired
//! ```
//!
//! Only committed lists are picked up by [`CommandQueue::submit`]. Once
//! the GPU job containing the list has completed, the list is retired:
//! its deleters run and its command buffers and resources are released.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;

use super::{CommandBufferHandle, DeferredContext, RenderPassContext};
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::queue::CommandQueue;
use crate::resources::{Framebuffer, Image, Semaphore};
use crate::sync::{AccessTracker, BarrierBatch, TrackerCheckpoint};
use crate::types::{ClearValue, QueueType};

/// What a context is recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingKind {
    /// Standalone primary buffer: copies, dispatches, barriers.
    Copy,
    /// Inside a render pass.
    Render,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingState {
    Idle,
    Recording(RecordingKind),
    Finished,
    /// A context was dropped without finishing; the list can't be committed.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionState {
    Idle,
    Enqueued,
    Committed,
    InFlight,
    Retired,
}

/// Render pass being recorded into a list.
pub(crate) struct ActiveRenderPass {
    pub framebuffer: Arc<Framebuffer>,
    pub subpass: u32,
    /// Finished secondary buffers of each subpass, in recording order.
    pub subpasses: Vec<Vec<CommandBufferHandle>>,
}

/// Command list state guarded by its mutex.
pub(crate) struct ListInner {
    pub recording: RecordingState,
    pub submission: SubmissionState,
    pub tracker: AccessTracker,
    /// Primary buffers submitted in order.
    pub command_buffers: Vec<CommandBufferHandle>,
    /// Secondary buffers executed by the primaries.
    pub executed: Vec<CommandBufferHandle>,
    pub retained: Vec<Arc<dyn Any + Send + Sync>>,
    pub deleters: Vec<Box<dyn FnOnce() + Send>>,
    pub render_pass: Option<ActiveRenderPass>,
    pub waits: Vec<(Arc<Semaphore>, vk::PipelineStageFlags)>,
    pub signals: Vec<Arc<Semaphore>>,
    /// Tracker state before the last `prepare_submission`, kept until the
    /// submission reaches the GPU.
    pub rollback: Option<TrackerCheckpoint>,
}

/// What the queue needs to submit one list.
pub(crate) struct PreparedList {
    /// Barrier buffer bringing every resource into the state the list
    /// expects at its start.
    pub pre_buffer: Option<CommandBufferHandle>,
    pub batch: crate::backend::SubmitBatch,
}

/// Recorded GPU work for one queue.
pub struct CommandList {
    shared: Arc<DeviceShared>,
    queue: Weak<CommandQueue>,
    kind: QueueType,
    label: Option<String>,
    recording: AtomicBool,
    pub(crate) inner: Mutex<ListInner>,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommandList")
            .field("label", &self.label)
            .field("queue", &self.kind)
            .field("recording", &inner.recording)
            .field("submission", &inner.submission)
            .field("command_buffers", &inner.command_buffers.len())
            .finish()
    }
}

impl CommandList {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        queue: &Arc<CommandQueue>,
        label: Option<String>,
    ) -> Self {
        Self {
            shared,
            queue: Arc::downgrade(queue),
            kind: queue.kind(),
            label,
            recording: AtomicBool::new(false),
            inner: Mutex::new(ListInner {
                recording: RecordingState::Idle,
                submission: SubmissionState::Idle,
                tracker: AccessTracker::new(),
                command_buffers: Vec::new(),
                executed: Vec::new(),
                retained: Vec::new(),
                deleters: Vec::new(),
                render_pass: None,
                waits: Vec::new(),
                signals: Vec::new(),
                rollback: None,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn queue_type(&self) -> QueueType {
        self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.inner.lock().recording
    }

    pub fn submission_state(&self) -> SubmissionState {
        self.inner.lock().submission
    }

    /// Number of primary command buffers recorded so far.
    pub fn command_buffer_count(&self) -> usize {
        self.inner.lock().command_buffers.len()
    }

    fn acquire_recording(&self) -> RhiResult<()> {
        self.recording
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RhiError::ConcurrentRecording)
    }

    pub(crate) fn release_recording(&self) {
        self.recording.store(false, Ordering::Release);
    }

    /// Move into `Recording(kind)`, checking both state machines.
    fn start_recording(&self, kind: RecordingKind) -> RhiResult<()> {
        self.acquire_recording()?;
        let mut inner = self.inner.lock();
        let result = match (inner.submission, inner.recording) {
            (SubmissionState::Idle | SubmissionState::Enqueued, RecordingState::Idle)
            | (SubmissionState::Idle | SubmissionState::Enqueued, RecordingState::Finished) => {
                inner.recording = RecordingState::Recording(kind);
                Ok(())
            }
            (SubmissionState::Idle | SubmissionState::Enqueued, state) => Err(
                RhiError::invalid_state(format!("cannot start recording from {:?}", state)),
            ),
            (state, _) => Err(RhiError::invalid_state(format!(
                "cannot record into a {:?} command list",
                state
            ))),
        };
        drop(inner);
        if result.is_err() {
            self.release_recording();
        }
        result
    }

    fn cancel_recording(&self) {
        let mut inner = self.inner.lock();
        inner.recording = RecordingState::Abandoned;
        inner.render_pass = None;
        drop(inner);
        self.release_recording();
    }

    /// Start a standalone context recording into a new primary buffer.
    pub fn begin(&self) -> RhiResult<DeferredContext<'_>> {
        self.start_recording(RecordingKind::Copy)?;
        let begun = self
            .shared
            .command_allocator
            .acquire_primary(self.kind)
            .and_then(|buffer| buffer.begin(None).map(|_| buffer));
        match begun {
            Ok(buffer) => Ok(DeferredContext::new_primary(self, buffer)),
            Err(e) => {
                self.cancel_recording();
                Err(e)
            }
        }
    }

    /// Start recording a render pass into `framebuffer`.
    ///
    /// Draws are recorded through the returned context's subpass contexts.
    pub fn begin_render_pass(
        &self,
        framebuffer: &Arc<Framebuffer>,
        clear_values: &[ClearValue],
    ) -> RhiResult<RenderPassContext<'_>> {
        if self.kind != QueueType::Graphics {
            return Err(RhiError::invalid_state(format!(
                "render pass recorded for the {:?} queue",
                self.kind
            )));
        }
        self.start_recording(RecordingKind::Render)?;
        let subpass_count = framebuffer.render_pass().subpass_count() as usize;
        let mut inner = self.inner.lock();
        inner.render_pass = Some(ActiveRenderPass {
            framebuffer: framebuffer.clone(),
            subpass: 0,
            subpasses: (0..subpass_count).map(|_| Vec::new()).collect(),
        });
        inner.retained.push(framebuffer.clone());
        drop(inner);
        Ok(RenderPassContext::new(self, framebuffer.clone(), clear_values))
    }

    /// Register the list with its queue. Calling it again has no effect.
    pub fn enqueue(self: &Arc<Self>) -> RhiResult<()> {
        {
            let mut inner = self.inner.lock();
            match inner.submission {
                SubmissionState::Idle => inner.submission = SubmissionState::Enqueued,
                SubmissionState::Enqueued | SubmissionState::Committed => return Ok(()),
                state => {
                    return Err(RhiError::invalid_state(format!(
                        "cannot enqueue a {:?} command list",
                        state
                    )))
                }
            }
        }
        self.queue()?.enqueue(self.clone());
        Ok(())
    }

    /// Mark the list ready for submission, enqueueing it if needed.
    pub fn commit(self: &Arc<Self>) -> RhiResult<()> {
        let needs_enqueue = {
            let mut inner = self.inner.lock();
            match inner.recording {
                RecordingState::Recording(_) => {
                    return Err(RhiError::invalid_state("command list is still recording"))
                }
                RecordingState::Abandoned => {
                    return Err(RhiError::invalid_state(
                        "command list has an unfinished context",
                    ))
                }
                RecordingState::Idle | RecordingState::Finished => {}
            }
            let needs_enqueue = match inner.submission {
                SubmissionState::Idle => true,
                SubmissionState::Enqueued => false,
                state => {
                    return Err(RhiError::invalid_state(format!(
                        "cannot commit a {:?} command list",
                        state
                    )))
                }
            };
            inner.submission = SubmissionState::Committed;
            needs_enqueue
        };
        if needs_enqueue {
            self.queue()?.enqueue(self.clone());
        }
        Ok(())
    }

    fn queue(&self) -> RhiResult<Arc<CommandQueue>> {
        self.queue
            .upgrade()
            .ok_or_else(|| RhiError::invalid_state("command queue no longer exists"))
    }

    /// Wait on `semaphore` at `stage` before the list executes.
    pub fn wait_semaphore(&self, semaphore: Arc<Semaphore>, stage: vk::PipelineStageFlags) {
        self.inner.lock().waits.push((semaphore, stage));
    }

    /// Signal `semaphore` once the list has executed.
    pub fn signal_semaphore(&self, semaphore: Arc<Semaphore>) {
        self.inner.lock().signals.push(semaphore);
    }

    /// Keep `resource` alive until the list's GPU work has completed.
    pub fn retain(&self, resource: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().retained.push(resource);
    }

    /// Run `deleter` once the list's GPU work has completed, or when the
    /// list is dropped without being submitted.
    pub fn defer(&self, deleter: impl FnOnce() + Send + 'static) {
        self.inner.lock().deleters.push(Box::new(deleter));
    }

    /// The list accesses `image` somewhere.
    pub fn touches_image(&self, image: &Image) -> bool {
        self.inner.lock().tracker.touches_image(image.handle())
    }

    pub(crate) fn touches_raw_image(&self, image: vk::Image) -> bool {
        self.inner.lock().tracker.touches_image(image)
    }

    /// Resolve the list's first accesses against the persistent resource
    /// states and describe its submission. Must run in submission order.
    pub(crate) fn prepare_submission(&self) -> RhiResult<PreparedList> {
        let mut inner = self.inner.lock();
        if inner.submission != SubmissionState::Committed {
            return Err(RhiError::invalid_state(format!(
                "submitting a {:?} command list",
                inner.submission
            )));
        }

        let checkpoint = inner.tracker.checkpoint();
        let mut barriers = inner.tracker.resolve_first_accesses();
        let pre_buffer = if barriers.is_empty() {
            None
        } else {
            match self.record_pre_buffer(&mut barriers) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    inner.tracker.restore(checkpoint);
                    return Err(e);
                }
            }
        };
        inner.rollback = Some(checkpoint);

        let mut batch = crate::backend::SubmitBatch {
            wait_semaphores: inner
                .waits
                .iter()
                .map(|(semaphore, stage)| (semaphore.handle(), *stage))
                .collect(),
            command_buffers: Vec::with_capacity(inner.command_buffers.len() + 1),
            signal_semaphores: inner.signals.iter().map(|s| s.handle()).collect(),
        };
        if let Some(pre) = &pre_buffer {
            batch.command_buffers.push(pre.raw());
        }
        batch
            .command_buffers
            .extend(inner.command_buffers.iter().map(|buffer| buffer.raw()));
        Ok(PreparedList { pre_buffer, batch })
    }

    fn record_pre_buffer(&self, barriers: &mut BarrierBatch) -> RhiResult<CommandBufferHandle> {
        let buffer = self.shared.command_allocator.acquire_primary(self.kind)?;
        buffer.begin(None)?;
        barriers.record(self.shared.driver.as_ref(), buffer.raw())?;
        buffer.end()?;
        Ok(buffer)
    }

    /// The submission failed: undo [`prepare_submission`](Self::prepare_submission).
    pub(crate) fn rollback_submission(&self) {
        let mut inner = self.inner.lock();
        if let Some(checkpoint) = inner.rollback.take() {
            inner.tracker.restore(checkpoint);
        }
    }

    pub(crate) fn mark_in_flight(&self) {
        let mut inner = self.inner.lock();
        inner.submission = SubmissionState::InFlight;
        inner.rollback = None;
    }

    /// Release everything the list kept alive for the GPU.
    pub(crate) fn retire(&self) {
        let (deleters, retained, buffers, executed, waits, signals) = {
            let mut inner = self.inner.lock();
            inner.submission = SubmissionState::Retired;
            (
                std::mem::take(&mut inner.deleters),
                std::mem::take(&mut inner.retained),
                std::mem::take(&mut inner.command_buffers),
                std::mem::take(&mut inner.executed),
                std::mem::take(&mut inner.waits),
                std::mem::take(&mut inner.signals),
            )
        };
        for deleter in deleters {
            deleter();
        }
        drop(retained);
        drop(executed);
        drop(buffers);
        drop(waits);
        drop(signals);
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.submission == SubmissionState::InFlight {
            log::error!("Command list {:?} dropped while in flight", self.label);
        }
        for deleter in inner.deleters.drain(..) {
            deleter();
        }
    }
}
