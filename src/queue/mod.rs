//! Command queues and GPU job tracking.
//!
//! A [`CommandQueue`] collects enqueued command lists and submits the
//! committed ones as one GPU job guarded by a fence. Two bounded rings
//! limit how far the CPU runs ahead of the GPU:
//!
//! - the job ring holds at most `max_jobs_in_flight` jobs; submitting one
//!   more waits for the oldest,
//! - the frame ring holds `frames_in_flight` frame fences; starting a frame
//!   on a slot whose previous frame is still running waits for it.
//!
//! When a job's fence signals, its command lists are retired: deferred
//! deleters run, command buffers go back to their pools and every resource
//! the lists referenced is released. Native handles whose last reference
//! drops are destroyed through the [`DeferredDestructor`] once every queue
//! has caught up with the work submitted before the drop.

mod deferred;
mod frame;
mod job;

pub use deferred::{DeferredDestructor, NativeHandle, TimelineSnapshot};

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::command::{CommandList, SubmissionState};
use crate::device::DeviceShared;
use crate::error::RhiResult;
use crate::resources::{Image, Semaphore};
use crate::types::QueueType;
use frame::FrameRing;
use job::{GpuJob, JobRing, RetiredJob};

/// Semaphore to wait on before the first job touching `image`.
struct ImageWait {
    image: vk::Image,
    semaphore: Arc<Semaphore>,
    stage: vk::PipelineStageFlags,
}

struct QueueState {
    pending: Vec<Arc<CommandList>>,
    image_waits: Vec<ImageWait>,
    jobs: JobRing,
    frames: FrameRing,
}

/// Submission front end of one hardware queue.
pub struct CommandQueue {
    shared: Arc<DeviceShared>,
    kind: QueueType,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("pending", &state.pending.len())
            .field("in_flight", &state.jobs.len())
            .field("frame", &state.frames.frame_index())
            .finish()
    }
}

impl CommandQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>, kind: QueueType) -> RhiResult<Arc<Self>> {
        let frames = FrameRing::new(shared.driver.as_ref(), shared.params.frame_count())?;
        let jobs = JobRing::new(shared.params.max_jobs_in_flight);
        Ok(Arc::new(Self {
            shared,
            kind,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                image_waits: Vec::new(),
                jobs,
                frames,
            }),
        }))
    }

    pub fn kind(&self) -> QueueType {
        self.kind
    }

    /// A new, empty command list for this queue.
    pub fn create_command_list(self: &Arc<Self>, label: Option<&str>) -> Arc<CommandList> {
        Arc::new(CommandList::new(
            self.shared.clone(),
            self,
            label.map(str::to_string),
        ))
    }

    pub(crate) fn enqueue(&self, list: Arc<CommandList>) {
        self.state.lock().pending.push(list);
    }

    /// Lists enqueued and not yet submitted.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// GPU jobs submitted and not yet retired.
    pub fn in_flight_jobs(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Frames submitted through [`submit_frame`](Self::submit_frame).
    pub fn frame_index(&self) -> u64 {
        self.state.lock().frames.frame_index()
    }

    /// Make the first submitted list that accesses `image` wait on
    /// `semaphore` at `stage`. Used for swap chain images.
    pub fn wait_for_image(
        &self,
        image: &Image,
        semaphore: Arc<Semaphore>,
        stage: vk::PipelineStageFlags,
    ) {
        self.state.lock().image_waits.push(ImageWait {
            image: image.handle(),
            semaphore,
            stage,
        });
    }

    /// Submit every committed list as one GPU job. Returns the number of
    /// lists submitted.
    pub fn submit(&self) -> RhiResult<usize> {
        let mut retired = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.submit_locked(&mut state, &mut retired)
        };
        self.retire(retired);
        result
    }

    /// Submit committed lists and close the current frame.
    ///
    /// Blocks while the frame slot being reused still has work in flight.
    pub fn submit_frame(&self) -> RhiResult<()> {
        let mut retired = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.submit_frame_locked(&mut state, &mut retired)
        };
        self.retire(retired);
        crate::frame_mark!();
        result
    }

    /// Submit committed lists; with `wait`, block until all work on this
    /// queue has completed.
    pub fn flush(&self, wait: bool) -> RhiResult<()> {
        let mut retired = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.submit_locked(&mut state, &mut retired).and_then(|_| {
                if wait {
                    let driver = self.shared.driver.as_ref();
                    let timeout = self.shared.params.fence_timeout;
                    state.jobs.drain(driver, timeout, &mut retired)
                } else {
                    Ok(())
                }
            })
        };
        self.retire(retired);
        result
    }

    /// Retire finished jobs without blocking. Returns how many retired.
    pub fn poll(&self) -> RhiResult<usize> {
        let mut retired = Vec::new();
        let result = {
            let mut state = self.state.lock();
            state.jobs.poll(self.shared.driver.as_ref(), &mut retired)
        };
        let count = retired.len();
        self.retire(retired);
        result.map(|_| count)
    }

    /// Wait for every job and frame submitted to this queue.
    pub fn wait_idle(&self) -> RhiResult<()> {
        let mut retired = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let driver = self.shared.driver.as_ref();
            let timeout = self.shared.params.fence_timeout;
            state
                .jobs
                .drain(driver, timeout, &mut retired)
                .and_then(|_| state.frames.wait_all(driver, timeout))
        };
        self.retire(retired);
        result
    }

    fn submit_locked(
        &self,
        state: &mut QueueState,
        retired: &mut Vec<RetiredJob>,
    ) -> RhiResult<usize> {
        crate::profile_scope!("queue_submit");
        let ready: Vec<_> = state
            .pending
            .iter()
            .filter(|list| list.submission_state() == SubmissionState::Committed)
            .cloned()
            .collect();
        if ready.is_empty() {
            return Ok(0);
        }

        // Nothing is resolved until a fence is available, so a timeout here
        // leaves every list pending and untouched.
        let driver = self.shared.driver.as_ref();
        let fence = state
            .jobs
            .acquire_fence(driver, self.shared.params.fence_timeout, retired)?;

        let mut batches = Vec::with_capacity(ready.len());
        let mut pre_buffers = Vec::new();
        let mut prepared = Vec::with_capacity(ready.len());
        let mut failure = None;
        for list in &ready {
            let mut waits = Vec::new();
            state.image_waits.retain(|wait| {
                if list.touches_raw_image(wait.image) {
                    waits.push((wait.semaphore.clone(), wait.stage));
                    false
                } else {
                    true
                }
            });
            for (semaphore, stage) in waits {
                list.wait_semaphore(semaphore, stage);
            }

            match list.prepare_submission() {
                Ok(list_submission) => {
                    pre_buffers.extend(list_submission.pre_buffer);
                    batches.push(list_submission.batch);
                    prepared.push(list);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            if let Err(e) = driver.queue_submit(self.kind, &batches, fence) {
                failure = Some(e);
            }
        }
        if let Some(e) = failure {
            for list in prepared.iter().rev() {
                list.rollback_submission();
            }
            state.jobs.release_fence(fence);
            log::warn!("Submission on {:?} queue failed: {}", self.kind, e);
            return Err(e);
        }

        state
            .pending
            .retain(|list| !ready.iter().any(|submitted| Arc::ptr_eq(submitted, list)));
        let value = self.shared.mark_submitted(self.kind);
        for list in &ready {
            list.mark_in_flight();
        }
        log::trace!(
            "Submitted job {} on {:?} queue ({} lists, {} barrier buffers)",
            value,
            self.kind,
            ready.len(),
            pre_buffers.len()
        );

        let count = ready.len();
        state.jobs.push(GpuJob {
            fence,
            value,
            lists: ready,
            pre_buffers,
        });
        state.jobs.poll(driver, retired)?;
        Ok(count)
    }

    fn submit_frame_locked(
        &self,
        state: &mut QueueState,
        retired: &mut Vec<RetiredJob>,
    ) -> RhiResult<()> {
        let driver = self.shared.driver.as_ref();
        let frame_fence = state
            .frames
            .begin(driver, self.shared.params.fence_timeout)?;
        self.submit_locked(state, retired)?;
        driver.queue_submit(self.kind, &[], frame_fence)?;
        state.frames.advance();
        state.jobs.poll(driver, retired)
    }

    /// Release what retired jobs kept alive. Runs without the queue lock.
    fn retire(&self, retired: Vec<RetiredJob>) {
        if retired.is_empty() {
            return;
        }
        for job in retired {
            self.shared.mark_completed(self.kind, job.value);
            for list in &job.lists {
                list.retire();
            }
            drop(job.pre_buffers);
            log::trace!("Retired job {} on {:?} queue", job.value, self.kind);
        }
        self.shared.collect_garbage();
    }

    /// Destroy fences and drop pending lists. Every job must have retired.
    pub(crate) fn destroy(&self) {
        let pending = {
            let mut state = self.state.lock();
            let driver = self.shared.driver.as_ref();
            state.jobs.destroy(driver);
            state.frames.destroy(driver);
            state.image_waits.clear();
            std::mem::take(&mut state.pending)
        };
        drop(pending);
    }
}
