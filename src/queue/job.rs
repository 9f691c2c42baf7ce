//! Bounded ring of fenced GPU jobs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::backend::Driver;
use crate::command::{CommandBufferHandle, CommandList};
use crate::error::{RhiError, RhiResult};

/// One `queue_submit` worth of command lists, tracked by a fence.
pub(crate) struct GpuJob {
    pub fence: vk::Fence,
    /// Value of the queue's submission counter this job was given.
    pub value: u64,
    pub lists: Vec<Arc<CommandList>>,
    /// Barrier buffers synthesized at submission.
    pub pre_buffers: Vec<CommandBufferHandle>,
}

/// A job whose fence signaled, ready to release what it kept alive.
pub(crate) struct RetiredJob {
    pub value: u64,
    pub lists: Vec<Arc<CommandList>>,
    pub pre_buffers: Vec<CommandBufferHandle>,
}

/// Jobs in flight on one queue, oldest first.
///
/// At most `capacity` jobs are outstanding; acquiring a fence for one more
/// blocks on the oldest job.
pub(crate) struct JobRing {
    capacity: usize,
    in_flight: VecDeque<GpuJob>,
    free_fences: Vec<vk::Fence>,
}

impl JobRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_flight: VecDeque::new(),
            free_fences: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_full(&self) -> bool {
        self.in_flight.len() >= self.capacity
    }

    /// An unsignaled fence for the next job.
    ///
    /// When the ring is full the oldest job is waited for first and pushed
    /// to `retired`.
    pub fn acquire_fence(
        &mut self,
        driver: &dyn Driver,
        timeout: Duration,
        retired: &mut Vec<RetiredJob>,
    ) -> RhiResult<vk::Fence> {
        while self.is_full() {
            crate::profile_scope!("job_ring_backpressure");
            let Some(oldest) = self.in_flight.front() else {
                break;
            };
            if !driver.wait_for_fence(oldest.fence, timeout)? {
                log::warn!("Timed out waiting for GPU job {}", oldest.value);
                return Err(RhiError::FenceTimeout);
            }
            if let Some(job) = self.in_flight.pop_front() {
                retired.push(self.recycle(driver, job)?);
            }
        }

        match self.free_fences.pop() {
            Some(fence) => Ok(fence),
            None => driver.create_fence(false),
        }
    }

    /// Give back a fence that ended up unused.
    pub fn release_fence(&mut self, fence: vk::Fence) {
        self.free_fences.push(fence);
    }

    pub fn push(&mut self, job: GpuJob) {
        self.in_flight.push_back(job);
    }

    /// Retire every leading job whose fence has signaled.
    pub fn poll(&mut self, driver: &dyn Driver, retired: &mut Vec<RetiredJob>) -> RhiResult<()> {
        while let Some(oldest) = self.in_flight.front() {
            if !driver.fence_signaled(oldest.fence)? {
                break;
            }
            if let Some(job) = self.in_flight.pop_front() {
                retired.push(self.recycle(driver, job)?);
            }
        }
        Ok(())
    }

    /// Wait for and retire every job in flight.
    pub fn drain(
        &mut self,
        driver: &dyn Driver,
        timeout: Duration,
        retired: &mut Vec<RetiredJob>,
    ) -> RhiResult<()> {
        while let Some(oldest) = self.in_flight.front() {
            if !driver.wait_for_fence(oldest.fence, timeout)? {
                log::warn!("Timed out waiting for GPU job {}", oldest.value);
                return Err(RhiError::FenceTimeout);
            }
            if let Some(job) = self.in_flight.pop_front() {
                retired.push(self.recycle(driver, job)?);
            }
        }
        Ok(())
    }

    fn recycle(&mut self, driver: &dyn Driver, job: GpuJob) -> RhiResult<RetiredJob> {
        driver.reset_fence(job.fence)?;
        self.free_fences.push(job.fence);
        Ok(RetiredJob {
            value: job.value,
            lists: job.lists,
            pre_buffers: job.pre_buffers,
        })
    }

    /// Destroy the fences. Every job must have been retired.
    pub fn destroy(&mut self, driver: &dyn Driver) {
        if !self.in_flight.is_empty() {
            log::error!(
                "Destroying job ring with {} jobs still in flight",
                self.in_flight.len()
            );
        }
        for job in self.in_flight.drain(..) {
            driver.destroy_fence(job.fence);
        }
        for fence in self.free_fences.drain(..) {
            driver.destroy_fence(fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullDriver;
    use crate::backend::SubmitBatch;
    use crate::instance::NullCompletion;
    use crate::types::QueueType;

    fn submit_empty(driver: &NullDriver, ring: &mut JobRing, value: u64) -> Vec<RetiredJob> {
        let mut retired = Vec::new();
        let fence = ring
            .acquire_fence(driver, Duration::from_millis(50), &mut retired)
            .unwrap();
        driver
            .queue_submit(QueueType::Graphics, &[SubmitBatch::default()], fence)
            .unwrap();
        ring.push(GpuJob {
            fence,
            value,
            lists: Vec::new(),
            pre_buffers: Vec::new(),
        });
        retired
    }

    #[test]
    fn test_poll_retires_in_order() {
        let driver = NullDriver::new(NullCompletion::Manual);
        let mut ring = JobRing::new(4);
        submit_empty(&driver, &mut ring, 1);
        submit_empty(&driver, &mut ring, 2);

        let mut retired = Vec::new();
        ring.poll(&driver, &mut retired).unwrap();
        assert!(retired.is_empty());

        driver.complete_next();
        ring.poll(&driver, &mut retired).unwrap();
        assert_eq!(retired.iter().map(|job| job.value).collect::<Vec<_>>(), vec![1]);
        assert_eq!(ring.len(), 1);

        driver.complete_all();
        ring.drain(&driver, Duration::from_millis(50), &mut retired).unwrap();
        assert_eq!(ring.len(), 0);
        ring.destroy(&driver);
        assert_eq!(driver.live_count("fence"), 0);
    }

    #[test]
    fn test_full_ring_times_out() {
        let driver = NullDriver::new(NullCompletion::Manual);
        let mut ring = JobRing::new(1);
        submit_empty(&driver, &mut ring, 1);

        let mut retired = Vec::new();
        let result = ring.acquire_fence(&driver, Duration::from_millis(10), &mut retired);
        assert_eq!(result, Err(RhiError::FenceTimeout));

        driver.complete_all();
        let fence = ring
            .acquire_fence(&driver, Duration::from_millis(10), &mut retired)
            .unwrap();
        assert_eq!(retired.len(), 1);
        ring.release_fence(fence);
        ring.destroy(&driver);
    }
}
