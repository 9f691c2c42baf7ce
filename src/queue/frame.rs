//! Frame pacing ring.
//!
//! Each slot owns a fence that is signaled once all work submitted during
//! that frame has completed. Starting a frame on a slot whose previous
//! frame is still running blocks, which bounds how far the CPU can run
//! ahead of the GPU.

use std::time::Duration;

use ash::vk;

use crate::backend::Driver;
use crate::error::{RhiError, RhiResult};

#[derive(Debug)]
struct FrameSlot {
    fence: vk::Fence,
    /// The fence was submitted and has not been waited for yet.
    pending: bool,
}

#[derive(Debug)]
pub(crate) struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
    frame_index: u64,
}

impl FrameRing {
    pub fn new(driver: &dyn Driver, frames: usize) -> RhiResult<Self> {
        let mut slots = Vec::with_capacity(frames.max(1));
        for _ in 0..frames.max(1) {
            match driver.create_fence(false) {
                Ok(fence) => slots.push(FrameSlot {
                    fence,
                    pending: false,
                }),
                Err(e) => {
                    for slot in slots {
                        driver.destroy_fence(slot.fence);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            slots,
            current: 0,
            frame_index: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Frames started so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Wait until the current slot is free and return its reset fence.
    pub fn begin(&mut self, driver: &dyn Driver, timeout: Duration) -> RhiResult<vk::Fence> {
        let slot = &mut self.slots[self.current];
        if slot.pending {
            crate::profile_scope!("frame_ring_wait");
            if !driver.wait_for_fence(slot.fence, timeout)? {
                log::warn!(
                    "Timed out waiting for frame slot {} (frame {})",
                    self.current,
                    self.frame_index
                );
                return Err(RhiError::FenceTimeout);
            }
            driver.reset_fence(slot.fence)?;
            slot.pending = false;
        }
        Ok(slot.fence)
    }

    /// Mark the current slot's fence as submitted and move to the next slot.
    pub fn advance(&mut self) {
        self.slots[self.current].pending = true;
        self.current = (self.current + 1) % self.slots.len();
        self.frame_index += 1;
        log::trace!(
            "Frame {} started on slot {}",
            self.frame_index,
            self.current
        );
    }

    /// Wait for every submitted frame fence.
    pub fn wait_all(&mut self, driver: &dyn Driver, timeout: Duration) -> RhiResult<()> {
        for slot in &mut self.slots {
            if !slot.pending {
                continue;
            }
            if !driver.wait_for_fence(slot.fence, timeout)? {
                log::warn!("Timed out waiting for frame fences");
                return Err(RhiError::FenceTimeout);
            }
            driver.reset_fence(slot.fence)?;
            slot.pending = false;
        }
        Ok(())
    }

    pub fn destroy(&mut self, driver: &dyn Driver) {
        for slot in self.slots.drain(..) {
            driver.destroy_fence(slot.fence);
        }
    }
}
