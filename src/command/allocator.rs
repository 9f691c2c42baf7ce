//! Per-thread command buffer pools.
//!
//! Native command pools must not be used from two threads at once, so
//! every recording thread gets its own pool per queue type. Buffers are
//! handed out as [`CommandBufferHandle`]s and go back to their pool's free
//! list when the handle drops, which happens once the GPU job that used
//! them has retired.
//!
//! A thread's pools leave the allocator when the thread exits; pools still
//! referenced by in-flight handles are destroyed with their last handle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{CommandBufferInheritance, Driver};
use crate::error::RhiResult;
use crate::types::QueueType;

#[derive(Debug, Default)]
struct FreeLists {
    primary: Vec<vk::CommandBuffer>,
    secondary: Vec<vk::CommandBuffer>,
}

impl FreeLists {
    fn list(&mut self, level: vk::CommandBufferLevel) -> &mut Vec<vk::CommandBuffer> {
        if level == vk::CommandBufferLevel::SECONDARY {
            &mut self.secondary
        } else {
            &mut self.primary
        }
    }
}

/// A native pool owned by one thread and queue type.
pub struct ThreadCommandPool {
    driver: Arc<dyn Driver>,
    pool: vk::CommandPool,
    queue: QueueType,
    free: spin::Mutex<FreeLists>,
    allocated: AtomicUsize,
}

impl std::fmt::Debug for ThreadCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCommandPool")
            .field("pool", &self.pool)
            .field("queue", &self.queue)
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadCommandPool {
    fn new(driver: Arc<dyn Driver>, queue: QueueType) -> RhiResult<Self> {
        let pool = driver.create_command_pool(queue)?;
        Ok(Self {
            driver,
            pool,
            queue,
            free: spin::Mutex::new(FreeLists::default()),
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Buffers ever allocated from the native pool.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        let free = self.free.lock();
        free.primary.len() + free.secondary.len()
    }

    fn acquire(
        self: &Arc<Self>,
        level: vk::CommandBufferLevel,
    ) -> RhiResult<CommandBufferHandle> {
        let recycled = self.free.lock().list(level).pop();
        let buffer = match recycled {
            Some(buffer) => {
                if let Err(e) = self.driver.reset_command_buffer(buffer) {
                    self.free.lock().list(level).push(buffer);
                    return Err(e);
                }
                buffer
            }
            None => {
                let buffer = self.driver.allocate_command_buffer(self.pool, level)?;
                self.allocated.fetch_add(1, Ordering::Relaxed);
                buffer
            }
        };
        Ok(CommandBufferHandle {
            pool: self.clone(),
            buffer,
            level,
        })
    }

    fn release(&self, buffer: vk::CommandBuffer, level: vk::CommandBufferLevel) {
        self.free.lock().list(level).push(buffer);
    }
}

impl Drop for ThreadCommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees every buffer allocated from it.
        self.driver.destroy_command_pool(self.pool);
    }
}

/// A command buffer borrowed from a [`ThreadCommandPool`].
///
/// Dropping the handle returns the buffer to its pool. Only drop it once
/// the GPU no longer executes the buffer.
pub struct CommandBufferHandle {
    pool: Arc<ThreadCommandPool>,
    buffer: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
}

impl std::fmt::Debug for CommandBufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferHandle")
            .field("buffer", &self.buffer)
            .field("level", &self.level)
            .finish()
    }
}

impl CommandBufferHandle {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn is_secondary(&self) -> bool {
        self.level == vk::CommandBufferLevel::SECONDARY
    }

    pub fn queue(&self) -> QueueType {
        self.pool.queue
    }

    /// Begin one-time recording.
    pub fn begin(&self, inheritance: Option<&CommandBufferInheritance>) -> RhiResult<()> {
        self.pool.driver.begin_command_buffer(self.buffer, inheritance)
    }

    pub fn end(&self) -> RhiResult<()> {
        self.pool.driver.end_command_buffer(self.buffer)
    }
}

impl Drop for CommandBufferHandle {
    fn drop(&mut self) {
        self.pool.release(self.buffer, self.level);
    }
}

type PoolMap = Mutex<HashMap<(ThreadId, QueueType), Arc<ThreadCommandPool>>>;

/// Allocators the current thread has pools in.
struct ThreadExit {
    thread: ThreadId,
    allocators: RefCell<Vec<Weak<PoolMap>>>,
}

impl ThreadExit {
    fn register(&self, pools: &Arc<PoolMap>) {
        let mut allocators = self.allocators.borrow_mut();
        allocators.retain(|weak| weak.strong_count() > 0);
        let pools = Arc::downgrade(pools);
        if !allocators.iter().any(|weak| weak.ptr_eq(&pools)) {
            allocators.push(pools);
        }
    }
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        for pools in self.allocators.get_mut().drain(..) {
            let Some(pools) = pools.upgrade() else {
                continue;
            };
            let removed: Vec<_> = {
                let mut pools = pools.lock();
                let keys: Vec<_> = pools
                    .keys()
                    .filter(|(thread, _)| *thread == self.thread)
                    .copied()
                    .collect();
                keys.iter().filter_map(|key| pools.remove(key)).collect()
            };
            if !removed.is_empty() {
                log::debug!(
                    "Thread {:?} exited, releasing {} command pools",
                    self.thread,
                    removed.len()
                );
            }
        }
    }
}

thread_local! {
    static THREAD_EXIT: ThreadExit = ThreadExit {
        thread: std::thread::current().id(),
        allocators: RefCell::new(Vec::new()),
    };
}

/// Hands out command buffers from the calling thread's pool.
pub struct CommandBufferAllocator {
    driver: Arc<dyn Driver>,
    pools: Arc<PoolMap>,
}

impl std::fmt::Debug for CommandBufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBufferAllocator")
            .field("pools", &self.pools.lock().len())
            .finish()
    }
}

impl CommandBufferAllocator {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The calling thread's pool for `queue`, created on first use.
    pub fn thread_pool(&self, queue: QueueType) -> RhiResult<Arc<ThreadCommandPool>> {
        let key = (std::thread::current().id(), queue);
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        log::debug!("Creating {:?} command pool for thread {:?}", queue, key.0);
        let pool = Arc::new(ThreadCommandPool::new(self.driver.clone(), queue)?);
        pools.insert(key, pool.clone());
        drop(pools);
        // Threads being torn down keep their pool until the allocator goes.
        let _ = THREAD_EXIT.try_with(|exit| exit.register(&self.pools));
        Ok(pool)
    }

    pub fn acquire_primary(&self, queue: QueueType) -> RhiResult<CommandBufferHandle> {
        self.thread_pool(queue)?.acquire(vk::CommandBufferLevel::PRIMARY)
    }

    pub fn acquire_secondary(&self, queue: QueueType) -> RhiResult<CommandBufferHandle> {
        self.thread_pool(queue)?.acquire(vk::CommandBufferLevel::SECONDARY)
    }

    /// Number of pools held for live threads.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Forget every pool. Pools still referenced by live handles are
    /// destroyed when the last handle drops.
    pub fn clear(&self) {
        self.pools.lock().clear();
    }
}
