use std::sync::Arc;
use crate::renderer::backend::Backend;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::resource_ctx::page_allocator::PageAllocator;
use crate::renderer::error::RenderResult;
use crate::renderer::resources::sync::{CommandPool, Semaphore};

pub const COPY: usize = 0;
pub const COMPUTE: usize = 1;
pub const DRAW: usize = 2;

/// One element of the frame ring. Created once, then reset every time the ring wraps around.
pub struct FrameSlot<B: Backend> {
    // Copy, compute and draw command buffers, in submission order.
    pub commands: CommandPool<B>,

    // Signals when the swapchain image acquired for this frame is ready to be written.
    pub image_ready: Semaphore<B>,

    pub pages: PageAllocator<B>,

    // Timeline value signaled by the last submission from this slot.
    pub reached: u64,
}

impl<B: Backend> FrameSlot<B> {
    pub fn new(backend: &Arc<B>, config: &RenderConfig) -> RenderResult<Self> {
        Ok(Self {
            commands: CommandPool::new(backend, 3)?,
            image_ready: Semaphore::new(backend)?,
            pages: PageAllocator::new(backend, config.page_size, config.max_allocation_size),
            reached: 0,
        })
    }

    pub fn cmd(&self, index: usize) -> B::CommandBuffer {
        self.commands.buffers()[index]
    }
}
