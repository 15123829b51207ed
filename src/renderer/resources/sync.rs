use std::sync::Arc;
use crate::renderer::backend::Backend;
use crate::renderer::error::RenderResult;

pub struct Semaphore<B: Backend> {
    raw: B::Semaphore,
    backend: Arc<B>,
}

impl<B: Backend> Semaphore<B> {
    pub fn new(backend: &Arc<B>) -> RenderResult<Self> {
        Ok(Self {
            raw: backend.create_semaphore()?,
            backend: backend.clone(),
        })
    }

    pub fn raw(&self) -> B::Semaphore {
        self.raw
    }
}

impl<B: Backend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.raw);
    }
}

/// A command pool and the primary command buffers allocated from it.
pub struct CommandPool<B: Backend> {
    raw: B::CommandPool,
    buffers: Vec<B::CommandBuffer>,
    backend: Arc<B>,
}

impl<B: Backend> CommandPool<B> {
    pub fn new(backend: &Arc<B>, count: u32) -> RenderResult<Self> {
        let raw = backend.create_command_pool()?;
        let buffers = match backend.allocate_command_buffers(raw, count) {
            Ok(buffers) => buffers,
            Err(e) => {
                backend.destroy_command_pool(raw);
                return Err(e);
            }
        };

        Ok(Self {
            raw,
            buffers,
            backend: backend.clone(),
        })
    }

    pub fn buffers(&self) -> &[B::CommandBuffer] {
        &self.buffers
    }

    /// Resets every command buffer and opens each for recording.
    pub fn reset_and_begin(&self) -> RenderResult<()> {
        self.backend.reset_command_pool(self.raw)?;
        for cmd in &self.buffers {
            self.backend.begin_commands(*cmd)?;
        }
        Ok(())
    }

    pub fn end_all(&self) -> RenderResult<()> {
        for cmd in &self.buffers {
            self.backend.end_commands(*cmd)?;
        }
        Ok(())
    }
}

impl<B: Backend> Drop for CommandPool<B> {
    fn drop(&mut self) {
        // Command buffers are freed with their pool
        self.backend.destroy_command_pool(self.raw);
    }
}
