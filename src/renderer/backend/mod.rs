//! GPU backend interface.
//!
//! The frame pacer and the memory provisioning code only talk to the GPU through [`Backend`].
//! [`RenderDeviceContext`](crate::renderer::RenderDeviceContext) implements it on top of Vulkan,
//! `mock::MockBackend`, built for tests and with the `mock` feature, implements it in host
//! memory so the pacing and paging logic can be exercised without a device.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::fmt;
use std::ptr::NonNull;
use ash::vk;
use gpu_allocator::MemoryLocation;
use smallvec::SmallVec;
use crate::renderer::error::RenderResult;

/// Offset alignments the device imposes on sub-allocated buffer ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u64,
    pub min_texel_buffer_offset_alignment: u64,
}

impl DeviceLimits {
    /// Alignment that satisfies every way a temporary range may be bound.
    pub fn temporary_alignment(&self) -> u64 {
        self.min_storage_buffer_offset_alignment
            .max(self.min_texel_buffer_offset_alignment)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// A freshly created buffer together with its backing memory.
pub struct RawBuffer<B: Backend> {
    pub raw: B::Buffer,
    pub memory: B::Memory,
    /// Host pointer to the start of the buffer, for host-visible locations
    pub mapped: Option<NonNull<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// Result of handing an image to the presentation engine. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// One frame's worth of GPU work.
///
/// `command_buffers` execute in order (copy, compute, draw). The batch waits on `image_ready`
/// before writing color output, raises the frame timeline to `signal_value`, and signals the
/// submission-complete primitive of `image_index`.
#[derive(Debug)]
pub struct FrameSubmission<B: Backend> {
    pub command_buffers: SmallVec<[B::CommandBuffer; 3]>,
    pub image_ready: B::Semaphore,
    pub image_index: u32,
    pub signal_value: u64,
}

pub trait Backend: Sized + 'static {
    type Buffer: Copy + PartialEq + fmt::Debug;
    type Memory;
    type CommandPool: Copy + fmt::Debug;
    type CommandBuffer: Copy + fmt::Debug;
    type Semaphore: Copy + fmt::Debug;

    fn limits(&self) -> DeviceLimits;

    // Memory
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> RenderResult<RawBuffer<Self>>;
    fn destroy_buffer(&self, buffer: Self::Buffer, memory: Self::Memory);

    // Command recording
    fn create_command_pool(&self) -> RenderResult<Self::CommandPool>;
    fn destroy_command_pool(&self, pool: Self::CommandPool);
    /// Returns every command buffer of the pool to the initial state.
    fn reset_command_pool(&self, pool: Self::CommandPool) -> RenderResult<()>;
    fn allocate_command_buffers(
        &self,
        pool: Self::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<Self::CommandBuffer>>;
    fn begin_commands(&self, cmd: Self::CommandBuffer) -> RenderResult<()>;
    fn end_commands(&self, cmd: Self::CommandBuffer) -> RenderResult<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[CopyRegion],
    );
    /// Makes every transfer write recorded so far visible to any later read on the queue.
    fn cmd_transfer_barrier(&self, cmd: Self::CommandBuffer);
    /// Moves the acquired image into a writable layout, after the image-ready wait.
    fn cmd_begin_image(&self, cmd: Self::CommandBuffer, image_index: u32);
    /// Moves the acquired image into the presentable layout.
    fn cmd_end_image(&self, cmd: Self::CommandBuffer, image_index: u32);
    fn cmd_clear_image(&self, cmd: Self::CommandBuffer, image_index: u32, color: [f32; 4]);

    /// Records commands into a one-shot command buffer, submits it, and blocks until the GPU
    /// has finished executing it.
    fn submit_immediate<F>(&self, record: F) -> RenderResult<()>
    where
        F: FnOnce(Self::CommandBuffer) -> RenderResult<()>;

    // Frame synchronization
    fn create_semaphore(&self) -> RenderResult<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);
    /// Blocks until the frame timeline reaches `value`.
    fn wait_for_frame_completion(&self, value: u64, timeout_ns: u64) -> RenderResult<()>;
    /// Current value of the frame timeline.
    fn completed_frames(&self) -> RenderResult<u64>;
    fn acquire_image(&self, image_ready: Self::Semaphore) -> RenderResult<AcquiredImage>;
    fn submit_frame(&self, submission: &FrameSubmission<Self>) -> RenderResult<()>;
    fn present(&self, image_index: u32) -> RenderResult<PresentOutcome>;
    fn wait_idle(&self) -> RenderResult<()>;
}
