pub mod frame;

use std::sync::Arc;
use log::{debug, trace};
use crate::renderer::backend::{Backend, FrameSubmission, PresentOutcome};
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::frame_ctx::frame::{COMPUTE, COPY, DRAW, FrameSlot};
use crate::renderer::error::{ErrorKind, RenderError, RenderResult};
use crate::renderer::resources::handle::TempBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No frame has been started yet
    Idle,
    /// Between `begin_frame` and `end_frame`
    Recording,
    /// The last frame was handed to the GPU, the next one has not started
    Submitted,
    /// Ending a frame failed part way. The command buffers and the swapchain image of the
    /// failed frame are in an unknown state, so no further frame can be recorded.
    Lost,
}

/// Responsibilities:
/// - Manage per-frame command buffers
/// - Manage per-frame resources
/// - Manage synchronization between frames
///
/// Frame `n` records into slot `n % ring_size`. Before a slot is reused the CPU waits for the
/// frame timeline to reach `n - ring_size + 1`, which is the value the previous frame in that
/// slot signals, so at most `ring_size` frames are ever in flight.
pub struct RenderFrameContext<B: Backend> {
    slots: Vec<FrameSlot<B>>,
    frame_counter: u64,
    state: FrameState,
    image_index: u32,
    timeout_ns: u64,

    backend: Arc<B>,
}

impl<B: Backend> RenderFrameContext<B> {
    pub fn new(backend: &Arc<B>, config: &RenderConfig) -> RenderResult<Self> {
        let slots = (0..config.frames_in_flight)
            .map(|_| FrameSlot::new(backend, config))
            .collect::<RenderResult<Vec<_>>>()
            .map_err(|e| e.context("Failed to create frame resources").with_kind(ErrorKind::CriticalVulkan))?;

        Ok(Self {
            slots,
            frame_counter: 0,
            state: FrameState::Idle,
            image_index: 0,
            timeout_ns: config.frame_timeout_ns,

            backend: backend.clone(),
        })
    }

    fn slot_index(&self) -> usize {
        (self.frame_counter % self.slots.len() as u64) as usize
    }

    fn require_recording(&self, action: &str) -> RenderResult<()> {
        match self.state {
            FrameState::Recording => Ok(()),
            FrameState::Lost => Err(self.lost()),
            FrameState::Idle | FrameState::Submitted => Err(RenderError::invalid_usage(format!(
                "Cannot {action} outside of begin_frame/end_frame",
            ))),
        }
    }

    fn lost(&self) -> RenderError {
        RenderError::critical("A frame failed to end, the renderer must be recreated")
    }

    pub fn begin_frame(&mut self) -> RenderResult<()> {
        match self.state {
            FrameState::Recording => {
                return Err(RenderError::invalid_usage(format!(
                    "begin_frame called while frame {} is still recording",
                    self.frame_counter,
                )));
            }
            FrameState::Lost => return Err(self.lost()),
            FrameState::Idle | FrameState::Submitted => {}
        }

        let ring_size = self.slots.len() as u64;
        let index = self.slot_index();

        if self.frame_counter >= ring_size {
            let wait_value = self.frame_counter - ring_size + 1;
            debug_assert_eq!(self.slots[index].reached, wait_value);
            self.backend
                .wait_for_frame_completion(wait_value, self.timeout_ns)
                .map_err(|e| {
                    e.context(format!("Failed to wait for frame {}", wait_value - 1))
                        .with_kind(ErrorKind::CriticalVulkan)
                })?;
        }

        let slot = &mut self.slots[index];
        slot.commands.reset_and_begin()?;
        slot.pages.begin_frame();

        let acquired = self
            .backend
            .acquire_image(slot.image_ready.raw())
            .map_err(|e| e.context("Failed to acquire swapchain image"))?;
        if acquired.suboptimal {
            debug!("Acquired image {} from a suboptimal swapchain", acquired.index);
        }
        self.backend.cmd_begin_image(slot.cmd(DRAW), acquired.index);

        self.image_index = acquired.index;
        self.state = FrameState::Recording;
        trace!(
            "Began frame {} (slot {index}, image {})",
            self.frame_counter, acquired.index,
        );
        Ok(())
    }

    /// Submits the recorded frame and presents its image.
    ///
    /// A stale or suboptimal swapchain is reported through the returned outcome, never as an
    /// error. Any failure past this point is fatal and leaves the context [`FrameState::Lost`].
    pub fn end_frame(&mut self) -> RenderResult<PresentOutcome> {
        match self.state {
            FrameState::Recording => {}
            FrameState::Lost => return Err(self.lost()),
            FrameState::Idle | FrameState::Submitted => {
                return Err(RenderError::invalid_usage("end_frame called without a frame in progress"));
            }
        }

        let result = self.submit_and_present();
        if result.is_err() {
            self.state = FrameState::Lost;
        }
        result
    }

    fn submit_and_present(&mut self) -> RenderResult<PresentOutcome> {
        let index = self.slot_index();
        let image_index = self.image_index;
        let frame = self.frame_counter;
        let slot = &mut self.slots[index];

        slot.pages.record_copy_commands(slot.cmd(COPY));
        self.backend.cmd_end_image(slot.cmd(DRAW), image_index);
        slot.commands.end_all().map_err(|e| {
            e.context(format!("Failed to end frame {frame}"))
                .with_kind(ErrorKind::CriticalVulkan)
        })?;

        let signal_value = frame + 1;
        let submission = FrameSubmission {
            command_buffers: slot.commands.buffers().iter().copied().collect(),
            image_ready: slot.image_ready.raw(),
            image_index,
            signal_value,
        };
        self.backend
            .submit_frame(&submission)
            .map_err(|e| {
                e.context(format!("Failed to submit frame {frame}"))
                    .with_kind(ErrorKind::CriticalVulkan)
            })?;

        slot.reached = signal_value;
        self.frame_counter += 1;
        self.state = FrameState::Submitted;

        let outcome = self
            .backend
            .present(image_index)
            .map_err(|e| {
                e.context(format!("Failed to present frame {frame}"))
                    .with_kind(ErrorKind::CriticalVulkan)
            })?;
        match outcome {
            PresentOutcome::Optimal => trace!("Presented frame {frame} (image {image_index})"),
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                debug!("Presented frame {frame} to a stale swapchain ({outcome:?})");
            }
        }
        Ok(outcome)
    }

    pub fn allocate_temporary(
        &mut self,
        size: u64,
    ) -> RenderResult<(TempBuffer<B::Buffer>, &mut [u8])> {
        self.require_recording("allocate a temporary buffer")?;
        let frame = self.frame_counter;
        let index = self.slot_index();

        let (allocation, host) = self.slots[index].pages.allocate_temporary(size)?;
        let buffer = TempBuffer {
            descriptor: allocation.descriptor,
            page: allocation.page,
            frame,
        };
        Ok((buffer, host))
    }

    /// Host bytes of a temporary buffer allocated during the current frame.
    pub fn temp_buffer_mut(&mut self, buffer: &TempBuffer<B::Buffer>) -> RenderResult<&mut [u8]> {
        self.require_recording("write a temporary buffer")?;
        if buffer.frame != self.frame_counter {
            return Err(RenderError::invalid_usage(format!(
                "Temporary buffer from frame {} used during frame {}",
                buffer.frame, self.frame_counter,
            )));
        }

        let index = self.slot_index();
        self.slots[index].pages.host_slice_mut(
            buffer.page,
            buffer.descriptor.offset,
            buffer.descriptor.size,
        )
    }

    fn command_buffer(&self, which: usize) -> RenderResult<B::CommandBuffer> {
        self.require_recording("record commands")?;
        Ok(self.slots[self.slot_index()].cmd(which))
    }

    /// Executes first in the frame. Temporary uploads are appended to it at `end_frame`.
    pub fn copy_commands(&self) -> RenderResult<B::CommandBuffer> {
        self.command_buffer(COPY)
    }

    pub fn compute_commands(&self) -> RenderResult<B::CommandBuffer> {
        self.command_buffer(COMPUTE)
    }

    pub fn draw_commands(&self) -> RenderResult<B::CommandBuffer> {
        self.command_buffer(DRAW)
    }

    pub fn clear_image(&self, color: [f32; 4]) -> RenderResult<()> {
        let cmd = self.draw_commands()?;
        self.backend.cmd_clear_image(cmd, self.image_index, color);
        Ok(())
    }

    /// Swapchain image of the frame being recorded.
    pub fn image_index(&self) -> Option<u32> {
        (self.state == FrameState::Recording).then_some(self.image_index)
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot<B>> {
        self.slots.get(index)
    }
}
