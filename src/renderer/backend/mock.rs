//! Host-memory backend.
//!
//! [`MockBackend`] behaves like a single in-order GPU queue. Submitted frames are queued and
//! only execute when the CPU waits for them (or when [`MockBackend::gpu_step`] is called), so
//! tests can observe exactly how far the CPU runs ahead. Buffers live in host memory, copy
//! commands move real bytes, and probes snapshot buffer contents at the point in the command
//! stream where they were recorded.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use ash::vk;
use gpu_allocator::MemoryLocation;
use crate::renderer::backend::{
    AcquiredImage, Backend, BufferDesc, CopyRegion, DeviceLimits, FrameSubmission,
    PresentOutcome, RawBuffer,
};
use crate::renderer::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MockBuffer(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockCommandPool(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockCommandBuffer(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockSemaphore(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(usize);

#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    Copy {
        src: MockBuffer,
        dst: MockBuffer,
        regions: Vec<CopyRegion>,
    },
    TransferBarrier,
    Probe {
        probe: ProbeId,
        buffer: MockBuffer,
        offset: u64,
        size: u64,
    },
    BeginImage(u32),
    EndImage(u32),
    ClearImage(u32, [f32; 4]),
}

/// What the queue saw for one `submit_frame` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub command_buffers: Vec<MockCommandBuffer>,
    pub commands: Vec<MockCommand>,
    pub image_ready: MockSemaphore,
    pub image_index: u32,
    pub signal_value: u64,
}

struct MockAllocation {
    bytes: NonNull<[u8]>,
    location: MemoryLocation,
}

impl MockAllocation {
    fn new(size: usize, location: MemoryLocation) -> Self {
        let bytes = NonNull::from(Box::leak(vec![0u8; size].into_boxed_slice()));
        Self { bytes, location }
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn as_ptr(&self) -> *mut u8 {
        self.bytes.cast::<u8>().as_ptr()
    }
}

impl Drop for MockAllocation {
    fn drop(&mut self) {
        // SAFETY: `bytes` came from `Box::leak` in `new` and is released exactly once here
        drop(unsafe { Box::from_raw(self.bytes.as_ptr()) });
    }
}

#[derive(Default)]
struct Recording {
    recording: bool,
    commands: Vec<MockCommand>,
}

struct PendingSubmission {
    signal_value: u64,
    commands: Vec<MockCommand>,
}

#[derive(Default)]
struct Failures {
    buffers: Vec<MemoryLocation>,
    immediate_submit: bool,
    frame_submit: bool,
    present: bool,
    present_outcomes: VecDeque<PresentOutcome>,
    stalled: bool,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    buffers: HashMap<MockBuffer, MockAllocation>,
    pools: HashMap<u64, Vec<MockCommandBuffer>>,
    recordings: HashMap<MockCommandBuffer, Recording>,
    semaphores: Vec<MockSemaphore>,

    pending: VecDeque<PendingSubmission>,
    completed: u64,
    wait_log: Vec<u64>,
    submissions: Vec<SubmissionRecord>,
    immediate_submits: usize,
    probes: Vec<Option<Vec<u8>>>,
    cleared_images: HashMap<u32, [f32; 4]>,

    next_image: u32,
    presented: Vec<u32>,

    failures: Failures,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, cmd: MockCommandBuffer, command: MockCommand) {
        let recording = self
            .recordings
            .get_mut(&cmd)
            .filter(|r| r.recording);
        match recording {
            Some(recording) => recording.commands.push(command),
            None => panic!("{cmd:?} is not in the recording state"),
        }
    }

    fn execute(&mut self, commands: &[MockCommand]) {
        for command in commands {
            match command {
                MockCommand::Copy { src, dst, regions } => {
                    for region in regions {
                        self.copy(*src, *dst, region);
                    }
                }
                MockCommand::Probe { probe, buffer, offset, size } => {
                    let snapshot = self.read(*buffer, *offset, *size);
                    self.probes[probe.0] = Some(snapshot);
                }
                MockCommand::ClearImage(index, color) => {
                    self.cleared_images.insert(*index, *color);
                }
                MockCommand::TransferBarrier
                | MockCommand::BeginImage(_)
                | MockCommand::EndImage(_) => {}
            }
        }
    }

    fn copy(&mut self, src: MockBuffer, dst: MockBuffer, region: &CopyRegion) {
        let (Some(from), Some(to)) = (self.buffers.get(&src), self.buffers.get(&dst)) else {
            panic!("copy between destroyed buffers {src:?} -> {dst:?}");
        };
        let size = region.size as usize;
        assert!(
            region.src_offset as usize + size <= from.len()
                && region.dst_offset as usize + size <= to.len(),
            "copy region {region:?} out of bounds ({} -> {} bytes)",
            from.len(),
            to.len(),
        );
        // SAFETY: both ranges were bounds checked above, `copy` tolerates overlap
        unsafe {
            std::ptr::copy(
                from.as_ptr().add(region.src_offset as usize),
                to.as_ptr().add(region.dst_offset as usize),
                size,
            );
        }
    }

    fn read(&self, buffer: MockBuffer, offset: u64, size: u64) -> Vec<u8> {
        let Some(allocation) = self.buffers.get(&buffer) else {
            panic!("read from destroyed buffer {buffer:?}");
        };
        let (offset, size) = (offset as usize, size as usize);
        assert!(offset + size <= allocation.len(), "read out of bounds");
        // SAFETY: bounds checked above, the allocation outlives this borrow
        unsafe { std::slice::from_raw_parts(allocation.as_ptr().add(offset), size).to_vec() }
    }

    /// Executes the oldest pending submission.
    fn step(&mut self) -> Option<u64> {
        let submission = self.pending.pop_front()?;
        self.execute(&submission.commands);
        self.completed = self.completed.max(submission.signal_value);
        Some(submission.signal_value)
    }

    fn flush(&mut self) {
        while self.step().is_some() {}
    }
}

/// A [`Backend`] that runs entirely in host memory.
pub struct MockBackend {
    state: Mutex<MockState>,
    limits: DeviceLimits,
    image_count: u32,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            limits: DeviceLimits {
                min_storage_buffer_offset_alignment: 16,
                min_texel_buffer_offset_alignment: 64,
            },
            image_count: 3,
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_image_count(mut self, image_count: u32) -> Self {
        self.image_count = image_count.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Failure injection

    /// Fails the next buffer creation in `location`.
    pub fn fail_next_buffer(&self, location: MemoryLocation) {
        self.state().failures.buffers.push(location);
    }

    pub fn fail_next_immediate_submit(&self) {
        self.state().failures.immediate_submit = true;
    }

    pub fn fail_next_frame_submit(&self) {
        self.state().failures.frame_submit = true;
    }

    pub fn fail_next_present(&self) {
        self.state().failures.present = true;
    }

    /// Queues the outcome reported by an upcoming `present`.
    pub fn push_present_outcome(&self, outcome: PresentOutcome) {
        self.state().failures.present_outcomes.push_back(outcome);
    }

    /// A stalled GPU never completes queued work, so waits on it time out.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().failures.stalled = stalled;
    }

    // GPU simulation

    /// Executes the oldest queued frame, returning the timeline value it signaled.
    pub fn gpu_step(&self) -> Option<u64> {
        self.state().step()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state().pending.len()
    }

    /// Records a snapshot of `size` bytes of `buffer` taken when the GPU reaches this command.
    pub fn cmd_probe(
        &self,
        cmd: MockCommandBuffer,
        buffer: MockBuffer,
        offset: u64,
        size: u64,
    ) -> ProbeId {
        let mut state = self.state();
        let probe = ProbeId(state.probes.len());
        state.probes.push(None);
        state.record(cmd, MockCommand::Probe { probe, buffer, offset, size });
        probe
    }

    /// Bytes captured by a probe, `None` until the GPU executed it.
    pub fn probe(&self, probe: ProbeId) -> Option<Vec<u8>> {
        self.state().probes.get(probe.0).cloned().flatten()
    }

    // Introspection

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_buffers_in(&self, location: MemoryLocation) -> usize {
        self.state()
            .buffers
            .values()
            .filter(|a| a.location == location)
            .count()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state().semaphores.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state().pools.len()
    }

    /// Every timeline value the CPU waited for, in order.
    pub fn wait_log(&self) -> Vec<u64> {
        self.state().wait_log.clone()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state().submissions.clone()
    }

    pub fn immediate_submits(&self) -> usize {
        self.state().immediate_submits
    }

    pub fn presented(&self) -> Vec<u32> {
        self.state().presented.clone()
    }

    pub fn recorded_commands(&self, cmd: MockCommandBuffer) -> Vec<MockCommand> {
        self.state()
            .recordings
            .get(&cmd)
            .map(|r| r.commands.clone())
            .unwrap_or_default()
    }

    pub fn cleared_color(&self, image_index: u32) -> Option<[f32; 4]> {
        self.state().cleared_images.get(&image_index).copied()
    }

    /// Reads buffer contents regardless of memory location.
    pub fn read_buffer(&self, buffer: MockBuffer) -> Option<Vec<u8>> {
        let state = self.state();
        let size = state.buffers.get(&buffer)?.len() as u64;
        Some(state.read(buffer, 0, size))
    }
}

impl Backend for MockBackend {
    type Buffer = MockBuffer;
    type Memory = ();
    type CommandPool = MockCommandPool;
    type CommandBuffer = MockCommandBuffer;
    type Semaphore = MockSemaphore;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> RenderResult<RawBuffer<Self>> {
        let mut state = self.state();

        if let Some(i) = state
            .failures
            .buffers
            .iter()
            .position(|location| *location == desc.location)
        {
            state.failures.buffers.remove(i);
            return Err(RenderError::vulkan(format!(
                "{} ({})",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                desc.name,
            )));
        }
        if desc.size == 0 {
            return Err(RenderError::invalid_usage(format!(
                "Buffer {} must not be empty",
                desc.name,
            )));
        }

        let buffer = MockBuffer(state.next_id());
        let allocation = MockAllocation::new(desc.size as usize, desc.location);
        let mapped = match desc.location {
            MemoryLocation::GpuOnly => None,
            _ => NonNull::new(allocation.as_ptr()),
        };
        state.buffers.insert(buffer, allocation);

        Ok(RawBuffer {
            raw: buffer,
            memory: (),
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: Self::Buffer, _memory: Self::Memory) {
        if self.state().buffers.remove(&buffer).is_none() {
            log::error!("Destroyed {buffer:?} twice");
        }
    }

    fn create_command_pool(&self) -> RenderResult<Self::CommandPool> {
        let mut state = self.state();
        let id = state.next_id();
        state.pools.insert(id, Vec::new());
        Ok(MockCommandPool(id))
    }

    fn destroy_command_pool(&self, pool: Self::CommandPool) {
        let mut state = self.state();
        for cmd in state.pools.remove(&pool.0).unwrap_or_default() {
            state.recordings.remove(&cmd);
        }
    }

    fn reset_command_pool(&self, pool: Self::CommandPool) -> RenderResult<()> {
        let mut state = self.state();
        let buffers = state
            .pools
            .get(&pool.0)
            .cloned()
            .ok_or_else(|| RenderError::critical(format!("Unknown {pool:?}")))?;
        for cmd in buffers {
            if let Some(recording) = state.recordings.get_mut(&cmd) {
                recording.recording = false;
                recording.commands.clear();
            }
        }
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        pool: Self::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<Self::CommandBuffer>> {
        let mut state = self.state();
        if !state.pools.contains_key(&pool.0) {
            return Err(RenderError::critical(format!("Unknown {pool:?}")));
        }

        let buffers: Vec<_> = (0..count)
            .map(|_| MockCommandBuffer(state.next_id()))
            .collect();
        for cmd in &buffers {
            state.recordings.insert(*cmd, Recording::default());
        }
        if let Some(pool_buffers) = state.pools.get_mut(&pool.0) {
            pool_buffers.extend_from_slice(&buffers);
        }
        Ok(buffers)
    }

    fn begin_commands(&self, cmd: Self::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state();
        let recording = state
            .recordings
            .get_mut(&cmd)
            .ok_or_else(|| RenderError::critical(format!("Unknown {cmd:?}")))?;
        if recording.recording {
            return Err(RenderError::critical(format!("{cmd:?} is already recording")));
        }
        recording.recording = true;
        recording.commands.clear();
        Ok(())
    }

    fn end_commands(&self, cmd: Self::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state();
        match state.recordings.get_mut(&cmd) {
            Some(recording) if recording.recording => {
                recording.recording = false;
                Ok(())
            }
            _ => Err(RenderError::critical(format!("{cmd:?} is not recording"))),
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[CopyRegion],
    ) {
        self.state().record(cmd, MockCommand::Copy {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn cmd_transfer_barrier(&self, cmd: Self::CommandBuffer) {
        self.state().record(cmd, MockCommand::TransferBarrier);
    }

    fn cmd_begin_image(&self, cmd: Self::CommandBuffer, image_index: u32) {
        self.state().record(cmd, MockCommand::BeginImage(image_index));
    }

    fn cmd_end_image(&self, cmd: Self::CommandBuffer, image_index: u32) {
        self.state().record(cmd, MockCommand::EndImage(image_index));
    }

    fn cmd_clear_image(&self, cmd: Self::CommandBuffer, image_index: u32, color: [f32; 4]) {
        self.state().record(cmd, MockCommand::ClearImage(image_index, color));
    }

    fn submit_immediate<F>(&self, record: F) -> RenderResult<()>
    where
        F: FnOnce(Self::CommandBuffer) -> RenderResult<()>,
    {
        let cmd = {
            let mut state = self.state();
            let cmd = MockCommandBuffer(state.next_id());
            state.recordings.insert(cmd, Recording {
                recording: true,
                ..Default::default()
            });
            cmd
        };

        // The closure records through `self`, so the state lock must not be held here
        let recorded = record(cmd);

        let mut state = self.state();
        let commands = state
            .recordings
            .remove(&cmd)
            .map(|r| r.commands)
            .unwrap_or_default();
        recorded?;

        if std::mem::take(&mut state.failures.immediate_submit) {
            return Err(RenderError::critical(format!(
                "Failed to submit single use command buffer, {}",
                vk::Result::ERROR_DEVICE_LOST,
            )));
        }

        // One queue: everything submitted earlier finishes first
        state.flush();
        state.execute(&commands);
        state.immediate_submits += 1;
        Ok(())
    }

    fn create_semaphore(&self) -> RenderResult<Self::Semaphore> {
        let mut state = self.state();
        let semaphore = MockSemaphore(state.next_id());
        state.semaphores.push(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: Self::Semaphore) {
        self.state().semaphores.retain(|s| *s != semaphore);
    }

    fn wait_for_frame_completion(&self, value: u64, timeout_ns: u64) -> RenderResult<()> {
        let mut state = self.state();
        state.wait_log.push(value);

        while state.completed < value {
            if state.failures.stalled {
                return Err(RenderError::critical(format!(
                    "Timed out after {timeout_ns}ns waiting for frame {value}, {}",
                    vk::Result::TIMEOUT,
                )));
            }
            if state.step().is_none() {
                return Err(RenderError::critical(format!(
                    "Frame {value} was never submitted, the wait would never return",
                )));
            }
        }
        Ok(())
    }

    fn completed_frames(&self) -> RenderResult<u64> {
        Ok(self.state().completed)
    }

    fn acquire_image(&self, image_ready: Self::Semaphore) -> RenderResult<AcquiredImage> {
        let mut state = self.state();
        if !state.semaphores.contains(&image_ready) {
            return Err(RenderError::critical(format!("Unknown {image_ready:?}")));
        }
        let index = state.next_image;
        state.next_image = (index + 1) % self.image_count;
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn submit_frame(&self, submission: &FrameSubmission<Self>) -> RenderResult<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.failures.frame_submit) {
            return Err(RenderError::critical(format!(
                "Failed to submit frame {}, {}",
                submission.signal_value,
                vk::Result::ERROR_DEVICE_LOST,
            )));
        }

        let mut commands = Vec::new();
        for cmd in &submission.command_buffers {
            match state.recordings.get(cmd) {
                Some(recording) if !recording.recording => {
                    commands.extend_from_slice(&recording.commands);
                }
                _ => {
                    return Err(RenderError::critical(format!(
                        "{cmd:?} submitted while recording or after being freed",
                    )));
                }
            }
        }

        state.submissions.push(SubmissionRecord {
            command_buffers: submission.command_buffers.to_vec(),
            commands: commands.clone(),
            image_ready: submission.image_ready,
            image_index: submission.image_index,
            signal_value: submission.signal_value,
        });
        state.pending.push_back(PendingSubmission {
            signal_value: submission.signal_value,
            commands,
        });
        Ok(())
    }

    fn present(&self, image_index: u32) -> RenderResult<PresentOutcome> {
        let mut state = self.state();
        if std::mem::take(&mut state.failures.present) {
            return Err(RenderError::critical(format!(
                "Failed to present image {image_index}, {}",
                vk::Result::ERROR_DEVICE_LOST,
            )));
        }
        state.presented.push(image_index);
        Ok(state
            .failures
            .present_outcomes
            .pop_front()
            .unwrap_or(PresentOutcome::Optimal))
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut state = self.state();
        if state.failures.stalled && !state.pending.is_empty() {
            return Err(RenderError::critical(format!(
                "Failed to wait for device idle, {}",
                vk::Result::TIMEOUT,
            )));
        }
        state.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(size: u64, location: MemoryLocation) -> BufferDesc<'static> {
        BufferDesc {
            name: "test",
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location,
        }
    }

    #[test]
    fn device_local_buffers_are_not_mapped() {
        let backend = MockBackend::new();
        let staging = backend.create_buffer(&desc(16, MemoryLocation::CpuToGpu)).unwrap();
        let device = backend.create_buffer(&desc(16, MemoryLocation::GpuOnly)).unwrap();

        assert!(staging.mapped.is_some());
        assert!(device.mapped.is_none());
        assert_eq!(backend.live_buffers(), 2);

        backend.destroy_buffer(staging.raw, ());
        backend.destroy_buffer(device.raw, ());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn injected_buffer_failure_targets_one_location() {
        let backend = MockBackend::new();
        backend.fail_next_buffer(MemoryLocation::GpuOnly);

        let staging = backend.create_buffer(&desc(16, MemoryLocation::CpuToGpu));
        assert!(staging.is_ok());
        assert!(backend.create_buffer(&desc(16, MemoryLocation::GpuOnly)).is_err());
        assert!(backend.create_buffer(&desc(16, MemoryLocation::GpuOnly)).is_ok());
    }

    #[test]
    fn frames_execute_only_when_waited_for() {
        let backend = MockBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let cmd = backend.allocate_command_buffers(pool, 1).unwrap()[0];
        let semaphore = backend.create_semaphore().unwrap();

        for value in 1..=2 {
            backend.reset_command_pool(pool).unwrap();
            backend.begin_commands(cmd).unwrap();
            backend.end_commands(cmd).unwrap();
            backend
                .submit_frame(&FrameSubmission {
                    command_buffers: smallvec::smallvec![cmd],
                    image_ready: semaphore,
                    image_index: 0,
                    signal_value: value,
                })
                .unwrap();
        }

        assert_eq!(backend.completed_frames().unwrap(), 0);
        backend.wait_for_frame_completion(1, u64::MAX).unwrap();
        assert_eq!(backend.completed_frames().unwrap(), 1);
        assert_eq!(backend.pending_submissions(), 1);
        backend.wait_idle().unwrap();
        assert_eq!(backend.completed_frames().unwrap(), 2);
    }

    #[test]
    fn immediate_submit_moves_bytes() {
        let backend = MockBackend::new();
        let src = backend.create_buffer(&desc(4, MemoryLocation::CpuToGpu)).unwrap();
        let dst = backend.create_buffer(&desc(4, MemoryLocation::GpuOnly)).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), src.mapped.unwrap().as_ptr(), 4);
        }

        backend
            .submit_immediate(|cmd| {
                backend.cmd_copy_buffer(cmd, src.raw, dst.raw, &[CopyRegion {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 4,
                }]);
                Ok(())
            })
            .unwrap();

        assert_eq!(backend.read_buffer(dst.raw).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.immediate_submits(), 1);
    }

    #[test]
    fn stalled_gpu_times_out() {
        let backend = MockBackend::new();
        backend.set_stalled(true);
        let err = backend.wait_for_frame_completion(1, 1_000).unwrap_err();
        assert!(err.is_fatal());
    }
}
