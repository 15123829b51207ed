pub mod backend;
pub mod config;
pub mod contexts;
pub mod error;
pub mod frontend;
pub mod resources;

use std::sync::Arc;
use bytemuck::Pod;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use crate::renderer::backend::Backend;
use crate::renderer::contexts::resource_ctx::page_allocator::PageStats;
use crate::renderer::contexts::resource_ctx::permanent_table::PermanentBufferTable;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;

pub use crate::renderer::backend::PresentOutcome;
pub use crate::renderer::config::{PresentMode, RenderConfig};
pub use crate::renderer::contexts::device_ctx::RenderDeviceContext;
pub use crate::renderer::contexts::frame_ctx::{FrameState, RenderFrameContext};
pub use crate::renderer::error::{ErrorKind, RenderError, RenderResult};
pub use crate::renderer::resources::{BufferDescriptor, PermanentBuffer, TempBuffer};

/// The renderer context object. Owns the frame ring and the permanent buffers of one backend.
///
/// Every frame operation takes `&mut self`, so there is exactly one producer of GPU work.
pub struct Renderer<B: Backend = RenderDeviceContext> {
    frames: RenderFrameContext<B>,
    resources: RenderResourceContext<B>,
    config: RenderConfig,

    backend: Arc<B>,
}

impl<B: Backend> Renderer<B> {
    pub fn with_backend(backend: Arc<B>, config: RenderConfig) -> RenderResult<Self> {
        config.validate()?;

        let frames = RenderFrameContext::new(&backend, &config)?;
        let resources = RenderResourceContext::new(&backend);
        log::info!(
            "Renderer ready with {} frames in flight and {} byte pages",
            config.frames_in_flight,
            config.page_size,
        );

        Ok(Self {
            frames,
            resources,
            config,
            backend,
        })
    }

    pub fn begin_frame(&mut self) -> RenderResult<()> {
        self.frames.begin_frame()
    }

    pub fn end_frame(&mut self) -> RenderResult<PresentOutcome> {
        self.frames.end_frame()
    }

    /// Ends the frame being recorded, if any, and begins the next one.
    ///
    /// Returns the outcome of presenting the ended frame.
    pub fn present_frame(&mut self) -> RenderResult<Option<PresentOutcome>> {
        let outcome = match self.frames.state() {
            FrameState::Recording => Some(self.frames.end_frame()?),
            FrameState::Idle | FrameState::Submitted | FrameState::Lost => None,
        };
        self.frames.begin_frame()?;
        Ok(outcome)
    }

    /// Reserves `size` bytes for the current frame. The returned bytes are uploaded before
    /// any of the frame's compute or draw commands execute.
    pub fn allocate_temp_buffer(
        &mut self,
        size: u64,
    ) -> RenderResult<(TempBuffer<B::Buffer>, &mut [u8])> {
        self.frames.allocate_temporary(size)
    }

    pub fn create_temp_buffer(&mut self, data: &[u8]) -> RenderResult<TempBuffer<B::Buffer>> {
        let (buffer, host) = self.frames.allocate_temporary(data.len() as u64)?;
        host.copy_from_slice(data);
        Ok(buffer)
    }

    pub fn create_temp_buffer_from<T: Pod>(&mut self, data: &[T]) -> RenderResult<TempBuffer<B::Buffer>> {
        self.create_temp_buffer(bytemuck::cast_slice(data))
    }

    pub fn temp_buffer_mut(&mut self, buffer: &TempBuffer<B::Buffer>) -> RenderResult<&mut [u8]> {
        self.frames.temp_buffer_mut(buffer)
    }

    /// Uploads `data` to a device-local buffer that lives until it is freed.
    /// Blocks until the upload has executed.
    pub fn load_permanent_buffer(&mut self, data: &[u8]) -> RenderResult<PermanentBuffer> {
        self.resources.load_permanent_buffer(data)
    }

    pub fn load_permanent_buffer_from<T: Pod>(&mut self, data: &[T]) -> RenderResult<PermanentBuffer> {
        self.resources.load_permanent_buffer(bytemuck::cast_slice(data))
    }

    /// Frees a permanent buffer once every submitted frame that could reference it is done.
    pub fn free_permanent_buffer(&mut self, handle: PermanentBuffer) -> RenderResult<()> {
        // Validate before stalling on the GPU
        self.resources.permanent_buffer(handle)?;

        let submitted = self.frames.frame_counter();
        if submitted > 0 {
            self.backend
                .wait_for_frame_completion(submitted, self.config.frame_timeout_ns)
                .map_err(|e| e.context("Failed to wait for frames using permanent buffer"))?;
        }
        self.resources.free_permanent_buffer(handle)
    }

    pub fn permanent_buffer(&self, handle: PermanentBuffer) -> RenderResult<BufferDescriptor<B::Buffer>> {
        self.resources.permanent_buffer(handle)
    }

    /// Copies a permanent buffer back to the host. Blocks until the copy has executed.
    pub fn read_permanent_buffer(&self, handle: PermanentBuffer) -> RenderResult<Vec<u8>> {
        self.resources.read_permanent_buffer(handle)
    }

    pub fn permanent_table(&self) -> &PermanentBufferTable<B> {
        self.resources.permanent_table()
    }

    pub fn copy_commands(&self) -> RenderResult<B::CommandBuffer> {
        self.frames.copy_commands()
    }

    pub fn compute_commands(&self) -> RenderResult<B::CommandBuffer> {
        self.frames.compute_commands()
    }

    pub fn draw_commands(&self) -> RenderResult<B::CommandBuffer> {
        self.frames.draw_commands()
    }

    pub fn clear_image(&self, color: [f32; 4]) -> RenderResult<()> {
        self.frames.clear_image(color)
    }

    pub fn frame_counter(&self) -> u64 {
        self.frames.frame_counter()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    pub fn state(&self) -> FrameState {
        self.frames.state()
    }

    /// Temporary page usage of one frame slot.
    pub fn page_stats(&self, slot: usize) -> Option<PageStats> {
        self.frames.slot(slot).map(|slot| slot.pages.stats())
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn wait_idle(&self) -> RenderResult<()> {
        self.backend.wait_idle()
    }
}

impl Renderer<RenderDeviceContext> {
    pub fn new<W>(
        window: &W,
        extent: (u32, u32),
        config: RenderConfig,
    ) -> RenderResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        config.validate()?;
        let backend = RenderDeviceContext::new(window, extent, &config)?;
        Self::with_backend(Arc::new(backend), config)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.backend.request_resize(width, height);
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to wait for GPU before dropping renderer, {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::mock::MockBackend;

    fn renderer() -> (Arc<MockBackend>, Renderer<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let config = RenderConfig::default()
            .with_page_size(256)
            .with_max_allocation_size(1024);
        let renderer = Renderer::with_backend(backend.clone(), config).unwrap();
        (backend, renderer)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let config = RenderConfig::default().with_frames_in_flight(0);
        let err = Renderer::with_backend(backend.clone(), config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
        assert_eq!(backend.live_command_pools(), 0);
    }

    #[test]
    fn present_frame_from_idle_only_begins() {
        let (backend, mut renderer) = renderer();

        assert_eq!(renderer.present_frame().unwrap(), None);
        assert_eq!(renderer.state(), FrameState::Recording);
        assert!(backend.submissions().is_empty());

        assert_eq!(renderer.present_frame().unwrap(), Some(PresentOutcome::Optimal));
        assert_eq!(renderer.state(), FrameState::Recording);
        assert_eq!(renderer.frame_counter(), 1);
    }

    #[test]
    fn typed_temp_buffer_holds_bytes() {
        let (_backend, mut renderer) = renderer();
        renderer.begin_frame().unwrap();

        let values = [1.0f32, 2.0, 3.0, 4.0];
        let buffer = renderer.create_temp_buffer_from(&values).unwrap();
        assert_eq!(buffer.descriptor.size, 16);
        let host = renderer.temp_buffer_mut(&buffer).unwrap();
        assert_eq!(host, bytemuck::cast_slice::<f32, u8>(&values));
    }

    #[test]
    fn free_waits_for_submitted_frames() {
        let (backend, mut renderer) = renderer();
        let handle = renderer.load_permanent_buffer_from(&[7u32; 8]).unwrap();

        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();

        renderer.free_permanent_buffer(handle).unwrap();
        assert_eq!(backend.wait_log().last(), Some(&2));
        assert_eq!(backend.completed_frames().unwrap(), 2);
        assert_eq!(renderer.permanent_table().occupied(), 0);
    }

    #[test]
    fn freeing_twice_is_rejected() {
        let (_backend, mut renderer) = renderer();
        let handle = renderer.load_permanent_buffer(&[1, 2, 3]).unwrap();
        renderer.free_permanent_buffer(handle).unwrap();

        let err = renderer.free_permanent_buffer(handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
    }

    #[test]
    fn page_stats_report_current_usage() {
        let (_backend, mut renderer) = renderer();
        renderer.begin_frame().unwrap();
        renderer.allocate_temp_buffer(100).unwrap();

        let stats = renderer.page_stats(0).unwrap();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.capacity, 256);
        assert_eq!(stats.used, 100);
        assert!(renderer.page_stats(7).is_none());
    }
}
