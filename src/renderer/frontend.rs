//! Status-code boundary for clients that cannot take a `Result`.
//!
//! Every call returns a [`Status`]. Negative codes are fatal and mean the renderer must be
//! torn down and initialized again, positive codes are recoverable and zero is success.
//! The message of the most recent failure stays available through
//! [`RenderFrontend::last_error`] until the next failure replaces it.

use std::sync::Arc;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use crate::renderer::backend::Backend;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::RenderDeviceContext;
use crate::renderer::error::{ErrorKind, RenderError, RenderResult};
use crate::renderer::resources::handle::{PermanentBuffer, TempBuffer};
use crate::renderer::Renderer;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success = 0,
    Failure = -1,
    CriticalWindowError = -2,
    NoDevice = -3,
    CriticalVulkanError = -4,
    WindowError = 1,
    VulkanError = 2,
    InvalidUsage = 3,
}

impl Status {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn is_fatal(self) -> bool {
        self.code() < 0
    }
}

impl From<ErrorKind> for Status {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Failure => Status::Failure,
            ErrorKind::CriticalWindow => Status::CriticalWindowError,
            ErrorKind::NoDevice => Status::NoDevice,
            ErrorKind::CriticalVulkan => Status::CriticalVulkanError,
            ErrorKind::Window => Status::WindowError,
            ErrorKind::Vulkan => Status::VulkanError,
            ErrorKind::InvalidUsage => Status::InvalidUsage,
        }
    }
}

pub struct RenderFrontend<B: Backend = RenderDeviceContext> {
    renderer: Option<Renderer<B>>,
    last_error: String,
}

impl<B: Backend> Default for RenderFrontend<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> RenderFrontend<B> {
    pub fn new() -> Self {
        Self {
            renderer: None,
            last_error: String::new(),
        }
    }

    pub fn initialize_with(&mut self, backend: Arc<B>, config: RenderConfig) -> Status {
        match Renderer::with_backend(backend, config) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                Status::Success
            }
            Err(e) => record(&mut self.last_error, e),
        }
    }

    /// Drops the renderer after the GPU has gone idle.
    pub fn quit(&mut self) {
        self.renderer = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.renderer.is_some()
    }

    pub fn renderer(&mut self) -> Option<&mut Renderer<B>> {
        self.renderer.as_mut()
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn allocate_temp_buffer(
        &mut self,
        size: u64,
    ) -> Result<(TempBuffer<B::Buffer>, &mut [u8]), Status> {
        let result = match self.renderer.as_mut() {
            Some(renderer) => renderer.allocate_temp_buffer(size),
            None => Err(not_initialized()),
        };
        result.map_err(|e| record(&mut self.last_error, e))
    }

    pub fn create_temp_buffer(
        &mut self,
        size: u64,
        data: &[u8],
    ) -> Result<TempBuffer<B::Buffer>, Status> {
        let result = self.with_renderer(|renderer| {
            check_len(size, data)?;
            renderer.create_temp_buffer(data)
        });
        result.map_err(|e| record(&mut self.last_error, e))
    }

    pub fn load_permanent_buffer(
        &mut self,
        size: u64,
        data: &[u8],
    ) -> Result<PermanentBuffer, Status> {
        let result = self.with_renderer(|renderer| {
            check_len(size, data)?;
            renderer.load_permanent_buffer(data)
        });
        result.map_err(|e| record(&mut self.last_error, e))
    }

    pub fn free_permanent_buffer(&mut self, handle: PermanentBuffer) -> Status {
        self.status(|renderer| renderer.free_permanent_buffer(handle))
    }

    pub fn begin_frame(&mut self) -> Status {
        self.status(Renderer::begin_frame)
    }

    pub fn end_frame(&mut self) -> Status {
        self.status(|renderer| renderer.end_frame().map(|_| ()))
    }

    pub fn present_frame(&mut self) -> Status {
        self.status(|renderer| renderer.present_frame().map(|_| ()))
    }

    fn with_renderer<T, F>(&mut self, f: F) -> RenderResult<T>
    where
        F: FnOnce(&mut Renderer<B>) -> RenderResult<T>,
    {
        match self.renderer.as_mut() {
            Some(renderer) => f(renderer),
            None => Err(not_initialized()),
        }
    }

    fn status<F>(&mut self, f: F) -> Status
    where
        F: FnOnce(&mut Renderer<B>) -> RenderResult<()>,
    {
        match self.with_renderer(f) {
            Ok(()) => Status::Success,
            Err(e) => record(&mut self.last_error, e),
        }
    }
}

impl RenderFrontend<RenderDeviceContext> {
    pub fn initialize<W>(
        &mut self,
        window: &W,
        extent: (u32, u32),
        config: RenderConfig,
    ) -> Status
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        match Renderer::new(window, extent, config) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                Status::Success
            }
            Err(e) => record(&mut self.last_error, e),
        }
    }
}

// Takes the message slot alone so callers can keep a borrow of the renderer
fn record(last_error: &mut String, error: RenderError) -> Status {
    if error.is_fatal() {
        log::error!("{}", error);
    } else {
        log::warn!("{}", error);
    }
    let status = Status::from(error.kind());
    *last_error = error.message().to_owned();
    status
}

fn not_initialized() -> RenderError {
    RenderError::new(ErrorKind::Failure, "Renderer is not initialized")
}

fn check_len(size: u64, data: &[u8]) -> RenderResult<()> {
    if data.len() as u64 != size {
        return Err(RenderError::invalid_usage(format!(
            "Expected {} bytes of data, got {}",
            size,
            data.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_allocator::MemoryLocation;
    use crate::renderer::backend::mock::MockBackend;

    fn frontend() -> (Arc<MockBackend>, RenderFrontend<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let mut frontend = RenderFrontend::new();
        let config = RenderConfig::default().with_page_size(256).with_max_allocation_size(4096);
        assert_eq!(frontend.initialize_with(backend.clone(), config), Status::Success);
        (backend, frontend)
    }

    #[test]
    fn codes_match_error_kinds() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::from(ErrorKind::Failure).code(), -1);
        assert_eq!(Status::from(ErrorKind::CriticalWindow).code(), -2);
        assert_eq!(Status::from(ErrorKind::NoDevice).code(), -3);
        assert_eq!(Status::from(ErrorKind::CriticalVulkan).code(), -4);
        assert_eq!(Status::from(ErrorKind::Window).code(), 1);
        assert_eq!(Status::from(ErrorKind::Vulkan).code(), 2);
        assert_eq!(Status::from(ErrorKind::InvalidUsage).code(), 3);

        for kind in [ErrorKind::Failure, ErrorKind::Vulkan, ErrorKind::InvalidUsage] {
            assert_eq!(Status::from(kind).code(), kind.code());
            assert_eq!(Status::from(kind).is_fatal(), kind.is_fatal());
        }
    }

    #[test]
    fn calls_before_initialize_fail() {
        let mut frontend = RenderFrontend::<MockBackend>::new();
        assert_eq!(frontend.begin_frame(), Status::Failure);
        assert_eq!(frontend.last_error(), "Renderer is not initialized");
        assert!(matches!(frontend.allocate_temp_buffer(16), Err(Status::Failure)));
    }

    #[test]
    fn failed_device_buffer_releases_staging() {
        let (backend, mut frontend) = frontend();
        backend.fail_next_buffer(MemoryLocation::GpuOnly);

        let data = [0xABu8; 32];
        let status = frontend.load_permanent_buffer(32, &data).unwrap_err();
        assert_eq!(status, Status::VulkanError);
        assert!(!status.is_fatal());
        assert!(frontend.last_error().starts_with("Failed to allocate device buffer for permanent buffer"));
        assert_eq!(backend.live_buffers_in(MemoryLocation::CpuToGpu), 0);
        assert_eq!(backend.live_buffers_in(MemoryLocation::GpuOnly), 0);

        // The renderer keeps working after a recoverable failure
        let handle = frontend.load_permanent_buffer(32, &data).unwrap();
        let renderer = frontend.renderer().unwrap();
        assert_eq!(renderer.read_permanent_buffer(handle).unwrap(), data.to_vec());
    }

    #[test]
    fn lost_device_during_upload_is_fatal() {
        let (backend, mut frontend) = frontend();
        backend.fail_next_immediate_submit();

        let status = frontend.load_permanent_buffer(4, &[1, 2, 3, 4]).unwrap_err();
        assert_eq!(status, Status::CriticalVulkanError);
        assert!(status.code() < 0);
        assert!(status.is_fatal());
        assert!(frontend.last_error().starts_with("Failed to upload permanent buffer"));
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn last_error_survives_success() {
        let (_backend, mut frontend) = frontend();

        assert_eq!(frontend.end_frame(), Status::InvalidUsage);
        let message = frontend.last_error().to_owned();
        assert!(!message.is_empty());

        assert_eq!(frontend.begin_frame(), Status::Success);
        assert_eq!(frontend.last_error(), message);
    }

    #[test]
    fn length_mismatch_is_invalid_usage() {
        let (_backend, mut frontend) = frontend();
        frontend.begin_frame();

        assert!(matches!(frontend.create_temp_buffer(8, &[1, 2, 3]), Err(Status::InvalidUsage)));
        assert!(matches!(frontend.load_permanent_buffer(2, &[1]), Err(Status::InvalidUsage)));
        assert!(frontend.create_temp_buffer(3, &[1, 2, 3]).is_ok());
    }

    #[test]
    fn frame_loop_through_status_codes() {
        let (backend, mut frontend) = frontend();

        for _ in 0..5 {
            assert_eq!(frontend.present_frame(), Status::Success);
            let (_, host) = frontend.allocate_temp_buffer(64).unwrap();
            host.fill(1);
        }
        assert_eq!(frontend.end_frame(), Status::Success);
        assert_eq!(backend.submissions().len(), 5);

        frontend.quit();
        assert!(!frontend.is_initialized());
        assert_eq!(backend.live_command_pools(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }
}
