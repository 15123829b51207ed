use ash::vk;
use crate::renderer::error::{RenderError, RenderResult};

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;
pub const DEFAULT_PAGE_SIZE: u64 = 256 * 1024; // 256 KiB
pub const DEFAULT_MAX_ALLOCATION_SIZE: u64 = 64 * 1024 * 1024; // 64 MiB

/// Presentation pacing requested by the client
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    /// Wait for vertical blank, always supported
    #[default]
    Vsync,
    /// Mailbox presentation, falls back to vsync when unsupported
    TripleBuffer,
    /// No waiting, may tear, falls back to vsync when unsupported
    Immediate,
}

impl PresentMode {
    /// Picks the Vulkan present mode for this request out of the modes the surface supports.
    pub fn select(self, supported: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        let wanted = match self {
            PresentMode::Vsync => return vk::PresentModeKHR::FIFO,
            PresentMode::TripleBuffer => vk::PresentModeKHR::MAILBOX,
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        };

        if supported.contains(&wanted) {
            wanted
        } else {
            vk::PresentModeKHR::FIFO
        }
    }
}

/// Contains configuration options for the renderer like frame pacing and memory paging
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub application_name: String,
    /// Size of the frame ring, i.e. how many frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Default capacity of a temporary page
    pub page_size: u64,
    /// Largest single temporary allocation that is served by growing a dedicated page
    pub max_allocation_size: u64,
    pub present_mode: PresentMode,
    /// Enables the validation layer and debug messenger
    pub debug: bool,
    /// How long `begin_frame` may wait for the GPU before giving up
    pub frame_timeout_ns: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            application_name: String::from("mvr"),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            page_size: DEFAULT_PAGE_SIZE,
            max_allocation_size: DEFAULT_MAX_ALLOCATION_SIZE,
            present_mode: PresentMode::default(),
            debug: cfg!(debug_assertions),
            frame_timeout_ns: u64::MAX,
        }
    }
}

impl RenderConfig {
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_allocation_size(mut self, max_allocation_size: u64) -> Self {
        self.max_allocation_size = max_allocation_size;
        self
    }

    pub fn with_present_mode(mut self, present_mode: PresentMode) -> Self {
        self.present_mode = present_mode;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_frame_timeout_ns(mut self, frame_timeout_ns: u64) -> Self {
        self.frame_timeout_ns = frame_timeout_ns;
        self
    }

    pub fn validate(&self) -> RenderResult<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(RenderError::invalid_usage(format!(
                "frames_in_flight must be within 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight,
            )));
        }
        if self.page_size == 0 {
            return Err(RenderError::invalid_usage("page_size must be non-zero"));
        }
        if self.max_allocation_size < self.page_size {
            return Err(RenderError::invalid_usage(format!(
                "max_allocation_size ({}) must not be smaller than page_size ({})",
                self.max_allocation_size, self.page_size,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::error::ErrorKind;

    #[test]
    fn default_is_valid() {
        let config = RenderConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.page_size, 256 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_ring_and_page_sizes() {
        for config in [
            RenderConfig::default().with_frames_in_flight(0),
            RenderConfig::default().with_frames_in_flight(MAX_FRAMES_IN_FLIGHT + 1),
            RenderConfig::default().with_page_size(0),
            RenderConfig::default().with_page_size(1024).with_max_allocation_size(512),
        ] {
            let err = config.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidUsage);
        }
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let only_fifo = [vk::PresentModeKHR::FIFO];
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];

        assert_eq!(PresentMode::TripleBuffer.select(&only_fifo), vk::PresentModeKHR::FIFO);
        assert_eq!(PresentMode::Immediate.select(&only_fifo), vk::PresentModeKHR::FIFO);
        assert_eq!(PresentMode::TripleBuffer.select(&all), vk::PresentModeKHR::MAILBOX);
        assert_eq!(PresentMode::Immediate.select(&all), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(PresentMode::Vsync.select(&all), vk::PresentModeKHR::FIFO);
    }
}
