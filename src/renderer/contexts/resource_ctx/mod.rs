pub mod page_allocator;
pub mod permanent_table;

use std::sync::Arc;
use ash::vk;
use gpu_allocator::MemoryLocation;
use log::debug;
use crate::renderer::backend::{Backend, BufferDesc, CopyRegion};
use crate::renderer::contexts::resource_ctx::permanent_table::PermanentBufferTable;
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::resources::buffer::GpuBuffer;
use crate::renderer::resources::handle::{BufferDescriptor, PermanentBuffer};
use crate::renderer::resources::page::{DEVICE_USAGE, STAGING_USAGE};

// Readback needs the permanent buffer as a copy source
const PERMANENT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    DEVICE_USAGE.as_raw() | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

/// Responsibilities:
/// - Upload and own long-lived buffers
/// - Hand out binding descriptors for them
/// - Read them back for verification
pub struct RenderResourceContext<B: Backend> {
    permanent: PermanentBufferTable<B>,
    backend: Arc<B>,
}

impl<B: Backend> RenderResourceContext<B> {
    pub fn new(backend: &Arc<B>) -> Self {
        Self {
            permanent: PermanentBufferTable::default(),
            backend: backend.clone(),
        }
    }

    /// Uploads `data` into a new device-local buffer, blocking until the copy has executed.
    pub fn load_permanent_buffer(&mut self, data: &[u8]) -> RenderResult<PermanentBuffer> {
        if data.is_empty() {
            return Err(RenderError::invalid_usage("Permanent buffers must not be empty"));
        }
        let size = data.len() as u64;

        let mut staging = GpuBuffer::new(&self.backend, &BufferDesc {
            name: "permanent upload (staging)",
            size,
            usage: STAGING_USAGE,
            location: MemoryLocation::CpuToGpu,
        })
        .map_err(|e| e.context("Failed to allocate staging buffer for permanent buffer"))?;
        staging.write(data, 0)?;

        let device = GpuBuffer::new(&self.backend, &BufferDesc {
            name: "permanent buffer",
            size,
            usage: PERMANENT_USAGE,
            location: MemoryLocation::GpuOnly,
        })
        .map_err(|e| e.context("Failed to allocate device buffer for permanent buffer"))?;

        self.backend
            .submit_immediate(|cmd| {
                self.backend.cmd_copy_buffer(cmd, staging.raw(), device.raw(), &[CopyRegion {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }]);
                Ok(())
            })
            .map_err(|e| e.context("Failed to upload permanent buffer"))?;
        drop(staging);

        let handle = self.permanent.insert(device);
        debug!("Loaded permanent buffer {} ({size} bytes)", handle.index());
        Ok(handle)
    }

    /// Releases the buffer's device memory. The GPU must no longer reference it.
    pub fn free_permanent_buffer(&mut self, handle: PermanentBuffer) -> RenderResult<()> {
        let buffer = self.permanent.remove(handle)?;
        debug!("Freed permanent buffer {} ({} bytes)", handle.index(), buffer.size());
        Ok(())
    }

    pub fn permanent_buffer(
        &self,
        handle: PermanentBuffer,
    ) -> RenderResult<BufferDescriptor<B::Buffer>> {
        let buffer = self.permanent.get(handle)?;
        Ok(BufferDescriptor {
            buffer: buffer.raw(),
            offset: 0,
            size: buffer.size(),
        })
    }

    /// Copies the buffer back into host memory, blocking until the copy has executed.
    pub fn read_permanent_buffer(&self, handle: PermanentBuffer) -> RenderResult<Vec<u8>> {
        let device = self.permanent.get(handle)?;
        let size = device.size();

        let readback = GpuBuffer::new(&self.backend, &BufferDesc {
            name: "permanent readback",
            size,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuToCpu,
        })
        .map_err(|e| e.context("Failed to allocate readback buffer"))?;

        self.backend
            .submit_immediate(|cmd| {
                self.backend.cmd_copy_buffer(cmd, device.raw(), readback.raw(), &[CopyRegion {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }]);
                Ok(())
            })
            .map_err(|e| e.context("Failed to read back permanent buffer"))?;

        readback.read(0, size)
    }

    pub fn permanent_table(&self) -> &PermanentBufferTable<B> {
        &self.permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::mock::MockBackend;
    use crate::renderer::error::ErrorKind;

    fn bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn upload_round_trips() {
        let backend = Arc::new(MockBackend::new());
        let mut resources = RenderResourceContext::new(&backend);

        let data = bytes(300);
        let handle = resources.load_permanent_buffer(&data).unwrap();

        assert_eq!(resources.read_permanent_buffer(handle).unwrap(), data);
        let descriptor = resources.permanent_buffer(handle).unwrap();
        assert_eq!(descriptor.size, 300);
        assert_eq!(backend.read_buffer(descriptor.buffer).unwrap(), data);
    }

    #[test]
    fn staging_is_released_after_upload() {
        let backend = Arc::new(MockBackend::new());
        let mut resources = RenderResourceContext::new(&backend);

        resources.load_permanent_buffer(&bytes(16)).unwrap();
        assert_eq!(backend.live_buffers_in(MemoryLocation::CpuToGpu), 0);
        assert_eq!(backend.live_buffers_in(MemoryLocation::GpuOnly), 1);
    }

    #[test]
    fn failed_device_allocation_releases_staging() {
        let backend = Arc::new(MockBackend::new());
        let mut resources = RenderResourceContext::new(&backend);
        backend.fail_next_buffer(MemoryLocation::GpuOnly);

        let err = resources.load_permanent_buffer(&bytes(16)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Vulkan);
        assert!(err.message().starts_with("Failed to allocate device buffer for permanent buffer"));
        assert_eq!(backend.live_buffers(), 0);
        assert!(resources.permanent_table().is_empty());
    }

    #[test]
    fn failed_transfer_releases_both_halves() {
        let backend = Arc::new(MockBackend::new());
        let mut resources = RenderResourceContext::new(&backend);
        backend.fail_next_immediate_submit();

        let err = resources.load_permanent_buffer(&bytes(16)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CriticalVulkan);
        assert!(err.is_fatal());
        assert!(err.message().starts_with("Failed to upload permanent buffer"));
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn free_then_load_reuses_the_slot() {
        let backend = Arc::new(MockBackend::new());
        let mut resources = RenderResourceContext::new(&backend);

        let a = resources.load_permanent_buffer(&bytes(64)).unwrap();
        resources.load_permanent_buffer(&bytes(64)).unwrap();
        resources.free_permanent_buffer(a).unwrap();
        let c = resources.load_permanent_buffer(&bytes(32)).unwrap();

        assert_eq!(c.index(), a.index());
        assert_eq!(resources.permanent_table().len(), 2);
        assert_eq!(
            resources.free_permanent_buffer(a).unwrap_err().kind(),
            ErrorKind::InvalidUsage,
        );
    }

    #[test]
    fn empty_upload_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let mut resources = RenderResourceContext::new(&backend);
        let err = resources.load_permanent_buffer(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
    }
}
