use std::sync::Arc;
use ash::vk;
use gpu_allocator::MemoryLocation;
use crate::renderer::backend::{Backend, BufferDesc, CopyRegion};
use crate::renderer::error::RenderResult;
use crate::renderer::resources::buffer::GpuBuffer;

pub const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::TRANSFER_SRC;

/// Every way a temporary range may be consumed on the device.
pub const DEVICE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER.as_raw(),
);

/// A host-visible staging buffer paired with a device-local copy destination of the same size.
pub struct Page<B: Backend> {
    pub staging: GpuBuffer<B>,
    pub device: GpuBuffer<B>,
    offset: u64,
}

impl<B: Backend> Page<B> {
    pub fn new(backend: &Arc<B>, capacity: u64, index: usize) -> RenderResult<Self> {
        let staging_name = format!("temporary page {index} (staging)");
        let staging = GpuBuffer::new(backend, &BufferDesc {
            name: &staging_name,
            size: capacity,
            usage: STAGING_USAGE,
            location: MemoryLocation::CpuToGpu,
        })
        .map_err(|e| e.context("Failed to allocate staging buffer for new page"))?;

        // `staging` is released on the way out if this fails
        let device_name = format!("temporary page {index} (device)");
        let device = GpuBuffer::new(backend, &BufferDesc {
            name: &device_name,
            size: capacity,
            usage: DEVICE_USAGE,
            location: MemoryLocation::GpuOnly,
        })
        .map_err(|e| e.context("Failed to allocate device buffer for new page"))?;

        Ok(Self {
            staging,
            device,
            offset: 0,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.staging.size()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.capacity() - self.offset
    }

    /// Claims `size` bytes at the current offset and returns where they start.
    ///
    /// The offset advances to the next multiple of `alignment`, clamped to the capacity.
    pub fn claim(&mut self, size: u64, alignment: u64) -> u64 {
        debug_assert!(size <= self.remaining());
        let start = self.offset;
        self.offset = (start + size)
            .div_ceil(alignment)
            .saturating_mul(alignment)
            .min(self.capacity());
        start
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Staging to device copy covering everything written since the last reset.
    pub fn pending_copy(&self) -> Option<CopyRegion> {
        (self.offset > 0).then_some(CopyRegion {
            src_offset: 0,
            dst_offset: 0,
            size: self.offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::mock::MockBackend;

    #[test]
    fn claim_rounds_up_and_clamps() {
        let backend = Arc::new(MockBackend::new());
        let mut page = Page::new(&backend, 100, 0).unwrap();

        assert_eq!(page.claim(10, 64), 0);
        assert_eq!(page.offset(), 64);
        assert_eq!(page.claim(30, 64), 64);
        // 94 would round up to 128, past the end
        assert_eq!(page.offset(), 100);
        assert_eq!(page.remaining(), 0);
    }

    #[test]
    fn untouched_page_has_no_copy() {
        let backend = Arc::new(MockBackend::new());
        let mut page = Page::new(&backend, 256, 0).unwrap();
        assert_eq!(page.pending_copy(), None);

        page.claim(1, 64);
        assert_eq!(page.pending_copy().map(|c| c.size), Some(64));

        page.reset();
        assert_eq!(page.pending_copy(), None);
    }

    #[test]
    fn failed_device_half_releases_staging_half() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_buffer(MemoryLocation::GpuOnly);

        let err = Page::new(&backend, 256, 0).err().unwrap();
        assert!(err.message().starts_with("Failed to allocate device buffer for new page"));
        assert_eq!(backend.live_buffers(), 0);
    }
}
