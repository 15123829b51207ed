use std::ptr::NonNull;
use std::sync::Arc;
use crate::renderer::backend::{Backend, BufferDesc};
use crate::renderer::error::{RenderError, RenderResult, ResultExt};

/// A buffer and its memory, released together when dropped.
pub struct GpuBuffer<B: Backend> {
    raw: B::Buffer,
    size: u64,
    mapped: Option<NonNull<u8>>,

    memory: Option<B::Memory>,
    backend: Arc<B>,
}

impl<B: Backend> GpuBuffer<B> {
    pub fn new(backend: &Arc<B>, desc: &BufferDesc<'_>) -> RenderResult<Self> {
        let raw = backend.create_buffer(desc)?;

        Ok(Self {
            raw: raw.raw,
            size: desc.size,
            mapped: raw.mapped,

            memory: Some(raw.memory),
            backend: backend.clone(),
        })
    }

    pub fn raw(&self) -> B::Buffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn write<T>(
        &mut self,
        data: &[T],
        start_offset: usize,
    ) -> RenderResult<presser::CopyRecord>
    where
        T: Copy,
    {
        let mapped = self.mapped()?;
        let mut raw_allocation = presser::RawAllocation::from_raw_parts(
            mapped,
            self.size as usize,
        );
        // SAFETY: the mapping stays valid for the lifetime of `self`, and `&mut self` rules out
        // any other host access while the slab is borrowed
        let mut slab = unsafe { raw_allocation.borrow_as_slab() };
        presser::copy_from_slice_to_offset(data, &mut slab, start_offset)
            .recoverable("Failed to write buffer")
    }

    /// Host view of `[offset, offset + len)`.
    pub fn mapped_slice_mut(&mut self, offset: u64, len: u64) -> RenderResult<&mut [u8]> {
        let mapped = self.mapped()?;
        self.check_range(offset, len)?;
        // SAFETY: the range lies inside the mapping, which lives as long as `self`
        Ok(unsafe {
            std::slice::from_raw_parts_mut(mapped.as_ptr().add(offset as usize), len as usize)
        })
    }

    pub fn read(&self, offset: u64, len: u64) -> RenderResult<Vec<u8>> {
        let mapped = self.mapped()?;
        self.check_range(offset, len)?;
        // SAFETY: see `mapped_slice_mut`
        let bytes = unsafe {
            std::slice::from_raw_parts(mapped.as_ptr().add(offset as usize), len as usize)
        };
        Ok(bytes.to_vec())
    }

    fn mapped(&self) -> RenderResult<NonNull<u8>> {
        self.mapped
            .ok_or_else(|| RenderError::invalid_usage("Buffer is not host visible"))
    }

    fn check_range(&self, offset: u64, len: u64) -> RenderResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RenderError::invalid_usage(format!(
                "Range {offset}+{len} exceeds buffer size {}",
                self.size,
            ))),
        }
    }
}

impl<B: Backend> Drop for GpuBuffer<B> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.backend.destroy_buffer(self.raw, memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use gpu_allocator::MemoryLocation;
    use crate::renderer::backend::mock::MockBackend;
    use crate::renderer::error::ErrorKind;

    fn staging(backend: &Arc<MockBackend>, size: u64) -> GpuBuffer<MockBackend> {
        GpuBuffer::new(backend, &BufferDesc {
            name: "staging",
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        })
        .unwrap()
    }

    #[test]
    fn write_then_read() {
        let backend = Arc::new(MockBackend::new());
        let mut buffer = staging(&backend, 16);

        buffer.write(&[0xAAu8; 4], 8).unwrap();
        assert_eq!(buffer.read(8, 4).unwrap(), vec![0xAA; 4]);
        assert_eq!(buffer.read(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let backend = Arc::new(MockBackend::new());
        let mut buffer = staging(&backend, 16);

        assert!(buffer.write(&[0u8; 8], 12).is_err());
        let err = buffer.mapped_slice_mut(12, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
        assert!(buffer.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn drop_releases_memory() {
        let backend = Arc::new(MockBackend::new());
        {
            let _buffer = staging(&backend, 16);
            assert_eq!(backend.live_buffers(), 1);
        }
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn device_local_buffers_have_no_host_view() {
        let backend = Arc::new(MockBackend::new());
        let buffer = GpuBuffer::new(&backend, &BufferDesc {
            name: "device",
            size: 16,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        })
        .unwrap();

        assert!(!buffer.is_mapped());
        assert_eq!(buffer.read(0, 4).unwrap_err().kind(), ErrorKind::InvalidUsage);
    }
}
