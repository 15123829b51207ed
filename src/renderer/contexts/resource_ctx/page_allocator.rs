use std::sync::Arc;
use log::{debug, info};
use crate::renderer::backend::Backend;
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::resources::handle::BufferDescriptor;
use crate::renderer::resources::page::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempAllocation<H> {
    pub page: usize,
    pub descriptor: BufferDescriptor<H>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    pub pages: usize,
    pub capacity: u64,
    pub used: u64,
}

/// Sub-allocates short-lived ranges out of a growable list of staging/device page pairs.
///
/// Allocations bump a per-page offset and are only reclaimed in bulk by [`begin_frame`],
/// so one allocator belongs to one frame slot.
///
/// [`begin_frame`]: PageAllocator::begin_frame
pub struct PageAllocator<B: Backend> {
    pages: Vec<Page<B>>,
    page_size: u64,
    max_allocation_size: u64,
    alignment: u64,

    backend: Arc<B>,
}

impl<B: Backend> PageAllocator<B> {
    pub fn new(backend: &Arc<B>, page_size: u64, max_allocation_size: u64) -> Self {
        Self {
            pages: Vec::new(),
            page_size,
            max_allocation_size,
            alignment: backend.limits().temporary_alignment(),

            backend: backend.clone(),
        }
    }

    /// Reserves `size` bytes and returns the range along with its host-writable staging bytes.
    ///
    /// Grows by one page of `max(page_size, size)` bytes when no page has room, so a request
    /// never straddles two pages.
    pub fn allocate_temporary(
        &mut self,
        size: u64,
    ) -> RenderResult<(TempAllocation<B::Buffer>, &mut [u8])> {
        if size == 0 {
            return Err(RenderError::invalid_usage("Temporary buffers must not be empty"));
        }
        if size > self.max_allocation_size {
            return Err(RenderError::invalid_usage(format!(
                "Temporary buffer of {size} bytes exceeds the maximum of {} bytes",
                self.max_allocation_size,
            )));
        }

        let index = match self.pages.iter().position(|page| page.remaining() >= size) {
            Some(index) => index,
            None => self.append_page(size)?,
        };

        let page = &mut self.pages[index];
        let offset = page.claim(size, self.alignment);
        let allocation = TempAllocation {
            page: index,
            descriptor: BufferDescriptor {
                buffer: page.device.raw(),
                offset,
                size,
            },
        };
        let host = page.staging.mapped_slice_mut(offset, size)?;

        Ok((allocation, host))
    }

    fn append_page(&mut self, size: u64) -> RenderResult<usize> {
        let capacity = self.page_size.max(size);
        // Only pushed once both halves exist
        let page = Page::new(&self.backend, capacity, self.pages.len())?;
        self.pages.push(page);

        info!(
            "Allocated temporary page {} ({capacity} bytes)",
            self.pages.len() - 1,
        );
        Ok(self.pages.len() - 1)
    }

    /// Host bytes of a range handed out since the last `begin_frame`.
    pub fn host_slice_mut(&mut self, page: usize, offset: u64, size: u64) -> RenderResult<&mut [u8]> {
        let page = self
            .pages
            .get_mut(page)
            .filter(|p| offset.checked_add(size).is_some_and(|end| end <= p.offset()))
            .ok_or_else(|| {
                RenderError::invalid_usage(format!(
                    "Range {offset}+{size} of page {page} was not allocated this frame",
                ))
            })?;
        page.staging.mapped_slice_mut(offset, size)
    }

    /// Reclaims every range. The GPU must be done with this allocator's previous frame.
    pub fn begin_frame(&mut self) {
        for page in &mut self.pages {
            page.reset();
        }
    }

    /// Records staging to device copies for every page written since `begin_frame`, followed
    /// by a barrier that publishes them to later reads. Returns the number of copies.
    pub fn record_copy_commands(&self, cmd: B::CommandBuffer) -> usize {
        let mut copies = 0;
        for page in &self.pages {
            if let Some(region) = page.pending_copy() {
                self.backend.cmd_copy_buffer(cmd, page.staging.raw(), page.device.raw(), &[region]);
                copies += 1;
            }
        }

        if copies > 0 {
            self.backend.cmd_transfer_barrier(cmd);
        }
        debug!("Recorded {copies} temporary page copies");
        copies
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn page(&self, index: usize) -> Option<&Page<B>> {
        self.pages.get(index)
    }

    pub fn stats(&self) -> PageStats {
        self.pages.iter().fold(PageStats::default(), |stats, page| PageStats {
            pages: stats.pages + 1,
            capacity: stats.capacity + page.capacity(),
            used: stats.used + page.offset(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_allocator::MemoryLocation;
    use crate::renderer::backend::mock::{MockBackend, MockCommand, MockCommandBuffer};
    use crate::renderer::error::ErrorKind;

    const PAGE: u64 = 256;

    fn allocator(backend: &Arc<MockBackend>) -> PageAllocator<MockBackend> {
        PageAllocator::new(backend, PAGE, 64 * PAGE)
    }

    fn recording_cmd(backend: &MockBackend) -> MockCommandBuffer {
        let pool = backend.create_command_pool().unwrap();
        let cmd = backend.allocate_command_buffers(pool, 1).unwrap()[0];
        backend.begin_commands(cmd).unwrap();
        cmd
    }

    #[test]
    fn offsets_are_aligned() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);
        assert_eq!(allocator.alignment(), 64);

        for size in [1, 17, 64, 100, 3, 255, 8] {
            let (allocation, host) = allocator.allocate_temporary(size).unwrap();
            assert_eq!(host.len() as u64, size);
            assert_eq!(allocation.descriptor.offset % 64, 0);
        }
    }

    #[test]
    fn allocations_stay_inside_one_page() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);

        for size in [200, 100, PAGE, 3 * PAGE, 1, 130, PAGE + 1] {
            let (allocation, _) = allocator.allocate_temporary(size).unwrap();
            let page = allocator.page(allocation.page).unwrap();
            let end = allocation.descriptor.offset + allocation.descriptor.size;
            assert!(end <= page.capacity());
            assert_eq!(allocation.descriptor.buffer, page.device.raw());
        }
    }

    #[test]
    fn grows_by_the_larger_of_page_and_request() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);

        allocator.allocate_temporary(200).unwrap();
        allocator.allocate_temporary(200).unwrap();
        let (large, _) = allocator.allocate_temporary(1000).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.capacity, PAGE + PAGE + 1000);
        assert_eq!(large.page, 2);
        assert_eq!(large.descriptor.offset, 0);
    }

    #[test]
    fn host_ranges_past_the_offset_are_rejected() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);
        let (allocation, _) = allocator.allocate_temporary(32).unwrap();

        assert!(allocator.host_slice_mut(allocation.page, 0, 32).is_ok());
        let err = allocator.host_slice_mut(allocation.page, 0, PAGE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
        // An offset near the end of the address space must not wrap around
        let err = allocator.host_slice_mut(allocation.page, u64::MAX - 8, 32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
        assert!(allocator.host_slice_mut(allocation.page + 1, 0, 1).is_err());
    }

    #[test]
    fn begin_frame_reclaims_without_growing() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);

        let (first, _) = allocator.allocate_temporary(PAGE).unwrap();
        allocator.allocate_temporary(PAGE).unwrap();
        assert_eq!(allocator.stats().pages, 2);

        allocator.begin_frame();
        assert_eq!(allocator.stats().used, 0);

        let (again, _) = allocator.allocate_temporary(PAGE).unwrap();
        assert_eq!(again, first);
        assert_eq!(allocator.stats().pages, 2);
    }

    #[test]
    fn copies_only_written_pages() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);
        allocator.allocate_temporary(PAGE).unwrap();
        allocator.allocate_temporary(PAGE).unwrap();
        allocator.begin_frame();

        let idle = recording_cmd(&backend);
        assert_eq!(allocator.record_copy_commands(idle), 0);
        assert!(backend.recorded_commands(idle).is_empty());

        allocator.allocate_temporary(10).unwrap();
        let cmd = recording_cmd(&backend);
        assert_eq!(allocator.record_copy_commands(cmd), 1);

        let page = allocator.page(0).unwrap();
        let commands = backend.recorded_commands(cmd);
        assert_eq!(commands.len(), 2);
        match &commands[0] {
            MockCommand::Copy { src, dst, regions } => {
                assert_eq!(*src, page.staging.raw());
                assert_eq!(*dst, page.device.raw());
                assert_eq!(regions.len(), 1);
                assert_eq!(regions[0].size, 64);
            }
            other => panic!("expected a copy, got {other:?}"),
        }
        assert_eq!(commands[1], MockCommand::TransferBarrier);
    }

    #[test]
    fn failed_growth_leaves_no_partial_page() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);
        allocator.allocate_temporary(PAGE).unwrap();
        let live = backend.live_buffers();

        backend.fail_next_buffer(MemoryLocation::GpuOnly);
        let err = allocator.allocate_temporary(1).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Vulkan);
        assert!(err.message().starts_with("Failed to allocate device buffer for new page"));
        assert_eq!(allocator.stats().pages, 1);
        assert_eq!(backend.live_buffers(), live);

        // The next request grows normally
        allocator.allocate_temporary(1).unwrap();
        assert_eq!(allocator.stats().pages, 2);
    }

    #[test]
    fn rejects_empty_and_oversized_requests() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);

        let empty = allocator.allocate_temporary(0).unwrap_err();
        let oversized = allocator.allocate_temporary(64 * PAGE + 1).unwrap_err();

        assert_eq!(empty.kind(), ErrorKind::InvalidUsage);
        assert_eq!(oversized.kind(), ErrorKind::InvalidUsage);
        assert_eq!(allocator.stats().pages, 0);
    }

    #[test]
    fn host_bytes_land_in_staging() {
        let backend = Arc::new(MockBackend::new());
        let mut allocator = allocator(&backend);

        allocator.allocate_temporary(64).unwrap();
        let (allocation, host) = allocator.allocate_temporary(4).unwrap();
        host.copy_from_slice(&[9, 8, 7, 6]);

        let page = allocator.page(allocation.page).unwrap();
        assert_eq!(page.staging.read(64, 4).unwrap(), vec![9, 8, 7, 6]);

        let again = allocator
            .host_slice_mut(allocation.page, allocation.descriptor.offset, 4)
            .unwrap();
        assert_eq!(again, &[9, 8, 7, 6]);
        assert!(allocator.host_slice_mut(0, 128, 4).is_err());
    }
}
