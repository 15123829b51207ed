/// A contiguous device-addressable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor<H> {
    /// Device-local buffer that holds the range
    pub buffer: H,
    pub offset: u64,
    pub size: u64,
}

/// A temporary range handed out for the current frame.
///
/// The range is reclaimed when its frame slot comes around again, so the handle is checked
/// against the frame it was issued in before any host access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempBuffer<H> {
    pub descriptor: BufferDescriptor<H>,
    pub(crate) page: usize,
    pub(crate) frame: u64,
}

impl<H> TempBuffer<H> {
    /// Frame counter value this buffer belongs to.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

/// Handle to a long-lived buffer in the permanent table.
///
/// The generation changes whenever the slot is freed, so a handle that outlived its buffer is
/// rejected instead of aliasing whatever reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermanentBuffer {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PermanentBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }
}
