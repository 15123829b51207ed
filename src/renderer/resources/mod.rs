//! "Resources" are the scoped GPU objects the contexts are built from.
//! Each one releases what it owns when dropped, so a half-built pair unwinds on its own.

pub mod buffer;
pub mod handle;
pub mod page;
pub mod sync;

pub use buffer::GpuBuffer;
pub use handle::{BufferDescriptor, PermanentBuffer, TempBuffer};
