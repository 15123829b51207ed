use crate::renderer::backend::Backend;
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::resources::buffer::GpuBuffer;
use crate::renderer::resources::handle::PermanentBuffer;

struct Slot<B: Backend> {
    buffer: Option<GpuBuffer<B>>,
    generation: u32,
}

/// Long-lived device buffers addressed by index.
///
/// Slots are never removed. Freeing empties a slot and bumps its generation, and the next
/// insert takes the first empty slot before appending a new one.
pub struct PermanentBufferTable<B: Backend> {
    slots: Vec<Slot<B>>,
}

impl<B: Backend> Default for PermanentBufferTable<B> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<B: Backend> PermanentBufferTable<B> {
    pub fn insert(&mut self, buffer: GpuBuffer<B>) -> PermanentBuffer {
        let index = match self.slots.iter().position(|slot| slot.buffer.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    buffer: None,
                    generation: 0,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.buffer = Some(buffer);
        PermanentBuffer {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// Takes the buffer out of its slot. Dropping the result releases the device memory.
    pub fn remove(&mut self, handle: PermanentBuffer) -> RenderResult<GpuBuffer<B>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| stale(handle))?;
        let buffer = slot.buffer.take().ok_or_else(|| stale(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(buffer)
    }

    pub fn get(&self, handle: PermanentBuffer) -> RenderResult<&GpuBuffer<B>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.buffer.as_ref())
            .ok_or_else(|| stale(handle))
    }

    /// Number of slots, occupied or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.buffer.is_some()).count()
    }
}

fn stale(handle: PermanentBuffer) -> RenderError {
    RenderError::invalid_usage(format!(
        "Permanent buffer {} (generation {}) does not exist",
        handle.index, handle.generation,
    ))
}
