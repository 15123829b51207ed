use std::sync::{Mutex, PoisonError};
use ash::prelude::VkResult;
use ash::vk;

/// The single queue every context submits to. Submissions are serialized through `lock`
/// because Vulkan requires external synchronization on queue access.
pub struct Queue {
    pub family: QueueFamily,
    pub handle: vk::Queue,
    lock: Mutex<()>,
}

impl Queue {
    pub fn new(
        family: QueueFamily,
        handle: vk::Queue,
    ) -> Self {
        Self {
            family,
            handle,
            lock: Mutex::new(()),
        }
    }

    pub fn submit2(
        &self,
        device: &ash::Device,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { device.queue_submit2(self.handle, submits, fence) }
    }

    /// Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> VkResult<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { swapchain_loader.queue_present(self.handle, present_info) }
    }
}

#[derive(Clone, Debug)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        properties: vk::QueueFamilyProperties,
        supports_present: bool
    ) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    /// Graphics, compute and transfer work, plus presentation, all from one queue.
    pub fn supports_everything(&self) -> bool {
        // Graphics and compute queues implicitly support transfer
        self.supports_graphics() && self.supports_compute() && self.supports_present()
    }
}

impl PartialEq for QueueFamily {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QueueFamily {}
