use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use crate::renderer::backend::{AcquiredImage, PresentOutcome};
use crate::renderer::config::PresentMode;
use crate::renderer::contexts::device_ctx::queue::Queue;
use crate::renderer::contexts::device_ctx::swapchain::Swapchain;
use crate::renderer::error::{RenderError, RenderResult, ResultExt};

/// Window surface, destroyed when dropped
pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

/// Presentation target of the renderer, encapsulating the surface and swapchain
pub struct RenderTarget {
    // Declared before `surface` so the swapchain is destroyed first
    swapchain: Swapchain,
    // Signaled by the frame submission that last wrote each swapchain image
    render_finished: Vec<vk::Semaphore>,
    surface: Surface,

    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    swapchain_loader: ash::khr::swapchain::Device,
    requested_extent: vk::Extent2D,
    needs_rebuild: bool,

    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
}

impl RenderTarget {
    pub fn new(
        surface: Surface,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        extent: (u32, u32),
        present_mode: PresentMode,
    ) -> Result<Self> {
        let surface_formats = unsafe {
            surface.loader
                .get_physical_device_surface_formats(physical_device, surface.handle)?
        };
        let surface_present_modes = unsafe {
            surface.loader
                .get_physical_device_surface_present_modes(physical_device, surface.handle)?
        };

        let surface_format = surface_formats
            .iter()
            .find(|format| {
                format.format == vk::Format::B8G8R8A8_SRGB
                    && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| surface_formats.first())
            .copied()
            .ok_or_else(|| color_eyre::eyre::eyre!("Surface reports no formats"))?;
        let present_mode = present_mode.select(&surface_present_modes);
        log::debug!("Surface format {:?}, present mode {:?}", surface_format, present_mode);

        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);
        let requested_extent = vk::Extent2D {
            width: extent.0,
            height: extent.1,
        };

        let swapchain = Swapchain::new(
            surface.handle,
            &surface.loader,
            surface_format,
            present_mode,
            requested_extent,
            vk::SwapchainKHR::null(),
            physical_device,
            &swapchain_loader,
            device.clone(),
        )?;
        let render_finished = create_semaphores(&device, swapchain.image_count())?;

        Ok(Self {
            swapchain,
            render_finished,
            surface,
            surface_format,
            present_mode,
            swapchain_loader,
            requested_extent,
            needs_rebuild: false,
            physical_device,
            device,
        })
    }

    /// The swapchain is rebuilt at the next acquire.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.requested_extent = vk::Extent2D { width, height };
        self.needs_rebuild = true;
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.swapchain_image_extent
    }

    pub fn image(&self, image_index: u32) -> Option<vk::Image> {
        self.swapchain.swapchain_images.get(image_index as usize).copied()
    }

    pub fn render_finished(&self, image_index: u32) -> Option<vk::Semaphore> {
        self.render_finished.get(image_index as usize).copied()
    }

    pub fn rebuild(&mut self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }

        let swapchain = Swapchain::new(
            self.surface.handle,
            &self.surface.loader,
            self.surface_format,
            self.present_mode,
            self.requested_extent,
            self.swapchain.swapchain,
            self.physical_device,
            &self.swapchain_loader,
            self.device.clone(),
        )?;
        let render_finished = create_semaphores(&self.device, swapchain.image_count())?;

        // Replacing the old swapchain drops it after the new one was created from it
        self.swapchain = swapchain;
        for semaphore in std::mem::replace(&mut self.render_finished, render_finished) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
        self.needs_rebuild = false;

        log::info!(
            "Rebuilt swapchain at {}x{} with {} images",
            self.swapchain.swapchain_image_extent.width,
            self.swapchain.swapchain_image_extent.height,
            self.swapchain.image_count(),
        );
        Ok(())
    }

    pub fn acquire(&mut self, image_ready: vk::Semaphore) -> RenderResult<AcquiredImage> {
        if self.needs_rebuild {
            self.rebuild().critical("Failed to rebuild swapchain")?;
        }

        let mut rebuilt = false;
        loop {
            let result = unsafe {
                self.swapchain_loader.acquire_next_image(
                    self.swapchain.swapchain,
                    u64::MAX,
                    image_ready,
                    vk::Fence::null(),
                )
            };
            match result {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        self.needs_rebuild = true;
                    }
                    return Ok(AcquiredImage { index, suboptimal });
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) if !rebuilt => {
                    self.rebuild().critical("Failed to rebuild swapchain")?;
                    rebuilt = true;
                }
                Err(e) => {
                    return Err(RenderError::critical(format!(
                        "Failed to acquire swapchain image, {}",
                        e
                    )));
                }
            }
        }
    }

    pub fn present(&mut self, queue: &Queue, image_index: u32) -> RenderResult<PresentOutcome> {
        let wait_semaphores = [self
            .render_finished(image_index)
            .ok_or_else(|| RenderError::invalid_usage(format!("No swapchain image {}", image_index)))?];
        let swapchains = [self.swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match queue.present(&self.swapchain_loader, &present_info) {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) => {
                self.needs_rebuild = true;
                Ok(PresentOutcome::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_rebuild = true;
                Ok(PresentOutcome::OutOfDate)
            }
            Err(e) => Err(RenderError::critical(format!("Failed to present, {}", e))),
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        for semaphore in self.render_finished.drain(..) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }
}

fn create_semaphores(device: &ash::Device, count: usize) -> Result<Vec<vk::Semaphore>> {
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
            Ok(semaphore) => semaphores.push(semaphore),
            Err(e) => {
                for semaphore in semaphores {
                    unsafe { device.destroy_semaphore(semaphore, None) };
                }
                return Err(e.into());
            }
        }
    }
    Ok(semaphores)
}
