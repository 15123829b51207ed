use std::ffi::{c_char, CStr};
use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use crate::renderer::backend::DeviceLimits;
use crate::renderer::contexts::device_ctx::queue::{Queue, QueueFamily};

/// Logical device, the physical device it runs on, and its single queue
pub struct RenderDevice {
    pub logical: Arc<ash::Device>,
    pub physical: vk::PhysicalDevice,

    // One queue handles graphics, compute, transfer and presentation
    pub queue: Arc<Queue>,

    pub limits: DeviceLimits,
}

impl RenderDevice {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: QueueFamily,
    ) -> Result<Self> {
        let (logical_device, queue) = Self::create_logical_device(
            instance,
            physical_device,
            queue_family,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: properties.limits.min_storage_buffer_offset_alignment,
            min_texel_buffer_offset_alignment: properties.limits.min_texel_buffer_offset_alignment,
        };

        if let Ok(name) = properties.device_name_as_c_str() {
            log::info!("Using device {:?}", name);
        }

        Ok(Self {
            logical: Arc::new(logical_device),
            physical: physical_device,
            queue: Arc::new(queue),
            limits,
        })
    }

    /// Picks the best device that can do everything on one queue family, discrete GPUs first.
    /// Returns `None` when no device qualifies.
    pub fn select_physical_device(
        instance: &ash::Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<Option<(vk::PhysicalDevice, QueueFamily)>> {
        let req_device_exts = Self::get_required_device_extensions();
        let devices = unsafe { instance.enumerate_physical_devices()? };

        Ok(devices
            .into_iter()
            // Filter out devices older than Vulkan 1.3
            .filter(|device| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                props.api_version >= vk::API_VERSION_1_3
            })
            // Filter out devices that do not contain the required device extensions
            .filter(|device| {
                let supported_extensions = unsafe {
                    instance.enumerate_device_extension_properties(*device)
                }.unwrap_or_default();

                req_device_exts.iter().all(|req_ext| {
                    supported_extensions
                        .iter()
                        .filter_map(|sup_ext| sup_ext.extension_name_as_c_str().ok())
                        .any(|sup_ext| sup_ext == *req_ext)
                })
            })
            .filter(|device| RequiredDeviceFeatures::query(instance, *device).has_all())
            // Filter out devices without a queue family that does everything
            .filter_map(|device| {
                let props = unsafe {
                    instance.get_physical_device_queue_family_properties(device)
                };

                props
                    .iter()
                    .enumerate()
                    .map(|(index, properties)| {
                        let supports_present = unsafe {
                            surface_loader.get_physical_device_surface_support(
                                device,
                                index as u32,
                                surface,
                            )
                        }.unwrap_or(false);
                        QueueFamily::new(index as u32, *properties, supports_present)
                    })
                    .find(QueueFamily::supports_everything)
                    .map(|family| (device, family))
            })
            .min_by_key(|(device, _)| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                    vk::PhysicalDeviceType::CPU => 3,
                    vk::PhysicalDeviceType::OTHER => 4,
                    _ => 5,
                }
            }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: QueueFamily,
    ) -> Result<(ash::Device, Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos = [
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family.index)
                .queue_priorities(&queue_priorities),
        ];

        let enabled_extension_names = Self::get_required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        if !RequiredDeviceFeatures::query(instance, physical_device).has_all() {
            return Err(eyre!("Required features not supported"));
        }

        // Create device
        let device = {
            let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
                .timeline_semaphore(true);
            let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
                .synchronization2(true);

            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&enabled_extension_names)
                .push_next(&mut vulkan_12_features)
                .push_next(&mut vulkan_13_features);

            unsafe {
                instance.create_device(physical_device, &device_create_info, None)?
            }
        };

        let queue = unsafe {
            let queue = device.get_device_queue(queue_family.index, 0);
            Queue::new(queue_family, queue)
        };

        Ok((device, queue))
    }

    fn get_required_device_extensions() -> Vec<&'static CStr> {
        vec![
            ash::khr::swapchain::NAME,

            #[cfg(target_os = "macos")]
            ash::khr::portability_subset::NAME,
        ]
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        unsafe {
            self.logical.destroy_device(None);
        }
    }
}

struct RequiredDeviceFeatures {
    timeline_semaphore: bool,
    synchronization2: bool,
}

impl RequiredDeviceFeatures {
    fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut vulkan_12_features)
                .push_next(&mut vulkan_13_features);

            // Query physical device features
            unsafe {
                instance.get_physical_device_features2(physical_device, &mut features);
            }
        }

        Self {
            timeline_semaphore: vulkan_12_features.timeline_semaphore == vk::TRUE,
            synchronization2: vulkan_13_features.synchronization2 == vk::TRUE,
        }
    }

    fn has_all(&self) -> bool {
        self.timeline_semaphore && self.synchronization2
    }
}
