pub mod barrier;
pub mod device;
pub mod instance;
pub mod queue;
pub mod swapchain;
pub mod target;
pub mod transfer_ctx;

use std::sync::{Mutex, MutexGuard, PoisonError};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use smallvec::SmallVec;
use crate::renderer::backend::{
    AcquiredImage,
    Backend,
    BufferDesc,
    CopyRegion,
    DeviceLimits,
    FrameSubmission,
    PresentOutcome,
    RawBuffer,
};
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::device_ctx::instance::RenderInstance;
use crate::renderer::contexts::device_ctx::target::{RenderTarget, Surface};
use crate::renderer::contexts::device_ctx::transfer_ctx::TransferContext;
use crate::renderer::error::{ErrorKind, RenderError, RenderResult, ResultExt};

/// Responsibilities:
/// - Own the Vulkan instance, device, queue, surface and swapchain
/// - Allocate buffer memory
/// - Record and submit command buffers
/// - Keep the frame timeline that tells the CPU which frames the GPU has finished
pub struct RenderDeviceContext {
    // Fields are dropped in declaration order, every one of these depends on `device`
    target: Mutex<RenderTarget>,
    transfer: Mutex<TransferContext>,
    frame_timeline: vk::Semaphore,
    memory_allocator: Mutex<Allocator>,

    device: RenderDevice,
    instance: RenderInstance,
}

impl RenderDeviceContext {
    pub fn new<W>(
        window: &W,
        extent: (u32, u32),
        config: &RenderConfig,
    ) -> RenderResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display_handle = window
            .display_handle()
            .window("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .window("Failed to get window handle")?
            .as_raw();

        let instance = RenderInstance::new(display_handle, config)
            .critical("Failed to create Vulkan instance")?;

        let surface = {
            let (handle, loader) = instance
                .create_surface(display_handle, window_handle)
                .window("Failed to create window surface")?;
            Surface { handle, loader }
        };

        let (physical_device, queue_family) = RenderDevice::select_physical_device(
            &instance.instance,
            surface.handle,
            &surface.loader,
        )
            .no_device("Failed to enumerate physical devices")?
            .ok_or_else(|| RenderError::new(ErrorKind::NoDevice, "No suitable physical device found"))?;

        let device = RenderDevice::new(&instance.instance, physical_device, queue_family)
            .critical("Failed to create logical device")?;

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: (*device.logical).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: config.debug,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
            .critical("Failed to create memory allocator")?;

        let target = RenderTarget::new(
            surface,
            &instance.instance,
            physical_device,
            device.logical.clone(),
            extent,
            config.present_mode,
        )
            .critical("Failed to create render target")?;

        let transfer = TransferContext::new(device.queue.clone(), device.logical.clone())
            .critical("Failed to create transfer context")?;

        let frame_timeline = {
            let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let semaphore_info = vk::SemaphoreCreateInfo::default()
                .push_next(&mut type_info);
            unsafe {
                device.logical.create_semaphore(&semaphore_info, None)
                    .critical("Failed to create frame timeline")?
            }
        };

        Ok(Self {
            target: Mutex::new(target),
            transfer: Mutex::new(transfer),
            frame_timeline,
            memory_allocator: Mutex::new(memory_allocator),
            device,
            instance,
        })
    }

    /// Records the new window size, the swapchain follows at the next acquire.
    pub fn request_resize(&self, width: u32, height: u32) {
        self.target().request_resize(width, height);
    }

    pub fn extent(&self) -> (u32, u32) {
        let extent = self.target().extent();
        (extent.width, extent.height)
    }

    pub fn instance(&self) -> &RenderInstance {
        &self.instance
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    fn target(&self) -> MutexGuard<'_, RenderTarget> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.memory_allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RenderDeviceContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.logical.device_wait_idle() {
                log::error!("Failed to wait for device idle on shutdown, {}", e);
            }
            self.device.logical.destroy_semaphore(self.frame_timeline, None);
        }
    }
}

impl Backend for RenderDeviceContext {
    type Buffer = vk::Buffer;
    type Memory = Allocation;
    type CommandPool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;
    type Semaphore = vk::Semaphore;

    fn limits(&self) -> DeviceLimits {
        self.device.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> RenderResult<RawBuffer<Self>> {
        if desc.size == 0 {
            return Err(RenderError::invalid_usage(format!(
                "Cannot create empty buffer {}",
                desc.name
            )));
        }

        let device = &self.device.logical;
        let buffer = {
            let buffer_info = vk::BufferCreateInfo {
                size: desc.size,
                usage: desc.usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            unsafe {
                device.create_buffer(&buffer_info, None)
                    .recoverable("Failed to create buffer")?
            }
        };

        let requirements = unsafe {
            device.get_buffer_memory_requirements(buffer)
        };
        let allocation = self.allocator().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(RenderError::vulkan(format!(
                    "Failed to allocate memory for {}, {}",
                    desc.name,
                    e
                )));
            }
        };

        let bound = unsafe {
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            if let Err(e) = self.allocator().free(allocation) {
                log::error!("Failed to free memory of {}, {}", desc.name, e);
            }
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(RenderError::vulkan(format!(
                "Failed to bind memory for {}, {}",
                desc.name,
                e
            )));
        }

        let mapped = match desc.location {
            MemoryLocation::GpuOnly => None,
            _ => allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>()),
        };

        Ok(RawBuffer {
            raw: buffer,
            memory: allocation,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Allocation) {
        if let Err(e) = self.allocator().free(memory) {
            log::error!("Failed to free buffer memory, {}", e);
        }
        unsafe {
            self.device.logical.destroy_buffer(buffer, None);
        }
    }

    fn create_command_pool(&self) -> RenderResult<vk::CommandPool> {
        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.device.queue.family.index);
        unsafe {
            self.device.logical.create_command_pool(&command_pool_info, None)
                .recoverable("Failed to create command pool")
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.logical.destroy_command_pool(pool, None);
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RenderResult<()> {
        unsafe {
            self.device.logical
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
                .recoverable("Failed to reset command pool")
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .command_buffer_count(count)
            .level(vk::CommandBufferLevel::PRIMARY);
        unsafe {
            self.device.logical.allocate_command_buffers(&command_buffer_info)
                .recoverable("Failed to allocate command buffers")
        }
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let cmd_begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.logical.begin_command_buffer(cmd, &cmd_begin_info)
                .recoverable("Failed to begin command buffer")
        }
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe {
            self.device.logical.end_command_buffer(cmd)
                .recoverable("Failed to end command buffer")
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[CopyRegion],
    ) {
        let regions = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect::<SmallVec<[vk::BufferCopy; 4]>>();
        unsafe {
            self.device.logical.cmd_copy_buffer(cmd, src, dst, &regions);
        }
    }

    fn cmd_transfer_barrier(&self, cmd: vk::CommandBuffer) {
        barrier::transfer_write_barrier(cmd, &self.device.logical);
    }

    fn cmd_begin_image(&self, cmd: vk::CommandBuffer, image_index: u32) {
        match self.target().image(image_index) {
            Some(image) => barrier::transition_image_layout(
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                &self.device.logical,
            ),
            None => log::warn!("No swapchain image {} to begin", image_index),
        }
    }

    fn cmd_end_image(&self, cmd: vk::CommandBuffer, image_index: u32) {
        match self.target().image(image_index) {
            Some(image) => barrier::transition_image_layout(
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                &self.device.logical,
            ),
            None => log::warn!("No swapchain image {} to end", image_index),
        }
    }

    fn cmd_clear_image(&self, cmd: vk::CommandBuffer, image_index: u32, color: [f32; 4]) {
        let Some(image) = self.target().image(image_index) else {
            log::warn!("No swapchain image {} to clear", image_index);
            return;
        };
        let clear_value = vk::ClearColorValue { float32: color };
        let range = barrier::color_subresource_range(vk::ImageAspectFlags::COLOR);
        unsafe {
            self.device.logical.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::GENERAL,
                &clear_value,
                &[range],
            );
        }
    }

    fn submit_immediate<F>(&self, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer) -> RenderResult<()>,
    {
        self.transfer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .immediate_submit(record)
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        unsafe {
            self.device.logical
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .recoverable("Failed to create semaphore")
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.logical.destroy_semaphore(semaphore, None);
        }
    }

    fn wait_for_frame_completion(&self, value: u64, timeout_ns: u64) -> RenderResult<()> {
        let semaphores = [self.frame_timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.logical.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::critical(format!(
                "Timed out after {}ns waiting for frame timeline to reach {}",
                timeout_ns,
                value
            ))),
            Err(e) => Err(RenderError::critical(format!(
                "Failed to wait for frame timeline to reach {}, {}",
                value,
                e
            ))),
        }
    }

    fn completed_frames(&self) -> RenderResult<u64> {
        unsafe {
            self.device.logical.get_semaphore_counter_value(self.frame_timeline)
                .critical("Failed to read frame timeline")
        }
    }

    fn acquire_image(&self, image_ready: vk::Semaphore) -> RenderResult<AcquiredImage> {
        self.target().acquire(image_ready)
    }

    fn submit_frame(&self, submission: &FrameSubmission<Self>) -> RenderResult<()> {
        let render_finished = self
            .target()
            .render_finished(submission.image_index)
            .ok_or_else(|| RenderError::invalid_usage(format!(
                "No swapchain image {}",
                submission.image_index
            )))?;

        let cmd_infos = submission
            .command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect::<SmallVec<[vk::CommandBufferSubmitInfo; 3]>>();
        let wait_infos = [
            vk::SemaphoreSubmitInfo::default()
                .semaphore(submission.image_ready)
                .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
        ];
        let signal_infos = [
            vk::SemaphoreSubmitInfo::default()
                .semaphore(self.frame_timeline)
                .value(submission.signal_value)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            vk::SemaphoreSubmitInfo::default()
                .semaphore(render_finished)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        ];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cmd_infos)
            .signal_semaphore_infos(&signal_infos);

        self.device
            .queue
            .submit2(&self.device.logical, &[submit], vk::Fence::null())
            .critical("Failed to submit frame command buffers")
    }

    fn present(&self, image_index: u32) -> RenderResult<PresentOutcome> {
        self.target().present(&self.device.queue, image_index)
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe {
            self.device.logical.device_wait_idle()
                .critical("Failed to wait for device idle")
        }
    }
}
