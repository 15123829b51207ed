use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::Result;
use crate::renderer::contexts::device_ctx::queue::Queue;
use crate::renderer::error::{RenderResult, ResultExt};

pub struct TransferContext {
    transfer_fence: vk::Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,

    queue: Arc<Queue>,
    device: Arc<ash::Device>,
}

impl TransferContext {
    pub fn new(
        queue: Arc<Queue>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let transfer_fence_info = vk::FenceCreateInfo::default();
        let transfer_fence =
            unsafe { device.create_fence(&transfer_fence_info, None)? };

        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family.index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = match unsafe { device.create_command_pool(&command_pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_fence(transfer_fence, None) };
                return Err(e.into());
            }
        };

        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let command_buffer = match unsafe { device.allocate_command_buffers(&command_buffer_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_fence(transfer_fence, None);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            transfer_fence,
            command_pool,
            command_buffer,
            queue,
            device,
        })
    }

    // Execute some commands on the GPU right away, outside of the frame loop, and block until
    // they finish. Everything submitted to the queue earlier finishes first.
    pub fn immediate_submit<F>(
        &self,
        func: F,
    ) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer) -> RenderResult<()>,
    {
        let cmd = self.command_buffer;

        // A failed recording may have left the command buffer open, so always start clean
        unsafe {
            self.device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .recoverable("Failed to reset single use command pool")?;
        }

        // This command buffer will be used exactly once before resetting
        let cmd_begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(cmd, &cmd_begin_info)
                .recoverable("Failed to begin single use command buffer")?;
        }

        func(cmd)?;

        unsafe {
            self.device
                .end_command_buffer(cmd)
                .recoverable("Failed to end single use command buffer")?;
        }

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        self.queue
            .submit2(&self.device, &[submit], self.transfer_fence)
            .critical("Failed to submit single use command buffer")?;

        unsafe {
            // `transfer_fence` will now block until the commands finish execution
            self.device
                .wait_for_fences(&[self.transfer_fence], true, u64::MAX)
                .critical("Failed to wait for single use command buffer")?;
            self.device
                .reset_fences(&[self.transfer_fence])
                .critical("Failed to reset single use fence")?;
        }

        Ok(())
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_fence(self.transfer_fence, None);
        }
    }
}
