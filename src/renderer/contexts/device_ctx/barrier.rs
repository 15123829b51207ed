use ash::vk;

pub fn transition_image_layout(
    cmd: vk::CommandBuffer,
    image: vk::Image,
    image_aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    device: &ash::Device,
) {
    if old_layout == new_layout {
        return;
    }

    let image_barrier = vk::ImageMemoryBarrier2 {
        src_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
        dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        dst_access_mask: vk::AccessFlags2::MEMORY_WRITE
            | vk::AccessFlags2::MEMORY_READ,
        old_layout,
        new_layout,
        subresource_range: color_subresource_range(image_aspect),
        image,
        ..Default::default()
    };

    let dep_info = vk::DependencyInfo {
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &image_barrier,
        ..Default::default()
    };

    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dep_info);
    }
}

/// Makes every preceding transfer write available to any later read or write on the queue,
/// including commands in later command buffers of the same submission.
pub fn transfer_write_barrier(
    cmd: vk::CommandBuffer,
    device: &ash::Device,
) {
    let memory_barrier = vk::MemoryBarrier2 {
        src_stage_mask: vk::PipelineStageFlags2::ALL_TRANSFER,
        src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        dst_access_mask: vk::AccessFlags2::MEMORY_READ
            | vk::AccessFlags2::MEMORY_WRITE,
        ..Default::default()
    };

    let dep_info = vk::DependencyInfo {
        memory_barrier_count: 1,
        p_memory_barriers: &memory_barrier,
        ..Default::default()
    };

    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dep_info);
    }
}

pub fn color_subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
