// Command pools and buffers
//
// The render graph pre-records one primary command buffer per frame in
// flight; one-time submits cover setup work like initial layout transitions.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

pub fn create_command_pool(device: &VulkanDevice) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.device.create_command_pool(&pool_info, None) }.context("Failed to create command pool")
}

pub fn allocate_command_buffers(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    unsafe { device.device.allocate_command_buffers(&alloc_info) }.context("Failed to allocate command buffers")
}

/// Record `f` into a throwaway command buffer, submit it and wait for completion.
pub fn one_time_submit<F>(device: &VulkanDevice, pool: vk::CommandPool, f: F) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let cmd = allocate_command_buffers(device, pool, 1)?[0];

    let result = (|| -> Result<()> {
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.device.begin_command_buffer(cmd, &begin_info)?;
            f(&device.device, cmd);
            device.device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .device
                .queue_submit(device.queue, &[submit_info.build()], vk::Fence::null())
                .context("One-time submit failed")?;
            device.device.queue_wait_idle(device.queue)?;
        }
        Ok(())
    })();

    unsafe { device.device.free_command_buffers(pool, &[cmd]) };
    result
}
