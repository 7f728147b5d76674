// Synchronization primitives
//
// One FrameSync per acquire slot: the acquire semaphore, the semaphore the
// graph's submission signals for present, and the fence guarding reuse.

use anyhow::Result;
use ash::vk;

use super::VulkanDevice;

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Block until the GPU is done with the last submission that used this
    /// slot, then rearm the fence.
    pub fn wait(&self, device: &VulkanDevice) -> Result<()> {
        unsafe {
            device.device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX)?;
            device.device.reset_fences(&[self.in_flight_fence])?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_semaphore(self.image_available, None);
            device.device.destroy_semaphore(self.render_finished, None);
            device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
