// Synchronization primitives
//
// Semaphores order device work against device work; the host never waits on
// them. Fences are only used by the one-shot submit path, through a guard
// that destroys the fence on every exit path.

use crate::error::{Result, VkContext};
use ash::vk;

pub fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    unsafe { device.create_semaphore(&semaphore_info, None) }.vk_context("vkCreateSemaphore")
}

/// A fence that lives for one submission.
pub struct ScopedFence<'a> {
    device: &'a ash::Device,
    fence: vk::Fence,
}

impl<'a> ScopedFence<'a> {
    /// Create an unsignaled fence.
    pub fn new(device: &'a ash::Device) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::default();
        let fence =
            unsafe { device.create_fence(&fence_info, None) }.vk_context("vkCreateFence")?;
        Ok(Self { device, fence })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled. No timeout.
    pub fn wait(&self) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.fence], true, u64::MAX) }
            .vk_context("vkWaitForFences")
    }
}

impl Drop for ScopedFence<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}
