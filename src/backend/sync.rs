// Synchronization primitives
//
// One fence (CPU waits for the GPU) and one semaphore (the queue waits for
// the presentation engine) per frame slot.

use ash::vk;

use super::error::{RendererResult, VkResultExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSync {
    /// Signaled by acquire, waited on by the submit
    pub image_available: vk::Semaphore,
    /// Signaled when the submitted command buffer completes
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> RendererResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Unsignaled: the fence is reset before every submit anyway
        let fence_info = vk::FenceCreateInfo::builder();

        let image_available =
            unsafe { device.create_semaphore(&semaphore_info, None) }.phase("semaphore creation")?;

        match unsafe { device.create_fence(&fence_info, None) }.phase("fence creation") {
            Ok(in_flight) => Ok(Self {
                image_available,
                in_flight,
            }),
            Err(err) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                Err(err)
            }
        }
    }

    /// `count` slots; on failure the slots already made are destroyed.
    pub fn create_slots(device: &ash::Device, count: usize) -> RendererResult<Vec<Self>> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::new(device) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    for slot in &slots {
                        slot.destroy(device);
                    }
                    return Err(err);
                }
            }
        }
        Ok(slots)
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}
