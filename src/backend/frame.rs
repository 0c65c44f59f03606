// Frame rendering
//
// Command buffers are recorded once per swapchain image and never touched
// again. Each frame then runs the same protocol:
//
//   acquire (signals slot semaphore) -> reset fence -> submit (waits on the
//   semaphore, signals the fence) -> wait fence -> present
//
// The queue/swapchain calls go through `FrameBackend` so the protocol can be
// driven without a GPU.

use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use std::time::Duration;

use super::buffer::VertexBuffer;
use super::error::{RendererError, RendererResult, VkResultExt};
use super::pipeline::{FramebufferSet, RenderPipeline};
use super::sync::FrameSync;
use crate::config::GraphicsConfig;

/// Where the frame loop is in its per-frame protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Uninitialized,
    Recorded,
    Ready,
    Acquiring,
    Submitted,
    Presenting,
    /// Swapchain out of date; the owner must rebuild everything sized by it.
    Stale,
}

/// Result of one `draw_frame` call that did not hit a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// Swapchain is stale; nothing was submitted.
    NeedsRebuild,
    /// A submit, wait or present failure was reported and the frame skipped.
    Dropped,
}

impl FrameStatus {
    /// True when the sequence ran to completion, including the rebuild short-circuit.
    pub fn completed(self) -> bool {
        !matches!(self, FrameStatus::Dropped)
    }
}

/// Queue and swapchain operations one frame needs.
pub trait FrameBackend {
    fn acquire_next_image(&mut self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)>;

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()>;

    fn present(&mut self, image_index: u32) -> VkResult<bool>;
}

/// The real backend: one device queue and one swapchain.
pub struct QueuePresenter<'a> {
    pub device: &'a ash::Device,
    pub swapchain_loader: &'a khr::Swapchain,
    pub swapchain: vk::SwapchainKHR,
    pub queue: vk::Queue,
}

impl FrameBackend for QueuePresenter<'_> {
    fn acquire_next_image(&mut self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let wait_semaphores = [wait_semaphore];
        let wait_stages = [wait_stage];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers);

        unsafe { self.device.queue_submit(self.queue, &[submit_info.build()], fence) }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn present(&mut self, image_index: u32) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        // No wait semaphore: the fence wait already ordered us after rendering.
        let present_info = vk::PresentInfoKHR::builder()
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(self.queue, &present_info) }
    }
}

/// Pre-recorded command buffers plus the frame-sync arena.
///
/// Command buffers are indexed by swapchain image, sync slots by
/// `frame_counter % slots`.
#[derive(Debug)]
pub struct FrameLoop {
    command_buffers: Vec<vk::CommandBuffer>,
    sync: Vec<FrameSync>,
    frame_counter: u64,
    state: FrameState,
    fence_timeout: Duration,
}

impl Default for FrameLoop {
    fn default() -> Self {
        Self {
            command_buffers: Vec::new(),
            sync: Vec::new(),
            frame_counter: 0,
            state: FrameState::Uninitialized,
            fence_timeout: Duration::from_secs(10),
        }
    }
}

impl FrameLoop {
    pub fn recorded(command_buffers: Vec<vk::CommandBuffer>, fence_timeout: Duration) -> Self {
        Self {
            command_buffers,
            state: FrameState::Recorded,
            fence_timeout,
            ..Default::default()
        }
    }

    /// Hand over the sync slots; the loop is ready to draw afterwards.
    pub fn arm(&mut self, sync: Vec<FrameSync>) {
        assert_eq!(self.state, FrameState::Recorded, "arming a frame loop that was not recorded");
        assert!(!sync.is_empty(), "frame loop needs at least one sync slot");
        self.sync = sync;
        self.state = FrameState::Ready;
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Sync slot the next frame will use.
    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.sync.len().max(1) as u64) as usize
    }

    pub fn mark_stale(&mut self) {
        self.state = FrameState::Stale;
    }

    fn timeout_nanos(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Run one acquire -> submit -> wait -> present cycle.
    ///
    /// `Err` means acquire failed with something other than out-of-date or
    /// suboptimal and the caller should give up. Everything after acquire is
    /// reported and turned into `FrameStatus::Dropped`.
    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> RendererResult<FrameStatus> {
        if self.state == FrameState::Stale {
            return Ok(FrameStatus::NeedsRebuild);
        }
        assert_eq!(self.state, FrameState::Ready, "draw_frame called before the frame loop was armed");

        let sync = self.sync[self.current_slot()];

        // Phase 1: acquire; effectively unbounded wait
        self.state = FrameState::Acquiring;
        let image_index = match backend.acquire_next_image(u64::MAX, sync.image_available) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal for image {}", index);
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::info!("Swapchain out of date, rebuild required");
                self.state = FrameState::Stale;
                return Ok(FrameStatus::NeedsRebuild);
            }
            Err(result) => {
                return Err(RendererError::Vulkan {
                    phase: "swapchain image acquire",
                    result,
                })
            }
        };

        // Phase 2: submit the image's command buffer
        if let Err(e) = backend.reset_fence(sync.in_flight) {
            log::warn!("vkResetFences failed with {}", e);
            return Ok(self.drop_frame());
        }

        let command_buffer = self.command_buffers[image_index as usize];
        if let Err(e) = backend.submit(
            command_buffer,
            sync.image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            sync.in_flight,
        ) {
            log::warn!("vkQueueSubmit failed with {}", e);
            return Ok(self.drop_frame());
        }
        self.state = FrameState::Submitted;

        // Phase 3: block until the GPU is done with it
        if let Err(e) = backend.wait_for_fence(sync.in_flight, self.timeout_nanos()) {
            log::warn!("vkWaitForFences failed with {}", e);
            return Ok(self.drop_frame());
        }

        // Phase 4: present
        self.state = FrameState::Presenting;
        match backend.present(image_index) {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal at present");
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("vkQueuePresent failed with {}", vk::Result::ERROR_OUT_OF_DATE_KHR);
                self.frame_counter += 1;
                self.state = FrameState::Stale;
                return Ok(FrameStatus::Dropped);
            }
            Err(e) => {
                log::warn!("vkQueuePresent failed with {}", e);
                return Ok(self.drop_frame());
            }
        }

        self.frame_counter += 1;
        self.state = FrameState::Ready;
        Ok(FrameStatus::Presented { image_index })
    }

    fn drop_frame(&mut self) -> FrameStatus {
        self.state = FrameState::Ready;
        FrameStatus::Dropped
    }
}

/// Command pool, per-image command buffers and the frame loop.
#[derive(Debug, Default)]
pub struct FrameRenderer {
    pub command_pool: vk::CommandPool,
    pub frames: FrameLoop,
}

impl FrameRenderer {
    /// Record one command buffer per framebuffer, then create the sync slots.
    pub fn init(
        device: &ash::Device,
        queue_family: u32,
        pipeline: &RenderPipeline,
        framebuffers: &FramebufferSet,
        extent: vk::Extent2D,
        vertex_buffer: &VertexBuffer,
        graphics: &GraphicsConfig,
    ) -> RendererResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.phase("command pool creation")?;

        let mut renderer = Self {
            command_pool,
            frames: FrameLoop::default(),
        };

        if let Err(err) = renderer.record_and_arm(device, pipeline, framebuffers, extent, vertex_buffer, graphics) {
            renderer.destroy_sync(device);
            // Destroying the pool frees any buffers allocated from it.
            renderer.destroy_command_pool(device);
            return Err(err);
        }

        Ok(renderer)
    }

    fn record_and_arm(
        &mut self,
        device: &ash::Device,
        pipeline: &RenderPipeline,
        framebuffers: &FramebufferSet,
        extent: vk::Extent2D,
        vertex_buffer: &VertexBuffer,
        graphics: &GraphicsConfig,
    ) -> RendererResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(framebuffers.len() as u32);

        let command_buffers =
            unsafe { device.allocate_command_buffers(&alloc_info) }.phase("command buffer allocation")?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: graphics.clear_color,
            },
        }];

        for (&cmd, &framebuffer) in command_buffers.iter().zip(&framebuffers.framebuffers) {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(pipeline.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);

            unsafe {
                device.begin_command_buffer(cmd, &begin_info).phase("command buffer begin")?;
                device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
                device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.buffer], &[0]);
                device.cmd_draw(cmd, vertex_buffer.vertex_count, 1, 0, 0);
                device.cmd_end_render_pass(cmd);
                device.end_command_buffer(cmd).phase("command buffer end")?;
            }
        }

        log::info!("Recorded {} command buffers", command_buffers.len());
        self.frames = FrameLoop::recorded(command_buffers, graphics.fence_timeout());

        let slots = FrameSync::create_slots(device, graphics.frames_in_flight())?;
        self.frames.arm(slots);
        Ok(())
    }

    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> RendererResult<FrameStatus> {
        self.frames.draw_frame(backend)
    }

    pub(crate) fn free_command_buffers(&mut self, device: &ash::Device) {
        let buffers = std::mem::take(&mut self.frames.command_buffers);
        if !buffers.is_empty() && self.command_pool != vk::CommandPool::null() {
            unsafe { device.free_command_buffers(self.command_pool, &buffers) };
        }
    }

    pub(crate) fn destroy_sync(&mut self, device: &ash::Device) {
        for slot in self.frames.sync.drain(..) {
            slot.destroy(device);
        }
    }

    pub(crate) fn destroy_command_pool(&mut self, device: &ash::Device) {
        if self.command_pool != vk::CommandPool::null() {
            unsafe { device.destroy_command_pool(self.command_pool, None) };
        }
        self.command_pool = vk::CommandPool::null();
        self.frames.command_buffers.clear();
        self.frames.state = FrameState::Uninitialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Acquire { timeout: u64, semaphore: vk::Semaphore },
        ResetFence(vk::Fence),
        Submit {
            command_buffer: vk::CommandBuffer,
            wait_semaphore: vk::Semaphore,
            wait_stage: vk::PipelineStageFlags,
            fence: vk::Fence,
        },
        Wait { fence: vk::Fence, timeout: u64 },
        Present(u32),
    }

    struct ScriptedBackend {
        acquire: VkResult<(u32, bool)>,
        submit: VkResult<()>,
        wait: VkResult<()>,
        present: VkResult<bool>,
        calls: Vec<Call>,
    }

    impl Default for ScriptedBackend {
        fn default() -> Self {
            Self {
                acquire: Ok((0, false)),
                submit: Ok(()),
                wait: Ok(()),
                present: Ok(false),
                calls: Vec::new(),
            }
        }
    }

    impl ScriptedBackend {
        fn submits(&self) -> Vec<vk::CommandBuffer> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Submit { command_buffer, .. } => Some(*command_buffer),
                    _ => None,
                })
                .collect()
        }

        fn presents(&self) -> usize {
            self.calls.iter().filter(|call| matches!(call, Call::Present(_))).count()
        }
    }

    impl FrameBackend for ScriptedBackend {
        fn acquire_next_image(&mut self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
            self.calls.push(Call::Acquire { timeout, semaphore });
            self.acquire
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
            self.calls.push(Call::ResetFence(fence));
            Ok(())
        }

        fn submit(
            &mut self,
            command_buffer: vk::CommandBuffer,
            wait_semaphore: vk::Semaphore,
            wait_stage: vk::PipelineStageFlags,
            fence: vk::Fence,
        ) -> VkResult<()> {
            self.calls.push(Call::Submit {
                command_buffer,
                wait_semaphore,
                wait_stage,
                fence,
            });
            self.submit
        }

        fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
            self.calls.push(Call::Wait { fence, timeout });
            self.wait
        }

        fn present(&mut self, image_index: u32) -> VkResult<bool> {
            self.calls.push(Call::Present(image_index));
            self.present
        }
    }

    fn slot(raw: u64) -> FrameSync {
        FrameSync {
            image_available: vk::Semaphore::from_raw(raw),
            in_flight: vk::Fence::from_raw(raw + 100),
        }
    }

    fn armed_loop(images: u64, slots: u64) -> FrameLoop {
        let command_buffers = (1..=images).map(vk::CommandBuffer::from_raw).collect();
        let mut frames = FrameLoop::recorded(command_buffers, Duration::from_secs(10));
        assert_eq!(frames.state(), FrameState::Recorded);
        frames.arm((1..=slots).map(slot).collect());
        frames
    }

    #[test]
    fn happy_path_submits_acquired_image_once() {
        let mut frames = armed_loop(3, 1);
        assert_eq!(frames.state(), FrameState::Ready);
        let mut backend = ScriptedBackend::default();

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Presented { image_index: 0 });
        assert!(status.completed());
        assert_eq!(frames.state(), FrameState::Ready);
        assert_eq!(frames.frame_counter(), 1);
        assert_eq!(backend.submits(), vec![vk::CommandBuffer::from_raw(1)]);

        let sync = slot(1);
        assert_eq!(
            backend.calls,
            vec![
                Call::Acquire {
                    timeout: u64::MAX,
                    semaphore: sync.image_available
                },
                Call::ResetFence(sync.in_flight),
                Call::Submit {
                    command_buffer: vk::CommandBuffer::from_raw(1),
                    wait_semaphore: sync.image_available,
                    wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    fence: sync.in_flight,
                },
                Call::Wait {
                    fence: sync.in_flight,
                    timeout: 10_000_000_000
                },
                Call::Present(0),
            ]
        );
    }

    #[test]
    fn acquired_index_selects_command_buffer() {
        let mut frames = armed_loop(3, 1);
        let mut backend = ScriptedBackend {
            acquire: Ok((2, true)),
            ..Default::default()
        };

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Presented { image_index: 2 });
        assert_eq!(backend.submits(), vec![vk::CommandBuffer::from_raw(3)]);
    }

    #[test]
    fn out_of_date_acquire_goes_stale_without_work() {
        let mut frames = armed_loop(2, 1);
        let mut backend = ScriptedBackend {
            acquire: Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            ..Default::default()
        };

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::NeedsRebuild);
        assert!(status.completed());
        assert_eq!(frames.state(), FrameState::Stale);
        assert!(backend.submits().is_empty());
        assert_eq!(backend.presents(), 0);

        // Stays stale: no further acquires until rebuilt.
        let status = frames.draw_frame(&mut backend).unwrap();
        assert_eq!(status, FrameStatus::NeedsRebuild);
        assert_eq!(backend.calls.len(), 1);
    }

    #[test]
    fn other_acquire_failures_are_fatal() {
        let mut frames = armed_loop(2, 1);
        let mut backend = ScriptedBackend {
            acquire: Err(vk::Result::ERROR_DEVICE_LOST),
            ..Default::default()
        };

        let err = frames.draw_frame(&mut backend).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert!(backend.submits().is_empty());
    }

    #[test]
    fn submit_failure_drops_frame() {
        let mut frames = armed_loop(2, 1);
        let mut backend = ScriptedBackend {
            submit: Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            ..Default::default()
        };

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Dropped);
        assert!(!status.completed());
        assert_eq!(frames.state(), FrameState::Ready);
        assert_eq!(backend.presents(), 0);
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Wait { .. })));
    }

    #[test]
    fn fence_timeout_drops_frame_before_present() {
        let mut frames = armed_loop(2, 1);
        let mut backend = ScriptedBackend {
            wait: Err(vk::Result::TIMEOUT),
            ..Default::default()
        };

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Dropped);
        assert_eq!(backend.submits().len(), 1);
        assert_eq!(backend.presents(), 0);
        assert_eq!(frames.frame_counter(), 0);
    }

    #[test]
    fn present_failure_is_reported() {
        let mut frames = armed_loop(2, 1);
        let mut backend = ScriptedBackend {
            present: Err(vk::Result::ERROR_SURFACE_LOST_KHR),
            ..Default::default()
        };

        let status = frames.draw_frame(&mut backend).unwrap();
        assert_eq!(status, FrameStatus::Dropped);
        assert_eq!(frames.state(), FrameState::Ready);
    }

    #[test]
    fn out_of_date_present_marks_stale() {
        let mut frames = armed_loop(2, 1);
        let mut backend = ScriptedBackend {
            present: Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            ..Default::default()
        };

        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::Dropped);
        assert_eq!(frames.state(), FrameState::Stale);
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::NeedsRebuild);
    }

    #[test]
    fn sync_slots_rotate_by_frame_not_by_image() {
        let mut frames = armed_loop(3, 2);
        let mut backend = ScriptedBackend::default();

        for _ in 0..3 {
            frames.draw_frame(&mut backend).unwrap();
        }

        let semaphores: Vec<_> = backend
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Acquire { semaphore, .. } => Some(*semaphore),
                _ => None,
            })
            .collect();
        assert_eq!(
            semaphores,
            vec![
                slot(1).image_available,
                slot(2).image_available,
                slot(1).image_available
            ]
        );
        // Same image every time, so the same command buffer.
        assert_eq!(backend.submits(), vec![vk::CommandBuffer::from_raw(1); 3]);
    }

    #[test]
    #[should_panic(expected = "before the frame loop was armed")]
    fn drawing_unarmed_loop_panics() {
        let mut frames = FrameLoop::recorded(vec![vk::CommandBuffer::from_raw(1)], Duration::from_secs(1));
        let _ = frames.draw_frame(&mut ScriptedBackend::default());
    }
}
