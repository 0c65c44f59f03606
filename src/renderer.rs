// =============================================================================
// TRIANGLE RENDERER - owns every Vulkan object and drives the frame loop
// =============================================================================
//
// INIT ORDER:
//   DeviceContext -> Swapchain -> RenderPipeline -> FramebufferSet
//     -> VertexBuffer -> FrameRenderer
//
// Every created object is registered in the ResourceGraph. Teardown (on drop,
// or partially on a stale swapchain) walks the graph's derived order, so a
// failure halfway through `new` releases exactly what was built.

use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::ffi::CStr;

use crate::backend::buffer::{VertexBuffer, TRIANGLE};
use crate::backend::device::{selector_for, DeviceContext};
use crate::backend::error::{RendererError, RendererResult};
use crate::backend::frame::{FrameRenderer, FrameStatus, QueuePresenter};
use crate::backend::pipeline::{FramebufferSet, RenderPipeline};
use crate::backend::shader::ShaderSource;
use crate::backend::swapchain::Swapchain;
use crate::backend::teardown::{ResourceGraph, ResourceKind};
use crate::config::RendererConfig;

pub struct TriangleRenderer {
    config: RendererConfig,
    shaders: Box<dyn ShaderSource>,

    context: DeviceContext,
    swapchain: Swapchain,
    pipeline: RenderPipeline,
    framebuffers: FramebufferSet,
    vertices: VertexBuffer,
    frames: FrameRenderer,

    resources: ResourceGraph,
}

impl TriangleRenderer {
    /// Run the full initialization sequence against a platform surface.
    ///
    /// `fallback_extent` is used only when the surface leaves the extent up
    /// to the swapchain (usually the window's inner size).
    pub fn new<F>(
        config: RendererConfig,
        required_extensions: &[&CStr],
        surface_factory: F,
        shaders: Box<dyn ShaderSource>,
        fallback_extent: vk::Extent2D,
    ) -> RendererResult<Self>
    where
        F: FnOnce(&Entry, &ash::Instance) -> VkResult<vk::SurfaceKHR>,
    {
        log::info!("Initializing Vulkan...");

        let selector = selector_for(&config.device);
        let context = DeviceContext::new(&config, required_extensions, surface_factory, selector.as_ref())?;

        let mut renderer = Self {
            config,
            shaders,
            resources: context.resource_kinds().into_iter().collect(),
            context,
            swapchain: Swapchain::default(),
            pipeline: RenderPipeline::default(),
            framebuffers: FramebufferSet::default(),
            vertices: VertexBuffer::default(),
            frames: FrameRenderer::default(),
        };

        // From here on an early return drops `renderer`, which tears down
        // whatever has been registered.
        renderer.build_targets(fallback_extent)?;

        renderer.vertices = VertexBuffer::upload(
            &renderer.context.device,
            &renderer.context.memory_properties,
            &TRIANGLE,
            renderer.config.debug.copy_mismatch,
        )?;
        renderer.resources.insert(ResourceKind::VertexBuffer);
        renderer.resources.insert(ResourceKind::VertexMemory);

        renderer.build_frames()?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    /// Swapchain, image views, render pass, pipeline and framebuffers.
    fn build_targets(&mut self, fallback_extent: vk::Extent2D) -> RendererResult<()> {
        self.swapchain = Swapchain::new(&self.context, fallback_extent)?;
        self.resources.insert(ResourceKind::Swapchain);
        self.resources.insert(ResourceKind::ImageViews);

        self.pipeline = RenderPipeline::new(
            &self.context.device,
            self.swapchain.surface_format.format,
            self.swapchain.extent,
            self.shaders.as_ref(),
            &self.config.shaders,
        )?;
        self.resources.insert(ResourceKind::RenderPass);
        self.resources.insert(ResourceKind::PipelineLayout);
        self.resources.insert(ResourceKind::PipelineCache);
        self.resources.insert(ResourceKind::Pipeline);

        self.framebuffers = FramebufferSet::new(
            &self.context.device,
            &self.swapchain.image_views,
            None,
            self.pipeline.render_pass,
            self.swapchain.extent,
        )?;
        self.resources.insert(ResourceKind::Framebuffers);

        Ok(())
    }

    /// Command pool, recorded command buffers and the frame-sync arena.
    fn build_frames(&mut self) -> RendererResult<()> {
        check_image_counts(
            self.swapchain.image_count(),
            self.swapchain.image_views.len(),
            self.framebuffers.len(),
        )?;

        self.frames = FrameRenderer::init(
            &self.context.device,
            self.context.queue_family,
            &self.pipeline,
            &self.framebuffers,
            self.swapchain.extent,
            &self.vertices,
            &self.config.graphics,
        )?;
        self.resources.insert(ResourceKind::CommandPool);
        self.resources.insert(ResourceKind::CommandBuffers);
        self.resources.insert(ResourceKind::FrameSync);

        Ok(())
    }

    /// Draw one frame. See `FrameLoop::draw_frame` for the outcome contract.
    pub fn draw_frame(&mut self) -> RendererResult<FrameStatus> {
        let mut presenter = QueuePresenter {
            device: &self.context.device,
            swapchain_loader: &self.context.swapchain_loader,
            swapchain: self.swapchain.handle,
            queue: self.context.queue,
        };
        self.frames.draw_frame(&mut presenter)
    }

    /// Force a rebuild before the next frame (window resized, for instance).
    pub fn request_rebuild(&mut self) {
        self.frames.frames.mark_stale();
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Tear down and recreate everything sized by the swapchain.
    ///
    /// The device context and the vertex buffer survive.
    pub fn rebuild(&mut self, fallback_extent: vk::Extent2D) -> RendererResult<()> {
        log::info!("Rebuilding swapchain resources");
        self.context.wait_idle()?;

        let order = self.resources.release_order(&ResourceKind::SWAPCHAIN_DEPENDENT)?;
        for kind in order {
            self.release(kind)?;
        }

        self.build_targets(fallback_extent)?;
        self.build_frames()?;

        log::info!(
            "Swapchain rebuilt: {}x{}, {} images",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            self.swapchain.image_count()
        );
        Ok(())
    }

    fn release(&mut self, kind: ResourceKind) -> RendererResult<()> {
        self.resources.release(kind)?;
        log::debug!("Destroying {}", kind);
        self.destroy_resource(kind);
        Ok(())
    }

    fn destroy_resource(&mut self, kind: ResourceKind) {
        let device = &self.context.device;
        match kind {
            ResourceKind::CommandBuffers => self.frames.free_command_buffers(device),
            ResourceKind::FrameSync => self.frames.destroy_sync(device),
            ResourceKind::CommandPool => self.frames.destroy_command_pool(device),
            ResourceKind::RenderPass => self.pipeline.destroy_render_pass(device),
            ResourceKind::Framebuffers => self.framebuffers.destroy(device),
            ResourceKind::ImageViews => self.swapchain.destroy_image_views(device),
            ResourceKind::Swapchain => self.swapchain.destroy(&self.context),
            ResourceKind::Pipeline => self.pipeline.destroy_pipeline(device),
            ResourceKind::PipelineCache => self.pipeline.destroy_cache(device),
            ResourceKind::PipelineLayout => self.pipeline.destroy_layout(device),
            ResourceKind::VertexBuffer => self.vertices.destroy_buffer(device),
            ResourceKind::VertexMemory => self.vertices.free_memory(device),
            ResourceKind::Device => self.context.destroy_device(),
            ResourceKind::DebugMessenger => self.context.destroy_diagnostics(),
            ResourceKind::Surface => self.context.destroy_surface(),
            ResourceKind::Instance => self.context.destroy_instance(),
        }
    }
}

/// Every swapchain image needs exactly one view and one framebuffer, and
/// there has to be at least one image to record and draw into.
fn check_image_counts(images: usize, views: usize, framebuffers: usize) -> RendererResult<()> {
    if images == 0 || views != images || framebuffers != images {
        return Err(RendererError::ImageCountMismatch {
            images,
            views,
            framebuffers,
        });
    }
    Ok(())
}

impl Drop for TriangleRenderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if self.resources.contains(ResourceKind::Device) {
            if let Err(e) = self.context.wait_idle() {
                log::warn!("Device did not go idle before teardown: {}", e);
            }
        }

        let order = match self.resources.destruction_order() {
            Ok(order) => order,
            Err(e) => {
                log::error!("Cannot derive teardown order: {}", e);
                return;
            }
        };

        for kind in order {
            if let Err(e) = self.release(kind) {
                log::error!("Teardown of {} failed: {}", kind, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_image_counts_pass() {
        assert!(check_image_counts(1, 1, 1).is_ok());
        assert!(check_image_counts(3, 3, 3).is_ok());
    }

    #[test]
    fn empty_swapchain_is_rejected() {
        assert!(matches!(
            check_image_counts(0, 0, 0),
            Err(RendererError::ImageCountMismatch { images: 0, .. })
        ));
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        assert!(matches!(
            check_image_counts(3, 2, 3),
            Err(RendererError::ImageCountMismatch {
                images: 3,
                views: 2,
                framebuffers: 3
            })
        ));
        assert!(check_image_counts(3, 3, 2).is_err());
    }
}
