// Graphics pipeline creation and management
//
// One render pass (single color attachment, clear then store), an empty
// pipeline layout, a pipeline cache and a fully static graphics pipeline:
// no dynamic state, no depth, no blending. Framebuffers bind each swapchain
// view to that render pass.

use ash::vk;

use super::buffer::VERTEX_STRIDE;
use super::error::{RendererResult, VkResultExt};
use super::shader::{ShaderModules, ShaderSource};
use crate::config::ShaderConfig;

/// Create the render pass for a single color attachment in `format`
pub fn create_render_pass(device: &ash::Device, format: vk::Format) -> RendererResult<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    // Writes to the attachment wait until the acquired image is actually free.
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }.phase("render pass creation")
}

/// Vertex input description: one binding, one vec3 position at location 0
pub fn vertex_input_layout() -> (
    [vk::VertexInputBindingDescription; 1],
    [vk::VertexInputAttributeDescription; 1],
) {
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(VERTEX_STRIDE)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let position_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(0)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(0)
        .build();

    ([binding], [position_attr])
}

/// Render pass plus the immutable pipeline built against it.
#[derive(Debug, Default)]
pub struct RenderPipeline {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub cache: vk::PipelineCache,
    pub pipeline: vk::Pipeline,
}

impl RenderPipeline {
    pub fn new(
        device: &ash::Device,
        format: vk::Format,
        extent: vk::Extent2D,
        shaders: &dyn ShaderSource,
        shader_names: &ShaderConfig,
    ) -> RendererResult<Self> {
        let mut built = Self {
            render_pass: create_render_pass(device, format)?,
            ..Default::default()
        };

        if let Err(err) = built.create_graphics_pipeline(device, shaders, shader_names, extent) {
            built.destroy_pipeline(device);
            built.destroy_cache(device);
            built.destroy_layout(device);
            built.destroy_render_pass(device);
            return Err(err);
        }

        log::info!("Created graphics pipeline for {}x{}", extent.width, extent.height);
        Ok(built)
    }

    /// Layout, shader stages, cache and pipeline. Shader modules never outlive
    /// this call; handles set on `self` before a failure are left for the
    /// caller to release.
    fn create_graphics_pipeline(
        &mut self,
        device: &ash::Device,
        shaders: &dyn ShaderSource,
        shader_names: &ShaderConfig,
        extent: vk::Extent2D,
    ) -> RendererResult<()> {
        // Empty layout: no descriptor sets, no push constants
        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        self.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .phase("pipeline layout creation")?;

        let mut modules = ShaderModules::new(device);
        let vert_shader = modules.load(shaders, &shader_names.vertex)?;
        let frag_shader = modules.load(shaders, &shader_names.fragment)?;

        let entry_point = c"main";

        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader)
            .name(entry_point)
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader)
            .name(entry_point)
            .build();

        let shader_stages = &[vert_stage, frag_stage];

        // Vertex input
        let (bindings, attributes) = vertex_input_layout();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor, fixed to the swapchain extent
        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();

        let scissor = vk::Rect2D::builder()
            .offset(vk::Offset2D { x: 0, y: 0 })
            .extent(extent)
            .build();

        let viewports = &[viewport];
        let scissors = &[scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(viewports)
            .scissors(scissors);

        // Rasterization: filled, no culling, clockwise front face
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let sample_mask = [u32::MAX];
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_mask(&sample_mask);

        // Color blending (no blending, opaque)
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(color_blend_attachments);

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        self.cache = unsafe { device.create_pipeline_cache(&cache_info, None) }
            .phase("pipeline cache creation")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(self.layout)
            .render_pass(self.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe { device.create_graphics_pipelines(self.cache, &[pipeline_info], None) }
            .map_err(|(_, result)| result)
            .phase("graphics pipeline creation")?;

        self.pipeline = pipelines[0];
        Ok(())
    }

    pub(crate) fn destroy_pipeline(&mut self, device: &ash::Device) {
        if self.pipeline != vk::Pipeline::null() {
            unsafe { device.destroy_pipeline(self.pipeline, None) };
        }
        self.pipeline = vk::Pipeline::null();
    }

    pub(crate) fn destroy_cache(&mut self, device: &ash::Device) {
        if self.cache != vk::PipelineCache::null() {
            unsafe { device.destroy_pipeline_cache(self.cache, None) };
        }
        self.cache = vk::PipelineCache::null();
    }

    pub(crate) fn destroy_layout(&mut self, device: &ash::Device) {
        if self.layout != vk::PipelineLayout::null() {
            unsafe { device.destroy_pipeline_layout(self.layout, None) };
        }
        self.layout = vk::PipelineLayout::null();
    }

    pub(crate) fn destroy_render_pass(&mut self, device: &ash::Device) {
        if self.render_pass != vk::RenderPass::null() {
            unsafe { device.destroy_render_pass(self.render_pass, None) };
        }
        self.render_pass = vk::RenderPass::null();
    }
}

/// One framebuffer per swapchain image view
#[derive(Debug, Default)]
pub struct FramebufferSet {
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl FramebufferSet {
    /// `depth_view` is attached as a second attachment when given; the
    /// triangle's render pass has none, so callers pass `None`.
    pub fn new(
        device: &ash::Device,
        image_views: &[vk::ImageView],
        depth_view: Option<vk::ImageView>,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> RendererResult<Self> {
        let mut set = Self {
            framebuffers: Vec::with_capacity(image_views.len()),
        };

        for &image_view in image_views {
            let mut attachments = vec![image_view];
            attachments.extend(depth_view);

            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            match unsafe { device.create_framebuffer(&framebuffer_info, None) }
                .phase("framebuffer creation")
            {
                Ok(framebuffer) => set.framebuffers.push(framebuffer),
                Err(err) => {
                    set.destroy(device);
                    return Err(err);
                }
            }
        }

        debug_assert_eq!(set.framebuffers.len(), image_views.len());
        log::info!("Created {} framebuffers", set.framebuffers.len());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_one_vec3_at_location_zero() {
        let (bindings, attributes) = vertex_input_layout();

        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].stride, 12);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);

        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].binding, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[0].offset, 0);
    }
}
