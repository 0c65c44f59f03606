// Swapchain - Window presentation
//
// Negotiates present mode and color format with the surface, creates the
// swapchain and one 2D view per image. Policy is deliberately minimal: FIFO
// always, the first of two accepted 8-bit UNORM formats, and the extent and
// image count the surface reports.

use ash::vk;

use super::device::DeviceContext;
use super::error::{RendererError, RendererResult, VkResultExt};

/// Formats accepted for the color attachment, in no particular preference.
pub const ACCEPTED_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

/// Always FIFO (vsync), whatever else the surface supports.
pub fn negotiate_present_mode(supported: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    log::debug!("Supported present modes: {:?}", supported);
    vk::PresentModeKHR::FIFO
}

/// First supported format equal to one of the accepted encodings.
pub fn negotiate_format(supported: &[vk::SurfaceFormatKHR]) -> RendererResult<vk::SurfaceFormatKHR> {
    for format in supported {
        log::debug!(
            "Supported format {:?} colorspace {:?}",
            format.format,
            format.color_space
        );
    }

    supported
        .iter()
        .copied()
        .find(|f| ACCEPTED_FORMATS.contains(&f.format))
        .ok_or(RendererError::NoSuitableFormat)
}

/// Extent and minimum image count straight from the surface capabilities.
///
/// Only the "extent decided by the swapchain" sentinel (`u32::MAX`) is
/// replaced, by the size the platform asked for.
pub fn capability_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    fallback: vk::Extent2D,
) -> (vk::Extent2D, u32) {
    let extent = if caps.current_extent.width == u32::MAX {
        fallback
    } else {
        caps.current_extent
    };
    (extent, caps.min_image_count)
}

#[derive(Default)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    pub fn new(ctx: &DeviceContext, fallback_extent: vk::Extent2D) -> RendererResult<Self> {
        let loader = &ctx.surface_loader;
        let (physical_device, surface) = (ctx.physical_device, ctx.surface);

        let present_modes = unsafe {
            loader.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .phase("present mode query")?;
        let present_mode = negotiate_present_mode(&present_modes);
        log::info!("Present mode: {:?}", present_mode);

        let formats = unsafe { loader.get_physical_device_surface_formats(physical_device, surface) }
            .phase("surface format query")?;
        let surface_format = negotiate_format(&formats)?;
        log::info!("Chosen format: {:?}", surface_format.format);

        let caps = unsafe {
            loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .phase("surface capability query")?;
        let (extent, min_image_count) = capability_extent(&caps, fallback_extent);
        log::info!("Display size {}x{}", extent.width, extent.height);

        let queue_families = [ctx.queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(false);

        let handle = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None) }
            .phase("swapchain creation")?;

        let mut swapchain = Self {
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            surface_format,
            extent,
            present_mode,
        };

        // The realized image count may exceed the requested minimum.
        let images = unsafe { ctx.swapchain_loader.get_swapchain_images(handle) };
        match images {
            Ok(images) => swapchain.images = images,
            Err(result) => {
                swapchain.destroy(ctx);
                return Err(RendererError::Vulkan {
                    phase: "swapchain image query",
                    result,
                });
            }
        }
        log::info!("Created swapchain with {} images", swapchain.images.len());

        if let Err(err) = swapchain.create_image_views(&ctx.device) {
            swapchain.destroy_image_views(&ctx.device);
            swapchain.destroy(ctx);
            return Err(err);
        }

        Ok(swapchain)
    }

    fn create_image_views(&mut self, device: &ash::Device) -> RendererResult<()> {
        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { device.create_image_view(&create_info, None) }
                .phase("image view creation")?;
            self.image_views.push(view);
        }
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub(crate) fn destroy_image_views(&mut self, device: &ash::Device) {
        for view in self.image_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    pub(crate) fn destroy(&mut self, ctx: &DeviceContext) {
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { ctx.swapchain_loader.destroy_swapchain(self.handle, None) };
        }
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}
