// =============================================================================
// TRIANGLE RENDERER - winit platform layer
// =============================================================================
//
// The renderer core never touches the window system. This binary maps the
// window lifecycle onto it:
//
//   resumed          -> create window + surface, build the renderer
//   suspended/close  -> drop the renderer (runs the teardown sequence)
//   RedrawRequested  -> one draw_frame, then request the next redraw
//   Resized          -> flag the swapchain for a rebuild
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;
use triangle_renderer::backend::AssetDirectory;
use triangle_renderer::{FrameStatus, RendererConfig, TriangleRenderer};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RendererConfig::load();
    log::info!("Starting triangle renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        config.window.title
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop terminated with an error")?;
    Ok(())
}

/// Platform state. `renderer` is declared before `window` so the Vulkan
/// objects are gone before the window they present to.
struct App {
    config: RendererConfig,
    renderer: Option<TriangleRenderer>,
    window: Option<Arc<Window>>,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
        }
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        let attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = event_loop.create_window(attributes).context("Failed to create window")?;
        Ok(Arc::new(window))
    }

    fn create_renderer(&self, window: &Window) -> Result<TriangleRenderer> {
        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let extension_ptrs = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions")?;
        // Pointers come from ash-window's static extension names.
        let required_extensions: Vec<&CStr> = extension_ptrs
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();

        let surface_factory = |entry: &ash::Entry, instance: &ash::Instance| unsafe {
            ash_window::create_surface(entry, instance, display_handle, window_handle, None)
        };

        let shaders = Box::new(AssetDirectory::new(&self.config.shaders.asset_dir));

        let renderer = TriangleRenderer::new(
            self.config.clone(),
            &required_extensions,
            surface_factory,
            shaders,
            window_extent(window),
        )
        .context("Failed to initialize Vulkan")?;

        Ok(renderer)
    }

    /// One redraw. Returns an error only when the renderer cannot continue.
    fn redraw(&mut self) -> Result<()> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        let extent = window_extent(window);
        if extent.width == 0 || extent.height == 0 {
            // Minimized; nothing to present to.
            return Ok(());
        }

        match renderer.draw_frame().context("Frame acquire failed")? {
            FrameStatus::Presented { .. } => {}
            FrameStatus::NeedsRebuild => renderer.rebuild(extent).context("Failed to rebuild swapchain")?,
            FrameStatus::Dropped => log::debug!("Frame dropped"),
        }

        window.request_redraw();
        Ok(())
    }
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// winit reports a resize right after creating the window; only a size the
/// swapchain was not built for warrants a rebuild.
fn needs_rebuild(current: vk::Extent2D, size: PhysicalSize<u32>) -> bool {
    current.width != size.width || current.height != size.height
}

impl ApplicationHandler for App {
    /// Surface created: build everything.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }

        let window = match self.window.clone() {
            Some(window) => window,
            None => match self.create_window(event_loop) {
                Ok(window) => window,
                Err(e) => {
                    log::error!("{:#}", e);
                    event_loop.exit();
                    return;
                }
            },
        };

        match self.create_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                log::error!("{:#}", e);
                event_loop.exit();
                return;
            }
        }

        window.request_redraw();
        self.window = Some(window);
    }

    /// Surface destroyed: tear down, keep the window around for the next resume.
    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("Suspended, releasing renderer");
        self.renderer = None;
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.renderer = None;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    if needs_rebuild(renderer.extent(), size) {
                        renderer.request_rebuild();
                    }
                }
                if let Some(window) = self.window.as_ref() {
                    window.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    log::error!("Render error: {:#}", e);
                    self.renderer = None;
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.renderer = None;
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn resize_to_current_extent_is_ignored() {
        assert!(!needs_rebuild(extent(800, 600), PhysicalSize::new(800, 600)));
    }

    #[test]
    fn resize_to_new_extent_rebuilds() {
        assert!(needs_rebuild(extent(800, 600), PhysicalSize::new(1024, 600)));
        assert!(needs_rebuild(extent(800, 600), PhysicalSize::new(800, 0)));
    }
}
