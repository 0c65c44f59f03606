//! A minimal Vulkan renderer that clears the screen and draws one triangle.
//!
//! The platform layer hands [`TriangleRenderer::new`] a surface factory and a
//! shader source; everything else (device, swapchain, pipeline, vertex
//! upload, frame loop and teardown) lives behind the facade.

pub mod backend;
pub mod config;
pub mod renderer;

pub use backend::{FrameStatus, RendererError, RendererResult};
pub use config::RendererConfig;
pub use renderer::TriangleRenderer;
