// Backend module - Vulkan abstraction layer
//
// One module per renderer component. Each owns its handles and exposes
// crate-private destroy hooks; the order those run in is decided by
// `teardown`, not by the components.

pub mod buffer;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod teardown;

pub use device::{AdapterSelector, DeviceContext};
pub use error::{RendererError, RendererResult};
pub use frame::{FrameBackend, FrameRenderer, FrameState, FrameStatus};
pub use shader::{AssetDirectory, ShaderSource};
pub use swapchain::Swapchain;
pub use teardown::{ResourceGraph, ResourceKind};
