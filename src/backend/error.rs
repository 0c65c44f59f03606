// Renderer error taxonomy
//
// Initialization failures bubble up as `RendererError` carrying the phase that
// failed. Frame-loop failures are absorbed by the frame renderer and only the
// fatal acquire path ever produces an error there.

use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

use super::teardown::TeardownError;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Failed to load Vulkan library. Is Vulkan installed?")]
    Loading(#[from] ash::LoadingError),

    #[error("{phase} failed: {result}")]
    Vulkan {
        phase: &'static str,
        result: vk::Result,
    },

    #[error("No Vulkan-capable GPU found")]
    NoAdaptersFound,

    #[error("Adapter selection policy rejected all {candidates} adapters")]
    NoAdapterSelected { candidates: usize },

    #[error("Surface reports no B8G8R8A8_UNORM or R8G8B8A8_UNORM format")]
    NoSuitableFormat,

    #[error("No memory type in mask {type_bits:#034b} has properties {required:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Swapchain has {images} images, {views} views and {framebuffers} framebuffers")]
    ImageCountMismatch {
        images: usize,
        views: usize,
        framebuffers: usize,
    },

    #[error("Vertex upload copied {copied} bytes, expected {expected}")]
    CopySizeMismatch { expected: usize, copied: usize },

    #[error("Shader asset {name} not found")]
    ShaderAssetMissing {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shader asset {name} is {len} bytes, not a whole number of SPIR-V words")]
    InvalidShaderBytecode { name: String, len: usize },

    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

pub type RendererResult<T> = Result<T, RendererError>;

/// Attach the failing phase to a raw Vulkan result.
pub trait VkResultExt<T> {
    fn phase(self, phase: &'static str) -> RendererResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn phase(self, phase: &'static str) -> RendererResult<T> {
        self.map_err(|result| RendererError::Vulkan { phase, result })
    }
}

impl RendererError {
    /// The raw Vulkan result behind this error, if there is one.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_is_reported_in_message() {
        let failed: VkResult<()> = Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        let err = failed.phase("instance creation").unwrap_err();

        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_INITIALIZATION_FAILED));
        assert!(err.to_string().starts_with("instance creation failed"));
    }

    #[test]
    fn domain_errors_carry_no_vk_result() {
        assert_eq!(RendererError::NoSuitableFormat.vk_result(), None);
        let mismatch = RendererError::CopySizeMismatch { expected: 36, copied: 12 };
        assert_eq!(mismatch.to_string(), "Vertex upload copied 12 bytes, expected 36");
    }
}
