// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every knob the renderer used to hardcode (clear color, shader asset names,
// queue family) is an explicit option here and gets passed into
// initialization. Missing or broken files fall back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RendererConfig {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Triangle".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub fence_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.098, 0.71, 0.996, 1.0],
            frames_in_flight: 1,
            fence_timeout_ms: 10_000,
        }
    }
}

impl GraphicsConfig {
    /// Number of frame-sync slots; never zero.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.max(1)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

/// How the physical adapter is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterPolicy {
    /// Always the first enumerated adapter
    #[default]
    First,
    /// Prefer a discrete GPU with a graphics queue
    Discrete,
}

/// Device selection settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub adapter_policy: AdapterPolicy,
    /// Queue family to request the single queue from (0 when unset)
    pub queue_family: Option<u32>,
}

/// Shader asset identifiers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub asset_dir: PathBuf,
    pub vertex: String,
    pub fragment: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            asset_dir: PathBuf::from("shaders"),
            vertex: "tri-vert.spv".to_string(),
            fragment: "tri-frag.spv".to_string(),
        }
    }
}

/// What to do when the vertex upload copies fewer bytes than requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CopyMismatchPolicy {
    #[default]
    Warn,
    Error,
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    pub copy_mismatch: CopyMismatchPolicy,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: true,
            copy_mismatch: CopyMismatchPolicy::Warn,
        }
    }
}

impl RendererConfig {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            RendererConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(RendererConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
