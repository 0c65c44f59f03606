// Shader module loading and management
//
// Vulkan consumes SPIR-V as 32-bit words. Bytecode comes from a named-asset
// source (the renderer only knows asset names), gets repacked into words and
// turned into shader modules that live exactly as long as pipeline creation.

use ash::vk;
use std::io::Cursor;
use std::path::PathBuf;

use super::error::{RendererError, RendererResult, VkResultExt};

/// Named-asset lookup for compiled shader bytecode.
pub trait ShaderSource {
    fn load(&self, name: &str) -> RendererResult<Vec<u8>>;
}

/// Shader assets stored as files under one directory.
#[derive(Debug, Clone)]
pub struct AssetDirectory {
    root: PathBuf,
}

impl AssetDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ShaderSource for AssetDirectory {
    fn load(&self, name: &str) -> RendererResult<Vec<u8>> {
        let path = self.root.join(name);
        log::debug!("Loading shader asset {:?}", path);
        std::fs::read(&path).map_err(|source| RendererError::ShaderAssetMissing {
            name: name.to_string(),
            source,
        })
    }
}

/// Repack raw bytecode into SPIR-V words.
pub fn spirv_words(name: &str, code: &[u8]) -> RendererResult<Vec<u32>> {
    let invalid = || RendererError::InvalidShaderBytecode {
        name: name.to_string(),
        len: code.len(),
    };

    if code.is_empty() || code.len() % 4 != 0 {
        return Err(invalid());
    }

    // read_spv copies into an aligned buffer and fixes endianness
    ash::util::read_spv(&mut Cursor::new(code)).map_err(|_| invalid())
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &ash::Device, words: &[u32]) -> RendererResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    unsafe { device.create_shader_module(&create_info, None) }.phase("shader module creation")
}

/// Shader modules created for one pipeline build; destroyed when dropped,
/// whether the build succeeded or not.
pub struct ShaderModules<'a> {
    device: &'a ash::Device,
    modules: Vec<vk::ShaderModule>,
}

impl<'a> ShaderModules<'a> {
    pub fn new(device: &'a ash::Device) -> Self {
        Self {
            device,
            modules: Vec::with_capacity(2),
        }
    }

    /// Fetch `name` from `source` and build a module from it.
    pub fn load(&mut self, source: &dyn ShaderSource, name: &str) -> RendererResult<vk::ShaderModule> {
        let code = source.load(name)?;
        let words = spirv_words(name, &code)?;
        let module = create_shader_module(self.device, &words)?;
        self.modules.push(module);
        Ok(module)
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn bytecode_is_repacked_into_words() {
        let mut code = SPIRV_MAGIC.to_le_bytes().to_vec();
        code.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = spirv_words("tri-vert.spv", &code).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn ragged_bytecode_is_rejected() {
        let err = spirv_words("tri-frag.spv", &[0x03, 0x02, 0x23, 0x07, 0x00, 0x00]).unwrap_err();
        match err {
            RendererError::InvalidShaderBytecode { name, len } => {
                assert_eq!(name, "tri-frag.spv");
                assert_eq!(len, 6);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            spirv_words("empty.spv", &[]),
            Err(RendererError::InvalidShaderBytecode { len: 0, .. })
        ));
    }

    #[test]
    fn missing_asset_is_reported_by_name() {
        let source = AssetDirectory::new("no/such/shader/dir");
        match source.load("tri-vert.spv") {
            Err(RendererError::ShaderAssetMissing { name, .. }) => assert_eq!(name, "tri-vert.spv"),
            other => panic!("unexpected result: {:?}", other.map(|bytes| bytes.len())),
        }
    }

    #[test]
    fn asset_directory_reads_files() {
        let dir = std::env::temp_dir().join(format!("triangle-renderer-shaders-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tri-vert.spv"), SPIRV_MAGIC.to_le_bytes()).unwrap();

        let bytes = AssetDirectory::new(&dir).load("tri-vert.spv").unwrap();
        assert_eq!(spirv_words("tri-vert.spv", &bytes).unwrap(), vec![SPIRV_MAGIC]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
