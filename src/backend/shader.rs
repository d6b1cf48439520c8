// Shader module loading
//
// Shaders arrive as pre-compiled SPIR-V files. A missing file and a broken
// file are both reported as errors naming the path; neither is fatal here.

use crate::error::{Result, RuntimeError, VkContext};
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;

const ENTRY_POINT: &CStr = c"main";

/// A shader module plus the stage it is meant for.
///
/// The module is destroyed on drop; create pipelines from it first.
pub struct ShaderStage<'rt> {
    device: &'rt ash::Device,
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl<'rt> ShaderStage<'rt> {
    pub fn load(
        device: &'rt ash::Device,
        path: &Path,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let code = read_shader_file(path)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.create_shader_module(&create_info, None) }
            .vk_context("vkCreateShaderModule")?;

        log::debug!("Loaded {:?} shader {:?} ({} words)", stage, path, code.len());

        Ok(Self {
            device,
            module,
            stage,
        })
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Stage description for pipeline creation, entry point `main`.
    pub fn create_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.module)
            .name(ENTRY_POINT)
    }
}

impl Drop for ShaderStage<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Read a SPIR-V file from disk.
pub fn read_shader_file(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|source| RuntimeError::ShaderRead {
        path: path.to_path_buf(),
        source,
    })?;
    decode_spirv(path, &bytes)
}

/// Turn a SPIR-V blob into aligned words.
pub fn decode_spirv(path: &Path, bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() {
        return Err(RuntimeError::InvalidShader {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| RuntimeError::InvalidShader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn missing_file_is_not_found() {
        let path = std::env::temp_dir().join("vk-runtime-no-such-shader.spv");
        let err = read_shader_file(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("vk-runtime-no-such-shader.spv"));
    }

    #[test]
    fn file_on_disk_is_decoded() {
        let path = std::env::temp_dir().join(format!("vk-runtime-shader-{}.spv", std::process::id()));
        std::fs::write(&path, SPIRV_MAGIC.to_le_bytes()).unwrap();
        let words = read_shader_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(words.unwrap(), vec![SPIRV_MAGIC]);
    }

    #[test]
    fn empty_blob_is_rejected() {
        let err = decode_spirv(Path::new("empty.spv"), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
        assert!(err.to_string().contains("empty.spv"));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let err = decode_spirv(Path::new("odd.spv"), &[0x03, 0x02, 0x23]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
    }

    #[test]
    fn words_are_decoded_little_endian() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC, 0x0001_0600, 0, 8, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let words = decode_spirv(Path::new("header.spv"), &bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words[3], 8);
    }
}
