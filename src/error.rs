// Runtime error type
//
// One typed policy for every fallible call in the library. Callers decide
// which kinds are fatal; nothing in here terminates the process.

use ash::prelude::VkResult;
use ash::vk;
use std::path::PathBuf;

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SetupFailure,
    ResourceExhausted,
    CapabilityUnsupported,
    NotFound,
}

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// A native call returned an unexpected result
    #[error("{call} failed: {result}")]
    SetupFailure {
        call: &'static str,
        result: vk::Result,
    },

    /// The driver ran out of host/device memory or object slots
    #[error("{call} exhausted device resources: {result}")]
    ResourceExhausted {
        call: &'static str,
        result: vk::Result,
    },

    /// Missing extension, feature, layer, device or queue family
    #[error("unsupported: {0}")]
    CapabilityUnsupported(String),

    /// A lookup (memory type, configuration, ...) found nothing
    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("cannot read shader file {}: {source}", path.display())]
    ShaderRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid shader binary {}: {reason}", path.display())]
    InvalidShader { path: PathBuf, reason: String },

    /// Host copy larger than the buffer
    #[error("host access of {requested} bytes exceeds the {size}-byte buffer")]
    AccessOutOfRange {
        requested: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("buffer memory is not host visible ({0:?})")]
    NotHostVisible(vk::MemoryPropertyFlags),
}

impl RuntimeError {
    /// Classify a native result returned by `call`.
    pub fn from_vk(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL => Self::ResourceExhausted { call, result },
            vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER
            | vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
                Self::CapabilityUnsupported(format!("{call} returned {result}"))
            }
            _ => Self::SetupFailure { call, result },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SetupFailure { .. }
            | Self::Loading(_)
            | Self::WindowHandle(_)
            | Self::InvalidShader { .. }
            | Self::AccessOutOfRange { .. } => ErrorKind::SetupFailure,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::CapabilityUnsupported(_) | Self::NotHostVisible(_) => {
                ErrorKind::CapabilityUnsupported
            }
            Self::NotFound(_) | Self::ShaderRead { .. } => ErrorKind::NotFound,
        }
    }
}

/// Attach the failing call name to a raw `VkResult`.
pub(crate) trait VkContext<T> {
    fn vk_context(self, call: &'static str) -> Result<T>;
}

impl<T> VkContext<T> for VkResult<T> {
    fn vk_context(self, call: &'static str) -> Result<T> {
        self.map_err(|result| RuntimeError::from_vk(call, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_resource_exhausted() {
        let err = RuntimeError::from_vk("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("vkAllocateMemory"));
    }

    #[test]
    fn missing_extension_is_capability_unsupported() {
        let err = RuntimeError::from_vk("vkCreateDevice", vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        assert_eq!(err.kind(), ErrorKind::CapabilityUnsupported);
        assert!(err.to_string().contains("vkCreateDevice"));
    }

    #[test]
    fn device_lost_is_setup_failure() {
        let err = RuntimeError::from_vk("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
    }

    #[test]
    fn vk_context_names_the_call() {
        let result: VkResult<()> = Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        let err = result.vk_context("vkCreateFence").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailure);
        assert!(err.to_string().starts_with("vkCreateFence failed"));
    }

    #[test]
    fn shader_read_is_not_found() {
        let err = RuntimeError::ShaderRead {
            path: PathBuf::from("shaders/missing.spv"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("shaders/missing.spv"));
    }
}
