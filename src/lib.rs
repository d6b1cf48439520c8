//! Vulkan resource and command runtime.
//!
//! [`VulkanRuntime`] selects a device, owns the single queue and command
//! pool, and hands out buffers, swapchains and one-shot command sequences
//! that borrow it.

pub mod backend;
pub mod config;
pub mod error;

pub use backend::{
    Buffer, CommandSequence, DeviceReport, MatrixConfiguration, ShaderStage, Swapchain,
    SwapchainStatus, VulkanRuntime,
};
pub use error::{ErrorKind, Result, RuntimeError};
