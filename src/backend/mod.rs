// Backend module - Vulkan resource and command runtime
//
// Design: thin wrapper around ash. The runtime owns the device; everything
// else borrows it and releases its own handles on drop.

pub mod barrier;
pub mod buffer;
pub mod device;
pub mod diagnostics;
pub mod memory;
pub mod pipeline;
pub mod runtime;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{Buffer, BufferDevice};
pub use diagnostics::{DeviceReport, MatrixConfiguration};
pub use runtime::{CommandSequence, VulkanRuntime};
pub use shader::ShaderStage;
pub use swapchain::{ImageViewDevice, Swapchain, SwapchainStatus};
