// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash: the render graph owns the algorithms, these
// modules own the Vulkan object lifetimes.

pub mod buffer;
pub mod command;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::{AcquireStatus, PresentStatus, Swapchain};
pub use sync::FrameSync;
