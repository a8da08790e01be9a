//! Backend implementations for the render module
//!
//! Vulkan drives real hardware; the headless backend simulates the device on
//! the CPU and is what the test suites run against.

/// Vulkan rendering backend implementation
pub mod vulkan;

/// CPU-only backend with manually signaled fences
pub mod headless;

pub use headless::HeadlessBackend;
pub use vulkan::VulkanBackend;
