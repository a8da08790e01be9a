//! Vulkan backend
//!
//! Implements [`GpuBackend`](crate::render::api::GpuBackend) with `ash`.
//! Native handles are the raw `vk` handle types, so they can be handed to
//! other Vulkan code (pipelines, render passes) without conversion.

mod backend;
mod conversions;

pub use backend::VulkanBackend;
