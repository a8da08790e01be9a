//! Public backend API
//!
//! The trait every graphics backend implements plus the backend-neutral
//! descriptions passed across it.

pub mod gpu_backend;

// Re-export commonly used types
pub use gpu_backend::{
    BackendError, BackendResult, BufferCopy, BufferUsage, CommandBufferLevel, DescriptorKind,
    GpuBackend, Inheritance, InheritanceInfo, LayoutBinding, ShaderStages,
};
