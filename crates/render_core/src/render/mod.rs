//! # Rendering System
//!
//! GPU resource lifecycle management over an explicit graphics API.
//!
//! ## Architecture
//!
//! - **API**: the [`GpuBackend`](api::GpuBackend) trait and the backend-neutral
//!   descriptions passed through it
//! - **Backends**: Vulkan (`ash`) and a headless CPU simulation
//! - **Resources**: buffer arena, descriptor allocator, command buffer manager
//!
//! Scene management, pipelines and the frame loop live elsewhere and talk to
//! this module through [`ResourceManager`].

pub mod api;

/// Graphics backend implementations
pub mod backends;

pub mod resources;


pub use api::{BackendError, BackendResult, BufferUsage, GpuBackend};
pub use resources::{ResourceError, ResourceManager, ResourceResult};
