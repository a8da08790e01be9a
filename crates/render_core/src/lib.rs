//! # Render Core
//!
//! GPU resource lifecycle management for an explicit graphics API.
//!
//! ## Features
//!
//! - **Typed handles**: generation-checked handles that refuse stale references and double frees
//! - **Buffer arena**: aligned bump allocation of device buffer ranges per usage class
//! - **Descriptor budgets**: pooled descriptor allocation with pool-granularity reclamation
//! - **Command buffers**: per-thread pools and fence-gated deferred destruction
//! - **Backends**: Vulkan through `ash`, plus a headless backend for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut resources = ResourceManager::new(HeadlessBackend::new(), ResourceConfig::default())?;
//!
//!     let primary = resources.create_primary(0)?;
//!     resources.begin(primary)?;
//!     resources.end(primary)?;
//!     resources.submit(primary)?;
//!
//!     // Still in flight, so the buffer is queued instead of freed
//!     assert_eq!(resources.destroy(primary)?, DestroyOutcome::Deferred);
//!
//!     resources.backend().complete_all();
//!     assert_eq!(resources.end_frame()?, 1);
//!     resources.shutdown()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{ArenaConfig, Config, ConfigError, ResourceConfig},
        foundation::collections::{Handle, HandleError, HandlePool},
        render::{
            api::{
                BackendError, BufferUsage, CommandBufferLevel, DescriptorKind, GpuBackend, InheritanceInfo,
                LayoutBinding, ShaderStages,
            },
            backends::{HeadlessBackend, VulkanBackend},
            resources::{
                BufferRange, CommandBufferHandle, CommandBufferState, DescriptorLayout, DescriptorSet,
                DestroyOutcome, ResourceError, ResourceManager, ResourceResult,
            },
        },
    };
}
