//! Resource management
//!
//! Lifetime management for short-lived GPU objects: a linear buffer arena,
//! a budget-tracked descriptor pool allocator and a command buffer manager
//! with fence-gated deferred destruction, tied together by
//! [`ResourceManager`].

pub mod buffer_arena;
pub mod command_buffers;
pub mod descriptor_allocator;
pub mod error;
pub mod resource_manager;

pub use buffer_arena::{ArenaStats, BufferArena, BufferRange};
pub use command_buffers::{
    CommandBufferHandle, CommandBufferKind, CommandBufferManager, CommandBufferState, DestroyOutcome,
};
pub use descriptor_allocator::{
    DescriptorAllocator, DescriptorLayout, DescriptorPoolStats, DescriptorSet, DescriptorSetKind,
};
pub use error::{ResourceError, ResourceResult};
pub use resource_manager::ResourceManager;
