//! Backend abstraction for the resource-management core
//!
//! The allocators above this trait only ever see opaque native handles. A
//! backend (Vulkan via `ash`, or the CPU-only headless backend used in
//! tests) creates, destroys and queries those objects.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported by backend implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Host allocation failed
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Device allocation failed
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// The device was lost; nothing submitted can be trusted anymore
    #[error("Device lost")]
    DeviceLost,

    /// A blocking wait ran out of time
    #[error("Timed out waiting on the device")]
    Timeout,

    /// The backend cannot perform the request
    #[error("Unsupported: {reason}")]
    Unsupported {
        /// What was asked for
        reason: String,
    },

    /// Any other API failure
    #[error("API error: {0}")]
    Api(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Usage class of a device buffer
///
/// The buffer arena keeps a separate set of backing buffers per class,
/// because alignment and memory placement differ between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferUsage {
    /// Uniform (constant) buffer data read by shaders
    Uniform,
    /// Vertex attribute data
    Vertex,
    /// Index data
    Index,
    /// Shader storage buffers
    Storage,
    /// Host-visible transfer source
    Staging,
}

impl BufferUsage {
    /// Every usage class
    pub const ALL: [Self; 5] = [Self::Uniform, Self::Vertex, Self::Index, Self::Storage, Self::Staging];

    /// Whether buffers of this class live in CPU-writable memory
    pub fn is_host_visible(self) -> bool {
        matches!(self, Self::Uniform | Self::Staging)
    }
}

/// Command buffer level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    /// Submitted directly to a queue
    Primary,
    /// Executed from within a primary buffer's render pass
    Secondary,
}

/// Kind of resource bound at a descriptor binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// Uniform buffer
    Uniform,
    /// Combined image sampler
    Sampler,
}

bitflags! {
    /// Shader stages that can see a descriptor binding
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        /// Vertex shader
        const VERTEX = 1 << 0;
        /// Fragment shader
        const FRAGMENT = 1 << 1;
        /// Compute shader
        const COMPUTE = 1 << 2;
        /// Vertex and fragment
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// One binding of a descriptor set layout description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    /// Binding index in the shader
    pub binding: u32,
    /// Resource kind
    pub kind: DescriptorKind,
    /// Stages that read the binding
    pub stages: ShaderStages,
}

impl LayoutBinding {
    /// Uniform buffer binding
    pub fn uniform(binding: u32, stages: ShaderStages) -> Self {
        Self { binding, kind: DescriptorKind::Uniform, stages }
    }

    /// Combined image sampler binding
    pub fn sampler(binding: u32, stages: ShaderStages) -> Self {
        Self { binding, kind: DescriptorKind::Sampler, stages }
    }
}

/// Render target a secondary command buffer records against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritanceInfo<R, F> {
    /// Render pass the secondary buffer executes inside
    pub render_pass: R,
    /// Framebuffer bound by the primary buffer
    pub framebuffer: F,
    /// Subpass index
    pub subpass: u32,
}

/// Inheritance info expressed in a backend's native types
pub type Inheritance<B> = InheritanceInfo<<B as GpuBackend>::RenderPass, <B as GpuBackend>::Framebuffer>;

/// Region of a buffer-to-buffer copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    /// Byte offset in the source buffer
    pub src_offset: u64,
    /// Byte offset in the destination buffer
    pub dst_offset: u64,
    /// Bytes to copy
    pub size: u64,
}

/// Native graphics API operations used by the resource-management core
///
/// Creation calls report failures through [`BackendResult`]; destruction
/// calls cannot fail. All native handles are plain copyable values whose
/// lifetime is managed by the caller.
pub trait GpuBackend {
    /// Command pool owning the command buffers of one recording thread
    type CommandPool: Copy + fmt::Debug + PartialEq;
    /// Command buffer
    type CommandBuffer: Copy + fmt::Debug + PartialEq;
    /// Host/device synchronization fence
    type Fence: Copy + fmt::Debug + PartialEq;
    /// Descriptor pool
    type DescriptorPool: Copy + fmt::Debug + PartialEq;
    /// Descriptor set layout
    type DescriptorSetLayout: Copy + fmt::Debug + PartialEq;
    /// Descriptor set
    type DescriptorSet: Copy + fmt::Debug + PartialEq;
    /// Device buffer
    type Buffer: Copy + fmt::Debug + PartialEq;
    /// Device memory block backing a buffer
    type Memory: Copy + fmt::Debug + PartialEq;
    /// Render pass referenced by secondary command buffers
    type RenderPass: Copy + fmt::Debug + PartialEq;
    /// Framebuffer referenced by secondary command buffers
    type Framebuffer: Copy + fmt::Debug + PartialEq;

    /// Create the command pool used by recording thread `thread_index`
    fn create_command_pool(&self, thread_index: usize) -> BackendResult<Self::CommandPool>;

    /// Destroy a command pool and every buffer still allocated from it
    fn destroy_command_pool(&self, pool: Self::CommandPool);

    /// Allocate one command buffer from `pool`
    fn allocate_command_buffer(
        &self,
        pool: Self::CommandPool,
        level: CommandBufferLevel,
    ) -> BackendResult<Self::CommandBuffer>;

    /// Return a command buffer to its pool
    fn free_command_buffer(&self, pool: Self::CommandPool, buffer: Self::CommandBuffer);

    /// Discard previously recorded commands
    fn reset_command_buffer(&self, buffer: Self::CommandBuffer) -> BackendResult<()>;

    /// Start recording; secondary buffers pass the render target they inherit
    fn begin_command_buffer(
        &self,
        buffer: Self::CommandBuffer,
        inheritance: Option<InheritanceInfo<Self::RenderPass, Self::Framebuffer>>,
    ) -> BackendResult<()>;

    /// Finish recording
    fn end_command_buffer(&self, buffer: Self::CommandBuffer) -> BackendResult<()>;

    /// Record execution of secondary buffers into a recording primary buffer
    fn cmd_execute_commands(&self, primary: Self::CommandBuffer, secondaries: &[Self::CommandBuffer]);

    /// Record a buffer-to-buffer copy
    fn cmd_copy_buffer(
        &self,
        buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[BufferCopy],
    );

    /// Reset `fence` and submit `buffer` to the graphics queue, signaling `fence` on completion
    fn submit(&self, buffer: Self::CommandBuffer, fence: Self::Fence) -> BackendResult<()>;

    /// Block until the graphics queue has drained
    fn queue_wait_idle(&self) -> BackendResult<()>;

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> BackendResult<Self::Fence>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: Self::Fence);

    /// Non-blocking check whether `fence` is signaled
    fn fence_status(&self, fence: Self::Fence) -> BackendResult<bool>;

    /// Block until `fence` is signaled or `timeout_ns` elapses
    fn wait_for_fence(&self, fence: Self::Fence, timeout_ns: u64) -> BackendResult<()>;

    /// Create a descriptor pool holding the given descriptor counts and set count
    fn create_descriptor_pool(
        &self,
        uniform_count: u32,
        sampler_count: u32,
        max_sets: u32,
    ) -> BackendResult<Self::DescriptorPool>;

    /// Destroy a descriptor pool and every set allocated from it
    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> BackendResult<Self::DescriptorSetLayout>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: Self::DescriptorSetLayout);

    /// Allocate a set with `layout` from `pool`
    fn allocate_descriptor_set(
        &self,
        pool: Self::DescriptorPool,
        layout: Self::DescriptorSetLayout,
    ) -> BackendResult<Self::DescriptorSet>;

    /// Point a uniform binding of `set` at a buffer range
    fn update_uniform_descriptor(
        &self,
        set: Self::DescriptorSet,
        binding: u32,
        buffer: Self::Buffer,
        offset: u64,
        range: u64,
    );

    /// Create a buffer of `size` bytes with memory bound at offset zero
    fn create_buffer(&self, usage: BufferUsage, size: u64) -> BackendResult<(Self::Buffer, Self::Memory)>;

    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, buffer: Self::Buffer, memory: Self::Memory);

    /// Offset alignment required for sub-ranges of buffers of this usage class
    fn buffer_alignment(&self, usage: BufferUsage) -> u64;

    /// Copy `data` into host-visible `memory` at `offset`
    fn write_buffer(&self, memory: Self::Memory, offset: u64, data: &[u8]) -> BackendResult<()>;
}
