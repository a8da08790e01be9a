//! CPU-only backend
//!
//! Simulates native objects in host memory so the resource-management core
//! can run without a GPU. Submitted work never completes on its own: a fence
//! stays unsignaled until [`HeadlessBackend::signal_fence`] or
//! [`HeadlessBackend::complete_all`] is called, or until something blocks on
//! the queue or the fence. Buffer copies recorded into a command buffer are
//! applied when it is submitted.

use crate::render::api::{
    BackendError, BackendResult, BufferCopy, BufferUsage, CommandBufferLevel, GpuBackend,
    InheritanceInfo, LayoutBinding,
};
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

new_key_type! {
    /// Simulated command pool
    pub struct HeadlessCommandPool;
    /// Simulated command buffer
    pub struct HeadlessCommandBuffer;
    /// Simulated fence
    pub struct HeadlessFence;
    /// Simulated descriptor pool
    pub struct HeadlessDescriptorPool;
    /// Simulated descriptor set layout
    pub struct HeadlessDescriptorSetLayout;
    /// Simulated descriptor set
    pub struct HeadlessDescriptorSet;
    /// Simulated buffer
    pub struct HeadlessBuffer;
    /// Simulated memory block
    pub struct HeadlessMemory;
}

/// Opaque render pass identifier for secondary inheritance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeadlessRenderPass(pub u32);

/// Opaque framebuffer identifier for secondary inheritance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeadlessFramebuffer(pub u32);

/// Creation call that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    /// `create_command_pool`
    CommandPool,
    /// `allocate_command_buffer`
    CommandBuffer,
    /// `create_fence`
    Fence,
    /// `create_descriptor_pool`
    DescriptorPool,
    /// `create_descriptor_set_layout`
    DescriptorSetLayout,
    /// `allocate_descriptor_set`
    DescriptorSet,
    /// `create_buffer`
    Buffer,
    /// `fence_status`
    FenceStatus,
    /// `queue_wait_idle`
    QueueWaitIdle,
}

/// Live object counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadlessStats {
    /// Command pools
    pub command_pools: usize,
    /// Command buffers
    pub command_buffers: usize,
    /// Fences
    pub fences: usize,
    /// Descriptor pools
    pub descriptor_pools: usize,
    /// Descriptor set layouts
    pub descriptor_set_layouts: usize,
    /// Descriptor sets
    pub descriptor_sets: usize,
    /// Buffers
    pub buffers: usize,
    /// Queue submissions so far
    pub submissions: u64,
    /// Queue idle waits so far
    pub queue_idle_waits: u64,
}

struct CommandBufferState {
    pool: HeadlessCommandPool,
    level: CommandBufferLevel,
    recording: bool,
    inheritance: Option<InheritanceInfo<HeadlessRenderPass, HeadlessFramebuffer>>,
    executed: Vec<HeadlessCommandBuffer>,
    copies: Vec<(HeadlessBuffer, HeadlessBuffer, BufferCopy)>,
}

#[derive(Clone, Copy)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

struct DescriptorPoolState {
    uniform_count: u32,
    sampler_count: u32,
    max_sets: u32,
    sets: u32,
}

struct BufferState {
    usage: BufferUsage,
    memory: HeadlessMemory,
}

#[derive(Default)]
struct State {
    command_pools: SlotMap<HeadlessCommandPool, usize>,
    command_buffers: SlotMap<HeadlessCommandBuffer, CommandBufferState>,
    fences: SlotMap<HeadlessFence, FenceState>,
    descriptor_pools: SlotMap<HeadlessDescriptorPool, DescriptorPoolState>,
    layouts: SlotMap<HeadlessDescriptorSetLayout, Vec<LayoutBinding>>,
    descriptor_sets: SlotMap<HeadlessDescriptorSet, HeadlessDescriptorPool>,
    uniform_bindings: HashMap<(HeadlessDescriptorSet, u32), (HeadlessBuffer, u64, u64)>,
    buffers: SlotMap<HeadlessBuffer, BufferState>,
    memory: SlotMap<HeadlessMemory, Vec<u8>>,
    failures: Vec<FailurePoint>,
    submissions: u64,
    queue_idle_waits: u64,
}

impl State {
    fn take_failure(&mut self, point: FailurePoint) -> BackendResult<()> {
        match self.failures.iter().position(|p| *p == point) {
            Some(index) => {
                self.failures.remove(index);
                Err(BackendError::OutOfDeviceMemory)
            }
            None => Ok(()),
        }
    }

    fn complete_pending(&mut self) {
        for fence in self.fences.values_mut().filter(|f| f.pending) {
            fence.signaled = true;
            fence.pending = false;
        }
    }
}

/// Backend that simulates the GPU on the host
pub struct HeadlessBackend {
    state: Mutex<State>,
    alignments: HashMap<BufferUsage, u64>,
}

impl HeadlessBackend {
    /// Create a backend with typical desktop alignments
    pub fn new() -> Self {
        let alignments = BufferUsage::ALL
            .into_iter()
            .map(|usage| {
                let alignment = match usage {
                    BufferUsage::Uniform => 256,
                    BufferUsage::Storage => 64,
                    _ => 16,
                };
                (usage, alignment)
            })
            .collect();

        Self {
            state: Mutex::new(State::default()),
            alignments,
        }
    }

    /// Override the sub-range alignment reported for `usage`
    pub fn with_alignment(mut self, usage: BufferUsage, alignment: u64) -> Self {
        self.alignments.insert(usage, alignment);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain bookkeeping behind; keep going.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next call at `point` fail with `OutOfDeviceMemory`
    pub fn fail_next(&self, point: FailurePoint) {
        self.state().failures.push(point);
    }

    /// Mark the work guarded by `fence` as finished
    pub fn signal_fence(&self, fence: HeadlessFence) {
        if let Some(state) = self.state().fences.get_mut(fence) {
            state.signaled = true;
            state.pending = false;
        }
    }

    /// Finish every submission still in flight
    pub fn complete_all(&self) {
        self.state().complete_pending();
    }

    /// Whether `fence` exists and is signaled
    pub fn is_signaled(&self, fence: HeadlessFence) -> bool {
        self.state().fences.get(fence).is_some_and(|f| f.signaled)
    }

    /// Whether `buffer` is still allocated
    pub fn command_buffer_exists(&self, buffer: HeadlessCommandBuffer) -> bool {
        self.state().command_buffers.contains_key(buffer)
    }

    /// Whether `buffer` is currently recording
    pub fn is_recording(&self, buffer: HeadlessCommandBuffer) -> bool {
        self.state().command_buffers.get(buffer).is_some_and(|cb| cb.recording)
    }

    /// Inheritance info `buffer` was last begun with
    pub fn inheritance(
        &self,
        buffer: HeadlessCommandBuffer,
    ) -> Option<InheritanceInfo<HeadlessRenderPass, HeadlessFramebuffer>> {
        self.state().command_buffers.get(buffer).and_then(|cb| cb.inheritance)
    }

    /// Secondary buffers recorded into `primary`
    pub fn executed_secondaries(&self, primary: HeadlessCommandBuffer) -> Vec<HeadlessCommandBuffer> {
        self.state()
            .command_buffers
            .get(primary)
            .map(|cb| cb.executed.clone())
            .unwrap_or_default()
    }

    /// Capacity `(uniform, sampler, max_sets)` of a descriptor pool
    pub fn descriptor_pool_capacity(&self, pool: HeadlessDescriptorPool) -> Option<(u32, u32, u32)> {
        self.state()
            .descriptor_pools
            .get(pool)
            .map(|p| (p.uniform_count, p.sampler_count, p.max_sets))
    }

    /// Buffer range a uniform binding points at
    pub fn uniform_binding(&self, set: HeadlessDescriptorSet, binding: u32) -> Option<(HeadlessBuffer, u64, u64)> {
        self.state().uniform_bindings.get(&(set, binding)).copied()
    }

    /// Read back `len` bytes of `buffer` starting at `offset`
    pub fn read_buffer(&self, buffer: HeadlessBuffer, offset: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state();
        let memory = state.buffers.get(buffer)?.memory;
        let bytes = state.memory.get(memory)?;
        let start = usize::try_from(offset).ok()?;
        bytes.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Usage class `buffer` was created with
    pub fn buffer_usage(&self, buffer: HeadlessBuffer) -> Option<BufferUsage> {
        self.state().buffers.get(buffer).map(|b| b.usage)
    }

    /// Live object counts
    pub fn stats(&self) -> HeadlessStats {
        let state = self.state();
        HeadlessStats {
            command_pools: state.command_pools.len(),
            command_buffers: state.command_buffers.len(),
            fences: state.fences.len(),
            descriptor_pools: state.descriptor_pools.len(),
            descriptor_set_layouts: state.layouts.len(),
            descriptor_sets: state.descriptor_sets.len(),
            buffers: state.buffers.len(),
            submissions: state.submissions,
            queue_idle_waits: state.queue_idle_waits,
        }
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(what: &str) -> BackendError {
    BackendError::Api(format!("unknown {what}"))
}

impl GpuBackend for HeadlessBackend {
    type CommandPool = HeadlessCommandPool;
    type CommandBuffer = HeadlessCommandBuffer;
    type Fence = HeadlessFence;
    type DescriptorPool = HeadlessDescriptorPool;
    type DescriptorSetLayout = HeadlessDescriptorSetLayout;
    type DescriptorSet = HeadlessDescriptorSet;
    type Buffer = HeadlessBuffer;
    type Memory = HeadlessMemory;
    type RenderPass = HeadlessRenderPass;
    type Framebuffer = HeadlessFramebuffer;

    fn create_command_pool(&self, thread_index: usize) -> BackendResult<Self::CommandPool> {
        let mut state = self.state();
        state.take_failure(FailurePoint::CommandPool)?;
        Ok(state.command_pools.insert(thread_index))
    }

    fn destroy_command_pool(&self, pool: Self::CommandPool) {
        let mut state = self.state();
        state.command_pools.remove(pool);
        state.command_buffers.retain(|_, cb| cb.pool != pool);
    }

    fn allocate_command_buffer(
        &self,
        pool: Self::CommandPool,
        level: CommandBufferLevel,
    ) -> BackendResult<Self::CommandBuffer> {
        let mut state = self.state();
        state.take_failure(FailurePoint::CommandBuffer)?;
        if !state.command_pools.contains_key(pool) {
            return Err(missing("command pool"));
        }
        Ok(state.command_buffers.insert(CommandBufferState {
            pool,
            level,
            recording: false,
            inheritance: None,
            executed: Vec::new(),
            copies: Vec::new(),
        }))
    }

    fn free_command_buffer(&self, _pool: Self::CommandPool, buffer: Self::CommandBuffer) {
        self.state().command_buffers.remove(buffer);
    }

    fn reset_command_buffer(&self, buffer: Self::CommandBuffer) -> BackendResult<()> {
        let mut state = self.state();
        let cb = state.command_buffers.get_mut(buffer).ok_or_else(|| missing("command buffer"))?;
        cb.recording = false;
        cb.inheritance = None;
        cb.executed.clear();
        cb.copies.clear();
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: Self::CommandBuffer,
        inheritance: Option<InheritanceInfo<Self::RenderPass, Self::Framebuffer>>,
    ) -> BackendResult<()> {
        let mut state = self.state();
        let cb = state.command_buffers.get_mut(buffer).ok_or_else(|| missing("command buffer"))?;
        if cb.level == CommandBufferLevel::Secondary && inheritance.is_none() {
            return Err(BackendError::Api("secondary buffer begun without inheritance".to_string()));
        }
        cb.recording = true;
        cb.inheritance = inheritance;
        Ok(())
    }

    fn end_command_buffer(&self, buffer: Self::CommandBuffer) -> BackendResult<()> {
        let mut state = self.state();
        let cb = state.command_buffers.get_mut(buffer).ok_or_else(|| missing("command buffer"))?;
        if !cb.recording {
            return Err(BackendError::Api("command buffer is not recording".to_string()));
        }
        cb.recording = false;
        Ok(())
    }

    fn cmd_execute_commands(&self, primary: Self::CommandBuffer, secondaries: &[Self::CommandBuffer]) {
        if let Some(cb) = self.state().command_buffers.get_mut(primary) {
            cb.executed.extend_from_slice(secondaries);
        }
    }

    fn cmd_copy_buffer(
        &self,
        buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[BufferCopy],
    ) {
        if let Some(cb) = self.state().command_buffers.get_mut(buffer) {
            cb.copies.extend(regions.iter().map(|region| (src, dst, *region)));
        }
    }

    fn submit(&self, buffer: Self::CommandBuffer, fence: Self::Fence) -> BackendResult<()> {
        let mut state = self.state();
        let cb = state.command_buffers.get(buffer).ok_or_else(|| missing("command buffer"))?;
        if cb.recording {
            return Err(BackendError::Api("submitted a command buffer that is still recording".to_string()));
        }
        let copies = cb.copies.clone();

        let fence_state = state.fences.get_mut(fence).ok_or_else(|| missing("fence"))?;
        fence_state.signaled = false;
        fence_state.pending = true;

        for (src, dst, region) in copies {
            let src_memory = state.buffers.get(src).ok_or_else(|| missing("buffer"))?.memory;
            let dst_memory = state.buffers.get(dst).ok_or_else(|| missing("buffer"))?.memory;
            let start = region.src_offset as usize;
            let bytes = state
                .memory
                .get(src_memory)
                .and_then(|m| m.get(start..start + region.size as usize))
                .ok_or_else(|| BackendError::Api("copy source out of range".to_string()))?
                .to_vec();
            let start = region.dst_offset as usize;
            state
                .memory
                .get_mut(dst_memory)
                .and_then(|m| m.get_mut(start..start + bytes.len()))
                .ok_or_else(|| BackendError::Api("copy destination out of range".to_string()))?
                .copy_from_slice(&bytes);
        }

        state.submissions += 1;
        Ok(())
    }

    fn queue_wait_idle(&self) -> BackendResult<()> {
        let mut state = self.state();
        state.take_failure(FailurePoint::QueueWaitIdle).map_err(|_| BackendError::DeviceLost)?;
        state.queue_idle_waits += 1;
        state.complete_pending();
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<Self::Fence> {
        let mut state = self.state();
        state.take_failure(FailurePoint::Fence)?;
        Ok(state.fences.insert(FenceState { signaled, pending: false }))
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        self.state().fences.remove(fence);
    }

    fn fence_status(&self, fence: Self::Fence) -> BackendResult<bool> {
        let mut state = self.state();
        state.take_failure(FailurePoint::FenceStatus).map_err(|_| BackendError::DeviceLost)?;
        state.fences.get(fence).map(|f| f.signaled).ok_or_else(|| missing("fence"))
    }

    fn wait_for_fence(&self, fence: Self::Fence, _timeout_ns: u64) -> BackendResult<()> {
        let mut state = self.state();
        let fence_state = state.fences.get_mut(fence).ok_or_else(|| missing("fence"))?;
        if fence_state.pending {
            fence_state.signaled = true;
            fence_state.pending = false;
        }
        if fence_state.signaled {
            Ok(())
        } else {
            Err(BackendError::Timeout)
        }
    }

    fn create_descriptor_pool(
        &self,
        uniform_count: u32,
        sampler_count: u32,
        max_sets: u32,
    ) -> BackendResult<Self::DescriptorPool> {
        let mut state = self.state();
        state.take_failure(FailurePoint::DescriptorPool)?;
        Ok(state.descriptor_pools.insert(DescriptorPoolState {
            uniform_count,
            sampler_count,
            max_sets,
            sets: 0,
        }))
    }

    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool) {
        let mut guard = self.state();
        let state = &mut *guard;
        state.descriptor_pools.remove(pool);
        state.descriptor_sets.retain(|_, owner| *owner != pool);
        let sets = &state.descriptor_sets;
        state.uniform_bindings.retain(|(set, _), _| sets.contains_key(*set));
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> BackendResult<Self::DescriptorSetLayout> {
        let mut state = self.state();
        state.take_failure(FailurePoint::DescriptorSetLayout)?;
        Ok(state.layouts.insert(bindings.to_vec()))
    }

    fn destroy_descriptor_set_layout(&self, layout: Self::DescriptorSetLayout) {
        self.state().layouts.remove(layout);
    }

    fn allocate_descriptor_set(
        &self,
        pool: Self::DescriptorPool,
        layout: Self::DescriptorSetLayout,
    ) -> BackendResult<Self::DescriptorSet> {
        let mut state = self.state();
        state.take_failure(FailurePoint::DescriptorSet)?;
        if !state.layouts.contains_key(layout) {
            return Err(missing("descriptor set layout"));
        }
        let pool_state = state.descriptor_pools.get_mut(pool).ok_or_else(|| missing("descriptor pool"))?;
        if pool_state.sets >= pool_state.max_sets {
            return Err(BackendError::OutOfDeviceMemory);
        }
        pool_state.sets += 1;
        Ok(state.descriptor_sets.insert(pool))
    }

    fn update_uniform_descriptor(
        &self,
        set: Self::DescriptorSet,
        binding: u32,
        buffer: Self::Buffer,
        offset: u64,
        range: u64,
    ) {
        self.state().uniform_bindings.insert((set, binding), (buffer, offset, range));
    }

    fn create_buffer(&self, usage: BufferUsage, size: u64) -> BackendResult<(Self::Buffer, Self::Memory)> {
        let mut state = self.state();
        state.take_failure(FailurePoint::Buffer)?;
        let len = usize::try_from(size).map_err(|_| BackendError::OutOfHostMemory)?;
        let memory = state.memory.insert(vec![0; len]);
        let buffer = state.buffers.insert(BufferState { usage, memory });
        Ok((buffer, memory))
    }

    fn destroy_buffer(&self, buffer: Self::Buffer, memory: Self::Memory) {
        let mut state = self.state();
        state.buffers.remove(buffer);
        state.memory.remove(memory);
    }

    fn buffer_alignment(&self, usage: BufferUsage) -> u64 {
        self.alignments.get(&usage).copied().unwrap_or(1)
    }

    fn write_buffer(&self, memory: Self::Memory, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state();
        let bytes = state.memory.get_mut(memory).ok_or_else(|| missing("memory"))?;
        let start = usize::try_from(offset).map_err(|_| BackendError::OutOfHostMemory)?;
        bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| BackendError::Api("write out of range".to_string()))?
            .copy_from_slice(data);
        Ok(())
    }
}
