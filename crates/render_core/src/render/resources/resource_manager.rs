//! Owner of the resource-management core
//!
//! Bundles a backend with the buffer arena, descriptor allocator and command
//! buffer manager, and tracks the frame slot counter. Several managers can
//! coexist, each with its own backend.

use bytemuck::Pod;

use crate::config::{ConfigError, ResourceConfig};
use crate::render::api::{BufferCopy, BufferUsage, GpuBackend, Inheritance, LayoutBinding};
use crate::render::resources::buffer_arena::{ArenaStats, BufferArena, BufferRange};
use crate::render::resources::command_buffers::{
    CommandBufferHandle, CommandBufferManager, CommandBufferState, DestroyOutcome,
};
use crate::render::resources::descriptor_allocator::{DescriptorAllocator, DescriptorLayout, DescriptorSet};
use crate::render::resources::error::{ResourceError, ResourceResult};

/// Thread index used for one-shot transfers
const TRANSFER_THREAD: usize = 0;

/// Backend plus every resource allocator built on top of it
pub struct ResourceManager<B: GpuBackend> {
    backend: B,
    config: ResourceConfig,
    arena: BufferArena<B>,
    descriptors: DescriptorAllocator<B>,
    command_buffers: CommandBufferManager<B>,
    frame_index: usize,
}

impl<B: GpuBackend> ResourceManager<B> {
    /// Validate `config` and build an empty manager over `backend`
    pub fn new(backend: B, config: ResourceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        log::info!(
            "Resource manager: {} recording threads, {} frames in flight",
            config.max_threads,
            config.frames_in_flight
        );

        Ok(Self {
            arena: BufferArena::new(config.arena.clone()),
            descriptors: DescriptorAllocator::new(config.descriptor_pool_multiplier),
            command_buffers: CommandBufferManager::new(
                config.max_threads,
                config.handle_growth_chunk,
                config.max_handle_slots,
            ),
            backend,
            config,
            frame_index: 0,
        })
    }

    /// Backend the manager drives
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Settings the manager was built with
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Buffer arena
    pub fn arena(&self) -> &BufferArena<B> {
        &self.arena
    }

    /// Descriptor budget allocator
    pub fn descriptors(&self) -> &DescriptorAllocator<B> {
        &self.descriptors
    }

    /// Command buffer manager
    pub fn command_buffers(&self) -> &CommandBufferManager<B> {
        &self.command_buffers
    }

    /// Current frame slot, in `0..frames_in_flight`
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Move to the next frame slot and return it
    pub fn advance_frame(&mut self) -> usize {
        self.frame_index = (self.frame_index + 1) % self.config.frames_in_flight;
        self.frame_index
    }

    /// Per-frame bookkeeping: reclaim signaled destructions, then advance the frame slot
    ///
    /// Returns the number of command buffers reclaimed.
    pub fn end_frame(&mut self) -> ResourceResult<usize> {
        let reclaimed = self.command_buffers.poll_destructions(&self.backend)?;
        self.advance_frame();
        Ok(reclaimed)
    }

    // Buffer arena

    /// Reserve `size` bytes of `usage` storage from the arena
    pub fn get_range(&mut self, usage: BufferUsage, size: u64) -> ResourceResult<BufferRange<B>> {
        self.arena.get_range(&self.backend, usage, size)
    }

    /// Copy bytes into a host-visible range
    pub fn write_range(&self, range: &BufferRange<B>, data: &[u8]) -> ResourceResult<()> {
        self.arena.write(&self.backend, range, data)
    }

    /// Copy a plain-old-data value into a host-visible range
    pub fn write_pod<T: Pod>(&self, range: &BufferRange<B>, value: &T) -> ResourceResult<()> {
        self.arena.write_pod(&self.backend, range, value)
    }

    /// Arena occupancy of `usage`
    pub fn arena_stats(&self, usage: BufferUsage) -> ArenaStats {
        self.arena.stats(usage)
    }

    /// Copy `src` into `dst` on the GPU and block until the copy has finished
    ///
    /// Records a throwaway primary buffer on the transfer thread's pool. Meant
    /// for uploads at load time, not for per-frame traffic.
    pub fn copy_buffer(&mut self, src: &BufferRange<B>, dst: &BufferRange<B>) -> ResourceResult<()> {
        if src.size > dst.size {
            return Err(ResourceError::precondition(format!(
                "copy of {} bytes into a {} byte range",
                src.size, dst.size
            )));
        }
        let region = BufferCopy {
            src_offset: src.offset,
            dst_offset: dst.offset,
            size: src.size,
        };

        let handle = self.command_buffers.create_primary(&self.backend, TRANSFER_THREAD)?;
        let copied = self.submit_copy(handle, src.buffer, dst.buffer, region);
        // Destroy even when the copy failed; this ends any open recording
        let destroyed = self.command_buffers.destroy(&self.backend, handle);
        copied?;
        destroyed?;
        Ok(())
    }

    fn submit_copy(
        &mut self,
        handle: CommandBufferHandle,
        src: B::Buffer,
        dst: B::Buffer,
        region: BufferCopy,
    ) -> ResourceResult<()> {
        self.command_buffers.begin(&self.backend, handle)?;
        let native = self.command_buffers.native(handle)?;
        self.backend.cmd_copy_buffer(native, src, dst, &[region]);
        self.command_buffers.end(&self.backend, handle)?;
        self.command_buffers.submit(&self.backend, handle)?;
        self.command_buffers.wait(&self.backend, handle, self.config.fence_timeout_ns)
    }

    // Descriptors

    /// Debit descriptor budget; see [`DescriptorAllocator::acquire_pool`]
    pub fn acquire_descriptor_pool(&mut self, uniform_count: u32, sampler_count: u32) -> ResourceResult<usize> {
        self.descriptors.acquire_pool(&self.backend, uniform_count, sampler_count)
    }

    /// Return one budget charge to pool `index`
    pub fn release_descriptor_pool(&mut self, index: usize) -> ResourceResult<()> {
        self.descriptors.release_pool(&self.backend, index)
    }

    /// Build a descriptor set layout
    pub fn create_layout(&self, bindings: &[LayoutBinding]) -> ResourceResult<DescriptorLayout<B>> {
        self.descriptors.create_layout(&self.backend, bindings)
    }

    /// Destroy a descriptor set layout
    pub fn destroy_layout(&self, layout: DescriptorLayout<B>) {
        self.descriptors.destroy_layout(&self.backend, layout)
    }

    /// Allocate a descriptor set shaped by `layout`
    pub fn allocate_set(&mut self, layout: &DescriptorLayout<B>) -> ResourceResult<DescriptorSet<B>> {
        self.descriptors.allocate_set(&self.backend, layout)
    }

    /// One set per frame slot, so each slot can be updated while the others are in flight
    pub fn allocate_frame_sets(&mut self, layout: &DescriptorLayout<B>) -> ResourceResult<Vec<DescriptorSet<B>>> {
        let mut sets = Vec::with_capacity(self.config.frames_in_flight);
        for _ in 0..self.config.frames_in_flight {
            match self.descriptors.allocate_set(&self.backend, layout) {
                Ok(set) => sets.push(set),
                Err(err) => {
                    for set in sets {
                        self.descriptors.free_set(&self.backend, set)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(sets)
    }

    /// Release a descriptor set's budget charge
    pub fn free_set(&mut self, set: DescriptorSet<B>) -> ResourceResult<()> {
        self.descriptors.free_set(&self.backend, set)
    }

    /// Point uniform `binding` of `set` at an arena range
    pub fn write_uniform(&self, set: &DescriptorSet<B>, binding: u32, range: &BufferRange<B>) -> ResourceResult<()> {
        self.descriptors.write_uniform(&self.backend, set, binding, range)
    }

    // Command buffers

    /// Allocate a primary command buffer on `thread_index`
    pub fn create_primary(&mut self, thread_index: usize) -> ResourceResult<CommandBufferHandle> {
        self.command_buffers.create_primary(&self.backend, thread_index)
    }

    /// Allocate a secondary command buffer executed by `primary`
    pub fn create_secondary(
        &mut self,
        thread_index: usize,
        primary: CommandBufferHandle,
        inheritance: Inheritance<B>,
    ) -> ResourceResult<CommandBufferHandle> {
        self.command_buffers
            .create_secondary(&self.backend, thread_index, primary, inheritance)
    }

    /// Reset and start recording
    pub fn begin(&mut self, handle: CommandBufferHandle) -> ResourceResult<()> {
        self.command_buffers.begin(&self.backend, handle)
    }

    /// Finish recording
    pub fn end(&mut self, handle: CommandBufferHandle) -> ResourceResult<()> {
        self.command_buffers.end(&self.backend, handle)
    }

    /// Record execution of recorded secondaries into a recording primary
    pub fn execute_secondary(
        &self,
        primary: CommandBufferHandle,
        secondaries: &[CommandBufferHandle],
    ) -> ResourceResult<()> {
        self.command_buffers
            .execute_secondary(&self.backend, primary, secondaries)
    }

    /// Submit a recorded primary buffer
    pub fn submit(&mut self, handle: CommandBufferHandle) -> ResourceResult<()> {
        self.command_buffers.submit(&self.backend, handle)
    }

    /// Destroy a command buffer, deferring while its fence is unsignaled
    pub fn destroy(&mut self, handle: CommandBufferHandle) -> ResourceResult<DestroyOutcome> {
        self.command_buffers.destroy(&self.backend, handle)
    }

    /// Reclaim queued command buffers whose fence has signaled
    pub fn poll_destructions(&mut self) -> ResourceResult<usize> {
        self.command_buffers.poll_destructions(&self.backend)
    }

    /// Lifecycle state of a command buffer
    pub fn status(&self, handle: CommandBufferHandle) -> ResourceResult<CommandBufferState> {
        self.command_buffers.status(&self.backend, handle)
    }

    /// Native command buffer for recording commands through the backend
    pub fn native_command_buffer(&self, handle: CommandBufferHandle) -> ResourceResult<B::CommandBuffer> {
        self.command_buffers.native(handle)
    }

    /// Block on the fence guarding `handle`, using the configured timeout
    ///
    /// This is the frames-in-flight wait: call it on a slot's previous primary
    /// buffer before touching that slot's resources again.
    pub fn wait(&self, handle: CommandBufferHandle) -> ResourceResult<()> {
        self.command_buffers
            .wait(&self.backend, handle, self.config.fence_timeout_ns)
    }

    /// Tear everything down in dependency order
    ///
    /// Waits for the queue, reclaims every pending destruction, then destroys
    /// arena buffers, descriptor pools and command pools. Fails if command
    /// buffers that were never destroyed are still alive.
    pub fn shutdown(&mut self) -> ResourceResult<()> {
        self.backend.queue_wait_idle()?;
        self.command_buffers.poll_destructions(&self.backend)?;

        self.arena.destroy_all(&self.backend);
        self.descriptors.destroy_all(&self.backend);
        self.command_buffers.destroy_all_pools(&self.backend)?;
        log::info!("Resource manager shut down");
        Ok(())
    }
}
