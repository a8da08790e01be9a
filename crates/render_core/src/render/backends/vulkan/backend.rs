//! `GpuBackend` over an `ash` logical device
//!
//! The backend borrows a device created elsewhere (instance, surface and
//! swapchain setup are not its business) and submits to a single graphics
//! queue. It never destroys the device itself.

use ash::{vk, Device, Instance};

use super::conversions::{
    buffer_usage_flags, descriptor_pool_sizes, descriptor_type, find_memory_type, memory_properties,
    shader_stage_flags, DEFAULT_BUFFER_ALIGNMENT,
};
use crate::render::api::{
    BackendError, BackendResult, BufferCopy, BufferUsage, CommandBufferLevel, GpuBackend, InheritanceInfo,
    LayoutBinding,
};

/// Vulkan implementation of [`GpuBackend`]
pub struct VulkanBackend {
    device: Device,
    queue: vk::Queue,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
}

impl VulkanBackend {
    /// Wrap an existing device and its graphics queue
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: Device,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> Self {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;
        log::info!(
            "Vulkan backend on queue family {}: uniform alignment {}, storage alignment {}",
            queue_family_index,
            limits.min_uniform_buffer_offset_alignment,
            limits.min_storage_buffer_offset_alignment
        );

        Self {
            device,
            queue,
            queue_family_index,
            memory_properties,
            limits,
        }
    }

    /// Logical device the backend records and submits on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Graphics queue used for submissions
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    fn allocate_memory(&self, buffer: vk::Buffer, usage: BufferUsage) -> BackendResult<vk::DeviceMemory> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            memory_properties(usage),
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }?;

        if let Err(err) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe { self.device.free_memory(memory, None) };
            return Err(err.into());
        }
        Ok(memory)
    }
}

impl GpuBackend for VulkanBackend {
    type CommandPool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;
    type Fence = vk::Fence;
    type DescriptorPool = vk::DescriptorPool;
    type DescriptorSetLayout = vk::DescriptorSetLayout;
    type DescriptorSet = vk::DescriptorSet;
    type Buffer = vk::Buffer;
    type Memory = vk::DeviceMemory;
    type RenderPass = vk::RenderPass;
    type Framebuffer = vk::Framebuffer;

    fn create_command_pool(&self, thread_index: usize) -> BackendResult<Self::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family_index);

        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }?;
        log::trace!("vkCreateCommandPool for thread {}: {:?}", thread_index, pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: Self::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: Self::CommandPool,
        level: CommandBufferLevel,
    ) -> BackendResult<Self::CommandBuffer> {
        let level = match level {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        buffers
            .first()
            .copied()
            .ok_or_else(|| BackendError::Api("vkAllocateCommandBuffers returned no buffer".to_string()))
    }

    fn free_command_buffer(&self, pool: Self::CommandPool, buffer: Self::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) };
    }

    fn reset_command_buffer(&self, buffer: Self::CommandBuffer) -> BackendResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }?;
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: Self::CommandBuffer,
        inheritance: Option<InheritanceInfo<Self::RenderPass, Self::Framebuffer>>,
    ) -> BackendResult<()> {
        match inheritance {
            Some(target) => {
                let inheritance_info = vk::CommandBufferInheritanceInfo::builder()
                    .render_pass(target.render_pass)
                    .subpass(target.subpass)
                    .framebuffer(target.framebuffer);
                let begin_info = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
                    .inheritance_info(&inheritance_info);
                unsafe { self.device.begin_command_buffer(buffer, &begin_info) }?;
            }
            None => {
                let begin_info =
                    vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe { self.device.begin_command_buffer(buffer, &begin_info) }?;
            }
        }
        Ok(())
    }

    fn end_command_buffer(&self, buffer: Self::CommandBuffer) -> BackendResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }?;
        Ok(())
    }

    fn cmd_execute_commands(&self, primary: Self::CommandBuffer, secondaries: &[Self::CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        unsafe { self.device.cmd_execute_commands(primary, secondaries) };
    }

    fn cmd_copy_buffer(
        &self,
        buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[BufferCopy],
    ) {
        let regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect();
        unsafe { self.device.cmd_copy_buffer(buffer, src, dst, &regions) };
    }

    fn submit(&self, buffer: Self::CommandBuffer, fence: Self::Fence) -> BackendResult<()> {
        let command_buffers = [buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();

        unsafe {
            self.device.reset_fences(&[fence])?;
            self.device.queue_submit(self.queue, &[submit_info], fence)?;
        }
        Ok(())
    }

    fn queue_wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.queue_wait_idle(self.queue) }?;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<Self::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.device.create_fence(&fence_info, None) }?)
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_status(&self, fence: Self::Fence) -> BackendResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence) }?)
    }

    fn wait_for_fence(&self, fence: Self::Fence, timeout_ns: u64) -> BackendResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }?;
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        uniform_count: u32,
        sampler_count: u32,
        max_sets: u32,
    ) -> BackendResult<Self::DescriptorPool> {
        let pool_sizes = descriptor_pool_sizes(uniform_count, sampler_count);
        // Sets are reclaimed with their pool, never one by one
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        Ok(unsafe { self.device.create_descriptor_pool(&pool_info, None) }?)
    }

    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> BackendResult<Self::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(descriptor_type(binding.kind))
                    .descriptor_count(1)
                    .stage_flags(shader_stage_flags(binding.stages))
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        Ok(unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }?)
    }

    fn destroy_descriptor_set_layout(&self, layout: Self::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: Self::DescriptorPool,
        layout: Self::DescriptorSetLayout,
    ) -> BackendResult<Self::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }?;
        sets.first()
            .copied()
            .ok_or_else(|| BackendError::Api("vkAllocateDescriptorSets returned no set".to_string()))
    }

    fn update_uniform_descriptor(
        &self,
        set: Self::DescriptorSet,
        binding: u32,
        buffer: Self::Buffer,
        offset: u64,
        range: u64,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    fn create_buffer(&self, usage: BufferUsage, size: u64) -> BackendResult<(Self::Buffer, Self::Memory)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(buffer_usage_flags(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;

        match self.allocate_memory(buffer, usage) {
            Ok(memory) => Ok((buffer, memory)),
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(err)
            }
        }
    }

    fn destroy_buffer(&self, buffer: Self::Buffer, memory: Self::Memory) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
            self.device.free_memory(memory, None);
        }
    }

    fn buffer_alignment(&self, usage: BufferUsage) -> u64 {
        match usage {
            BufferUsage::Uniform => self.limits.min_uniform_buffer_offset_alignment,
            BufferUsage::Storage => self.limits.min_storage_buffer_offset_alignment,
            BufferUsage::Vertex | BufferUsage::Index | BufferUsage::Staging => DEFAULT_BUFFER_ALIGNMENT,
        }
        .max(1)
    }

    fn write_buffer(&self, memory: Self::Memory, offset: u64, data: &[u8]) -> BackendResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let mapped = self.device.map_memory(
                memory,
                offset,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }
}
