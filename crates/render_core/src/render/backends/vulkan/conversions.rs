//! Translation between backend-neutral descriptions and Vulkan types

use ash::vk;

use crate::render::api::{BackendError, BufferUsage, DescriptorKind, ShaderStages};

/// Offset alignment for usage classes the device reports no limit for
pub const DEFAULT_BUFFER_ALIGNMENT: u64 = 16;

impl From<vk::Result> for BackendError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::TIMEOUT => Self::Timeout,
            other => Self::Api(format!("{other:?}")),
        }
    }
}

/// Buffer usage flags for an arena usage class
///
/// Device-local classes are filled through staging copies, so they also
/// accept transfers.
pub fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
    }
}

/// Memory properties required for an arena usage class
pub fn memory_properties(usage: BufferUsage) -> vk::MemoryPropertyFlags {
    if usage.is_host_visible() {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    }
}

pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::Sampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub fn shader_stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

/// Find memory type with required properties
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, BackendError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or_else(|| BackendError::Unsupported {
            reason: format!("no memory type with {properties:?} in filter {type_filter:#b}"),
        })
}

/// Pool sizes for a descriptor pool, leaving out empty descriptor types
pub fn descriptor_pool_sizes(uniform_count: u32, sampler_count: u32) -> Vec<vk::DescriptorPoolSize> {
    [
        (vk::DescriptorType::UNIFORM_BUFFER, uniform_count),
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, sampler_count),
    ]
    .into_iter()
    .filter(|&(_, count)| count > 0)
    .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        for (i, flags) in types.iter().enumerate() {
            properties.memory_types[i].property_flags = *flags;
        }
        properties.memory_type_count = types.len() as u32;
        properties
    }

    #[test]
    fn test_vk_result_conversion() {
        assert_eq!(
            BackendError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            BackendError::OutOfDeviceMemory
        );
        assert_eq!(BackendError::from(vk::Result::ERROR_DEVICE_LOST), BackendError::DeviceLost);
        assert_eq!(BackendError::from(vk::Result::TIMEOUT), BackendError::Timeout);
        assert!(matches!(
            BackendError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            BackendError::Api(_)
        ));
    }

    #[test]
    fn test_find_memory_type_respects_filter() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let memory = memory_with(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);

        assert_eq!(find_memory_type(&memory, 0b111, host), Ok(1));
        assert_eq!(find_memory_type(&memory, 0b100, host), Ok(2));
        assert_eq!(
            find_memory_type(&memory, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Ok(0)
        );
        assert!(find_memory_type(&memory, 0b001, host).is_err());
    }

    #[test]
    fn test_host_visibility_follows_usage() {
        assert!(memory_properties(BufferUsage::Staging).contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert_eq!(
            memory_properties(BufferUsage::Vertex),
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );
        assert!(buffer_usage_flags(BufferUsage::Index).contains(vk::BufferUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn test_pool_sizes_skip_empty_types() {
        let sizes = descriptor_pool_sizes(512, 0);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 512);
        assert_eq!(descriptor_pool_sizes(2, 3).len(), 2);
    }

    #[test]
    fn test_shader_stages() {
        assert_eq!(
            shader_stage_flags(ShaderStages::GRAPHICS),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(shader_stage_flags(ShaderStages::empty()), vk::ShaderStageFlags::empty());
    }
}
