//! Device memory selection and binding.
//!
//! One allocation per resource: each buffer or image gets its own
//! `vk::DeviceMemory` block, chosen by the first memory type whose property
//! flags cover the requested set.

use crate::error::{GpuError, Result};
use ash::vk;

/// Where a resource's memory lives and how the host may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Mappable memory for staging and per-frame uniform data.
    HostVisible,
    /// Device-local memory, populated through staging copies.
    DeviceLocal,
}

impl MemoryLocation {
    /// The property flags a memory type must cover for this location.
    pub fn property_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            Self::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }
}

/// Find the first memory type compatible with `type_bits` whose property
/// flags are a superset of `required`.
pub fn find_memory_type_index(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(index, _)| index as u32)
}

/// Allocate memory for a buffer and bind it.
///
/// # Safety
/// The device and buffer must be valid.
pub(crate) unsafe fn allocate_buffer_memory(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    buffer: vk::Buffer,
    location: MemoryLocation,
) -> Result<vk::DeviceMemory> {
    let requirements = device.get_buffer_memory_requirements(buffer);
    let memory = allocate(device, memory_properties, &requirements, location)?;
    device.bind_buffer_memory(buffer, memory, 0)?;
    Ok(memory)
}

/// Allocate memory for an image and bind it.
///
/// # Safety
/// The device and image must be valid.
pub(crate) unsafe fn allocate_image_memory(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    image: vk::Image,
    location: MemoryLocation,
) -> Result<vk::DeviceMemory> {
    let requirements = device.get_image_memory_requirements(image);
    let memory = allocate(device, memory_properties, &requirements, location)?;
    device.bind_image_memory(image, memory, 0)?;
    Ok(memory)
}

unsafe fn allocate(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
    location: MemoryLocation,
) -> Result<vk::DeviceMemory> {
    let type_index = find_memory_type_index(
        memory_properties,
        requirements.memory_type_bits,
        location.property_flags(),
    )
    .ok_or(GpuError::NoCompatibleMemoryType)?;

    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);

    let memory = device.allocate_memory(&allocate_info, None)?;
    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            properties.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        properties
    }

    #[test]
    fn picks_first_superset_match() {
        let properties = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        let index = find_memory_type_index(
            &properties,
            0b111,
            MemoryLocation::HostVisible.property_flags(),
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn respects_type_bits() {
        let properties = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        // Type 0 excluded by the resource's compatibility mask.
        let index = find_memory_type_index(
            &properties,
            0b10,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn no_match_yields_none() {
        let properties = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let index = find_memory_type_index(
            &properties,
            0b1,
            MemoryLocation::HostVisible.property_flags(),
        );
        assert_eq!(index, None);
    }

    #[test]
    fn superset_is_accepted() {
        // A type carrying more flags than requested still qualifies.
        let properties = properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let index = find_memory_type_index(
            &properties,
            0b1,
            MemoryLocation::HostVisible.property_flags(),
        );
        assert_eq!(index, Some(0));
    }
}
