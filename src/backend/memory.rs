// Memory type resolution
//
// Every allocation must be typed against one of the device's memory types.
// The resolver picks the first type allowed by the resource's type mask
// whose property flags contain all the requested ones.

use crate::error::{Result, RuntimeError};
use ash::vk;

/// Find a memory type index, or `None` if no type satisfies the request.
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count).find(|&i| {
        let allowed = type_bits & (1 << i) != 0;
        allowed
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// Same search, but absence is an error naming what was asked for.
pub fn resolve_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    find_memory_type_index(memory_properties, type_bits, required).ok_or_else(|| {
        RuntimeError::NotFound(format!(
            "memory type with {:?} in type mask {:#b}",
            required, type_bits
        ))
    })
}

#[cfg(test)]
pub(crate) fn synthetic_memory_properties(
    flags: &[vk::MemoryPropertyFlags],
) -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties::default();
    properties.memory_type_count = flags.len() as u32;
    properties.memory_heap_count = 1;
    for (i, &property_flags) in flags.iter().enumerate() {
        properties.memory_types[i] = vk::MemoryType {
            property_flags,
            heap_index: 0,
        };
    }
    properties
}
