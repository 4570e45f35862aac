//! Device-memory allocation.
//!
//! Allocations are dedicated: one `VkDeviceMemory` per buffer or image.
//! The render core allocates at init and resize time, so sub-allocation
//! machinery would buy nothing here.

use std::ptr::NonNull;

use ash::vk;

use kiln_core::RenderError;

use crate::device::Device;

/// A bound device-memory allocation, optionally persistently mapped.
pub struct Allocation {
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<NonNull<u8>>,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Allocation")
            .field("size", &self.size)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

// The mapped pointer is only written from the recording thread.
unsafe impl Send for Allocation {}

impl Allocation {
    /// Allocate memory satisfying `requirements` with the given properties,
    /// optionally mapping it persistently.
    pub fn new(
        device: &Device,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        map: bool,
    ) -> Result<Self, RenderError> {
        let type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            properties,
        )
        .ok_or(RenderError::OutOfDeviceMemory)?;

        unsafe {
            let memory = device
                .raw()
                .allocate_memory(
                    &vk::MemoryAllocateInfo::builder()
                        .allocation_size(requirements.size)
                        .memory_type_index(type_index),
                    None,
                )
                .map_err(RenderError::from)?;

            let mapped = if map {
                match device.raw().map_memory(
                    memory,
                    0,
                    requirements.size,
                    vk::MemoryMapFlags::empty(),
                ) {
                    Ok(ptr) => {
                        debug_assert!(!ptr.is_null());
                        Some(NonNull::new_unchecked(ptr.cast::<u8>()))
                    }
                    Err(err) => {
                        device.raw().free_memory(memory, None);
                        return Err(err.into());
                    }
                }
            } else {
                None
            };

            Ok(Allocation {
                memory,
                size: requirements.size,
                mapped,
            })
        }
    }

    /// Raw memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Persistently mapped pointer, if the allocation was mapped.
    pub fn mapped(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Free the memory. The bound buffer or image must already be destroyed.
    pub fn dispose(self, device: &Device) {
        unsafe {
            if self.mapped.is_some() {
                device.raw().unmap_memory(self.memory);
            }
            device.raw().free_memory(self.memory, None);
        }
    }
}

/// Find a memory type covering `type_bits` with all requested properties.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&index| {
        type_bits & (1 << index) != 0
            && properties.memory_types[index as usize]
                .property_flags
                .contains(required)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (index, &flags) in types.iter().enumerate() {
            properties.memory_types[index].property_flags = flags;
        }
        properties
    }

    #[test]
    fn picks_first_matching_type() {
        let properties = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        assert_eq!(
            find_memory_type(&properties, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            find_memory_type(
                &properties,
                0b11,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            Some(1)
        );
    }

    #[test]
    fn respects_type_bits() {
        let properties = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&properties, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&properties, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }
}
