// GPU buffers
//
// One dedicated allocation per buffer, no sub-allocation. The device calls
// go through `BufferDevice` so allocation accounting can be checked without
// a GPU.

use super::memory::resolve_memory_type;
use crate::error::{Result, RuntimeError, VkContext};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::c_void;

/// The device entry points a `Buffer` needs.
///
/// Implementations receive handles that this module created on the same
/// device and never releases twice.
pub trait BufferDevice {
    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory>;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut c_void>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Make host writes to a mapped, non-coherent allocation visible to the device.
    fn flush_mapped_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Make device writes to a mapped, non-coherent allocation visible to the host.
    fn invalidate_mapped_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn free_memory(&self, memory: vk::DeviceMemory);
}

impl BufferDevice for ash::Device {
    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        unsafe { ash::Device::create_buffer(self, info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory> {
        unsafe { ash::Device::allocate_memory(self, info, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { ash::Device::bind_buffer_memory(self, buffer, memory, 0) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> VkResult<*mut c_void> {
        unsafe { ash::Device::map_memory(self, memory, 0, size, vk::MemoryMapFlags::empty()) }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { ash::Device::unmap_memory(self, memory) }
    }

    fn flush_mapped_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = whole_range(memory);
        unsafe { self.flush_mapped_memory_ranges(std::slice::from_ref(&range)) }
    }

    fn invalidate_mapped_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = whole_range(memory);
        unsafe { self.invalidate_mapped_memory_ranges(std::slice::from_ref(&range)) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { ash::Device::destroy_buffer(self, buffer, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { ash::Device::free_memory(self, memory, None) }
    }
}

fn whole_range(memory: vk::DeviceMemory) -> vk::MappedMemoryRange<'static> {
    vk::MappedMemoryRange::default()
        .memory(memory)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// A buffer bound to its own device memory.
///
/// `size` is what the driver reported for the allocation, which may be
/// larger than the size that was asked for.
pub struct Buffer<'rt, D: BufferDevice = ash::Device> {
    device: &'rt D,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    /// Flags of the memory type actually chosen, a superset of the request
    memory_flags: vk::MemoryPropertyFlags,
}

impl<'rt, D: BufferDevice> Buffer<'rt, D> {
    pub fn new(
        device: &'rt D,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        // Handles are filled in as they are acquired so that an early
        // return releases exactly what exists.
        let mut this = Self {
            device,
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size: 0,
            memory_flags: vk::MemoryPropertyFlags::empty(),
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        this.buffer = device.create_buffer(&buffer_info).vk_context("vkCreateBuffer")?;

        let requirements = device.buffer_memory_requirements(this.buffer);
        let memory_type_index =
            resolve_memory_type(memory_properties, requirements.memory_type_bits, memory_flags)?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        this.memory = device
            .allocate_memory(&alloc_info)
            .vk_context("vkAllocateMemory")?;

        device
            .bind_buffer_memory(this.buffer, this.memory)
            .vk_context("vkBindBufferMemory")?;
        this.size = requirements.size;
        this.memory_flags =
            memory_properties.memory_types[memory_type_index as usize].property_flags;

        log::debug!(
            "Created buffer: requested {} bytes, allocated {} (type {}, {:?})",
            size,
            this.size,
            memory_type_index,
            usage
        );

        Ok(this)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Copy `data` to the start of a host-visible buffer.
    ///
    /// Non-coherent memory is flushed before it is unmapped.
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        let byte_len = self.check_host_access(std::mem::size_of_val(data))?;

        let ptr = self
            .device
            .map_memory(self.memory, self.size)
            .vk_context("vkMapMemory")?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, ptr as *mut u8, byte_len);
        }
        let flushed = if self.is_coherent() {
            Ok(())
        } else {
            self.device
                .flush_mapped_memory(self.memory)
                .vk_context("vkFlushMappedMemoryRanges")
        };
        self.device.unmap_memory(self.memory);
        flushed
    }

    /// Copy the start of a host-visible buffer into `out`.
    ///
    /// Non-coherent memory is invalidated before it is read.
    pub fn read<T: Copy>(&self, out: &mut [T]) -> Result<()> {
        let byte_len = self.check_host_access(std::mem::size_of_val(out))?;

        let ptr = self
            .device
            .map_memory(self.memory, self.size)
            .vk_context("vkMapMemory")?;
        if !self.is_coherent() {
            if let Err(result) = self.device.invalidate_mapped_memory(self.memory) {
                self.device.unmap_memory(self.memory);
                return Err(result).vk_context("vkInvalidateMappedMemoryRanges");
            }
        }
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr() as *mut u8, byte_len);
        }
        self.device.unmap_memory(self.memory);
        Ok(())
    }

    fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn check_host_access(&self, byte_len: usize) -> Result<usize> {
        if !self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(RuntimeError::NotHostVisible(self.memory_flags));
        }
        if byte_len as vk::DeviceSize > self.size {
            return Err(RuntimeError::AccessOutOfRange {
                requested: byte_len as vk::DeviceSize,
                size: self.size,
            });
        }
        Ok(byte_len)
    }
}

impl<D: BufferDevice> Drop for Buffer<'_, D> {
    fn drop(&mut self) {
        if self.buffer != vk::Buffer::null() {
            self.device.destroy_buffer(self.buffer);
        }
        if self.memory != vk::DeviceMemory::null() {
            self.device.free_memory(self.memory);
        }
    }
}
