//! The four buffer variants, chosen by access pattern.
//!
//! - [`ImmutableBuffer`]: staged once, device-local, read-only after upload.
//! - [`MutableBuffer`]: host-coherent, persistently mapped, written each
//!   frame (indirect draws, counts, debug vertices).
//! - [`PerFrameBuffer`]: one mutable copy per frame in flight with one
//!   descriptor set per copy (cameras, shadow data).
//! - [`BindlessBuffer`]: single fixed-capacity buffer exposed as a storage
//!   descriptor, written through a persistent host mirror (nodes, meshes,
//!   materials, lights, world matrices, bones, sprites).

use std::marker::PhantomData;

use ash::vk;
use bytemuck::Pod;

use kiln_core::{RenderError, FRAMES_IN_FLIGHT};

use crate::device::Device;
use crate::memory::Allocation;
use crate::sets::DescriptorArena;

/// A Vulkan buffer with its bound allocation.
#[derive(Debug)]
pub struct RawBuffer {
    raw: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

impl RawBuffer {
    /// Create a buffer and bind fresh memory to it.
    pub fn new(
        device: &Device,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        map: bool,
    ) -> Result<Self, RenderError> {
        unsafe {
            let raw = device
                .raw()
                .create_buffer(
                    &vk::BufferCreateInfo::builder()
                        .size(size)
                        .usage(usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    None,
                )
                .map_err(RenderError::from)?;

            let requirements = device.raw().get_buffer_memory_requirements(raw);
            let allocation = match Allocation::new(device, requirements, properties, map) {
                Ok(allocation) => allocation,
                Err(err) => {
                    device.raw().destroy_buffer(raw, None);
                    return Err(err);
                }
            };

            if let Err(err) = device
                .raw()
                .bind_buffer_memory(raw, allocation.memory(), 0)
            {
                device.raw().destroy_buffer(raw, None);
                allocation.dispose(device);
                return Err(err.into());
            }

            Ok(RawBuffer {
                raw,
                allocation,
                size,
            })
        }
    }

    /// Buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mapped pointer, when host-visible and mapped at creation.
    pub fn mapped(&self) -> Option<std::ptr::NonNull<u8>> {
        self.allocation.mapped()
    }

    /// Destroy the buffer and free its memory.
    pub fn dispose(self, device: &Device) {
        unsafe {
            device.raw().destroy_buffer(self.raw, None);
        }
        self.allocation.dispose(device);
    }
}

/// Device-local buffer filled once through a transient staging buffer.
#[derive(Debug)]
pub struct ImmutableBuffer {
    inner: RawBuffer,
}

impl ImmutableBuffer {
    /// Create a device-local buffer holding `data`.
    ///
    /// A staging buffer is created, filled, copied with a one-shot command,
    /// then destroyed.
    pub fn new(
        device: &Device,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RenderError> {
        let size = data.len().max(4) as u64;
        let inner = RawBuffer::new(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;

        if let Err(err) = upload(device, inner.raw(), 0, data) {
            inner.dispose(device);
            return Err(err);
        }
        Ok(ImmutableBuffer { inner })
    }

    /// Buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.inner.raw()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    /// Destroy the buffer. The caller must guarantee no frame in flight
    /// still reads it.
    pub fn dispose(self, device: &Device) {
        self.inner.dispose(device);
    }
}

/// Copy `data` into `dst` at `offset` through a transient staging buffer
/// and a one-shot transfer command.
pub(crate) fn upload(
    device: &Device,
    dst: vk::Buffer,
    offset: u64,
    data: &[u8],
) -> Result<(), RenderError> {
    if data.is_empty() {
        return Ok(());
    }

    let staging = RawBuffer::new(
        device,
        data.len() as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        true,
    )?;

    let mapped = staging.mapped().expect("staging buffer is mapped");
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr(), data.len());
    }

    let result = device.execute_one_shot(|cmd| unsafe {
        device.raw().cmd_copy_buffer(
            cmd,
            staging.raw(),
            dst,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: data.len() as u64,
            }],
        );
    });

    staging.dispose(device);
    result
}

/// Host-coherent, persistently mapped, typed buffer.
pub struct MutableBuffer<T: Pod> {
    inner: RawBuffer,
    capacity: usize,
    marker: PhantomData<T>,
}

impl<T: Pod> std::fmt::Debug for MutableBuffer<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("MutableBuffer")
            .field("capacity", &self.capacity)
            .field("stride", &std::mem::size_of::<T>())
            .finish()
    }
}

impl<T: Pod> MutableBuffer<T> {
    /// Create a mapped buffer with room for `capacity` elements.
    pub fn new(
        device: &Device,
        capacity: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RenderError> {
        Self::with_properties(
            device,
            capacity,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Like [`MutableBuffer::new`] but preferring device-local host-visible
    /// memory (BAR), falling back to plain host-coherent.
    pub fn new_preferring_device_local(
        device: &Device,
        capacity: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RenderError> {
        let preferred = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        match Self::with_properties(device, capacity, usage, preferred) {
            Ok(buffer) => Ok(buffer),
            Err(RenderError::OutOfDeviceMemory) => Self::new(device, capacity, usage),
            Err(err) => Err(err),
        }
    }

    fn with_properties(
        device: &Device,
        capacity: usize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self, RenderError> {
        let size = (capacity.max(1) * std::mem::size_of::<T>()) as u64;
        let inner = RawBuffer::new(device, size, usage, properties, true)?;
        if inner.mapped().is_none() {
            inner.dispose(device);
            return Err(RenderError::InitializationFailed(
                "mutable buffer mapping failed".into(),
            ));
        }
        Ok(MutableBuffer {
            inner,
            capacity: capacity.max(1),
            marker: PhantomData,
        })
    }

    /// Buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.inner.raw()
    }

    /// Element capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    /// Write one element.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of capacity.
    pub fn write(&mut self, index: usize, value: &T) {
        assert!(index < self.capacity, "buffer write out of capacity");
        let mapped = self.inner.mapped().expect("buffer is mapped");
        unsafe {
            mapped
                .as_ptr()
                .cast::<T>()
                .add(index)
                .copy_from_nonoverlapping(value, 1);
        }
    }

    /// Write a contiguous run of elements starting at `first`.
    pub fn write_slice(&mut self, first: usize, values: &[T]) {
        assert!(first + values.len() <= self.capacity);
        let mapped = self.inner.mapped().expect("buffer is mapped");
        unsafe {
            mapped
                .as_ptr()
                .cast::<T>()
                .add(first)
                .copy_from_nonoverlapping(values.as_ptr(), values.len());
        }
    }

    /// Read one element back. Only meaningful after the frame's fence.
    pub fn read(&self, index: usize) -> T {
        assert!(index < self.capacity);
        let mapped = self.inner.mapped().expect("buffer is mapped");
        unsafe { mapped.as_ptr().cast::<T>().add(index).read() }
    }

    /// Destroy the buffer.
    pub fn dispose(self, device: &Device) {
        self.inner.dispose(device);
    }
}

/// One mutable buffer per frame in flight, each with its own descriptor set.
pub struct PerFrameBuffer<T: Pod> {
    copies: Vec<MutableBuffer<T>>,
    sets: Vec<vk::DescriptorSet>,
}

impl<T: Pod> std::fmt::Debug for PerFrameBuffer<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("PerFrameBuffer")
            .field("copies", &self.copies.len())
            .finish()
    }
}

impl<T: Pod> PerFrameBuffer<T> {
    /// Create the frame copies and allocate + write one descriptor set for
    /// each.
    pub fn new(
        device: &Device,
        arena: &mut DescriptorArena,
        layout: vk::DescriptorSetLayout,
        descriptor_type: vk::DescriptorType,
        capacity: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, RenderError> {
        let mut copies = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            let copy = MutableBuffer::new(device, capacity, usage)?;
            let set = arena.allocate(device, layout)?;
            arena.write_buffer(device, set, 0, descriptor_type, copy.raw(), copy.size());
            copies.push(copy);
            sets.push(set);
        }
        Ok(PerFrameBuffer { copies, sets })
    }

    /// Write one element into the given frame's copy.
    pub fn write(&mut self, frame: usize, index: usize, value: &T) {
        self.copies[frame % FRAMES_IN_FLIGHT].write(index, value);
    }

    /// Write a contiguous run into the given frame's copy.
    pub fn write_slice(&mut self, frame: usize, first: usize, values: &[T]) {
        self.copies[frame % FRAMES_IN_FLIGHT].write_slice(first, values);
    }

    /// Descriptor set of the given frame's copy.
    pub fn set(&self, frame: usize) -> vk::DescriptorSet {
        self.sets[frame % FRAMES_IN_FLIGHT]
    }

    /// Buffer handle of the given frame's copy.
    pub fn raw(&self, frame: usize) -> vk::Buffer {
        self.copies[frame % FRAMES_IN_FLIGHT].raw()
    }

    /// Destroy all copies. Sets are reclaimed with their arena.
    pub fn dispose(self, device: &Device) {
        for copy in self.copies {
            copy.dispose(device);
        }
    }
}

/// Fixed-capacity storage buffer with a persistent host mirror and a single
/// long-lived descriptor set.
pub struct BindlessBuffer<T: Pod> {
    buffer: MutableBuffer<T>,
    set: vk::DescriptorSet,
}

impl<T: Pod> std::fmt::Debug for BindlessBuffer<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("BindlessBuffer")
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

impl<T: Pod> BindlessBuffer<T> {
    /// Create the buffer and its storage descriptor set.
    pub fn new(
        device: &Device,
        arena: &mut DescriptorArena,
        layout: vk::DescriptorSetLayout,
        capacity: usize,
    ) -> Result<Self, RenderError> {
        let buffer = MutableBuffer::new_preferring_device_local(
            device,
            capacity,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let set = arena.allocate(device, layout)?;
        arena.write_buffer(
            device,
            set,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            buffer.raw(),
            buffer.size(),
        );
        Ok(BindlessBuffer { buffer, set })
    }

    /// Write one element through the host mirror.
    pub fn write(&mut self, index: usize, value: &T) {
        self.buffer.write(index, value);
    }

    /// Write a contiguous run through the host mirror.
    pub fn write_slice(&mut self, first: usize, values: &[T]) {
        self.buffer.write_slice(first, values);
    }

    /// Element capacity.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Long-lived storage descriptor set.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Buffer handle.
    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Destroy the buffer. The set is reclaimed with its arena.
    pub fn dispose(self, device: &Device) {
        self.buffer.dispose(device);
    }
}
