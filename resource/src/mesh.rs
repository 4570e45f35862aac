//! The global geometry arenas and mesh records.
//!
//! All meshes share one device-local vertex buffer, one index buffer and one
//! skinning-attribute buffer; a mesh is a pair of ranges plus its
//! object-space AABB. Draws reference the ranges through indirect commands,
//! so the buffers are bound once per pass.

use ash::vk;

use kiln_core::{Aabb, RenderError};

use crate::buffer::{upload, RawBuffer};
use crate::device::Device;
use crate::records::{GpuVertex, SkinVertex};

/// Default arena capacities.
const VERTEX_CAPACITY: u32 = 1 << 18;
const INDEX_CAPACITY: u32 = 1 << 20;

/// First-fit range allocator over `0..capacity`.
///
/// Freed ranges go to a free list and are reused exactly or split; adjacent
/// free ranges are not coalesced; geometry churn is rare enough that
/// fragmentation has not been worth the bookkeeping.
#[derive(Debug)]
pub struct RangeAlloc {
    capacity: u32,
    cursor: u32,
    free: Vec<(u32, u32)>,
}

impl RangeAlloc {
    /// Allocator over `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        RangeAlloc {
            capacity,
            cursor: 0,
            free: Vec::new(),
        }
    }

    /// Take a contiguous range of `count` elements.
    pub fn alloc(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return Some(0);
        }
        if let Some(position) = self.free.iter().position(|&(_, len)| len >= count) {
            let (offset, len) = self.free.swap_remove(position);
            if len > count {
                self.free.push((offset + count, len - count));
            }
            return Some(offset);
        }
        if self.cursor + count <= self.capacity {
            let offset = self.cursor;
            self.cursor += count;
            Some(offset)
        } else {
            None
        }
    }

    /// Return a range for reuse.
    pub fn free(&mut self, offset: u32, count: u32) {
        if count > 0 {
            self.free.push((offset, count));
        }
    }

    /// Elements currently allocated.
    pub fn used(&self) -> u32 {
        self.cursor - self.free.iter().map(|&(_, len)| len).sum::<u32>()
    }
}

/// Mesh record: ranges into the global buffers plus the object-space bounds.
#[derive(Clone, Copy, Debug)]
pub struct Mesh {
    /// First index in the global index buffer.
    pub first_index: u32,
    /// Signed offset added to every index.
    pub vertex_offset: i32,
    /// Number of indices.
    pub index_count: u32,
    /// Number of vertices (for range bookkeeping).
    pub vertex_count: u32,
    /// Object-space bounds.
    pub aabb: Aabb,
}

/// The shared vertex/index/skinning buffers and their range allocators.
#[derive(Debug)]
pub struct MeshArena {
    vertices: RawBuffer,
    indices: RawBuffer,
    skinning: RawBuffer,
    vertex_ranges: RangeAlloc,
    index_ranges: RangeAlloc,
}

impl MeshArena {
    /// Create the device-local arenas.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        let vertices = RawBuffer::new(
            device,
            u64::from(VERTEX_CAPACITY) * std::mem::size_of::<GpuVertex>() as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;
        let indices = RawBuffer::new(
            device,
            u64::from(INDEX_CAPACITY) * std::mem::size_of::<u32>() as u64,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;
        let skinning = RawBuffer::new(
            device,
            u64::from(VERTEX_CAPACITY) * std::mem::size_of::<SkinVertex>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        )?;
        Ok(MeshArena {
            vertices,
            indices,
            skinning,
            vertex_ranges: RangeAlloc::new(VERTEX_CAPACITY),
            index_ranges: RangeAlloc::new(INDEX_CAPACITY),
        })
    }

    /// Upload a mesh into the arenas and return its record.
    pub fn create_mesh(
        &mut self,
        device: &Device,
        vertices: &[GpuVertex],
        skinning: Option<&[SkinVertex]>,
        indices: &[u32],
    ) -> Result<Mesh, RenderError> {
        if let Some(skin) = skinning {
            assert_eq!(skin.len(), vertices.len());
        }

        let vertex_offset = self
            .vertex_ranges
            .alloc(vertices.len() as u32)
            .ok_or(RenderError::OutOfDeviceMemory)?;
        let first_index = match self.index_ranges.alloc(indices.len() as u32) {
            Some(first_index) => first_index,
            None => {
                self.vertex_ranges.free(vertex_offset, vertices.len() as u32);
                return Err(RenderError::OutOfDeviceMemory);
            }
        };

        upload(
            device,
            self.vertices.raw(),
            u64::from(vertex_offset) * std::mem::size_of::<GpuVertex>() as u64,
            bytemuck::cast_slice(vertices),
        )?;
        upload(
            device,
            self.indices.raw(),
            u64::from(first_index) * std::mem::size_of::<u32>() as u64,
            bytemuck::cast_slice(indices),
        )?;
        if let Some(skin) = skinning {
            upload(
                device,
                self.skinning.raw(),
                u64::from(vertex_offset) * std::mem::size_of::<SkinVertex>() as u64,
                bytemuck::cast_slice(skin),
            )?;
        }

        let positions: Vec<glam::Vec3> = vertices
            .iter()
            .map(|vertex| glam::Vec3::from(vertex.position))
            .collect();

        Ok(Mesh {
            first_index,
            vertex_offset: vertex_offset as i32,
            index_count: indices.len() as u32,
            vertex_count: vertices.len() as u32,
            aabb: Aabb::from_points(&positions),
        })
    }

    /// Release a mesh's ranges.
    pub fn free_mesh(&mut self, mesh: &Mesh) {
        self.vertex_ranges
            .free(mesh.vertex_offset as u32, mesh.vertex_count);
        self.index_ranges.free(mesh.first_index, mesh.index_count);
    }

    /// Global vertex buffer.
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.raw()
    }

    /// Global index buffer.
    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.raw()
    }

    /// Global skinning-attribute buffer.
    pub fn skinning_buffer(&self) -> vk::Buffer {
        self.skinning.raw()
    }

    /// Size of the skinning buffer in bytes (for descriptor writes).
    pub fn skinning_size(&self) -> u64 {
        self.skinning.size()
    }

    /// Destroy the arenas.
    pub fn dispose(self, device: &Device) {
        self.vertices.dispose(device);
        self.indices.dispose(device);
        self.skinning.dispose(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocs_advance_the_cursor() {
        let mut ranges = RangeAlloc::new(100);
        assert_eq!(ranges.alloc(10), Some(0));
        assert_eq!(ranges.alloc(5), Some(10));
        assert_eq!(ranges.used(), 15);
    }

    #[test]
    fn freed_range_is_reused_and_split() {
        let mut ranges = RangeAlloc::new(100);
        let a = ranges.alloc(20).unwrap();
        let _b = ranges.alloc(20).unwrap();
        ranges.free(a, 20);
        // Exact reuse.
        assert_eq!(ranges.alloc(20), Some(a));
        ranges.free(a, 20);
        // Split reuse.
        assert_eq!(ranges.alloc(8), Some(a));
        assert_eq!(ranges.alloc(12), Some(a + 8));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut ranges = RangeAlloc::new(16);
        assert_eq!(ranges.alloc(16), Some(0));
        assert_eq!(ranges.alloc(1), None);
        ranges.free(0, 16);
        assert_eq!(ranges.alloc(16), Some(0));
    }
}
