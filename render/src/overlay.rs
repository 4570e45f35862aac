//! Debug line drawing and the UI overlay seam.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use kiln_core::{Aabb, RenderError, FRAMES_IN_FLIGHT};
use kiln_resource::{Device, MutableBuffer};

/// Vertex of the debug line stream.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct DebugVertex {
    /// World-space position.
    pub position: [f32; 3],
    /// Line color.
    pub color: [f32; 4],
}

/// Debug line capacity per frame.
pub const DEBUG_VERTEX_CAPACITY: usize = 1 << 16;

/// CPU-filled line list rendered after the scene, one buffer per frame in
/// flight.
pub struct DebugDraw {
    buffers: Vec<MutableBuffer<DebugVertex>>,
    pending: Vec<DebugVertex>,
    counts: Vec<u32>,
}

impl std::fmt::Debug for DebugDraw {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("DebugDraw")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl DebugDraw {
    /// Allocate the per-frame vertex buffers.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        let mut buffers = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            buffers.push(MutableBuffer::new(
                device,
                DEBUG_VERTEX_CAPACITY,
                vk::BufferUsageFlags::VERTEX_BUFFER,
            )?);
        }
        Ok(DebugDraw {
            buffers,
            pending: Vec::new(),
            counts: vec![0; FRAMES_IN_FLIGHT],
        })
    }

    /// Queue one world-space line.
    pub fn line(&mut self, from: Vec3, to: Vec3, color: [f32; 4]) {
        if self.pending.len() + 2 > DEBUG_VERTEX_CAPACITY {
            return;
        }
        self.pending.push(DebugVertex {
            position: from.to_array(),
            color,
        });
        self.pending.push(DebugVertex {
            position: to.to_array(),
            color,
        });
    }

    /// Queue the twelve edges of a box.
    pub fn aabb(&mut self, aabb: &Aabb, color: [f32; 4]) {
        let corners = [
            Vec3::new(aabb.min.x, aabb.min.y, aabb.min.z),
            Vec3::new(aabb.max.x, aabb.min.y, aabb.min.z),
            Vec3::new(aabb.min.x, aabb.max.y, aabb.min.z),
            Vec3::new(aabb.max.x, aabb.max.y, aabb.min.z),
            Vec3::new(aabb.min.x, aabb.min.y, aabb.max.z),
            Vec3::new(aabb.max.x, aabb.min.y, aabb.max.z),
            Vec3::new(aabb.min.x, aabb.max.y, aabb.max.z),
            Vec3::new(aabb.max.x, aabb.max.y, aabb.max.z),
        ];
        const EDGES: [(usize, usize); 12] = [
            (0, 1),
            (1, 3),
            (3, 2),
            (2, 0),
            (4, 5),
            (5, 7),
            (7, 6),
            (6, 4),
            (0, 4),
            (1, 5),
            (2, 6),
            (3, 7),
        ];
        for (a, b) in EDGES {
            self.line(corners[a], corners[b], color);
        }
    }

    /// Upload pending lines into the frame's buffer and clear the queue.
    pub fn flush(&mut self, frame: usize) {
        let slot = frame % FRAMES_IN_FLIGHT;
        let count = self.pending.len().min(DEBUG_VERTEX_CAPACITY);
        self.buffers[slot].write_slice(0, &self.pending[..count]);
        self.counts[slot] = count as u32;
        self.pending.clear();
    }

    /// Vertex buffer of the frame.
    pub fn buffer(&self, frame: usize) -> vk::Buffer {
        self.buffers[frame % FRAMES_IN_FLIGHT].raw()
    }

    /// Vertex count uploaded for the frame.
    pub fn count(&self, frame: usize) -> u32 {
        self.counts[frame % FRAMES_IN_FLIGHT]
    }

    /// Destroy the buffers.
    pub fn dispose(self, device: &Device) {
        for buffer in self.buffers {
            buffer.dispose(device);
        }
    }
}

/// External UI collaborator. Records its draw commands into an already
/// begun render pass over the swapchain image, loading existing contents.
pub trait UiOverlay {
    /// Record UI draws for this frame.
    fn record(&mut self, device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D);
}

impl std::fmt::Debug for dyn UiOverlay {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.write_str("UiOverlay")
    }
}
