//! Per-camera visibility state: the double-buffered indirect draw buffers
//! of every bucket and the camera's depth pyramid.

use ash::vk;

use kiln_core::{RenderError, FRAMES_IN_FLIGHT, MAX_NODES};
use kiln_resource::{Device, RawBuffer, Resources};

use crate::pyramid::DepthPyramid;
use crate::scene::Bucket;

/// Indirect command capacity per bucket (worst case: every node in one
/// bucket).
pub const DRAW_CAPACITY: u32 = MAX_NODES;

/// Stride of `VkDrawIndexedIndirectCommand`.
pub const DRAW_COMMAND_STRIDE: u32 = 20;

struct BucketBuffers {
    commands: Vec<RawBuffer>,
    counts: Vec<RawBuffer>,
    sets: Vec<vk::DescriptorSet>,
}

/// One camera's cull outputs and pyramid.
pub struct CameraCull {
    buckets: Vec<BucketBuffers>,
    /// The camera's hierarchical-Z pyramid.
    pub pyramid: DepthPyramid,
}

impl std::fmt::Debug for CameraCull {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("CameraCull")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl CameraCull {
    /// Allocate draw buffers for every bucket and the pyramid for the
    /// camera extent.
    pub fn new(
        device: &Device,
        resources: &mut Resources,
        output_layout: vk::DescriptorSetLayout,
        width: u32,
        height: u32,
    ) -> Result<Self, RenderError> {
        let mut buckets = Vec::with_capacity(Bucket::ALL.len());
        for _ in Bucket::ALL {
            let mut commands = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut counts = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for _ in 0..FRAMES_IN_FLIGHT {
                let command_buffer = RawBuffer::new(
                    device,
                    u64::from(DRAW_CAPACITY) * u64::from(DRAW_COMMAND_STRIDE),
                    vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    false,
                )?;
                let count_buffer = RawBuffer::new(
                    device,
                    4,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::INDIRECT_BUFFER
                        | vk::BufferUsageFlags::TRANSFER_DST,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    false,
                )?;
                let set = resources.arena.allocate(device, output_layout)?;
                resources.arena.write_buffer(
                    device,
                    set,
                    0,
                    vk::DescriptorType::STORAGE_BUFFER,
                    command_buffer.raw(),
                    command_buffer.size(),
                );
                resources.arena.write_buffer(
                    device,
                    set,
                    1,
                    vk::DescriptorType::STORAGE_BUFFER,
                    count_buffer.raw(),
                    count_buffer.size(),
                );
                commands.push(command_buffer);
                counts.push(count_buffer);
                sets.push(set);
            }
            buckets.push(BucketBuffers {
                commands,
                counts,
                sets,
            });
        }

        let pyramid = DepthPyramid::new(device, resources, width, height)?;

        Ok(CameraCull { buckets, pyramid })
    }

    /// Indirect command buffer of `(bucket, frame)`.
    pub fn commands(&self, bucket: Bucket, frame: usize) -> vk::Buffer {
        self.buckets[bucket as usize].commands[frame % FRAMES_IN_FLIGHT].raw()
    }

    /// Draw-count buffer of `(bucket, frame)`.
    pub fn count(&self, bucket: Bucket, frame: usize) -> vk::Buffer {
        self.buckets[bucket as usize].counts[frame % FRAMES_IN_FLIGHT].raw()
    }

    /// Cull-output descriptor set of `(bucket, frame)`.
    pub fn output_set(&self, bucket: Bucket, frame: usize) -> vk::DescriptorSet {
        self.buckets[bucket as usize].sets[frame % FRAMES_IN_FLIGHT]
    }

    /// Destroy buffers and pyramid.
    pub fn dispose(self, device: &Device, resources: &mut Resources) {
        for bucket in self.buckets {
            for buffer in bucket.commands.into_iter().chain(bucket.counts) {
                buffer.dispose(device);
            }
        }
        self.pyramid.dispose(device, resources);
    }
}
