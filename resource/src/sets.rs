//! Descriptor plumbing for the bindless buffer views.
//!
//! The layouts here are long-lived: one per buffer concern, as listed by the
//! pass interface contract (camera, bones, materials, node data, mesh data,
//! vertex skinning, lights, shadow data, sprites). The bindless texture
//! array has its own layout in the bindless module.

use ash::vk;

use kiln_core::RenderError;

/// Descriptor pool wrapper for long-lived buffer sets.
///
/// Sets are never freed individually; the whole pool is reclaimed at
/// shutdown.
#[derive(Debug)]
pub struct DescriptorArena {
    pool: vk::DescriptorPool,
}

impl DescriptorArena {
    /// Create a pool sized for the renderer's long-lived sets.
    pub fn new(device: &crate::Device) -> Result<Self, RenderError> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 512,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 128,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 256,
            },
        ];
        let pool = unsafe {
            device
                .raw()
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::builder()
                        .max_sets(1024)
                        .pool_sizes(&sizes),
                    None,
                )
                .map_err(RenderError::from)?
        };
        Ok(DescriptorArena { pool })
    }

    /// Allocate one set of the given layout.
    pub fn allocate(
        &mut self,
        device: &crate::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, RenderError> {
        let layouts = [layout];
        let sets = unsafe {
            device
                .raw()
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::builder()
                        .descriptor_pool(self.pool)
                        .set_layouts(&layouts),
                )
                .map_err(RenderError::from)?
        };
        Ok(sets[0])
    }

    /// Point a buffer binding of a set at `buffer`.
    pub fn write_buffer(
        &self,
        device: &crate::Device,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: u64,
    ) {
        let info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(&info)
            .build();
        unsafe {
            device.raw().update_descriptor_sets(&[write], &[]);
        }
    }

    /// Point an image binding of a set at `view`.
    pub fn write_image(
        &self,
        device: &crate::Device,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    ) {
        let info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .image_info(&info)
            .build();
        unsafe {
            device.raw().update_descriptor_sets(&[write], &[]);
        }
    }

    /// Destroy the pool, reclaiming every set allocated from it.
    pub fn dispose(self, device: &crate::Device) {
        unsafe {
            device.raw().destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Create a layout from raw binding descriptions.
pub fn create_layout(
    device: &crate::Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout, RenderError> {
    unsafe {
        device
            .raw()
            .create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings),
                None,
            )
            .map_err(RenderError::from)
    }
}

fn storage_layout(device: &crate::Device) -> Result<vk::DescriptorSetLayout, RenderError> {
    create_layout(
        device,
        &[vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(
                vk::ShaderStageFlags::VERTEX
                    | vk::ShaderStageFlags::GEOMETRY
                    | vk::ShaderStageFlags::FRAGMENT
                    | vk::ShaderStageFlags::COMPUTE,
            )
            .build()],
    )
}

/// The long-lived descriptor set layouts of the bindless buffer views.
/// Each pass binds the subset it declares.
#[derive(Debug)]
pub struct Layouts {
    /// Per-frame camera array.
    pub camera: vk::DescriptorSetLayout,
    /// Node records.
    pub nodes: vk::DescriptorSetLayout,
    /// Mesh records.
    pub meshes: vk::DescriptorSetLayout,
    /// Material records.
    pub materials: vk::DescriptorSetLayout,
    /// Light records.
    pub lights: vk::DescriptorSetLayout,
    /// World matrices, indexed by node id.
    pub world: vk::DescriptorSetLayout,
    /// Bone matrices.
    pub bones: vk::DescriptorSetLayout,
    /// Skinning vertex stream.
    pub skinning: vk::DescriptorSetLayout,
    /// Per-frame shadow slot array.
    pub shadow_data: vk::DescriptorSetLayout,
    /// Sprite records.
    pub sprites: vk::DescriptorSetLayout,
}

impl Layouts {
    /// Create every layout.
    pub fn new(device: &crate::Device) -> Result<Self, RenderError> {
        Ok(Layouts {
            camera: storage_layout(device)?,
            nodes: storage_layout(device)?,
            meshes: storage_layout(device)?,
            materials: storage_layout(device)?,
            lights: storage_layout(device)?,
            world: storage_layout(device)?,
            bones: storage_layout(device)?,
            skinning: storage_layout(device)?,
            shadow_data: storage_layout(device)?,
            sprites: storage_layout(device)?,
        })
    }

    /// Destroy every layout.
    pub fn dispose(self, device: &crate::Device) {
        unsafe {
            for layout in [
                self.camera,
                self.nodes,
                self.meshes,
                self.materials,
                self.lights,
                self.world,
                self.bones,
                self.skinning,
                self.shadow_data,
                self.sprites,
            ] {
                device.raw().destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}
