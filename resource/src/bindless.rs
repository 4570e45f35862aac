//! The bindless texture table.
//!
//! One update-after-bind descriptor set aggregates every sampled image; a
//! shader reaches a texture through its 32-bit index plus a push constant
//! selecting the sampler. Index 0 is the reserved "absent" sentinel and is
//! backed by a 1×1 white fallback so partially-bound reads stay defined.

use ash::vk;

use kiln_core::{RenderError, BINDLESS_INDEX_ABSENT, MAX_TEXTURES};

use crate::device::Device;
use crate::image::{upload_texels, Image2D};

/// The fixed sampler slots of binding 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SamplerKind {
    /// Trilinear repeat.
    Linear = 0,
    /// Nearest clamp.
    Nearest = 1,
    /// Depth-compare sampler for shadow maps.
    ShadowCompare = 2,
    /// MAX-reduction sampler for the depth pyramid.
    MaxReduction = 3,
}

/// LIFO recycling allocator for bindless indices. Index 0 is never handed
/// out.
#[derive(Debug)]
pub struct IndexAllocator {
    next: u32,
    capacity: u32,
    free: Vec<u32>,
}

impl IndexAllocator {
    /// Allocator over `1..capacity`.
    pub fn new(capacity: u32) -> Self {
        IndexAllocator {
            next: BINDLESS_INDEX_ABSENT + 1,
            capacity,
            free: Vec::new(),
        }
    }

    /// Take an index, recycling the most recently freed one first.
    pub fn alloc(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        if self.next < self.capacity {
            let index = self.next;
            self.next += 1;
            Some(index)
        } else {
            None
        }
    }

    /// Return an index to the free list.
    pub fn free(&mut self, index: u32) {
        debug_assert_ne!(index, BINDLESS_INDEX_ABSENT);
        debug_assert!(index < self.next);
        self.free.push(index);
    }

    /// Number of live indices.
    pub fn live(&self) -> u32 {
        (self.next - 1) - self.free.len() as u32
    }
}

/// Owner of the bindless texture descriptor set and the sampler slots.
#[derive(Debug)]
pub struct BindlessTables {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    samplers: [vk::Sampler; 4],
    indices: IndexAllocator,
    fallback: Option<Image2D>,
}

impl BindlessTables {
    /// Create the update-after-bind pool, layout, set and samplers, and
    /// write the fallback image into slot 0.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        unsafe {
            let sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: MAX_TEXTURES,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: 4,
                },
            ];
            let pool = device
                .raw()
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::builder()
                        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                        .max_sets(1)
                        .pool_sizes(&sizes),
                    None,
                )
                .map_err(RenderError::from)?;

            let bindings = [
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .descriptor_count(MAX_TEXTURES)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .descriptor_count(4)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE)
                    .build(),
            ];
            let binding_flags = [
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
                    | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                    | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT,
                vk::DescriptorBindingFlags::empty(),
            ];
            let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
                .binding_flags(&binding_flags);
            let layout = device
                .raw()
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::builder()
                        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                        .bindings(&bindings)
                        .push_next(&mut flags_info),
                    None,
                )
                .map_err(RenderError::from)?;

            let counts = [MAX_TEXTURES];
            let mut count_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
                .descriptor_counts(&counts);
            let layouts = [layout];
            let set = device
                .raw()
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::builder()
                        .descriptor_pool(pool)
                        .set_layouts(&layouts)
                        .push_next(&mut count_info),
                )
                .map_err(RenderError::from)?[0];

            let samplers = create_samplers(device)?;
            write_samplers(device, set, &samplers);

            let mut tables = BindlessTables {
                pool,
                layout,
                set,
                samplers,
                indices: IndexAllocator::new(MAX_TEXTURES),
                fallback: None,
            };
            tables.install_fallback(device)?;
            Ok(tables)
        }
    }

    fn install_fallback(&mut self, device: &Device) -> Result<(), RenderError> {
        let extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        let fallback = Image2D::new(
            device,
            extent,
            vk::Format::R8G8B8A8_UNORM,
            1,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
        )?;
        upload_texels(
            device,
            fallback.raw(),
            extent,
            1,
            1,
            &[255u8; 4],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        self.write_texture(
            device,
            BINDLESS_INDEX_ABSENT,
            fallback.view(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        self.fallback = Some(fallback);
        Ok(())
    }

    /// Take a fresh bindless index.
    pub fn alloc_index(&mut self) -> Result<u32, RenderError> {
        self.indices.alloc().ok_or(RenderError::OutOfDeviceMemory)
    }

    /// Release an index for reuse. The caller guarantees no frame in flight
    /// still samples the slot.
    pub fn free_index(&mut self, index: u32) {
        self.indices.free(index);
    }

    /// Point an array slot at a view. Update-after-bind makes this legal
    /// while other slots are in use.
    pub fn write_texture(
        &self,
        device: &Device,
        index: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) {
        let info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&info)
            .build();
        unsafe {
            device.raw().update_descriptor_sets(&[write], &[]);
        }
    }

    /// The texture array layout (set index fixed per pipeline layout).
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The texture array set.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// A fixed sampler slot's raw handle.
    pub fn sampler(&self, kind: SamplerKind) -> vk::Sampler {
        self.samplers[kind as usize]
    }

    /// Number of live texture indices.
    pub fn live_textures(&self) -> u32 {
        self.indices.live()
    }

    /// Destroy pool, layout, samplers and the fallback image.
    pub fn dispose(self, device: &Device) {
        unsafe {
            if let Some(fallback) = self.fallback {
                fallback.dispose(device);
            }
            for sampler in self.samplers {
                device.raw().destroy_sampler(sampler, None);
            }
            device.raw().destroy_descriptor_pool(self.pool, None);
            device.raw().destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

fn create_samplers(device: &Device) -> Result<[vk::Sampler; 4], RenderError> {
    unsafe {
        let linear = device
            .raw()
            .create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                    .address_mode_u(vk::SamplerAddressMode::REPEAT)
                    .address_mode_v(vk::SamplerAddressMode::REPEAT)
                    .address_mode_w(vk::SamplerAddressMode::REPEAT)
                    .max_lod(vk::LOD_CLAMP_NONE),
                None,
            )
            .map_err(RenderError::from)?;

        let nearest = device
            .raw()
            .create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::NEAREST)
                    .min_filter(vk::Filter::NEAREST)
                    .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .max_lod(vk::LOD_CLAMP_NONE),
                None,
            )
            .map_err(RenderError::from)?;

        let shadow = device
            .raw()
            .create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                    .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                    .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
                    .compare_enable(true)
                    .compare_op(vk::CompareOp::LESS_OR_EQUAL),
                None,
            )
            .map_err(RenderError::from)?;

        // Sampling the depth pyramid must return the farthest depth covered
        // by the footprint, hence MAX reduction (forward-Z).
        let mut reduction = vk::SamplerReductionModeCreateInfo::builder()
            .reduction_mode(vk::SamplerReductionMode::MAX);
        let max_reduction = device
            .raw()
            .create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .max_lod(vk::LOD_CLAMP_NONE)
                    .push_next(&mut reduction),
                None,
            )
            .map_err(RenderError::from)?;

        Ok([linear, nearest, shadow, max_reduction])
    }
}

fn write_samplers(device: &Device, set: vk::DescriptorSet, samplers: &[vk::Sampler; 4]) {
    let infos: Vec<vk::DescriptorImageInfo> = samplers
        .iter()
        .map(|&sampler| vk::DescriptorImageInfo {
            sampler,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        })
        .collect();
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(1)
        .descriptor_type(vk::DescriptorType::SAMPLER)
        .image_info(&infos)
        .build();
    unsafe {
        device.raw().update_descriptor_sets(&[write], &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_start_past_the_sentinel() {
        let mut alloc = IndexAllocator::new(8);
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), Some(2));
    }

    #[test]
    fn free_list_is_lifo() {
        let mut alloc = IndexAllocator::new(8);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        alloc.free(a);
        alloc.free(b);
        // Allocating and freeing twice in a row hands back the same index.
        assert_eq!(alloc.alloc(), Some(b));
        alloc.free(b);
        assert_eq!(alloc.alloc(), Some(b));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut alloc = IndexAllocator::new(3);
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), Some(2));
        assert_eq!(alloc.alloc(), None);
        alloc.free(2);
        assert_eq!(alloc.alloc(), Some(2));
        assert_eq!(alloc.live(), 2);
    }
}
