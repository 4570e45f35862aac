//! The hierarchical-Z depth pyramid.
//!
//! Per camera and per frame in flight: an `R32_SFLOAT` mip chain holding
//! depth maxima, sized to the largest power of two not exceeding the
//! source extent. The whole chain lives in GENERAL layout; per-mip storage
//! views serve the reduction writes and the full sampled view serves the
//! occlusion reads through the MAX-reduction sampler.

use ash::vk;

use kiln_core::{ilog2, next_pow2, RenderError, FRAMES_IN_FLIGHT, MAX_DEPTH_MIPS_LEVEL};
use kiln_resource::{Device, Image2D, Resources, SamplerKind};

/// Pyramid texel format.
pub const PYRAMID_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

/// Workgroup edge of the reduction dispatches.
pub const REDUCE_GROUP_SIZE: u32 = 32;

/// Largest power of two `<= value` (minimum 1).
pub fn prev_pow2(value: u32) -> u32 {
    let value = value.max(1);
    if value.is_power_of_two() {
        value
    } else {
        next_pow2(value) / 2
    }
}

/// Pyramid dimensions and mip count for a source extent.
pub fn pyramid_dimensions(width: u32, height: u32) -> (u32, u32, u32) {
    let pyramid_width = prev_pow2(width);
    let pyramid_height = prev_pow2(height);
    let mips = (ilog2(pyramid_width.max(pyramid_height)) + 1).min(MAX_DEPTH_MIPS_LEVEL);
    (pyramid_width, pyramid_height, mips)
}

/// One camera's depth pyramid: FRAMES_IN_FLIGHT copies of the mip chain.
pub struct DepthPyramid {
    images: Vec<Image2D>,
    mip_views: Vec<Vec<vk::ImageView>>,
    bindless: Vec<u32>,
    reduce_sets: Vec<Vec<vk::DescriptorSet>>,
    valid: Vec<bool>,
    width: u32,
    height: u32,
    mips: u32,
}

impl std::fmt::Debug for DepthPyramid {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("DepthPyramid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mips", &self.mips)
            .finish()
    }
}

impl DepthPyramid {
    /// Allocate the chain copies and register their sampled views in the
    /// bindless table.
    pub fn new(
        device: &Device,
        resources: &mut Resources,
        source_width: u32,
        source_height: u32,
    ) -> Result<Self, RenderError> {
        let (width, height, mips) = pyramid_dimensions(source_width, source_height);

        let mut images = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut mip_views = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut bindless = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            let image = Image2D::new(
                device,
                vk::Extent2D { width, height },
                PYRAMID_FORMAT,
                mips,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
                vk::ImageAspectFlags::COLOR,
            )?;
            let views: Vec<vk::ImageView> = (0..mips)
                .map(|mip| image.mip_view(device, mip))
                .collect::<Result<_, _>>()?;

            // The chain spends its whole life in GENERAL; enter it now so
            // the first frame's wrap-around barrier sees the layout it
            // expects.
            kiln_resource::transition_layout(
                device,
                image.raw(),
                vk::ImageAspectFlags::COLOR,
                mips,
                1,
                vk::ImageLayout::GENERAL,
            )?;

            let index = resources.tables.alloc_index()?;
            // The chain is sampled in GENERAL; it never leaves that layout.
            resources
                .tables
                .write_texture(device, index, image.view(), vk::ImageLayout::GENERAL);

            images.push(image);
            mip_views.push(views);
            bindless.push(index);
        }

        Ok(DepthPyramid {
            images,
            mip_views,
            bindless,
            reduce_sets: Vec::new(),
            valid: vec![false; FRAMES_IN_FLIGHT],
            width,
            height,
            mips,
        })
    }

    /// Build the per-mip reduction descriptor sets. `depth_view` is the
    /// camera's depth attachment (mip 0 input); called after every graph
    /// compile because the transient depth view changes.
    pub fn build_reduce_sets(
        &mut self,
        device: &Device,
        resources: &mut Resources,
        layout: vk::DescriptorSetLayout,
        depth_view: vk::ImageView,
    ) -> Result<(), RenderError> {
        self.reduce_sets.clear();
        for copy in 0..FRAMES_IN_FLIGHT {
            let mut sets = Vec::with_capacity(self.mips as usize);
            for mip in 0..self.mips {
                let set = resources.arena.allocate(device, layout)?;
                let (input_view, input_layout) = if mip == 0 {
                    (
                        depth_view,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )
                } else {
                    (
                        self.mip_views[copy][mip as usize - 1],
                        vk::ImageLayout::GENERAL,
                    )
                };
                resources.arena.write_image(
                    device,
                    set,
                    0,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    input_view,
                    input_layout,
                    resources.tables.sampler(SamplerKind::MaxReduction),
                );
                resources.arena.write_image(
                    device,
                    set,
                    1,
                    vk::DescriptorType::STORAGE_IMAGE,
                    self.mip_views[copy][mip as usize],
                    vk::ImageLayout::GENERAL,
                    vk::Sampler::null(),
                );
                sets.push(set);
            }
            self.reduce_sets.push(sets);
        }
        Ok(())
    }

    /// Pyramid extent.
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Mip count.
    pub fn mips(&self) -> u32 {
        self.mips
    }

    /// Raw image of a copy.
    pub fn image(&self, copy: usize) -> vk::Image {
        self.images[copy % FRAMES_IN_FLIGHT].raw()
    }

    /// Full sampled view of a copy.
    pub fn view(&self, copy: usize) -> vk::ImageView {
        self.images[copy % FRAMES_IN_FLIGHT].view()
    }

    /// Bindless index of a copy's sampled view.
    pub fn bindless_index(&self, copy: usize) -> u32 {
        self.bindless[copy % FRAMES_IN_FLIGHT]
    }

    /// Reduction set of `(copy, mip)`.
    pub fn reduce_set(&self, copy: usize, mip: u32) -> vk::DescriptorSet {
        self.reduce_sets[copy % FRAMES_IN_FLIGHT][mip as usize]
    }

    /// Whether the copy read at `Current` this frame has ever been built.
    /// Until it has, occlusion culling is disabled for the camera and the
    /// cull is frustum-only.
    pub fn readable(&self, frame: usize) -> bool {
        self.valid[frame % FRAMES_IN_FLIGHT]
    }

    /// Mark the copy written at `Next` this frame as built.
    pub fn mark_written(&mut self, frame: usize) {
        self.valid[(frame + 1) % FRAMES_IN_FLIGHT] = true;
    }

    /// Destroy images, views and bindless slots. Device must be idle.
    pub fn dispose(self, device: &Device, resources: &mut Resources) {
        unsafe {
            for views in self.mip_views {
                for view in views {
                    device.raw().destroy_image_view(view, None);
                }
            }
        }
        for index in self.bindless {
            resources.tables.free_index(index);
        }
        for image in self.images {
            image.dispose(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prev_pow2_table() {
        assert_eq!(prev_pow2(1), 1);
        assert_eq!(prev_pow2(2), 2);
        assert_eq!(prev_pow2(3), 2);
        assert_eq!(prev_pow2(1024), 1024);
        assert_eq!(prev_pow2(1920), 1024);
        assert_eq!(prev_pow2(1080), 1024);
        assert_eq!(prev_pow2(0), 1);
    }

    #[test]
    fn dimensions_are_pow2_and_mips_match() {
        let (width, height, mips) = pyramid_dimensions(1920, 1080);
        assert_eq!((width, height), (1024, 1024));
        assert_eq!(mips, ilog2(width.max(height)) + 1);

        let (width, height, mips) = pyramid_dimensions(640, 480);
        assert_eq!((width, height), (512, 256));
        assert_eq!(mips, 10);
    }

    #[test]
    fn mip_dimensions_halve_down_to_one() {
        let (width, height, mips) = pyramid_dimensions(800, 600);
        let mut dims = (width, height);
        for _ in 1..mips {
            dims = ((dims.0 / 2).max(1), (dims.1 / 2).max(1));
        }
        assert_eq!(dims, (1, 1));
    }

    #[test]
    fn mips_are_capped() {
        // A hypothetical enormous source cannot exceed the cap.
        let (_, _, mips) = pyramid_dimensions(1 << 20, 1 << 20);
        assert_eq!(mips, MAX_DEPTH_MIPS_LEVEL);
    }
}
