//! GPU images: 2D textures, attachments and cube maps.

use ash::vk;

use kiln_core::RenderError;

use crate::buffer::RawBuffer;
use crate::device::Device;
use crate::memory::Allocation;

/// A 2D image with its memory and full view.
#[derive(Debug)]
pub struct Image2D {
    raw: vk::Image,
    allocation: Allocation,
    view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
    mip_levels: u32,
    aspect: vk::ImageAspectFlags,
}

impl Image2D {
    /// Create an image, bind memory and build the full view.
    pub fn new(
        device: &Device,
        extent: vk::Extent2D,
        format: vk::Format,
        mip_levels: u32,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self, RenderError> {
        unsafe {
            let raw = device
                .raw()
                .create_image(
                    &vk::ImageCreateInfo::builder()
                        .image_type(vk::ImageType::TYPE_2D)
                        .format(format)
                        .extent(vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        })
                        .mip_levels(mip_levels)
                        .array_layers(1)
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .tiling(vk::ImageTiling::OPTIMAL)
                        .usage(usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .initial_layout(vk::ImageLayout::UNDEFINED),
                    None,
                )
                .map_err(RenderError::from)?;

            let requirements = device.raw().get_image_memory_requirements(raw);
            let allocation = match Allocation::new(
                device,
                requirements,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            ) {
                Ok(allocation) => allocation,
                Err(err) => {
                    device.raw().destroy_image(raw, None);
                    return Err(err);
                }
            };

            if let Err(err) = device.raw().bind_image_memory(raw, allocation.memory(), 0) {
                device.raw().destroy_image(raw, None);
                allocation.dispose(device);
                return Err(err.into());
            }

            let view = match create_view(
                device,
                raw,
                vk::ImageViewType::TYPE_2D,
                format,
                aspect,
                0,
                mip_levels,
                0,
                1,
            ) {
                Ok(view) => view,
                Err(err) => {
                    device.raw().destroy_image(raw, None);
                    allocation.dispose(device);
                    return Err(err);
                }
            };

            Ok(Image2D {
                raw,
                allocation,
                view,
                extent,
                format,
                mip_levels,
                aspect,
            })
        }
    }

    /// Image handle.
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    /// Full view over every mip.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Extent in pixels.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Mip level count.
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Aspect the views cover.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    /// Build an extra single-mip view (depth pyramid storage views).
    pub fn mip_view(&self, device: &Device, mip: u32) -> Result<vk::ImageView, RenderError> {
        create_view(
            device,
            self.raw,
            vk::ImageViewType::TYPE_2D,
            self.format,
            self.aspect,
            mip,
            1,
            0,
            1,
        )
    }

    /// Destroy image, view and memory.
    pub fn dispose(self, device: &Device) {
        unsafe {
            device.raw().destroy_image_view(self.view, None);
            device.raw().destroy_image(self.raw, None);
        }
        self.allocation.dispose(device);
    }
}

/// A cube image with a sampling view and a layered rendering view.
#[derive(Debug)]
pub struct ImageCube {
    raw: vk::Image,
    allocation: Allocation,
    cube_view: vk::ImageView,
    array_view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
    mip_levels: u32,
}

impl ImageCube {
    /// Create a 6-layer cube-compatible image with both views.
    pub fn new(
        device: &Device,
        size: u32,
        format: vk::Format,
        mip_levels: u32,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self, RenderError> {
        unsafe {
            let raw = device
                .raw()
                .create_image(
                    &vk::ImageCreateInfo::builder()
                        .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE)
                        .image_type(vk::ImageType::TYPE_2D)
                        .format(format)
                        .extent(vk::Extent3D {
                            width: size,
                            height: size,
                            depth: 1,
                        })
                        .mip_levels(mip_levels)
                        .array_layers(6)
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .tiling(vk::ImageTiling::OPTIMAL)
                        .usage(usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .initial_layout(vk::ImageLayout::UNDEFINED),
                    None,
                )
                .map_err(RenderError::from)?;

            let requirements = device.raw().get_image_memory_requirements(raw);
            let allocation = match Allocation::new(
                device,
                requirements,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                false,
            ) {
                Ok(allocation) => allocation,
                Err(err) => {
                    device.raw().destroy_image(raw, None);
                    return Err(err);
                }
            };

            if let Err(err) = device.raw().bind_image_memory(raw, allocation.memory(), 0) {
                device.raw().destroy_image(raw, None);
                allocation.dispose(device);
                return Err(err.into());
            }

            let cube_view = create_view(
                device,
                raw,
                vk::ImageViewType::CUBE,
                format,
                aspect,
                0,
                mip_levels,
                0,
                6,
            )?;
            let array_view = create_view(
                device,
                raw,
                vk::ImageViewType::TYPE_2D_ARRAY,
                format,
                aspect,
                0,
                1,
                0,
                6,
            )?;

            Ok(ImageCube {
                raw,
                allocation,
                cube_view,
                array_view,
                extent: vk::Extent2D {
                    width: size,
                    height: size,
                },
                format,
                mip_levels,
            })
        }
    }

    /// Image handle.
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    /// Cube view for sampling.
    pub fn cube_view(&self) -> vk::ImageView {
        self.cube_view
    }

    /// 2D-array view for layered rendering (geometry-shader shadow faces).
    pub fn array_view(&self) -> vk::ImageView {
        self.array_view
    }

    /// Face edge length.
    pub fn size(&self) -> u32 {
        self.extent.width
    }

    /// Format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Mip level count.
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Destroy image, views and memory.
    pub fn dispose(self, device: &Device) {
        unsafe {
            device.raw().destroy_image_view(self.cube_view, None);
            device.raw().destroy_image_view(self.array_view, None);
            device.raw().destroy_image(self.raw, None);
        }
        self.allocation.dispose(device);
    }
}

/// One-shot layout transition of a whole image. Resource owners use this
/// right after creation so a double-buffered image starts the first frame
/// in the layout its steady-state barriers expect.
pub fn transition_layout(
    device: &Device,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    layers: u32,
    to: vk::ImageLayout,
) -> Result<(), RenderError> {
    device.execute_one_shot(|cmd| unsafe {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(to)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: layers,
            })
            .build();
        device.raw().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn create_view(
    device: &Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    base_mip: u32,
    mip_count: u32,
    base_layer: u32,
    layer_count: u32,
) -> Result<vk::ImageView, RenderError> {
    unsafe {
        device
            .raw()
            .create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(view_type)
                    .format(format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: base_mip,
                        level_count: mip_count,
                        base_array_layer: base_layer,
                        layer_count,
                    }),
                None,
            )
            .map_err(RenderError::from)
    }
}

/// Copy texel `data` into mip 0 of `image` (all `layers`), transitioning
/// UNDEFINED → TRANSFER_DST → `final_layout`.
pub(crate) fn upload_texels(
    device: &Device,
    image: vk::Image,
    extent: vk::Extent2D,
    layers: u32,
    mip_levels: u32,
    data: &[u8],
    final_layout: vk::ImageLayout,
) -> Result<(), RenderError> {
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

    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count: layers,
    };

    let result = device.execute_one_shot(|cmd| unsafe {
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .build();
        device.raw().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        device.raw().cmd_copy_buffer_to_image(
            cmd,
            staging.raw(),
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: layers,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            }],
        );

        let to_final = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(final_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .build();
        device.raw().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_final],
        );
    });

    staging.dispose(device);
    result
}

/// Fill mips `1..mip_levels` of `image` by blitting down the chain, leaving
/// the whole image in SHADER_READ_ONLY_OPTIMAL. Mip 0 must already be in
/// TRANSFER_DST_OPTIMAL with its texels written.
pub(crate) fn generate_mips(
    device: &Device,
    image: vk::Image,
    extent: vk::Extent2D,
    mip_levels: u32,
) -> Result<(), RenderError> {
    device.execute_one_shot(|cmd| unsafe {
        let mut width = extent.width as i32;
        let mut height = extent.height as i32;

        for mip in 1..mip_levels {
            let src_range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: mip - 1,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };

            // Previous level becomes the blit source.
            let to_src = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(src_range)
                .build();
            device.raw().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_src],
            );

            let next_width = (width / 2).max(1);
            let next_height = (height / 2).max(1);

            device.raw().cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: mip - 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offsets: [
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: width,
                            y: height,
                            z: 1,
                        },
                    ],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: mip,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: next_width,
                            y: next_height,
                            z: 1,
                        },
                    ],
                }],
                vk::Filter::LINEAR,
            );

            // Source level is final; move it to shader-read.
            let src_to_read = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(src_range)
                .build();
            device.raw().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[src_to_read],
            );

            width = next_width;
            height = next_height;
        }

        // Last level never became a source.
        let last_to_read = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: mip_levels - 1,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        device.raw().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[last_to_read],
        );
    })
}
