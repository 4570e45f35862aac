//! Shadow slot allocation and shadow-map storage.
//!
//! Each frame the shadow-casting lights are assigned compact slot indices
//! `0..k`; lights past `MAX_SHADOW_MAPS` render unshadowed. A slot owns,
//! per frame in flight, a 2D depth map and/or a cube depth map (created
//! lazily for the kinds that have used the slot), the indirect draw
//! buffers its cull pass fills, and the descriptor set the cull pass
//! writes through.

use ash::vk;
use glam::{Mat4, Vec3};

use kiln_core::{
    Frustum, RenderError, FRAMES_IN_FLIGHT, INVALID_SHADOW_INDEX, MAX_SHADOW_MAPS,
    SHADOW_MAP_SIZE,
};
use kiln_resource::{
    create_layout, light_kind, Device, Image2D, ImageCube, RawBuffer, Resources, ShadowData,
};

/// Indirect-draw capacity of one shadow slot.
pub const SHADOW_DRAW_CAPACITY: u32 = 4096;

/// Shadow map format.
pub const SHADOW_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

fn flip_y() -> Mat4 {
    Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0))
}

/// Spot-light shadow view/projection.
///
/// The up vector is `Y` unless the direction is nearly collinear with it,
/// in which case `Z` keeps the basis well-conditioned.
pub fn spot_shadow_data(
    position: Vec3,
    direction: Vec3,
    angle_outer: f32,
    radius: f32,
) -> ShadowData {
    let direction = direction.normalize_or_zero();
    let up = if direction.dot(Vec3::Y).abs() > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let view = Mat4::look_at_rh(position, position + direction, up);
    let near = 0.1;
    let far = (near + 0.1).max(radius);
    let fovy = (2.0 * angle_outer).max(1.0e-2);
    let proj = flip_y() * Mat4::perspective_rh(fovy, 1.0, near, far);
    let frustum = Frustum::from_matrix(proj * view);
    ShadowData {
        view,
        proj,
        frustum: frustum.planes,
        position: position.to_array(),
        near,
        direction: direction.to_array(),
        far,
    }
}

/// Directional-light shadow view/projection: an orthographic box looking
/// along the light from `position - direction * radius`.
pub fn directional_shadow_data(position: Vec3, direction: Vec3, radius: f32) -> ShadowData {
    let direction = direction.normalize_or_zero();
    let up = if direction.dot(Vec3::Y).abs() > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = position - direction * radius;
    let view = Mat4::look_at_rh(eye, eye + direction, up);
    let half = radius.max(0.5);
    let near = 0.1;
    let far = (near + 0.1).max(2.0 * radius);
    let proj = flip_y() * Mat4::orthographic_rh(-half, half, -half, half, near, far);
    let frustum = Frustum::from_matrix(proj * view);
    ShadowData {
        view,
        proj,
        frustum: frustum.planes,
        position: position.to_array(),
        near,
        direction: direction.to_array(),
        far,
    }
}

/// Point-light shadow data: identity view and one 90° square projection
/// shared by all six cube faces (the geometry shader applies the per-face
/// bases). The frustum planes are unused; culling is sphere-vs-radius.
pub fn point_shadow_data(position: Vec3, radius: f32) -> ShadowData {
    let near = 0.1;
    let far = (near + 0.1).max(radius);
    let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, far);
    ShadowData {
        view: Mat4::IDENTITY,
        proj,
        frustum: Default::default(),
        position: position.to_array(),
        near,
        direction: [0.0, 0.0, 0.0],
        far,
    }
}

struct SlotMap2D {
    images: Vec<Image2D>,
    indices: Vec<u32>,
    framebuffers: Vec<vk::Framebuffer>,
}

struct SlotCube {
    images: Vec<ImageCube>,
    indices: Vec<u32>,
    framebuffers: Vec<vk::Framebuffer>,
}

/// One shadow slot's storage.
pub struct Slot {
    /// Light kind currently assigned to the slot.
    pub kind: u32,
    /// Shadow data of the current assignment.
    pub data: ShadowData,
    map2d: Option<SlotMap2D>,
    cube: Option<SlotCube>,
    /// Per-FIF indirect commands, GPU-filled.
    pub draw_commands: Vec<RawBuffer>,
    /// Per-FIF draw counts, GPU-filled.
    pub draw_counts: Vec<RawBuffer>,
    /// Per-FIF cull-output descriptor sets (commands + count).
    pub out_sets: Vec<vk::DescriptorSet>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Slot").field("kind", &self.kind).finish()
    }
}

/// The shadow subsystem's slot pool.
pub struct ShadowSlots {
    slots: Vec<Slot>,
    active: u32,
    output_layout: vk::DescriptorSetLayout,
}

impl std::fmt::Debug for ShadowSlots {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ShadowSlots")
            .field("slots", &self.slots.len())
            .field("active", &self.active)
            .finish()
    }
}

impl ShadowSlots {
    /// Empty slot pool.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        let output_layout = create_layout(
            device,
            &[
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build(),
            ],
        )?;
        Ok(ShadowSlots {
            slots: Vec::new(),
            active: 0,
            output_layout,
        })
    }

    /// The cull-output set layout (commands at 0, count at 1).
    pub fn output_layout(&self) -> vk::DescriptorSetLayout {
        self.output_layout
    }

    /// Number of slots assigned this frame.
    pub fn active_slots(&self) -> u32 {
        self.active
    }

    /// Slot storage, for pass recording.
    pub fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize).filter(|_| index < self.active)
    }

    /// Assign compact slots to shadow-casting lights and publish this
    /// frame's `ShadowData`. Lights beyond the pool get
    /// `INVALID_SHADOW_INDEX`.
    pub fn assign(
        &mut self,
        device: &Device,
        scene: &mut crate::scene::Scene,
        resources: &mut Resources,
        frame_index: usize,
    ) {
        let mut next = 0u32;
        let handles: Vec<_> = scene.lights.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            let Some(light) = scene.lights.get_mut(handle) else {
                continue;
            };
            if !light.cast_shadow {
                light.shadow_index = INVALID_SHADOW_INDEX;
                continue;
            }
            if next >= MAX_SHADOW_MAPS {
                light.shadow_index = INVALID_SHADOW_INDEX;
                continue;
            }

            let slot_index = next;
            next += 1;

            let kind = light.kind.gpu_kind();
            let data = match light.kind {
                crate::scene::LightKind::Spot { angle_outer, .. } => {
                    spot_shadow_data(light.position, light.direction, angle_outer, light.radius)
                }
                crate::scene::LightKind::Directional => {
                    directional_shadow_data(light.position, light.direction, light.radius)
                }
                crate::scene::LightKind::Point => {
                    point_shadow_data(light.position, light.radius)
                }
            };

            if let Err(err) = self.ensure_slot(device, resources, slot_index, kind) {
                log::warn!("shadow slot {slot_index} allocation failed: {err}; light unshadowed");
                light.shadow_index = INVALID_SHADOW_INDEX;
                next = slot_index;
                continue;
            }

            let slot = &mut self.slots[slot_index as usize];
            slot.kind = kind;
            slot.data = data;
            resources
                .shadow_data
                .write(frame_index, slot_index as usize, &data);
            light.shadow_index = slot_index;
        }
        self.active = next;
    }

    fn ensure_slot(
        &mut self,
        device: &Device,
        resources: &mut Resources,
        index: u32,
        kind: u32,
    ) -> Result<(), RenderError> {
        while self.slots.len() <= index as usize {
            let mut draw_commands = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut draw_counts = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut out_sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for _ in 0..FRAMES_IN_FLIGHT {
                let commands = RawBuffer::new(
                    device,
                    u64::from(SHADOW_DRAW_CAPACITY) * 20,
                    vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    false,
                )?;
                let count = RawBuffer::new(
                    device,
                    4,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::INDIRECT_BUFFER
                        | vk::BufferUsageFlags::TRANSFER_DST,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    false,
                )?;
                let set = resources.arena.allocate(device, self.output_layout)?;
                resources.arena.write_buffer(
                    device,
                    set,
                    0,
                    vk::DescriptorType::STORAGE_BUFFER,
                    commands.raw(),
                    commands.size(),
                );
                resources.arena.write_buffer(
                    device,
                    set,
                    1,
                    vk::DescriptorType::STORAGE_BUFFER,
                    count.raw(),
                    count.size(),
                );
                draw_commands.push(commands);
                draw_counts.push(count);
                out_sets.push(set);
            }
            self.slots.push(Slot {
                kind: light_kind::SPOT,
                data: ShadowData::default(),
                map2d: None,
                cube: None,
                draw_commands,
                draw_counts,
                out_sets,
            });
        }

        let needs_2d = kind != light_kind::POINT;
        // Storage for a kind is created on first use and kept; slots that
        // alternate between kinds keep both maps alive.
        let slot = &mut self.slots[index as usize];
        if needs_2d && slot.map2d.is_none() {
            let mut images = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut indices = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for _ in 0..FRAMES_IN_FLIGHT {
                let image = Image2D::new(
                    device,
                    vk::Extent2D {
                        width: SHADOW_MAP_SIZE,
                        height: SHADOW_MAP_SIZE,
                    },
                    SHADOW_FORMAT,
                    1,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    vk::ImageAspectFlags::DEPTH,
                )?;
                // Start in the layout the steady-state frame ends with.
                kiln_resource::transition_layout(
                    device,
                    image.raw(),
                    vk::ImageAspectFlags::DEPTH,
                    1,
                    1,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                )?;
                let bindless = resources.tables.alloc_index()?;
                resources.tables.write_texture(
                    device,
                    bindless,
                    image.view(),
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                );
                images.push(image);
                indices.push(bindless);
            }
            slot.map2d = Some(SlotMap2D {
                images,
                indices,
                framebuffers: Vec::new(),
            });
        }
        if !needs_2d && slot.cube.is_none() {
            let mut images = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut indices = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for _ in 0..FRAMES_IN_FLIGHT {
                let image = ImageCube::new(
                    device,
                    SHADOW_MAP_SIZE,
                    SHADOW_FORMAT,
                    1,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    vk::ImageAspectFlags::DEPTH,
                )?;
                kiln_resource::transition_layout(
                    device,
                    image.raw(),
                    vk::ImageAspectFlags::DEPTH,
                    1,
                    6,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                )?;
                let bindless = resources.tables.alloc_index()?;
                resources.tables.write_texture(
                    device,
                    bindless,
                    image.cube_view(),
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                );
                images.push(image);
                indices.push(bindless);
            }
            slot.cube = Some(SlotCube {
                images,
                indices,
                framebuffers: Vec::new(),
            });
        }
        Ok(())
    }

    /// Bindless index of the slot's shadow map for `frame`, honoring the
    /// slot's current kind. Returns 0 (the absent sentinel) for unassigned
    /// slots.
    pub fn texture_index(&self, slot: u32, frame: usize) -> u32 {
        let Some(slot) = self.slots.get(slot as usize) else {
            return 0;
        };
        let fif = frame % FRAMES_IN_FLIGHT;
        if slot.kind == light_kind::POINT {
            slot.cube.as_ref().map_or(0, |cube| cube.indices[fif])
        } else {
            slot.map2d.as_ref().map_or(0, |map| map.indices[fif])
        }
    }

    /// Depth image and view for rendering into the slot this frame.
    /// For point slots the view is the layered array view.
    pub fn render_target(&self, slot: u32, frame: usize) -> Option<(vk::Image, vk::ImageView)> {
        let slot = self.slots.get(slot as usize)?;
        let fif = frame % FRAMES_IN_FLIGHT;
        if slot.kind == light_kind::POINT {
            let cube = slot.cube.as_ref()?;
            Some((cube.images[fif].raw(), cube.images[fif].array_view()))
        } else {
            let map = slot.map2d.as_ref()?;
            Some((map.images[fif].raw(), map.images[fif].view()))
        }
    }

    /// Cached framebuffer for the slot's active kind, building it on first
    /// use from the given compatible render pass.
    pub fn framebuffer(
        &mut self,
        device: &Device,
        slot: u32,
        frame: usize,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Framebuffer, RenderError> {
        let fif = frame % FRAMES_IN_FLIGHT;
        let slot = self
            .slots
            .get_mut(slot as usize)
            .ok_or(RenderError::InvalidHandle)?;
        let (views, framebuffers, layers): (Vec<vk::ImageView>, &mut Vec<vk::Framebuffer>, u32) =
            if slot.kind == light_kind::POINT {
                let cube = slot.cube.as_mut().ok_or(RenderError::InvalidHandle)?;
                (
                    cube.images.iter().map(ImageCube::array_view).collect(),
                    &mut cube.framebuffers,
                    6,
                )
            } else {
                let map = slot.map2d.as_mut().ok_or(RenderError::InvalidHandle)?;
                (
                    map.images.iter().map(Image2D::view).collect(),
                    &mut map.framebuffers,
                    1,
                )
            };
        if framebuffers.is_empty() {
            for &view in &views {
                let attachments = [view];
                let framebuffer = unsafe {
                    device
                        .raw()
                        .create_framebuffer(
                            &vk::FramebufferCreateInfo::builder()
                                .render_pass(render_pass)
                                .attachments(&attachments)
                                .width(SHADOW_MAP_SIZE)
                                .height(SHADOW_MAP_SIZE)
                                .layers(layers),
                            None,
                        )
                        .map_err(RenderError::from)?
                };
                framebuffers.push(framebuffer);
            }
        }
        Ok(framebuffers[fif])
    }

    /// Framebuffer of the slot's active kind, if already built by
    /// [`ShadowSlots::framebuffer`] this frame.
    pub fn framebuffer_cached(&self, slot: u32, frame: usize) -> Option<vk::Framebuffer> {
        let fif = frame % FRAMES_IN_FLIGHT;
        let slot = self.slots.get(slot as usize)?;
        let framebuffers = if slot.kind == light_kind::POINT {
            &slot.cube.as_ref()?.framebuffers
        } else {
            &slot.map2d.as_ref()?.framebuffers
        };
        framebuffers.get(fif).copied()
    }

    /// Destroy all slot storage. The device must be idle.
    pub fn dispose(self, device: &Device, resources: &mut Resources) {
        unsafe {
            for slot in self.slots {
                if let Some(map) = slot.map2d {
                    for framebuffer in map.framebuffers {
                        device.raw().destroy_framebuffer(framebuffer, None);
                    }
                    for index in map.indices {
                        resources.tables.free_index(index);
                    }
                    for image in map.images {
                        image.dispose(device);
                    }
                }
                if let Some(cube) = slot.cube {
                    for framebuffer in cube.framebuffers {
                        device.raw().destroy_framebuffer(framebuffer, None);
                    }
                    for index in cube.indices {
                        resources.tables.free_index(index);
                    }
                    for image in cube.images {
                        image.dispose(device);
                    }
                }
                for buffer in slot.draw_commands.into_iter().chain(slot.draw_counts) {
                    buffer.dispose(device);
                }
            }
            device
                .raw()
                .destroy_descriptor_set_layout(self.output_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_frustum(data: &ShadowData) {
        assert!(data.far > data.near);
        assert!(data.near >= 0.1);
        let frustum = Frustum {
            planes: data.frustum,
        };
        // Plane normals are unit length.
        for plane in frustum.planes {
            let length = (plane.x * plane.x + plane.y * plane.y + plane.z * plane.z).sqrt();
            assert!((length - 1.0).abs() < 1.0e-3, "plane not normalized");
        }
    }

    #[test]
    fn spot_view_uses_y_up_for_horizontal_directions() {
        let data = spot_shadow_data(Vec3::new(1.0, 2.0, 3.0), Vec3::X, 0.6, 15.0);
        assert_valid_frustum(&data);
        // A point in front of the light is inside the frustum.
        let frustum = Frustum {
            planes: data.frustum,
        };
        assert!(frustum.contains_sphere(Vec3::new(6.0, 2.0, 3.0), 0.1));
        assert!(!frustum.contains_sphere(Vec3::new(-6.0, 2.0, 3.0), 0.1));
    }

    #[test]
    fn spot_view_switches_up_axis_when_looking_down() {
        // look_at with a collinear up would degenerate; the fallback keeps
        // the view finite.
        let data = spot_shadow_data(Vec3::new(0.0, 10.0, 0.0), Vec3::NEG_Y, 0.5, 20.0);
        assert!(data.view.is_finite());
        assert_valid_frustum(&data);
        let frustum = Frustum {
            planes: data.frustum,
        };
        assert!(frustum.contains_sphere(Vec3::new(0.0, 2.0, 0.0), 0.1));
    }

    #[test]
    fn spot_far_tracks_radius() {
        let data = spot_shadow_data(Vec3::ZERO, Vec3::X, 0.5, 42.0);
        assert_eq!(data.far, 42.0);
        // Tiny radii still satisfy far > near.
        let tiny = spot_shadow_data(Vec3::ZERO, Vec3::X, 0.5, 0.0);
        assert!(tiny.far > tiny.near);
    }

    #[test]
    fn directional_box_contains_the_lit_region() {
        let data = directional_shadow_data(Vec3::ZERO, Vec3::new(0.0, -1.0, 0.0), 10.0);
        assert_valid_frustum(&data);
        let frustum = Frustum {
            planes: data.frustum,
        };
        // The target position itself is covered.
        assert!(frustum.contains_sphere(Vec3::ZERO, 0.1));
        // Sideways beyond the half extent is not.
        assert!(!frustum.contains_sphere(Vec3::new(100.0, 0.0, 0.0), 0.1));
    }

    #[test]
    fn point_data_has_identity_view_and_square_projection() {
        let data = point_shadow_data(Vec3::new(5.0, 0.0, 0.0), 25.0);
        assert_eq!(data.view, Mat4::IDENTITY);
        assert!(data.far > data.near);
        assert_eq!(data.position, [5.0, 0.0, 0.0]);
    }
}
