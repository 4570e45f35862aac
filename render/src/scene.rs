//! The CPU scene snapshot and its GPU mirror.
//!
//! The renderer is a pure consumer: an embedder-owned scene graph updates
//! these pools each frame (transforms come in already sampled), and
//! `sync_frame` mirrors them into the bindless buffers.

use bitflags::bitflags;
use glam::{Mat4, Vec3};

use kiln_core::{
    Frustum, Handle, Pool, INVALID_SHADOW_INDEX, MAX_BONES, MAX_CAMERAS, MAX_LIGHTS, MAX_NODES,
    MAX_SPRITES,
};
use kiln_resource::{
    light_kind, BoneData, CameraData, LightData, Material, Mesh, NodeData, Resources, SpriteData,
};

use crate::shadow::ShadowSlots;

bitflags! {
    /// Node state bits; the material bits partition every node into
    /// exactly one pipeline bucket.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// Node participates in rendering at all.
        const VISIBLE = 1 << 0;
        /// Transparent bucket.
        const MATERIAL_TRANSPARENT = 1 << 1;
        /// Wireframe bucket.
        const MATERIAL_WIREFRAME = 1 << 2;
        /// Random-color debug bucket.
        const MATERIAL_RANDOM_COLOR = 1 << 3;
        /// Line-strip bucket.
        const MATERIAL_LINE_STRIP = 1 << 4;
        /// Sprite bucket.
        const SPRITE = 1 << 5;
    }
}

bitflags! {
    /// Which per-camera pipeline stages exist for a camera. Attachments
    /// are allocated iff the corresponding bit is set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CameraPasses: u32 {
        /// Depth prepass + geometry pass + depth pyramid.
        const GEOMETRY = 1 << 0;
        /// Ambient/IBL and per-light shading.
        const LIGHTING = 1 << 1;
        /// Transparency, sprites, wireframe, line strips.
        const OVERLAYS = 1 << 2;
        /// Debug line rendering.
        const DEBUG = 1 << 3;
        /// This camera's output is tone-mapped to the swapchain.
        const PRESENT = 1 << 4;
    }
}

impl Default for CameraPasses {
    fn default() -> Self {
        CameraPasses::all()
    }
}

/// The pipeline buckets a node can land in. Exactly one per node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Bucket {
    /// Opaque geometry (the default).
    Opaque = 0,
    /// Alpha-blended geometry, unsorted.
    Transparent = 1,
    /// Camera-facing quads.
    Sprite = 2,
    /// Line-polygon rendering.
    Wireframe = 3,
    /// Debug coloring by node id.
    RandomColor = 4,
    /// Line-strip topology.
    LineStrip = 5,
}

impl Bucket {
    /// All buckets, in dispatch order.
    pub const ALL: [Bucket; 6] = [
        Bucket::Opaque,
        Bucket::Transparent,
        Bucket::Sprite,
        Bucket::Wireframe,
        Bucket::RandomColor,
        Bucket::LineStrip,
    ];

    /// Flag bits a node must have to enter this bucket.
    pub fn include_mask(self) -> NodeFlags {
        let material = match self {
            Bucket::Opaque => NodeFlags::empty(),
            Bucket::Transparent => NodeFlags::MATERIAL_TRANSPARENT,
            Bucket::Sprite => NodeFlags::SPRITE,
            Bucket::Wireframe => NodeFlags::MATERIAL_WIREFRAME,
            Bucket::RandomColor => NodeFlags::MATERIAL_RANDOM_COLOR,
            Bucket::LineStrip => NodeFlags::MATERIAL_LINE_STRIP,
        };
        NodeFlags::VISIBLE | material
    }

    /// Flag bits that exclude a node from this bucket.
    pub fn exclude_mask(self) -> NodeFlags {
        let buckets = NodeFlags::MATERIAL_TRANSPARENT
            | NodeFlags::MATERIAL_WIREFRAME
            | NodeFlags::MATERIAL_RANDOM_COLOR
            | NodeFlags::MATERIAL_LINE_STRIP
            | NodeFlags::SPRITE;
        // Higher-priority bucket bits override lower ones, mirroring
        // `bucket_of`.
        let priority = match self {
            Bucket::Sprite => NodeFlags::empty(),
            Bucket::LineStrip => NodeFlags::SPRITE,
            Bucket::Wireframe => NodeFlags::SPRITE | NodeFlags::MATERIAL_LINE_STRIP,
            Bucket::RandomColor => {
                NodeFlags::SPRITE | NodeFlags::MATERIAL_LINE_STRIP | NodeFlags::MATERIAL_WIREFRAME
            }
            Bucket::Transparent => {
                NodeFlags::SPRITE
                    | NodeFlags::MATERIAL_LINE_STRIP
                    | NodeFlags::MATERIAL_WIREFRAME
                    | NodeFlags::MATERIAL_RANDOM_COLOR
            }
            Bucket::Opaque => buckets,
        };
        priority
    }
}

/// The single bucket a flag set belongs to.
pub fn bucket_of(flags: NodeFlags) -> Option<Bucket> {
    if !flags.contains(NodeFlags::VISIBLE) {
        return None;
    }
    Some(if flags.contains(NodeFlags::SPRITE) {
        Bucket::Sprite
    } else if flags.contains(NodeFlags::MATERIAL_LINE_STRIP) {
        Bucket::LineStrip
    } else if flags.contains(NodeFlags::MATERIAL_WIREFRAME) {
        Bucket::Wireframe
    } else if flags.contains(NodeFlags::MATERIAL_RANDOM_COLOR) {
        Bucket::RandomColor
    } else if flags.contains(NodeFlags::MATERIAL_TRANSPARENT) {
        Bucket::Transparent
    } else {
        Bucket::Opaque
    })
}

/// A renderable instance.
#[derive(Clone, Copy, Debug)]
pub struct Node {
    /// World transform, already sampled by the embedder.
    pub world: Mat4,
    /// Mesh handle.
    pub mesh: Handle<Mesh>,
    /// Material handle.
    pub material: Handle<Material>,
    /// State bits.
    pub flags: NodeFlags,
    /// `(first, count)` into the bones buffer; `count == 0` means rigid.
    pub bone_range: (u32, u32),
    /// Sprite record index for `SPRITE` nodes, 0 otherwise.
    pub sprite: u32,
}

/// Light kind and per-kind parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    /// Omnidirectional.
    Point,
    /// Cone light with inner/outer angles in radians.
    Spot {
        /// Full-intensity angle.
        angle_inner: f32,
        /// Falloff-to-zero angle.
        angle_outer: f32,
    },
    /// Infinitely distant light.
    Directional,
}

impl LightKind {
    /// Wire constant of the kind.
    pub fn gpu_kind(&self) -> u32 {
        match self {
            LightKind::Point => light_kind::POINT,
            LightKind::Spot { .. } => light_kind::SPOT,
            LightKind::Directional => light_kind::DIRECTIONAL,
        }
    }
}

/// A scene light.
#[derive(Clone, Copy, Debug)]
pub struct Light {
    /// Kind and kind parameters.
    pub kind: LightKind,
    /// Linear color.
    pub color: Vec3,
    /// Intensity multiplier.
    pub intensity: f32,
    /// World position (ignored for directional).
    pub position: Vec3,
    /// Direction (ignored for point).
    pub direction: Vec3,
    /// Influence radius.
    pub radius: f32,
    /// Whether this light wants a shadow slot.
    pub cast_shadow: bool,
    /// Assigned slot, or `INVALID_SHADOW_INDEX`. Written at sync time.
    pub shadow_index: u32,
}

impl Light {
    /// A light of the given kind with defaults.
    pub fn new(kind: LightKind) -> Self {
        Light {
            kind,
            color: Vec3::ONE,
            intensity: 1.0,
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            radius: 10.0,
            cast_shadow: false,
            shadow_index: INVALID_SHADOW_INDEX,
        }
    }
}

/// Camera projection.
#[derive(Clone, Copy, Debug)]
pub enum Projection {
    /// Perspective projection.
    Perspective {
        /// Vertical field of view in radians.
        fovy: f32,
        /// Width over height.
        aspect: f32,
        /// Near plane.
        near: f32,
        /// Far plane.
        far: f32,
    },
    /// Orthographic projection.
    Orthographic {
        /// Half extent on X.
        half_width: f32,
        /// Half extent on Y.
        half_height: f32,
        /// Near plane.
        near: f32,
        /// Far plane.
        far: f32,
    },
}

impl Projection {
    /// The projection matrix (Vulkan clip space, Y flipped).
    pub fn matrix(&self) -> Mat4 {
        let flip = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0));
        match *self {
            Projection::Perspective {
                fovy,
                aspect,
                near,
                far,
            } => flip * Mat4::perspective_rh(fovy, aspect, near, far),
            Projection::Orthographic {
                half_width,
                half_height,
                near,
                far,
            } => {
                flip * Mat4::orthographic_rh(
                    -half_width,
                    half_width,
                    -half_height,
                    half_height,
                    near,
                    far,
                )
            }
        }
    }

    /// Near/far planes.
    pub fn depth_range(&self) -> (f32, f32) {
        match *self {
            Projection::Perspective { near, far, .. }
            | Projection::Orthographic { near, far, .. } => (near, far),
        }
    }

    /// Update the aspect ratio (perspective only); called on resize.
    pub fn set_aspect(&mut self, new_aspect: f32) {
        if let Projection::Perspective { aspect, .. } = self {
            *aspect = new_aspect;
        }
    }
}

/// A viewport into the scene.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    /// Projection parameters.
    pub projection: Projection,
    /// View matrix.
    pub view: Mat4,
    /// Viewport extent in pixels.
    pub extent: (u32, u32),
    /// Which per-camera stages run.
    pub enabled_passes: CameraPasses,
}

impl Camera {
    /// GPU record of this camera.
    pub fn record(&self) -> CameraData {
        let proj = self.projection.matrix();
        let view_proj = proj * self.view;
        let frustum = Frustum::from_matrix(view_proj);
        let (near, far) = self.projection.depth_range();
        let position = self.view.inverse().col(3).truncate();
        CameraData {
            view: self.view,
            proj,
            view_proj,
            inverse_view_proj: view_proj.inverse(),
            frustum: frustum.planes,
            position: position.to_array(),
            near,
            extent: [self.extent.0 as f32, self.extent.1 as f32],
            far,
            _pad: 0.0,
        }
    }
}

/// The scene snapshot: pools plus frame-global data.
#[derive(Debug, Default)]
pub struct Scene {
    /// Renderable nodes.
    pub nodes: Pool<Node>,
    /// Lights.
    pub lights: Pool<Light>,
    /// Cameras.
    pub cameras: Pool<Camera>,
    /// Sprite records referenced by `Node::sprite`.
    pub sprites: Pool<SpriteData>,
    /// Skinning matrices, uploaded verbatim.
    pub bones: Vec<Mat4>,
    topology: u64,
}

impl Scene {
    /// Empty scene.
    pub fn new() -> Self {
        Scene::default()
    }

    /// Add a camera. Changes graph topology.
    pub fn add_camera(&mut self, camera: Camera) -> Handle<Camera> {
        self.topology += 1;
        self.cameras.alloc(camera)
    }

    /// Remove a camera. Changes graph topology.
    pub fn remove_camera(&mut self, handle: Handle<Camera>) {
        if self.cameras.free(handle).is_some() {
            self.topology += 1;
        }
    }

    /// Add a light. Changes graph topology when it casts shadows.
    pub fn add_light(&mut self, light: Light) -> Handle<Light> {
        if light.cast_shadow {
            self.topology += 1;
        }
        self.lights.alloc(light)
    }

    /// Remove a light.
    pub fn remove_light(&mut self, handle: Handle<Light>) {
        if let Some(light) = self.lights.free(handle) {
            if light.cast_shadow {
                self.topology += 1;
            }
        }
    }

    /// Toggle shadow casting on a light. Changes graph topology.
    pub fn set_cast_shadow(&mut self, handle: Handle<Light>, cast: bool) {
        if let Some(light) = self.lights.get_mut(handle) {
            if light.cast_shadow != cast {
                light.cast_shadow = cast;
                self.topology += 1;
            }
        }
    }

    /// Bump the topology version explicitly (resize, pass toggles).
    pub fn invalidate_topology(&mut self) {
        self.topology += 1;
    }

    /// Monotonic topology version; the renderer recompiles the graph when
    /// it changes.
    pub fn topology_version(&self) -> u64 {
        self.topology
    }

    /// Active cameras in slot order; scope index = position in this list.
    pub fn active_cameras(&self) -> Vec<Handle<Camera>> {
        self.cameras
            .iter()
            .map(|(handle, _)| handle)
            .take(MAX_CAMERAS as usize)
            .collect()
    }

    /// Number of live nodes the GPU buffers must cover (highest slot + 1).
    pub fn node_span(&self) -> u32 {
        (self.nodes.capacity() as u32).min(MAX_NODES)
    }

    /// Upload the frame's GPU mirrors: nodes, world matrices, lights (with
    /// shadow-slot assignment), cameras, bones and sprites.
    pub fn sync_frame(
        &mut self,
        device: &kiln_resource::Device,
        resources: &mut Resources,
        shadows: &mut ShadowSlots,
        frame_index: usize,
    ) -> FrameCounts {
        // Nodes + world matrices, written by slot so `first_instance`
        // addressing stays stable.
        for (handle, node) in self.nodes.iter() {
            let slot = handle.index() as usize;
            if slot >= MAX_NODES as usize {
                log::warn!("node slot {slot} beyond MAX_NODES, skipped");
                continue;
            }
            let mesh = resources.mesh(node.mesh);
            let (center, radius) = mesh
                .map(|mesh| mesh.aabb.bounding_sphere())
                .unwrap_or((Vec3::ZERO, 0.0));
            let flags = if mesh.is_some() || node.flags.contains(NodeFlags::SPRITE) {
                node.flags
            } else {
                // Meshless nodes are treated as absent.
                node.flags & !NodeFlags::VISIBLE
            };
            resources.nodes.write(
                slot,
                &NodeData {
                    center: center.to_array(),
                    radius,
                    flags: flags.bits(),
                    mesh: node.mesh.index(),
                    material: node.material.index(),
                    // Rigid nodes carry the sentinel; the vertex shaders
                    // skip skinning on it.
                    bone_offset: if node.bone_range.1 > 0 {
                        node.bone_range.0
                    } else {
                        u32::MAX
                    },
                    sprite: node.sprite,
                    _pad: [0; 3],
                },
            );
            resources.world.write(slot, &node.world);
        }

        // Shadow slots, then the light array with resolved indices.
        shadows.assign(device, self, resources, frame_index);

        let mut light_count = 0u32;
        for (_, light) in self.lights.iter() {
            if light_count >= MAX_LIGHTS {
                log::warn!("more than MAX_LIGHTS lights, extras skipped");
                break;
            }
            let (cone_inner, cone_outer) = match light.kind {
                LightKind::Spot {
                    angle_inner,
                    angle_outer,
                } => (angle_inner.cos(), angle_outer.cos()),
                _ => (0.0, 0.0),
            };
            let shadow_map_index = if light.shadow_index == INVALID_SHADOW_INDEX {
                0
            } else {
                shadows.texture_index(light.shadow_index, frame_index)
            };
            resources.lights.write(
                light_count as usize,
                &LightData {
                    color: light.color.to_array(),
                    intensity: light.intensity,
                    position: light.position.to_array(),
                    radius: light.radius,
                    direction: light.direction.normalize_or_zero().to_array(),
                    kind: light.kind.gpu_kind(),
                    cone_inner_cos: cone_inner,
                    cone_outer_cos: cone_outer,
                    shadow_index: light.shadow_index,
                    shadow_map_index,
                },
            );
            light_count += 1;
        }

        // Cameras, by active-list position.
        let active = self.active_cameras();
        for (slot, &handle) in active.iter().enumerate() {
            if let Some(camera) = self.cameras.get(handle) {
                resources.cameras.write(frame_index, slot, &camera.record());
            }
        }

        // Bones and sprites.
        let bone_count = self.bones.len().min(MAX_BONES as usize);
        for (slot, matrix) in self.bones.iter().take(bone_count).enumerate() {
            resources.bones.write(slot, &BoneData { matrix: *matrix });
        }
        for (handle, sprite) in self.sprites.iter() {
            let slot = handle.index() as usize;
            if slot < MAX_SPRITES as usize {
                resources.sprites.write(slot, sprite);
            }
        }

        FrameCounts {
            node_span: self.node_span(),
            light_count,
            camera_count: active.len() as u32,
            shadow_slot_count: shadows.active_slots(),
        }
    }
}

/// Per-frame counts the passes push to shaders.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCounts {
    /// Node slots the cull dispatch covers.
    pub node_span: u32,
    /// Compacted light count.
    pub light_count: u32,
    /// Active cameras.
    pub camera_count: u32,
    /// Assigned shadow slots.
    pub shadow_slot_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_flag_set_lands_in_exactly_one_bucket() {
        for bits in 0..64u32 {
            let flags = NodeFlags::from_bits_truncate(bits);
            let bucket = bucket_of(flags);
            if !flags.contains(NodeFlags::VISIBLE) {
                assert_eq!(bucket, None);
                continue;
            }
            let bucket = bucket.expect("visible nodes always bucket");
            // The include/exclude masks agree with bucket_of.
            let mut matches = 0;
            for candidate in Bucket::ALL {
                let include = candidate.include_mask();
                let exclude = candidate.exclude_mask();
                if flags.contains(include) && (flags & exclude).is_empty() {
                    matches += 1;
                    assert_eq!(candidate, bucket);
                }
            }
            assert_eq!(matches, 1, "flags {flags:?} matched {matches} buckets");
        }
    }

    #[test]
    fn sprite_outranks_other_material_bits() {
        let flags = NodeFlags::VISIBLE | NodeFlags::SPRITE | NodeFlags::MATERIAL_TRANSPARENT;
        assert_eq!(bucket_of(flags), Some(Bucket::Sprite));
    }

    #[test]
    fn topology_version_tracks_structure() {
        let mut scene = Scene::new();
        let before = scene.topology_version();
        let camera = scene.add_camera(Camera {
            projection: Projection::Perspective {
                fovy: 1.0,
                aspect: 1.0,
                near: 0.1,
                far: 100.0,
            },
            view: Mat4::IDENTITY,
            extent: (640, 480),
            enabled_passes: CameraPasses::default(),
        });
        assert_ne!(scene.topology_version(), before);

        let version = scene.topology_version();
        let light = scene.add_light(Light::new(LightKind::Point));
        // Non-shadow-casting lights do not change topology.
        assert_eq!(scene.topology_version(), version);
        scene.set_cast_shadow(light, true);
        assert_ne!(scene.topology_version(), version);

        scene.remove_camera(camera);
        assert!(scene.cameras.get(camera).is_none());
    }

    #[test]
    fn reference_cull_never_exceeds_matching_nodes() {
        // Host-side twin of the cull shader's decision sequence: bucket
        // masks, then the frustum sphere test. The sum of bucket draws can
        // never exceed the matching node count, and equals it when the
        // frustum test is disabled.
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 50.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let frustum = Frustum::from_matrix(proj * view);

        let nodes = [
            (NodeFlags::VISIBLE, Vec3::new(0.0, 0.0, -10.0)),
            (NodeFlags::VISIBLE, Vec3::new(0.0, 0.0, 100.0)), // behind
            (
                NodeFlags::VISIBLE | NodeFlags::MATERIAL_TRANSPARENT,
                Vec3::new(1.0, 0.0, -5.0),
            ),
            (NodeFlags::empty(), Vec3::new(0.0, 0.0, -2.0)), // invisible
            (
                NodeFlags::VISIBLE | NodeFlags::SPRITE,
                Vec3::new(0.0, 0.0, -200.0), // past far
            ),
        ];

        let cull = |frustum_on: bool| {
            let mut per_bucket = [0u32; 6];
            for &(flags, center) in &nodes {
                for bucket in Bucket::ALL {
                    let include = bucket.include_mask();
                    let exclude = bucket.exclude_mask();
                    if !flags.contains(include) || !(flags & exclude).is_empty() {
                        continue;
                    }
                    if frustum_on && !frustum.contains_sphere(center, 0.5) {
                        continue;
                    }
                    per_bucket[bucket as usize] += 1;
                }
            }
            per_bucket
        };

        let matching: u32 = nodes
            .iter()
            .filter(|(flags, _)| bucket_of(*flags).is_some())
            .count() as u32;

        let culled: u32 = cull(true).iter().sum();
        let unculled: u32 = cull(false).iter().sum();
        assert!(culled <= matching);
        assert_eq!(unculled, matching);
        // The out-of-frustum nodes were rejected.
        assert_eq!(culled, 2);
    }

    #[test]
    fn camera_record_has_valid_frustum() {
        let camera = Camera {
            projection: Projection::Perspective {
                fovy: std::f32::consts::FRAC_PI_2,
                aspect: 1.0,
                near: 0.1,
                far: 100.0,
            },
            view: Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y),
            extent: (800, 600),
            enabled_passes: CameraPasses::default(),
        };
        let record = camera.record();
        assert!(record.far > record.near);
        assert!(record.near >= 0.1);
        let frustum = Frustum {
            planes: record.frustum,
        };
        // The look-at target is inside; a point behind the camera is not.
        assert!(frustum.contains_sphere(Vec3::ZERO, 0.1));
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, 20.0), 0.1));
    }
}
