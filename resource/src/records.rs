//! GPU-shared records.
//!
//! Every struct here is mirrored by a std430 block in the shaders; layouts
//! are `#[repr(C)]` with explicit padding so the Rust and GLSL sides agree
//! byte for byte. Sizes are asserted in tests.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Vertex of the global vertex buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuVertex {
    /// Object-space position, `w` unused.
    pub position: [f32; 3],
    /// Texture coordinate u.
    pub uv_x: f32,
    /// Object-space normal.
    pub normal: [f32; 3],
    /// Texture coordinate v.
    pub uv_y: f32,
    /// Tangent with handedness in `w`.
    pub tangent: [f32; 4],
}

/// Skinning attributes, a parallel stream bound as a storage buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SkinVertex {
    /// Joint indices into the node's bone range.
    pub joints: [u32; 4],
    /// Joint weights, summing to one.
    pub weights: [f32; 4],
}

/// Per-node record of the node-data bindless buffer. The world matrix lives
/// in the parallel world-matrix buffer at the same index.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct NodeData {
    /// Object-space bounding-sphere center.
    pub center: [f32; 3],
    /// Object-space bounding-sphere radius.
    pub radius: f32,
    /// `NodeFlags` bits.
    pub flags: u32,
    /// Mesh record index.
    pub mesh: u32,
    /// Material record index.
    pub material: u32,
    /// First bone matrix of this node's range, or 0.
    pub bone_offset: u32,
    /// Sprite record index for sprite nodes, 0 otherwise.
    pub sprite: u32,
    /// Padding to a 16-byte multiple.
    pub _pad: [u32; 3],
}

/// Per-mesh record of the mesh-data bindless buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct MeshData {
    /// Object-space AABB minimum.
    pub aabb_min: [f32; 3],
    /// First index in the global index buffer.
    pub first_index: u32,
    /// Object-space AABB maximum.
    pub aabb_max: [f32; 3],
    /// Index count of the mesh.
    pub index_count: u32,
    /// Signed offset added to every index.
    pub vertex_offset: i32,
    /// Padding to a 16-byte multiple.
    pub _pad: [u32; 3],
}

/// Per-material record of the materials bindless buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MaterialData {
    /// Base color factor.
    pub base_color: [f32; 4],
    /// Emissive factor, strength in `w`.
    pub emissive: [f32; 4],
    /// Metallic factor.
    pub metallic: f32,
    /// Roughness factor.
    pub roughness: f32,
    /// Bindless index of the albedo texture, 0 when absent.
    pub albedo_index: u32,
    /// Bindless index of the metallic-roughness texture, 0 when absent.
    pub metallic_roughness_index: u32,
    /// Bindless index of the normal map, 0 when absent.
    pub normal_index: u32,
    /// Bindless index of the emissive texture, 0 when absent.
    pub emissive_index: u32,
    /// Padding to a 16-byte multiple.
    pub _pad: [u32; 2],
}

impl Default for MaterialData {
    fn default() -> Self {
        MaterialData {
            base_color: [1.0; 4],
            emissive: [0.0; 4],
            metallic: 0.0,
            roughness: 1.0,
            albedo_index: 0,
            metallic_roughness_index: 0,
            normal_index: 0,
            emissive_index: 0,
            _pad: [0; 2],
        }
    }
}

/// Light kinds, matching the shader constants.
pub mod light_kind {
    /// Omnidirectional light with a radius.
    pub const POINT: u32 = 0;
    /// Cone light.
    pub const SPOT: u32 = 1;
    /// Infinitely distant light.
    pub const DIRECTIONAL: u32 = 2;
}

/// Per-light record of the lights bindless buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct LightData {
    /// Linear color.
    pub color: [f32; 3],
    /// Intensity multiplier.
    pub intensity: f32,
    /// World-space position.
    pub position: [f32; 3],
    /// Influence radius.
    pub radius: f32,
    /// World-space direction (spot/directional).
    pub direction: [f32; 3],
    /// One of [`light_kind`].
    pub kind: u32,
    /// Cosine of the inner cone angle (spot).
    pub cone_inner_cos: f32,
    /// Cosine of the outer cone angle (spot).
    pub cone_outer_cos: f32,
    /// Shadow slot, or `INVALID_SHADOW_INDEX`.
    pub shadow_index: u32,
    /// Bindless index of the slot's shadow map for the current frame.
    pub shadow_map_index: u32,
}

/// Per-camera record of the per-frame camera buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct CameraData {
    /// View matrix.
    pub view: Mat4,
    /// Projection matrix.
    pub proj: Mat4,
    /// `proj * view`.
    pub view_proj: Mat4,
    /// Inverse of `proj * view`, for position reconstruction.
    pub inverse_view_proj: Mat4,
    /// Frustum planes derived from `view_proj`.
    pub frustum: [Vec4; 6],
    /// World-space camera position.
    pub position: [f32; 3],
    /// Near plane distance.
    pub near: f32,
    /// Viewport extent in pixels.
    pub extent: [f32; 2],
    /// Far plane distance.
    pub far: f32,
    /// Padding to a 16-byte multiple.
    pub _pad: f32,
}

/// Per-slot record of the shadow-data per-frame buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ShadowData {
    /// View matrix; identity for point lights.
    pub view: Mat4,
    /// Projection matrix (perspective, ortho, or 90° cube face).
    pub proj: Mat4,
    /// Frustum planes of `proj * view`; unused for point lights.
    pub frustum: [Vec4; 6],
    /// World-space light position.
    pub position: [f32; 3],
    /// Near plane.
    pub near: f32,
    /// World-space light direction.
    pub direction: [f32; 3],
    /// Far plane.
    pub far: f32,
}

/// Per-sprite record of the sprite bindless buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SpriteData {
    /// World-space center.
    pub center: [f32; 3],
    /// In-plane rotation in radians.
    pub rotation: f32,
    /// World-space size.
    pub size: [f32; 2],
    /// UV rectangle minimum.
    pub uv_min: [f32; 2],
    /// UV rectangle maximum.
    pub uv_max: [f32; 2],
    /// Bindless texture index.
    pub texture_index: u32,
    /// Padding to a 16-byte multiple.
    pub _pad: u32,
    /// Tint color.
    pub color: [f32; 4],
}

/// A bone matrix of the bones bindless buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BoneData {
    /// Skinning matrix.
    pub matrix: Mat4,
}

impl Default for BoneData {
    fn default() -> Self {
        BoneData {
            matrix: Mat4::IDENTITY,
        }
    }
}

/// Mirror of `VkDrawIndexedIndirectCommand`; the cull shaders append these.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct DrawCommand {
    /// Index count of the draw.
    pub index_count: u32,
    /// Always 1; the node id rides in `first_instance`.
    pub instance_count: u32,
    /// First index in the global index buffer.
    pub first_index: u32,
    /// Signed offset added to every index.
    pub vertex_offset: i32,
    /// Node id, read by the vertex shader as `gl_InstanceIndex`.
    pub first_instance: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_sizes_are_std430_friendly() {
        assert_eq!(size_of::<GpuVertex>(), 48);
        assert_eq!(size_of::<SkinVertex>(), 32);
        assert_eq!(size_of::<NodeData>(), 48);
        assert_eq!(size_of::<MeshData>(), 48);
        assert_eq!(size_of::<MaterialData>(), 64);
        assert_eq!(size_of::<LightData>(), 64);
        assert_eq!(size_of::<CameraData>(), 4 * 64 + 6 * 16 + 32);
        assert_eq!(size_of::<ShadowData>(), 2 * 64 + 6 * 16 + 32);
        assert_eq!(size_of::<SpriteData>(), 64);
        assert_eq!(size_of::<DrawCommand>(), 20);
        for size in [
            size_of::<NodeData>(),
            size_of::<MeshData>(),
            size_of::<MaterialData>(),
            size_of::<LightData>(),
            size_of::<CameraData>(),
            size_of::<ShadowData>(),
            size_of::<SpriteData>(),
            size_of::<BoneData>(),
        ] {
            assert_eq!(size % 16, 0);
        }
    }
}
