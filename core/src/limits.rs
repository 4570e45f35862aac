//! Build-time limits shared by the CPU code and the shader specialization
//! constants.

/// Number of frames the CPU may record ahead of the GPU. Every
/// double-buffered resource has this many physical copies.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound of shadow-casting lights that get a shadow slot per frame.
pub const MAX_SHADOW_MAPS: u32 = 16;

/// Edge length of every shadow map (2D and cube face).
pub const SHADOW_MAP_SIZE: u32 = 512;

/// Sentinel stored in a light's `shadow_index` when it casts no shadow.
pub const INVALID_SHADOW_INDEX: u32 = 0xFFFF_FFFF;

/// Hard cap on depth-pyramid mip levels.
pub const MAX_DEPTH_MIPS_LEVEL: u32 = 16;

/// Specialization-constant bound for per-frame lights.
pub const MAX_LIGHTS: u32 = 64;

/// Bindless buffer capacities.
pub const MAX_NODES: u32 = 16_384;
/// Mesh record capacity of the mesh-data bindless buffer.
pub const MAX_MESHES: u32 = 4_096;
/// Material record capacity of the materials bindless buffer.
pub const MAX_MATERIALS: u32 = 4_096;
/// Bone matrix capacity of the bones bindless buffer.
pub const MAX_BONES: u32 = 4_096;
/// Sprite record capacity of the sprite bindless buffer.
pub const MAX_SPRITES: u32 = 4_096;
/// Active camera bound.
pub const MAX_CAMERAS: u32 = 8;

/// Capacity of the bindless sampled-image descriptor array.
pub const MAX_TEXTURES: u32 = 4_096;

/// Bindless index 0 is reserved as the "absent" sentinel; allocators start
/// handing out indices at 1.
pub const BINDLESS_INDEX_ABSENT: u32 = 0;
