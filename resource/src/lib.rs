//! Device ownership and the bindless resource manager.
//!
//! Everything a shader can reach through a 32-bit index lives here: the
//! texture pools behind the update-after-bind descriptor array, the global
//! vertex/index arenas, and the bindless storage buffers mirrored from the
//! CPU each frame. The four buffer variants (immutable, mutable, per-frame,
//! bindless) cover every access pattern the passes use.

#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

mod bindless;
mod buffer;
mod device;
mod image;
mod manager;
mod material;
mod memory;
mod mesh;
mod records;
mod sets;

pub use crate::{
    bindless::{BindlessTables, IndexAllocator, SamplerKind},
    buffer::{BindlessBuffer, ImmutableBuffer, MutableBuffer, PerFrameBuffer, RawBuffer},
    device::{Device, QueueInfo},
    image::{transition_layout, Image2D, ImageCube},
    manager::{Resources, Texture2D, TextureCube},
    material::Material,
    memory::{find_memory_type, Allocation},
    mesh::{Mesh, MeshArena, RangeAlloc},
    records::{
        light_kind, BoneData, CameraData, DrawCommand, GpuVertex, LightData, MaterialData,
        MeshData, NodeData, ShadowData, SkinVertex, SpriteData,
    },
    sets::{create_layout, DescriptorArena, Layouts},
};
