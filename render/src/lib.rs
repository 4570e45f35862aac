//! The kiln renderer: per-camera GPU-driven visibility, slot-allocated
//! shadows, deferred lighting with image-based ambient, overlays and
//! compositing, all scheduled by the frame graph.

#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

mod overlay;
mod passes;
mod pipeline;
mod pyramid;
mod renderer;
mod scene;
mod shadow;
mod visibility;
mod volumes;

pub use crate::{
    overlay::{DebugDraw, DebugVertex, UiOverlay},
    pipeline::{
        DEPTH_FORMAT, FINAL_COLOR_FORMAT, GBUFFER_ALBEDO_FORMAT, GBUFFER_EMISSIVE_FORMAT,
        GBUFFER_MR_FORMAT, GBUFFER_NORMAL_FORMAT, GBUFFER_POSITION_FORMAT,
    },
    pyramid::{pyramid_dimensions, prev_pow2, DepthPyramid},
    renderer::Renderer,
    scene::{
        bucket_of, Bucket, Camera, CameraPasses, FrameCounts, Light, LightKind, Node, NodeFlags,
        Projection, Scene,
    },
    shadow::{
        directional_shadow_data, point_shadow_data, spot_shadow_data, ShadowSlots, SHADOW_FORMAT,
    },
    visibility::{CameraCull, DRAW_CAPACITY},
    volumes::VolumeMeshes,
};
