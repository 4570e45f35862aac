//! Windowing support: the swapchain target and frame pacing.

#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

mod pacer;
mod select;
mod target;

pub use crate::{
    pacer::FramePacer,
    select::{choose_present_mode, choose_surface_format, clamp_extent},
    target::Target,
};
