//! Kiln's top level crate.
//! Reexports all others.

#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

#[doc(inline)]
pub use kiln_core as core;

#[doc(inline)]
pub use kiln_graph as graph;

#[doc(inline)]
pub use kiln_render as render;

#[doc(inline)]
pub use kiln_resource as resource;

#[doc(inline)]
pub use kiln_wsi as wsi;

pub use kiln_core::{RenderConfig, RenderError};
pub use kiln_render::Renderer;
