//! Crate that contains the building blocks shared by every other kiln crate:
//! generational handle pools, scalar helpers, frustum math, the render
//! configuration and the error taxonomy.

#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

#[doc(inline)]
pub use ash;

mod config;
mod error;
mod frustum;
mod handle;
mod limits;
mod util;

pub use crate::{
    config::{Features, RenderConfig},
    error::{CompileError, RenderError},
    frustum::{Aabb, Frustum},
    handle::{Handle, Pool},
    limits::*,
    util::{align_up, ilog2, next_pow2},
};
