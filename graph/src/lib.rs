//! The frame graph.
//!
//! Passes declare the resources they create, read and write; the compiler
//! turns the declarations into a barrier-inserted execution schedule. The
//! compile pipeline is split into a pure planning stage (instantiation,
//! setup capture, validation, dependency edges, topological order, pass
//! culling, physical-copy assignment, aliasing and barrier synthesis) and
//! a realize stage that allocates the transient GPU resources the plan
//! calls for. The planning stage never touches a device, which is what
//! makes the ordering and synchronization rules testable.

#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

mod barrier;
mod decl;
mod exec;
mod plan;
mod res;

#[cfg(test)]
mod tests;

pub use kiln_core::CompileError;

pub use crate::{
    barrier::{BarrierPlan, ResourceState},
    decl::{BufferUse, PassDecl, PassScope, PassSetup, QueueClass, TextureUse},
    exec::{ExternalBinding, Graph, PassResources, RecordedQueues},
    plan::{CompileContext, Plan, PlannedPass},
    res::{
        physical_copy, BufferDesc, ExternalInfo, FrameOffset, ResourceId, ResourceType,
        TextureDesc,
    },
};
