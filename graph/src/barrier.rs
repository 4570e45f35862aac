//! Stage/access/layout inference and barrier synthesis.
//!
//! Each usage class maps to a `(stage, access, layout)` triple; the
//! compiler walks the scheduled order and folds consecutive states of every
//! physical copy into barriers. Same-frame transitions become full
//! execution+memory barriers. Temporal transitions (the first use of a
//! copy each frame, whose previous use happened one frame earlier) become
//! memory-only barriers: the frame fence already orders execution, so only
//! availability, visibility and the layout change remain.

use ash::vk;

use crate::decl::{BufferUse, TextureUse};

/// A point in the synchronization chain of one resource copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceState {
    /// Pipeline stage of the access.
    pub stage: vk::PipelineStageFlags,
    /// Access mask.
    pub access: vk::AccessFlags,
    /// Image layout; `UNDEFINED` for buffers.
    pub layout: vk::ImageLayout,
}

impl ResourceState {
    /// The empty pre-first-use state.
    pub fn undefined() -> Self {
        ResourceState {
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            access: vk::AccessFlags::empty(),
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl TextureUse {
    /// State this usage requires.
    pub fn state(self) -> ResourceState {
        match self {
            TextureUse::ColorAttachment => ResourceState {
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
            TextureUse::DepthAttachment => ResourceState {
                stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            },
            TextureUse::DepthReadOnly => ResourceState {
                stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            },
            TextureUse::SampledFragment => ResourceState {
                stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            TextureUse::SampledCompute => ResourceState {
                stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            // The depth pyramid keeps its whole mip chain in GENERAL so
            // per-mip storage writes and full-chain sampled reads coexist.
            TextureUse::StorageRead => ResourceState {
                stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::GENERAL,
            },
            TextureUse::StorageWrite => ResourceState {
                stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
            TextureUse::TransferSrc => ResourceState {
                stage: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_READ,
                layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            },
            TextureUse::TransferDst => ResourceState {
                stage: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_WRITE,
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
        }
    }

    /// Whether this usage writes.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            TextureUse::ColorAttachment
                | TextureUse::DepthAttachment
                | TextureUse::StorageWrite
                | TextureUse::TransferDst
        )
    }

    /// Whether this usage is a render-target attachment (illegal on a
    /// compute-queue pass).
    pub fn is_attachment(self) -> bool {
        matches!(self, TextureUse::ColorAttachment | TextureUse::DepthAttachment)
    }
}

impl BufferUse {
    /// State this usage requires.
    pub fn state(self) -> ResourceState {
        let (stage, access) = match self {
            BufferUse::Indirect => (
                vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::AccessFlags::INDIRECT_COMMAND_READ,
            ),
            BufferUse::Index => (
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::INDEX_READ,
            ),
            BufferUse::Vertex => (
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            ),
            BufferUse::Uniform => (
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::UNIFORM_READ,
            ),
            BufferUse::StorageRead => (
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            BufferUse::StorageReadGraphics => (
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            BufferUse::StorageWrite => (
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            ),
            BufferUse::TransferSrc => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_READ,
            ),
            BufferUse::TransferDst => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        };
        ResourceState {
            stage,
            access,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }

    /// Whether this usage writes.
    pub fn is_write(self) -> bool {
        matches!(self, BufferUse::StorageWrite | BufferUse::TransferDst)
    }
}

/// Which physical copy of a resource a barrier applies to, resolved against
/// the frame index at execution time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyClass {
    /// `(frame + 0) mod FIF`.
    Current,
    /// `(frame ± 1) mod FIF`, the other copy when FIF = 2.
    Other,
}

/// A barrier the executor emits before a pass.
#[derive(Clone, Copy, Debug)]
pub struct BarrierPlan {
    /// Logical resource index.
    pub resource: u32,
    /// Copy the barrier applies to.
    pub copy: CopyClass,
    /// Previous state.
    pub src: ResourceState,
    /// Required state.
    pub dst: ResourceState,
    /// Memory-only: the producer ran last frame, under the fence. The
    /// executor emits no execution dependency for these.
    pub temporal: bool,
    /// First use of an aliased or single-copy transient this frame; the
    /// old contents are discarded (`oldLayout = UNDEFINED`).
    pub discard: bool,
}

/// A queue-ownership transfer between two scheduled passes.
#[derive(Clone, Copy, Debug)]
pub struct QueueTransfer {
    /// Logical resource index.
    pub resource: u32,
    /// Copy the transfer applies to.
    pub copy: CopyClass,
    /// Pass releasing ownership (schedule position).
    pub release_after: usize,
    /// Pass acquiring ownership (schedule position).
    pub acquire_before: usize,
    /// State on the releasing side.
    pub src: ResourceState,
    /// State on the acquiring side.
    pub dst: ResourceState,
}
