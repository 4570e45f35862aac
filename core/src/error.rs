//! Error taxonomy for the render core.
//!
//! Initialization and resize paths bubble these to the embedder; per-frame
//! recoverable conditions are logged and skipped at the call site instead.

use ash::vk;

/// Graph compile-time invariant violations. These are never caught and
/// retried at runtime; a graph that fails to compile renders no frame.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// A pass reads a resource id that no pass creates and no external
    /// registration provides.
    #[error("pass `{pass}` reads `{resource}` which nothing produces")]
    DanglingRead {
        /// Offending pass instance name.
        pass: String,
        /// Name of the resource that could not be resolved.
        resource: String,
    },

    /// The dependency graph contains a cycle; the listed passes could not be
    /// ordered.
    #[error("pass dependencies form a cycle through {unresolved:?}")]
    CyclicGraph {
        /// Pass instance names left unresolved by the topological sort.
        unresolved: Vec<String>,
    },

    /// A resource is used with the wrong type or from an incompatible queue.
    #[error("pass `{pass}` uses `{resource}` with a mismatched type")]
    TypeMismatch {
        /// Offending pass instance name.
        pass: String,
        /// Name of the misused resource.
        resource: String,
    },

    /// Transient-memory aliasing could not place a resource.
    #[error("failed to alias transient resource `{resource}`")]
    AliasingFailed {
        /// Name of the resource that could not be placed.
        resource: String,
    },
}

/// Top-level error kinds of the render core.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// A GPU allocation failed.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// Pipeline, shader or layout creation failed. Fatal at init.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Present returned out-of-date or suboptimal; the swapchain and
    /// per-camera attachments must be recreated.
    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    /// The frame graph failed to compile.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Pool generation mismatch or destroyed resource.
    #[error("invalid handle")]
    InvalidHandle,

    /// The GPU was reset.
    #[error("device lost")]
    DeviceLost,
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RenderError::OutOfDeviceMemory
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                RenderError::SwapchainOutOfDate
            }
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            other => RenderError::InitializationFailed(format!("{other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_result_mapping() {
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::OutOfDeviceMemory
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderError::SwapchainOutOfDate
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_DEVICE_LOST),
            RenderError::DeviceLost
        ));
    }
}
