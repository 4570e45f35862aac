//! Resource declarations and the table the compiler builds from them.

use ash::vk;

/// Which physical copy of a double-buffered resource a usage touches,
/// relative to the executing frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameOffset {
    /// The copy the previous frame wrote at `Next`.
    Prev,
    /// This frame's copy.
    Current,
    /// The copy the next frame will read at `Current` (or `Prev`).
    Next,
}

impl FrameOffset {
    /// Signed frame delta.
    pub fn delta(self) -> i32 {
        match self {
            FrameOffset::Prev => -1,
            FrameOffset::Current => 0,
            FrameOffset::Next => 1,
        }
    }
}

/// The physical copy a usage resolves to:
/// `(frame + offset) mod copies`.
///
/// This is the whole double-buffering contract: a `Next` write in frame `N`
/// and a `Current` read in frame `N + 1` land on the same copy, while two
/// concurrent frames never touch the same copy of a double-buffered
/// resource through the same offset.
pub fn physical_copy(frame: usize, offset: FrameOffset, copies: usize) -> usize {
    debug_assert!(copies > 0);
    (frame as i64 + i64::from(offset.delta())).rem_euclid(copies as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_write_meets_current_read_one_frame_later() {
        for frame in 0..8 {
            assert_eq!(
                physical_copy(frame, FrameOffset::Next, 2),
                physical_copy(frame + 1, FrameOffset::Current, 2)
            );
            assert_eq!(
                physical_copy(frame, FrameOffset::Next, 2),
                physical_copy(frame + 2, FrameOffset::Prev, 2)
            );
        }
    }

    #[test]
    fn concurrent_frames_never_collide() {
        // Frame N writes its CURRENT copy while frame N+1 is being
        // recorded; with two copies the indices always differ.
        for frame in 0..8 {
            assert_ne!(
                physical_copy(frame, FrameOffset::Current, 2),
                physical_copy(frame + 1, FrameOffset::Current, 2)
            );
        }
    }

    #[test]
    fn single_copy_resources_always_resolve_to_zero() {
        for frame in 0..4 {
            for offset in [FrameOffset::Prev, FrameOffset::Current, FrameOffset::Next] {
                assert_eq!(physical_copy(frame, offset, 1), 0);
            }
        }
    }
}

/// Identifier of one version of a logical resource. Writing produces a new
/// version; reads name the version they consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub(crate) index: u32,
    pub(crate) version: u32,
}

impl ResourceId {
    /// Index of the logical resource.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Version this id names.
    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Logical resource kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    /// 2D image.
    Texture2D,
    /// Cube image (6 layers).
    TextureCube,
    /// Plain buffer.
    Buffer,
}

/// Description of a transient texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Format.
    pub format: vk::Format,
    /// Mip levels.
    pub mip_levels: u32,
    /// Usage bits the allocation must support.
    pub usage: vk::ImageUsageFlags,
    /// Aspect of the default view.
    pub aspect: vk::ImageAspectFlags,
}

impl TextureDesc {
    /// Color target with one mip.
    pub fn color(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        TextureDesc {
            width,
            height,
            format,
            mip_levels: 1,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Depth target with one mip.
    pub fn depth(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        TextureDesc {
            width,
            height,
            format,
            mip_levels: 1,
            usage,
            aspect: vk::ImageAspectFlags::DEPTH,
        }
    }
}

/// Description of a transient buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes.
    pub size: u64,
    /// Usage bits.
    pub usage: vk::BufferUsageFlags,
}

/// Full description of a declared resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceDesc {
    /// 2D texture.
    Texture2D(TextureDesc),
    /// Cube texture.
    TextureCube(TextureDesc),
    /// Buffer.
    Buffer(BufferDesc),
}

impl ResourceDesc {
    /// The declared type.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceDesc::Texture2D(_) => ResourceType::Texture2D,
            ResourceDesc::TextureCube(_) => ResourceType::TextureCube,
            ResourceDesc::Buffer(_) => ResourceType::Buffer,
        }
    }
}

/// Subresource shape of an externally owned texture, needed for barriers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalInfo {
    /// Aspect of the external image.
    pub aspect: vk::ImageAspectFlags,
    /// Mip levels of the external image.
    pub mip_levels: u32,
    /// Array layers of the external image.
    pub layers: u32,
}

impl Default for ExternalInfo {
    fn default() -> Self {
        ExternalInfo {
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            layers: 1,
        }
    }
}

/// One logical resource of the table.
#[derive(Debug)]
pub(crate) struct LogicalResource {
    /// Fully scope-qualified name.
    pub name: String,
    pub ty: ResourceType,
    /// `None` for externally registered resources.
    pub desc: Option<ResourceDesc>,
    pub external: bool,
    /// Subresource shape for external textures.
    pub external_info: ExternalInfo,
    /// Externals that end the frame in PRESENT_SRC.
    pub present: bool,
    /// Current head version during setup capture.
    pub head: u32,
}

/// A recorded read or write.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Usage {
    pub pass: usize,
    pub resource: u32,
    pub version: u32,
    pub offset: FrameOffset,
    pub write: bool,
    pub state: crate::barrier::ResourceState,
}
