//! Pass declarations and the setup interface.
//!
//! A `PassDecl` is pure data plus two callbacks over an opaque aux type
//! `T`: `setup` declares resources and usages, `execute` records commands.
//! The compiler clones per-camera and per-light declarations once per
//! scope instance before invoking setup.

use std::fmt;
use std::sync::Arc;

use ash::vk;

use kiln_core::CompileError;

use crate::barrier::ResourceState;
use crate::exec::PassResources;
use crate::res::{
    BufferDesc, ExternalInfo, FrameOffset, LogicalResource, ResourceDesc, ResourceId,
    ResourceType, TextureDesc, Usage,
};

/// How many instances of a declaration the compiler produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassScope {
    /// One instance.
    Global,
    /// One instance per active camera.
    PerCamera,
    /// One instance per shadow-casting light.
    PerLight,
}

/// Queue class a pass records on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueClass {
    /// Graphics queue.
    Graphics,
    /// Compute queue (may be folded into graphics at execution).
    Compute,
}

/// Texture usage classes; each maps to a stage/access/layout triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureUse {
    /// Render into as a color attachment.
    ColorAttachment,
    /// Render into as the depth attachment.
    DepthAttachment,
    /// Bound as read-only depth (attachment or sampled).
    DepthReadOnly,
    /// Sampled in fragment shaders.
    SampledFragment,
    /// Sampled in compute shaders.
    SampledCompute,
    /// Storage image read (GENERAL layout).
    StorageRead,
    /// Storage image write (GENERAL layout).
    StorageWrite,
    /// Blit/copy source.
    TransferSrc,
    /// Blit/copy destination.
    TransferDst,
}

/// Buffer usage classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUse {
    /// Indirect-command fetch.
    Indirect,
    /// Index fetch.
    Index,
    /// Vertex-attribute fetch.
    Vertex,
    /// Uniform read.
    Uniform,
    /// Storage read from compute.
    StorageRead,
    /// Storage read from graphics stages.
    StorageReadGraphics,
    /// Storage write from compute.
    StorageWrite,
    /// Copy source.
    TransferSrc,
    /// Copy destination.
    TransferDst,
}

type SetupFn<T> = dyn Fn(&mut PassSetup<'_>, &mut T);
type ExecuteFn<T> = dyn Fn(&PassResources<'_>, vk::CommandBuffer, &mut T);

/// Declarative description of one pass.
pub struct PassDecl<T: ?Sized> {
    /// Base name; instances get a scope suffix.
    pub name: String,
    /// Instantiation scope.
    pub scope: PassScope,
    /// Queue class.
    pub queue: QueueClass,
    /// Resource declaration callback.
    pub setup: Arc<SetupFn<T>>,
    /// Command recording callback.
    pub execute: Arc<ExecuteFn<T>>,
    /// Disabled declarations are dropped before instantiation.
    pub enabled: bool,
}

impl<T: ?Sized> Clone for PassDecl<T> {
    fn clone(&self) -> Self {
        PassDecl {
            name: self.name.clone(),
            scope: self.scope,
            queue: self.queue,
            setup: self.setup.clone(),
            execute: self.execute.clone(),
            enabled: self.enabled,
        }
    }
}

impl<T: ?Sized> fmt::Debug for PassDecl<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("PassDecl")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("queue", &self.queue)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<T: ?Sized> PassDecl<T> {
    /// Declaration with both callbacks.
    pub fn new(
        name: impl Into<String>,
        scope: PassScope,
        queue: QueueClass,
        setup: impl Fn(&mut PassSetup<'_>, &mut T) + 'static,
        execute: impl Fn(&PassResources<'_>, vk::CommandBuffer, &mut T) + 'static,
    ) -> Self {
        PassDecl {
            name: name.into(),
            scope,
            queue,
            setup: Arc::new(setup),
            execute: Arc::new(execute),
            enabled: true,
        }
    }

    /// Toggle the declaration.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Scope qualifier of one pass instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ScopeIndex {
    pub scope: PassScope,
    pub index: u32,
}

impl ScopeIndex {
    pub fn qualify(&self, name: &str) -> String {
        match self.scope {
            PassScope::Global => name.to_string(),
            PassScope::PerCamera => format!("{name}_cam_{}", self.index),
            PassScope::PerLight => format!("{name}_light_{}", self.index),
        }
    }
}

/// State shared by every `PassSetup` of one compilation.
#[derive(Debug, Default)]
pub(crate) struct SetupTable {
    pub resources: Vec<LogicalResource>,
    pub usages: Vec<Usage>,
    /// `(resource, version, offset)` of every write, keyed for edge lookup.
    pub producers: Vec<(u32, u32, FrameOffset, usize)>,
    pub errors: Vec<CompileError>,
}

impl SetupTable {
    pub fn find(&self, name: &str) -> Option<u32> {
        self.resources
            .iter()
            .position(|resource| resource.name == name)
            .map(|index| index as u32)
    }
}

/// The interface a pass uses during setup to declare resources and usages.
pub struct PassSetup<'a> {
    pub(crate) table: &'a mut SetupTable,
    pub(crate) pass: usize,
    pub(crate) pass_name: String,
    pub(crate) scope: ScopeIndex,
    pub(crate) queue: QueueClass,
}

impl fmt::Debug for PassSetup<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("PassSetup")
            .field("pass", &self.pass_name)
            .finish()
    }
}

impl<'a> PassSetup<'a> {
    /// Index of this instance within its scope (camera or light index).
    pub fn scope_index(&self) -> u32 {
        self.scope.index
    }

    fn declare(
        &mut self,
        name: &str,
        ty: ResourceType,
        desc: Option<ResourceDesc>,
        external: bool,
        info: ExternalInfo,
        present: bool,
    ) -> ResourceId {
        let qualified = self.scope.qualify(name);
        if external {
            // Several passes may register the same external (the pyramid
            // builder writes what the cull pass reads); the registration
            // is find-or-create.
            if let Some(index) = self.table.find(&qualified) {
                let resource = &mut self.table.resources[index as usize];
                resource.present |= present;
                let head = resource.head;
                return ResourceId {
                    index,
                    version: head,
                };
            }
        }
        let index = self.table.resources.len() as u32;
        self.table.resources.push(LogicalResource {
            name: qualified,
            ty,
            desc,
            external,
            external_info: info,
            present,
            head: 0,
        });
        // Creation produces version 0.
        self.table
            .producers
            .push((index, 0, FrameOffset::Current, self.pass));
        ResourceId { index, version: 0 }
    }

    /// Declare a transient 2D texture owned by the graph.
    pub fn create_texture(&mut self, name: &str, desc: TextureDesc) -> ResourceId {
        self.declare(
            name,
            ResourceType::Texture2D,
            Some(ResourceDesc::Texture2D(desc)),
            false,
            ExternalInfo::default(),
            false,
        )
    }

    /// Declare a transient cube texture owned by the graph.
    pub fn create_texture_cube(&mut self, name: &str, desc: TextureDesc) -> ResourceId {
        self.declare(
            name,
            ResourceType::TextureCube,
            Some(ResourceDesc::TextureCube(desc)),
            false,
            ExternalInfo::default(),
            false,
        )
    }

    /// Declare a transient buffer owned by the graph.
    pub fn create_buffer(&mut self, name: &str, desc: BufferDesc) -> ResourceId {
        self.declare(
            name,
            ResourceType::Buffer,
            Some(ResourceDesc::Buffer(desc)),
            false,
            ExternalInfo::default(),
            false,
        )
    }

    /// Reference a texture owned outside the graph. The concrete image is
    /// bound per frame before execution. Registration is find-or-create:
    /// every pass naming the same external gets the same resource.
    pub fn register_external_texture(&mut self, name: &str, present: bool) -> ResourceId {
        self.declare(
            name,
            ResourceType::Texture2D,
            None,
            true,
            ExternalInfo::default(),
            present,
        )
    }

    /// Like [`PassSetup::register_external_texture`] with an explicit
    /// subresource shape (depth externals, cube externals, mip chains).
    pub fn register_external_texture_with(
        &mut self,
        name: &str,
        info: ExternalInfo,
        present: bool,
    ) -> ResourceId {
        let ty = if info.layers == 6 {
            ResourceType::TextureCube
        } else {
            ResourceType::Texture2D
        };
        self.declare(name, ty, None, true, info, present)
    }

    /// Reference a buffer owned outside the graph.
    pub fn register_external_buffer(&mut self, name: &str) -> ResourceId {
        self.declare(
            name,
            ResourceType::Buffer,
            None,
            true,
            ExternalInfo::default(),
            false,
        )
    }

    /// Look up a texture by name: scope-qualified first, then global.
    pub fn find_texture(&mut self, name: &str) -> Option<ResourceId> {
        let index = self
            .table
            .find(&self.scope.qualify(name))
            .or_else(|| self.table.find(name))?;
        let head = self.table.resources[index as usize].head;
        Some(ResourceId {
            index,
            version: head,
        })
    }

    /// Look up a buffer by name: scope-qualified first, then global.
    pub fn find_buffer(&mut self, name: &str) -> Option<ResourceId> {
        self.find_texture(name)
    }

    /// Cross-scope lookup: the lighting pass reads the shadow maps of every
    /// light this way.
    pub fn find_texture_in_scope(
        &mut self,
        name: &str,
        scope: PassScope,
        scope_index: u32,
    ) -> Option<ResourceId> {
        let qualifier = ScopeIndex {
            scope,
            index: scope_index,
        };
        let index = self.table.find(&qualifier.qualify(name))?;
        let head = self.table.resources[index as usize].head;
        Some(ResourceId {
            index,
            version: head,
        })
    }

    fn record(
        &mut self,
        id: ResourceId,
        offset: FrameOffset,
        write: bool,
        state: ResourceState,
        expect_texture: bool,
        attachment: bool,
    ) -> ResourceId {
        let table = &mut *self.table;
        let Some(resource) = table.resources.get_mut(id.index as usize) else {
            table.errors.push(CompileError::DanglingRead {
                pass: self.pass_name.clone(),
                resource: format!("#{}", id.index),
            });
            return id;
        };

        let is_texture = resource.ty != ResourceType::Buffer;
        if is_texture != expect_texture {
            table.errors.push(CompileError::TypeMismatch {
                pass: self.pass_name.clone(),
                resource: resource.name.clone(),
            });
            return id;
        }
        // Render-target writes cannot run on a compute queue.
        if attachment && self.queue == QueueClass::Compute {
            table.errors.push(CompileError::TypeMismatch {
                pass: self.pass_name.clone(),
                resource: resource.name.clone(),
            });
            return id;
        }

        let version = if write {
            resource.head += 1;
            table
                .producers
                .push((id.index, resource.head, offset, self.pass));
            resource.head
        } else {
            id.version
        };

        table.usages.push(Usage {
            pass: self.pass,
            resource: id.index,
            version: if write { version - 1 } else { id.version },
            offset,
            write,
            state,
        });

        ResourceId {
            index: id.index,
            version,
        }
    }

    /// Record a texture read.
    pub fn read_texture(&mut self, id: ResourceId, offset: FrameOffset, usage: TextureUse) {
        self.record(id, offset, false, usage.state(), true, false);
    }

    /// Record a texture write; returns the id of the produced version.
    pub fn write_texture(
        &mut self,
        id: ResourceId,
        offset: FrameOffset,
        usage: TextureUse,
    ) -> ResourceId {
        self.record(
            id,
            offset,
            true,
            usage.state(),
            true,
            usage.is_attachment(),
        )
    }

    /// Record a buffer read.
    pub fn read_buffer(&mut self, id: ResourceId, offset: FrameOffset, usage: BufferUse) {
        self.record(id, offset, false, usage.state(), false, false);
    }

    /// Record a buffer write; returns the id of the produced version.
    pub fn write_buffer(
        &mut self,
        id: ResourceId,
        offset: FrameOffset,
        usage: BufferUse,
    ) -> ResourceId {
        self.record(id, offset, true, usage.state(), false, false)
    }
}
