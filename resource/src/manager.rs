//! The bindless resource manager.
//!
//! `Resources` owns everything shaders reach through 32-bit indices: the
//! texture pools behind the bindless array, the geometry arenas, the
//! material pool, and the GPU mirrors of the scene buffers. Allocation
//! returns `(handle, bindless_index)`; deallocation destroys the GPU
//! objects and recycles the index.

use ash::vk;
use glam::Mat4;

use kiln_core::{
    Handle, Pool, RenderError, MAX_BONES, MAX_CAMERAS, MAX_LIGHTS, MAX_MATERIALS, MAX_MESHES,
    MAX_NODES, MAX_SHADOW_MAPS, MAX_SPRITES,
};

use crate::bindless::BindlessTables;
use crate::buffer::{BindlessBuffer, PerFrameBuffer};
use crate::device::Device;
use crate::image::{generate_mips, upload_texels, Image2D, ImageCube};
use crate::material::Material;
use crate::mesh::{Mesh, MeshArena};
use crate::records::{
    BoneData, CameraData, LightData, MaterialData, MeshData, NodeData, ShadowData, SpriteData,
};
use crate::sets::{DescriptorArena, Layouts};

/// A pooled 2D texture with its bindless index.
#[derive(Debug)]
pub struct Texture2D {
    /// The GPU image.
    pub image: Image2D,
    /// Slot in the bindless array.
    pub index: u32,
}

/// A pooled cube texture with its bindless index.
#[derive(Debug)]
pub struct TextureCube {
    /// The GPU image.
    pub image: ImageCube,
    /// Slot in the bindless array.
    pub index: u32,
}

/// Owner of all GPU-visible resources addressable from shaders.
#[derive(Debug)]
pub struct Resources {
    /// Bindless texture array + samplers.
    pub tables: BindlessTables,
    /// Descriptor pool for the long-lived buffer sets.
    pub arena: DescriptorArena,
    /// The buffer-view set layouts.
    pub layouts: Layouts,
    /// Geometry arenas.
    pub mesh_arena: MeshArena,

    textures_2d: Pool<Texture2D>,
    textures_cube: Pool<TextureCube>,
    meshes: Pool<Mesh>,
    materials: Pool<Material>,

    /// Node records, indexed by node id.
    pub nodes: BindlessBuffer<NodeData>,
    /// World matrices, indexed by node id.
    pub world: BindlessBuffer<Mat4>,
    /// Mesh records, indexed by mesh handle index.
    pub mesh_data: BindlessBuffer<MeshData>,
    /// Material records, indexed by material handle index.
    pub material_data: BindlessBuffer<MaterialData>,
    /// Light records, compacted per frame.
    pub lights: BindlessBuffer<LightData>,
    /// Bone matrices.
    pub bones: BindlessBuffer<BoneData>,
    /// Sprite records.
    pub sprites: BindlessBuffer<SpriteData>,
    /// Skinning vertex stream descriptor set.
    skinning_set: vk::DescriptorSet,
    /// Per-frame camera array.
    pub cameras: PerFrameBuffer<CameraData>,
    /// Per-frame shadow slot array.
    pub shadow_data: PerFrameBuffer<ShadowData>,
}

impl Resources {
    /// Create the manager: tables, layouts, arenas and every mirror buffer.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        let tables = BindlessTables::new(device)?;
        let mut arena = DescriptorArena::new(device)?;
        let layouts = Layouts::new(device)?;
        let mesh_arena = MeshArena::new(device)?;

        let nodes = BindlessBuffer::new(device, &mut arena, layouts.nodes, MAX_NODES as usize)?;
        let world = BindlessBuffer::new(device, &mut arena, layouts.world, MAX_NODES as usize)?;
        let mesh_data =
            BindlessBuffer::new(device, &mut arena, layouts.meshes, MAX_MESHES as usize)?;
        let material_data =
            BindlessBuffer::new(device, &mut arena, layouts.materials, MAX_MATERIALS as usize)?;
        let lights = BindlessBuffer::new(device, &mut arena, layouts.lights, MAX_LIGHTS as usize)?;
        let bones = BindlessBuffer::new(device, &mut arena, layouts.bones, MAX_BONES as usize)?;
        let sprites =
            BindlessBuffer::new(device, &mut arena, layouts.sprites, MAX_SPRITES as usize)?;

        let skinning_set = arena.allocate(device, layouts.skinning)?;
        arena.write_buffer(
            device,
            skinning_set,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            mesh_arena.skinning_buffer(),
            mesh_arena.skinning_size(),
        );

        let cameras = PerFrameBuffer::new(
            device,
            &mut arena,
            layouts.camera,
            vk::DescriptorType::STORAGE_BUFFER,
            MAX_CAMERAS as usize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let shadow_data = PerFrameBuffer::new(
            device,
            &mut arena,
            layouts.shadow_data,
            vk::DescriptorType::STORAGE_BUFFER,
            MAX_SHADOW_MAPS as usize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;

        Ok(Resources {
            tables,
            arena,
            layouts,
            mesh_arena,
            textures_2d: Pool::new(),
            textures_cube: Pool::new(),
            meshes: Pool::new(),
            materials: Pool::new(),
            nodes,
            world,
            mesh_data,
            material_data,
            lights,
            bones,
            sprites,
            skinning_set,
            cameras,
            shadow_data,
        })
    }

    // ── Textures ───────────────────────────────────────────────────────────

    /// Allocate a 2D texture, optionally uploading texels and generating a
    /// full mip chain. Returns the pool handle and the bindless index.
    pub fn allocate_texture_2d(
        &mut self,
        device: &Device,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        gen_mips: bool,
        texels: Option<&[u8]>,
    ) -> Result<(Handle<Texture2D>, u32), RenderError> {
        let mip_levels = if gen_mips {
            kiln_core::ilog2(extent.width.max(extent.height).max(1)) + 1
        } else {
            1
        };
        let mut full_usage = usage | vk::ImageUsageFlags::SAMPLED;
        if texels.is_some() {
            full_usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if gen_mips {
            full_usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }

        let image = Image2D::new(
            device,
            extent,
            format,
            mip_levels,
            full_usage,
            vk::ImageAspectFlags::COLOR,
        )?;

        if let Some(data) = texels {
            let final_layout = if gen_mips {
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            };
            upload_texels(device, image.raw(), extent, 1, mip_levels, data, final_layout)?;
            if gen_mips {
                generate_mips(device, image.raw(), extent, mip_levels)?;
            }
        }

        let index = match self.tables.alloc_index() {
            Ok(index) => index,
            Err(err) => {
                image.dispose(device);
                return Err(err);
            }
        };
        self.tables.write_texture(
            device,
            index,
            image.view(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        let handle = self.textures_2d.alloc(Texture2D { image, index });
        Ok((handle, index))
    }

    /// Free a 2D texture, destroying the GPU objects and recycling the
    /// index. If a frame in flight still references it the caller must have
    /// waited on that frame's fence first.
    pub fn free_texture_2d(
        &mut self,
        device: &Device,
        handle: Handle<Texture2D>,
    ) -> Result<(), RenderError> {
        let texture = self
            .textures_2d
            .free(handle)
            .ok_or(RenderError::InvalidHandle)?;
        self.tables.free_index(texture.index);
        texture.image.dispose(device);
        Ok(())
    }

    /// Look up a live 2D texture.
    pub fn texture_2d(&self, handle: Handle<Texture2D>) -> Option<&Texture2D> {
        self.textures_2d.get(handle)
    }

    /// Allocate a cube texture. Texels, when given, hold all six faces
    /// tightly packed.
    pub fn allocate_texture_cube(
        &mut self,
        device: &Device,
        size: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        texels: Option<&[u8]>,
    ) -> Result<(Handle<TextureCube>, u32), RenderError> {
        let mut full_usage = usage | vk::ImageUsageFlags::SAMPLED;
        if texels.is_some() {
            full_usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        let image = ImageCube::new(
            device,
            size,
            format,
            mip_levels,
            full_usage,
            vk::ImageAspectFlags::COLOR,
        )?;
        if let Some(data) = texels {
            upload_texels(
                device,
                image.raw(),
                vk::Extent2D {
                    width: size,
                    height: size,
                },
                6,
                mip_levels,
                data,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?;
        }

        let index = match self.tables.alloc_index() {
            Ok(index) => index,
            Err(err) => {
                image.dispose(device);
                return Err(err);
            }
        };
        self.tables.write_texture(
            device,
            index,
            image.cube_view(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        let handle = self.textures_cube.alloc(TextureCube { image, index });
        Ok((handle, index))
    }

    /// Free a cube texture.
    pub fn free_texture_cube(
        &mut self,
        device: &Device,
        handle: Handle<TextureCube>,
    ) -> Result<(), RenderError> {
        let texture = self
            .textures_cube
            .free(handle)
            .ok_or(RenderError::InvalidHandle)?;
        self.tables.free_index(texture.index);
        texture.image.dispose(device);
        Ok(())
    }

    /// Look up a live cube texture.
    pub fn texture_cube(&self, handle: Handle<TextureCube>) -> Option<&TextureCube> {
        self.textures_cube.get(handle)
    }

    // ── Meshes ─────────────────────────────────────────────────────────────

    /// Upload a mesh and publish its GPU record.
    pub fn create_mesh(
        &mut self,
        device: &Device,
        vertices: &[crate::records::GpuVertex],
        skinning: Option<&[crate::records::SkinVertex]>,
        indices: &[u32],
    ) -> Result<Handle<Mesh>, RenderError> {
        let mesh = self
            .mesh_arena
            .create_mesh(device, vertices, skinning, indices)?;
        let handle = self.meshes.alloc(mesh);
        if handle.index() >= MAX_MESHES {
            self.meshes.free(handle);
            self.mesh_arena.free_mesh(&mesh);
            return Err(RenderError::OutOfDeviceMemory);
        }
        self.mesh_data.write(
            handle.index() as usize,
            &MeshData {
                aabb_min: mesh.aabb.min.to_array(),
                first_index: mesh.first_index,
                aabb_max: mesh.aabb.max.to_array(),
                index_count: mesh.index_count,
                vertex_offset: mesh.vertex_offset,
                _pad: [0; 3],
            },
        );
        Ok(handle)
    }

    /// Free a mesh and its arena ranges.
    pub fn free_mesh(&mut self, handle: Handle<Mesh>) -> Result<(), RenderError> {
        let mesh = self.meshes.free(handle).ok_or(RenderError::InvalidHandle)?;
        self.mesh_arena.free_mesh(&mesh);
        Ok(())
    }

    /// Look up a live mesh.
    pub fn mesh(&self, handle: Handle<Mesh>) -> Option<&Mesh> {
        self.meshes.get(handle)
    }

    // ── Materials ──────────────────────────────────────────────────────────

    /// Insert a material and publish its GPU record.
    pub fn create_material(&mut self, material: Material) -> Result<Handle<Material>, RenderError> {
        let handle = self.materials.alloc(material);
        if handle.index() >= MAX_MATERIALS {
            self.materials.free(handle);
            return Err(RenderError::OutOfDeviceMemory);
        }
        self.material_data
            .write(handle.index() as usize, &material.record());
        Ok(handle)
    }

    /// Update a live material in place and republish its record.
    pub fn update_material(
        &mut self,
        handle: Handle<Material>,
        material: Material,
    ) -> Result<(), RenderError> {
        let slot = self
            .materials
            .get_mut(handle)
            .ok_or(RenderError::InvalidHandle)?;
        *slot = material;
        self.material_data
            .write(handle.index() as usize, &material.record());
        Ok(())
    }

    /// Free a material.
    pub fn free_material(&mut self, handle: Handle<Material>) -> Result<(), RenderError> {
        self.materials
            .free(handle)
            .map(|_| ())
            .ok_or(RenderError::InvalidHandle)
    }

    /// Look up a live material.
    pub fn material(&self, handle: Handle<Material>) -> Option<&Material> {
        self.materials.get(handle)
    }

    /// The skinning-stream descriptor set.
    pub fn skinning_set(&self) -> vk::DescriptorSet {
        self.skinning_set
    }

    /// Destroy everything. The device must be idle.
    pub fn dispose(mut self, device: &Device) {
        let handles: Vec<_> = self.textures_2d.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            if let Some(texture) = self.textures_2d.free(handle) {
                texture.image.dispose(device);
            }
        }
        let handles: Vec<_> = self.textures_cube.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            if let Some(texture) = self.textures_cube.free(handle) {
                texture.image.dispose(device);
            }
        }
        let Resources {
            tables,
            arena,
            layouts,
            mesh_arena,
            nodes,
            world,
            mesh_data,
            material_data,
            lights,
            bones,
            sprites,
            cameras,
            shadow_data,
            ..
        } = self;
        nodes.dispose(device);
        world.dispose(device);
        mesh_data.dispose(device);
        material_data.dispose(device);
        lights.dispose(device);
        bones.dispose(device);
        sprites.dispose(device);
        cameras.dispose(device);
        shadow_data.dispose(device);
        mesh_arena.dispose(device);
        layouts.dispose(device);
        arena.dispose(device);
        tables.dispose(device);
    }
}
