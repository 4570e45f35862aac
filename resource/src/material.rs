//! PBR materials.

use kiln_core::BINDLESS_INDEX_ABSENT;

use crate::records::MaterialData;

/// CPU-side material: factors plus the bindless indices of its textures.
/// Mirrored into the materials bindless buffer at sync time; draws reference
/// it through `NodeData::material`.
#[derive(Clone, Copy, Debug)]
pub struct Material {
    /// Base color factor.
    pub base_color: [f32; 4],
    /// Metallic factor.
    pub metallic: f32,
    /// Roughness factor.
    pub roughness: f32,
    /// Emissive factor.
    pub emissive: [f32; 3],
    /// Emissive strength.
    pub emissive_strength: f32,
    /// Bindless albedo texture, 0 when absent.
    pub albedo_index: u32,
    /// Bindless metallic-roughness texture, 0 when absent.
    pub metallic_roughness_index: u32,
    /// Bindless normal map, 0 when absent.
    pub normal_index: u32,
    /// Bindless emissive texture, 0 when absent.
    pub emissive_index: u32,
}

impl Default for Material {
    fn default() -> Self {
        Material {
            base_color: [1.0; 4],
            metallic: 0.0,
            roughness: 1.0,
            emissive: [0.0; 3],
            emissive_strength: 1.0,
            albedo_index: BINDLESS_INDEX_ABSENT,
            metallic_roughness_index: BINDLESS_INDEX_ABSENT,
            normal_index: BINDLESS_INDEX_ABSENT,
            emissive_index: BINDLESS_INDEX_ABSENT,
        }
    }
}

impl Material {
    /// GPU record of this material.
    pub fn record(&self) -> MaterialData {
        MaterialData {
            base_color: self.base_color,
            emissive: [
                self.emissive[0],
                self.emissive[1],
                self.emissive[2],
                self.emissive_strength,
            ],
            metallic: self.metallic,
            roughness: self.roughness,
            albedo_index: self.albedo_index,
            metallic_roughness_index: self.metallic_roughness_index,
            normal_index: self.normal_index,
            emissive_index: self.emissive_index,
            _pad: [0; 2],
        }
    }
}
