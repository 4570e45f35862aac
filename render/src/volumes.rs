//! Light-volume meshes: a unit sphere for point lights and a unit cone
//! for spot lights, uploaded once into a dedicated immutable buffer pair.
//! Directional lights rasterize a fullscreen triangle and need no mesh.

use ash::vk;

use kiln_core::RenderError;
use kiln_resource::{Device, GpuVertex, ImmutableBuffer};

/// Draw range of one volume mesh.
#[derive(Clone, Copy, Debug)]
pub struct VolumeRange {
    /// First index.
    pub first_index: u32,
    /// Index count.
    pub index_count: u32,
    /// Vertex offset.
    pub vertex_offset: i32,
}

/// The uploaded volume meshes.
#[derive(Debug)]
pub struct VolumeMeshes {
    vertices: ImmutableBuffer,
    indices: ImmutableBuffer,
    /// Unit sphere (radius 1, centered at the origin).
    pub sphere: VolumeRange,
    /// Unit cone (apex at the origin, unit base circle at z = 1).
    pub cone: VolumeRange,
}

fn vertex(position: [f32; 3]) -> GpuVertex {
    GpuVertex {
        position,
        ..Default::default()
    }
}

fn unit_sphere(rings: u32, segments: u32) -> (Vec<GpuVertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for ring in 0..=rings {
        let theta = std::f32::consts::PI * ring as f32 / rings as f32;
        let (sin_t, cos_t) = theta.sin_cos();
        for segment in 0..=segments {
            let phi = 2.0 * std::f32::consts::PI * segment as f32 / segments as f32;
            let (sin_p, cos_p) = phi.sin_cos();
            vertices.push(vertex([sin_t * cos_p, cos_t, sin_t * sin_p]));
        }
    }
    let stride = segments + 1;
    for ring in 0..rings {
        for segment in 0..segments {
            let a = ring * stride + segment;
            let b = a + stride;
            indices.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
        }
    }
    (vertices, indices)
}

fn unit_cone(segments: u32) -> (Vec<GpuVertex>, Vec<u32>) {
    let mut vertices = vec![vertex([0.0, 0.0, 0.0])]; // apex
    for segment in 0..segments {
        let phi = 2.0 * std::f32::consts::PI * segment as f32 / segments as f32;
        let (sin_p, cos_p) = phi.sin_cos();
        vertices.push(vertex([cos_p, sin_p, 1.0]));
    }
    let base_center = vertices.len() as u32;
    vertices.push(vertex([0.0, 0.0, 1.0]));

    let mut indices = Vec::new();
    for segment in 0..segments {
        let a = 1 + segment;
        let b = 1 + (segment + 1) % segments;
        // Side.
        indices.extend_from_slice(&[0, b, a]);
        // Base cap.
        indices.extend_from_slice(&[base_center, a, b]);
    }
    (vertices, indices)
}

impl VolumeMeshes {
    /// Generate and upload the sphere and cone.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        let (sphere_vertices, sphere_indices) = unit_sphere(8, 16);
        let (cone_vertices, cone_indices) = unit_cone(16);

        let sphere = VolumeRange {
            first_index: 0,
            index_count: sphere_indices.len() as u32,
            vertex_offset: 0,
        };
        let cone = VolumeRange {
            first_index: sphere_indices.len() as u32,
            index_count: cone_indices.len() as u32,
            vertex_offset: sphere_vertices.len() as i32,
        };

        let mut vertices = sphere_vertices;
        vertices.extend(cone_vertices);
        let mut indices = sphere_indices;
        indices.extend(cone_indices);

        let vertex_buffer = ImmutableBuffer::new(
            device,
            bytemuck::cast_slice(&vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = ImmutableBuffer::new(
            device,
            bytemuck::cast_slice(&indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        Ok(VolumeMeshes {
            vertices: vertex_buffer,
            indices: index_buffer,
            sphere,
            cone,
        })
    }

    /// Vertex buffer handle.
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.raw()
    }

    /// Index buffer handle.
    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.raw()
    }

    /// Destroy the buffers.
    pub fn dispose(self, device: &Device) {
        self.vertices.dispose(device);
        self.indices.dispose(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_vertices_lie_on_the_unit_sphere() {
        let (vertices, indices) = unit_sphere(8, 16);
        for vertex in &vertices {
            let [x, y, z] = vertex.position;
            let length = (x * x + y * y + z * z).sqrt();
            assert!((length - 1.0).abs() < 1.0e-4);
        }
        assert_eq!(indices.len() % 3, 0);
        let max = *indices.iter().max().unwrap();
        assert!((max as usize) < vertices.len());
    }

    #[test]
    fn cone_spans_apex_to_base() {
        let (vertices, indices) = unit_cone(16);
        assert_eq!(vertices[0].position, [0.0, 0.0, 0.0]);
        assert!(vertices.iter().all(|vertex| (0.0..=1.0).contains(&vertex.position[2])));
        assert_eq!(indices.len() % 3, 0);
        let max = *indices.iter().max().unwrap();
        assert!((max as usize) < vertices.len());
    }
}
