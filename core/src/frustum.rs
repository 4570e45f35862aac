//! Axis-aligned boxes, bounding spheres and view frusta.
//!
//! The cull shaders run the same sphere-versus-planes test as
//! [`Frustum::contains_sphere`], so the visibility rules can be tested
//! host-side without a device.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// Box spanning the given corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Aabb { min, max }
    }

    /// Smallest box containing every point. Empty input yields a degenerate
    /// box at the origin.
    pub fn from_points(points: &[Vec3]) -> Self {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for &point in points {
            min = min.min(point);
            max = max.max(point);
        }
        if points.is_empty() {
            min = Vec3::ZERO;
            max = Vec3::ZERO;
        }
        Aabb { min, max }
    }

    /// Center point.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Bounding sphere `(center, radius)` of the box.
    pub fn bounding_sphere(&self) -> (Vec3, f32) {
        let center = self.center();
        (center, (self.max - center).length())
    }

    /// Box containing this box under an affine transform.
    pub fn transformed(&self, matrix: Mat4) -> Aabb {
        let corners = [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ];
        Aabb::from_points(
            &corners
                .iter()
                .map(|&corner| matrix.transform_point3(corner))
                .collect::<Vec<_>>(),
        )
    }

    /// Whether all six bounds are finite.
    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Aabb {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        }
    }
}

/// Six view-frustum planes, `xyz` the inward normal and `w` the distance,
/// extracted from a `projection * view` matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    /// Left, right, bottom, top, near, far.
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract planes from a combined `projection * view` matrix.
    ///
    /// Assumes a Vulkan-style `[0, 1]` clip depth range.
    pub fn from_matrix(matrix: Mat4) -> Self {
        let row0 = matrix.row(0);
        let row1 = matrix.row(1);
        let row2 = matrix.row(2);
        let row3 = matrix.row(3);
        let mut planes = [
            row3 + row0, // left
            row3 - row0, // right
            row3 + row1, // bottom
            row3 - row1, // top
            row2,        // near, z >= 0
            row3 - row2, // far, z <= w
        ];
        for plane in &mut planes {
            let length = plane.xyz().length();
            if length > 0.0 {
                *plane /= length;
            }
        }
        Frustum { planes }
    }

    /// Conservative sphere test: `false` only when the sphere is entirely
    /// outside at least one plane.
    pub fn contains_sphere(&self, center: Vec3, radius: f32) -> bool {
        let point = center.extend(1.0);
        self.planes.iter().all(|plane| plane.dot(point) >= -radius)
    }

    /// Conservative box test via the box's bounding sphere.
    pub fn contains_aabb(&self, aabb: &Aabb) -> bool {
        let (center, radius) = aabb.bounding_sphere();
        self.contains_sphere(center, radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frustum() -> Frustum {
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        Frustum::from_matrix(proj * view)
    }

    #[test]
    fn sphere_in_front_is_inside() {
        let frustum = test_frustum();
        assert!(frustum.contains_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0));
    }

    #[test]
    fn sphere_behind_camera_is_outside() {
        let frustum = test_frustum();
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, 10.0), 1.0));
    }

    #[test]
    fn sphere_past_far_plane_is_outside() {
        let frustum = test_frustum();
        assert!(!frustum.contains_sphere(Vec3::new(0.0, 0.0, -200.0), 1.0));
    }

    #[test]
    fn large_sphere_straddling_plane_is_inside() {
        let frustum = test_frustum();
        // Center is outside the left plane but the radius reaches in.
        assert!(frustum.contains_sphere(Vec3::new(-30.0, 0.0, -10.0), 50.0));
    }

    #[test]
    fn aabb_transform_grows_conservatively() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let rotated = aabb.transformed(Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4));
        assert!(rotated.max.x > 1.0);
        let (_, radius) = rotated.bounding_sphere();
        assert!(radius >= 1.0);
    }
}
