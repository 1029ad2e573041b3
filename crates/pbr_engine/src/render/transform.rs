//! Object transform with cached matrix computation

use crate::foundation::math::{Mat4, Vec3};
use nalgebra::{Rotation3, Translation3, Vector3};

/// Position and Euler rotation (degrees) with a cached model matrix
///
/// The matrix is `translate * rotate_x * rotate_y * rotate_z`. Each half is
/// recomputed only when the corresponding field changed since the last
/// query; callers always observe the current correct matrix.
#[derive(Debug, Clone)]
pub struct Transform {
    /// World-space position
    pub position: Vec3,
    /// Euler rotation in degrees, applied X then Y then Z
    pub rotation: Vec3,

    cached_position: Option<Vec3>,
    cached_rotation: Option<Vec3>,
    translation_matrix: Mat4,
    rotation_matrix: Mat4,
    final_matrix: Mat4,
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(Vec3::zeros(), Vec3::zeros())
    }
}

impl Transform {
    pub fn new(position: Vec3, rotation: Vec3) -> Self {
        Self {
            position,
            rotation,
            cached_position: None,
            cached_rotation: None,
            translation_matrix: Mat4::identity(),
            rotation_matrix: Mat4::identity(),
            final_matrix: Mat4::identity(),
        }
    }

    /// Current model matrix, recomputing stale halves
    pub fn matrix(&mut self) -> Mat4 {
        let mut dirty = false;

        if self.cached_position != Some(self.position) {
            self.translation_matrix =
                Translation3::new(self.position.x, self.position.y, self.position.z)
                    .to_homogeneous();
            self.cached_position = Some(self.position);
            dirty = true;
        }

        if self.cached_rotation != Some(self.rotation) {
            let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), self.rotation.x.to_radians());
            let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), self.rotation.y.to_radians());
            let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), self.rotation.z.to_radians());
            self.rotation_matrix = (rx * ry * rz).to_homogeneous();
            self.cached_rotation = Some(self.rotation);
            dirty = true;
        }

        if dirty {
            self.final_matrix = self.translation_matrix * self.rotation_matrix;
        }

        self.final_matrix
    }

    /// Add a rotation delta, wrapping each axis modulo 360 degrees
    pub fn rotate(&mut self, delta: Vec3) {
        let sum = self.rotation + delta;
        self.rotation = Vec3::new(sum.x % 360.0, sum.y % 360.0, sum.z % 360.0);
    }

    /// Translate by the given offset
    pub fn translate(&mut self, delta: Vec3) {
        self.position += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn rotation_round_trip_wraps_to_zero() {
        let mut transform = Transform::default();
        transform.rotate(Vec3::new(370.0, 0.0, 0.0));
        assert_relative_eq!(transform.rotation.x, 10.0);
        transform.rotate(Vec3::new(-10.0, 0.0, 0.0));
        assert_relative_eq!(transform.rotation.x, 0.0);
    }

    #[test]
    fn rotation_accumulates_modulo_360() {
        let mut transform = Transform::default();
        for _ in 0..10 {
            transform.rotate(Vec3::new(0.0, 90.0, 0.0));
        }
        // 900 degrees accumulated, wrapped after every call
        assert_relative_eq!(transform.rotation.y, 180.0);
    }

    #[test]
    fn matrix_translates_points() {
        let mut transform = Transform::new(Vec3::new(1.0, 2.0, 3.0), Vec3::zeros());
        let m = transform.matrix();
        let p = m * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(p.x, 1.0);
        assert_relative_eq!(p.y, 2.0);
        assert_relative_eq!(p.z, 3.0);
    }

    #[test]
    fn matrix_reflects_updates_in_any_order() {
        let mut transform = Transform::default();
        let identity = transform.matrix();
        assert_relative_eq!(identity, Mat4::identity());

        // Rotate 90 degrees about Y: +X maps to -Z
        transform.rotate(Vec3::new(0.0, 90.0, 0.0));
        let rotated = transform.matrix() * Vector4::new(1.0, 0.0, 0.0, 0.0);
        assert_relative_eq!(rotated.z, -1.0, epsilon = 1e-6);

        // Then move; rotation must still be applied
        transform.translate(Vec3::new(5.0, 0.0, 0.0));
        let moved = transform.matrix() * Vector4::new(1.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(moved.x, 5.0, epsilon = 1e-6);
        assert_relative_eq!(moved.z, -1.0, epsilon = 1e-6);

        // Repeated queries are stable
        let again = transform.matrix();
        assert_relative_eq!(again, transform.matrix());
    }
}
