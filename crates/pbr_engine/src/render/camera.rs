//! Scene camera

use crate::foundation::math::{Mat4, Point3, Vec3};
use nalgebra::Perspective3;

/// Perspective camera with position and yaw/pitch orientation
#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    yaw: f32,
    pitch: f32,
    fov_y_degrees: f32,
    near: f32,
    far: f32,
}

impl Camera {
    pub fn new(fov_y_degrees: f32) -> Self {
        Self {
            position: Vec3::zeros(),
            yaw: 0.0,
            pitch: 0.0,
            fov_y_degrees,
            near: 0.1,
            far: 1000.0,
        }
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Set orientation as yaw/pitch in degrees
    pub fn set_rotation(&mut self, yaw: f32, pitch: f32) {
        self.yaw = yaw;
        self.pitch = pitch.clamp(-89.0, 89.0);
    }

    /// Unit vector the camera is looking along
    pub fn forward(&self) -> Vec3 {
        let yaw = self.yaw.to_radians();
        let pitch = self.pitch.to_radians();
        Vec3::new(
            yaw.cos() * pitch.cos(),
            pitch.sin(),
            yaw.sin() * pitch.cos(),
        )
    }

    /// World-to-view matrix
    pub fn view_matrix(&self) -> Mat4 {
        let eye = Point3::new(self.position.x, self.position.y, self.position.z);
        let target = eye + self.forward();
        Mat4::look_at_rh(&eye, &target, &Vec3::new(0.0, 1.0, 0.0))
    }

    /// Perspective projection for the given aspect ratio, with the Y axis
    /// flipped for Vulkan clip space
    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        let mut projection =
            Perspective3::new(aspect, self.fov_y_degrees.to_radians(), self.near, self.far)
                .to_homogeneous();
        projection[(1, 1)] *= -1.0;
        projection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn view_matrix_maps_forward_to_negative_z() {
        let mut camera = Camera::new(70.0);
        camera.set_position(Vec3::new(0.0, 0.0, -3.0));
        camera.set_rotation(90.0, 0.0);

        let forward = camera.forward();
        let view = camera.view_matrix();
        let mapped = view * Vector4::new(forward.x, forward.y, forward.z, 0.0);
        assert_relative_eq!(mapped.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(mapped.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(mapped.z, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = Camera::new(70.0);
        let projection = camera.projection_matrix(16.0 / 9.0);
        assert!(projection[(1, 1)] < 0.0);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::new(70.0);
        camera.set_rotation(0.0, 120.0);
        let forward = camera.forward();
        // Still has a horizontal component when pitch is clamped below 90
        assert!(forward.x.abs() > 1e-4);
    }
}
