//! # PBR Engine
//!
//! A physically based rendering engine built on Vulkan. Loads meshes and
//! textures, precomputes image-based lighting from an HDR panorama
//! (environment cubemap, irradiance convolution, prefiltered specular,
//! BRDF lookup table), and renders a frame loop compositing objects with
//! a shared camera, lights, and a skybox.
//!
//! The GPU layer is written directly against `ash`; windowing uses GLFW.

// Foundation modules
pub mod config;
pub mod foundation;

// Rendering
pub mod render;

pub use render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Commonly used engine types
pub mod prelude {
    pub use crate::config::RenderConfig;
    pub use crate::foundation::math::{Mat4, Vec3, Vec4};
    pub use crate::render::camera::Camera;
    pub use crate::render::material::{Material, MaterialArena, MaterialHandle};
    pub use crate::render::model::Model;
    pub use crate::render::object::RenderObject;
    pub use crate::render::renderer::Renderer;
    pub use crate::render::scene::Scene;
    pub use crate::render::texture::{Texture, TextureFormat};
    pub use crate::render::transform::Transform;
    pub use crate::render::window::Window;
    pub use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};
}
