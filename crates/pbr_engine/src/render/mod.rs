//! Rendering subsystem
//!
//! High-level rendering components built on the Vulkan backend: textures,
//! materials, models, the image-based-lighting capture pipeline, and the
//! per-frame renderer.

pub mod brdf;
pub mod camera;
pub mod cubemap;
pub mod descriptor;
pub mod material;
pub mod model;
pub mod object;
pub mod renderer;
pub mod scene;
pub mod skybox;
pub mod texture;
pub mod transform;
pub mod vulkan;
pub mod window;

pub use material::{Material, MaterialArena, MaterialHandle};
pub use model::Model;
pub use object::RenderObject;
pub use renderer::Renderer;
pub use scene::Scene;
pub use texture::{AssetError, Texture, TextureFormat};
pub use transform::Transform;
