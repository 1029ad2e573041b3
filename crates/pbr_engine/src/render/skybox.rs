//! Skybox and environment baking
//!
//! Converts an equirectangular HDR panorama into the environment cubemap
//! (via the capture engine) and owns the drawable skybox cube. The
//! irradiance and prefiltered cubes baked alongside are exposed to the
//! scene for image-based lighting.

use ash::vk;
use std::sync::Arc;

use crate::render::cubemap::{CaptureShaders, CubemapCapture};
use crate::render::material::{Material, MaterialArena, MaterialHandle};
use crate::render::model::Model;
use crate::render::object::RenderObject;
use crate::render::texture::{AssetError, Texture, TextureFormat};
use crate::render::transform::Transform;
use crate::render::vulkan::VulkanContext;

/// Shader binaries used by the skybox
#[derive(Debug, Clone)]
pub struct SkyboxShaders {
    /// Skybox draw shaders
    pub skybox_vert: String,
    pub skybox_frag: String,
    /// Equirectangular-to-cube conversion fragment shader
    pub equi_to_cube_frag: String,
    /// Capture-pass shaders forwarded to the cubemap engine
    pub capture: CaptureShaders,
}

/// The environment cube and its renderable skybox
pub struct Skybox {
    cubemap: CubemapCapture,
    model: Arc<Model>,
    material: MaterialHandle,
}

impl Skybox {
    /// Bake the environment from an HDR panorama and build the skybox
    ///
    /// Runs the one-time equirectangular-to-cube conversion through the
    /// capture engine, which also convolves the irradiance and
    /// prefiltered specular cubes.
    pub fn new(
        context: &VulkanContext,
        materials: &mut MaterialArena,
        cube_model: Arc<Model>,
        environment_path: &str,
        shaders: &SkyboxShaders,
    ) -> Result<Self, AssetError> {
        let mut cubemap =
            CubemapCapture::new(context, cube_model.clone(), shaders.capture.clone())
                .map_err(AssetError::Gpu)?;

        // The panorama is just a texture input to the conversion material;
        // the capture pass treats it like any other render object
        let panorama = Arc::new(Texture::from_file(
            context,
            environment_path,
            TextureFormat::Hdr,
        )?);
        let mut equi_material =
            Material::new(&shaders.skybox_vert, &shaders.equi_to_cube_frag);
        equi_material.add_texture(panorama);
        let equi_handle = materials.insert(equi_material);

        let equi_object = RenderObject::new(cube_model.clone(), equi_handle, Transform::default());
        cubemap
            .capture(context, &[equi_object], materials)
            .map_err(AssetError::Gpu)?;

        // The conversion material was built against the capture pass and
        // has no further use
        materials.remove(equi_handle);

        // Drawn last, behind all depth-tested geometry; the camera sits
        // inside the cube so the front faces are culled
        let environment = Arc::new(Texture::from_view(
            context,
            cubemap.capture_view(),
            cubemap.mip_levels(),
        ));
        let mut skybox_material = Material::new(&shaders.skybox_vert, &shaders.skybox_frag);
        skybox_material.add_texture(environment);
        skybox_material.set_depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        skybox_material.set_cull_mode(vk::CullModeFlags::FRONT);
        let material = materials.insert(skybox_material);

        Ok(Self {
            cubemap,
            model: cube_model,
            material,
        })
    }

    /// Handle of the skybox draw material
    pub fn material(&self) -> MaterialHandle {
        self.material
    }

    /// Irradiance cube view for diffuse IBL
    pub fn irradiance_view(&self) -> vk::ImageView {
        self.cubemap.irradiance_view()
    }

    /// Prefiltered specular cube view
    pub fn prefilter_view(&self) -> vk::ImageView {
        self.cubemap.prefilter_view()
    }

    /// Mip count of the prefiltered chain
    pub fn prefilter_mip_levels(&self) -> u32 {
        self.cubemap.mip_levels()
    }

    /// Draw the skybox cube; the material must already be bound
    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        self.model.bind(command_buffer);
        self.model.draw(command_buffer, 0);
    }
}
