//! Scene: render objects, lighting, and the IBL environment
//!
//! Owns the material arena, the baked skybox/IBL data, the BRDF LUT, and
//! the global descriptor ring. `draw` writes the per-frame uniform and
//! object buffers, renders every object, and draws the skybox last.

use ash::vk;
use std::sync::Arc;

use crate::foundation::math::Vec3;
use crate::render::brdf::BrdfLut;
use crate::render::camera::Camera;
use crate::render::descriptor::{
    GlobalDescriptor, GpuCameraData, GpuLightData, GpuObjectData, GpuSceneData, IblViews,
    MAX_OBJECTS,
};
use crate::render::material::{Material, MaterialArena, MaterialHandle};
use crate::render::model::Model;
use crate::render::object::RenderObject;
use crate::render::skybox::{Skybox, SkyboxShaders};
use crate::render::texture::AssetError;
use crate::render::transform::Transform;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Ambient and sun parameters written into the scene uniform
#[derive(Debug, Clone)]
pub struct SceneLighting {
    pub ambient_color: [f32; 4],
    pub sun_direction: [f32; 4],
    pub sun_color: [f32; 4],
    pub light_positions: [[f32; 4]; 4],
    pub light_colors: [[f32; 4]; 4],
}

impl Default for SceneLighting {
    fn default() -> Self {
        Self {
            ambient_color: [0.1, 0.1, 0.1, 1.0],
            sun_direction: [1.0, 0.0, 0.0, 0.0],
            sun_color: [1.0, 1.0, 1.0, 1.0],
            light_positions: [
                [-1.5, 0.0, -3.0, 0.0],
                [1.5, 0.0, -3.0, 0.0],
                [0.0, 2.0, 2.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
            ],
            light_colors: [
                [1.0, 1.0, 1.0, 5.0],
                [1.0, 1.0, 1.0, 5.0],
                [0.5, 0.5, 1.0, 25.0],
                [0.0, 0.0, 0.0, 0.0],
            ],
        }
    }
}

/// A scene with baked image-based lighting
pub struct Scene {
    materials: MaterialArena,
    objects: Vec<RenderObject>,
    camera: Camera,
    pub lighting: SceneLighting,

    skybox: Skybox,
    brdf: BrdfLut,
    global: GlobalDescriptor,
}

impl Scene {
    /// Bake the environment and build the per-frame descriptor ring
    ///
    /// `frame_count` is the swapchain image count; the uniform ring holds
    /// one slice per frame in flight.
    pub fn new(
        context: &VulkanContext,
        cube_model: Arc<Model>,
        environment_path: &str,
        brdf_shader: &str,
        skybox_shaders: &SkyboxShaders,
        frame_count: usize,
        camera: Camera,
    ) -> Result<Self, AssetError> {
        let mut materials = MaterialArena::with_key();

        let skybox = Skybox::new(
            context,
            &mut materials,
            cube_model,
            environment_path,
            skybox_shaders,
        )?;
        let brdf = BrdfLut::new(context, brdf_shader).map_err(AssetError::Gpu)?;

        let ibl = IblViews {
            irradiance: skybox.irradiance_view(),
            prefilter: skybox.prefilter_view(),
            prefilter_mip_levels: skybox.prefilter_mip_levels(),
            brdf_lut: brdf.view(),
        };
        let global =
            GlobalDescriptor::new(context, frame_count, &ibl).map_err(AssetError::Gpu)?;

        Ok(Self {
            materials,
            objects: Vec::new(),
            camera,
            lighting: SceneLighting::default(),
            skybox,
            brdf,
            global,
        })
    }

    /// Register a material and return its handle
    pub fn add_material(&mut self, material: Material) -> MaterialHandle {
        self.materials.insert(material)
    }

    /// Add a renderable object
    pub fn add_object(
        &mut self,
        model: Arc<Model>,
        material: MaterialHandle,
        transform: Transform,
    ) {
        debug_assert!(self.objects.len() < MAX_OBJECTS);
        self.objects
            .push(RenderObject::new(model, material, transform));
    }

    /// Mutable access to the scene objects (animation)
    pub fn objects_mut(&mut self) -> &mut [RenderObject] {
        &mut self.objects
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Sampled view of the precomputed BRDF lookup table
    pub fn brdf_view(&self) -> vk::ImageView {
        self.brdf.view()
    }

    /// Record the scene into the active render pass
    ///
    /// Updates the frame's uniform and object buffers, draws every object
    /// with `first_instance` carrying its index, and draws the skybox
    /// last.
    pub fn draw(
        &mut self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        frame: u64,
        aspect_ratio: f32,
    ) -> VulkanResult<()> {
        self.update_buffers(context, frame, aspect_ratio)?;

        let set_layouts = [self.global.scene_layout(), self.global.object_layout()];
        for index in 0..self.objects.len() {
            let material_handle = self.objects[index].material;
            let material = self.materials.get_mut(material_handle).ok_or_else(|| {
                VulkanError::InvalidOperation {
                    reason: "render object references a removed material".to_string(),
                }
            })?;

            if !material.is_ready() {
                material.setup(context, &set_layouts, render_pass)?;
            }
            let layout = material.pipeline_layout()?;
            self.global.bind_scene(command_buffer, layout, frame);
            self.global.bind_objects(command_buffer, layout, frame);
            self.materials[material_handle].bind(command_buffer)?;

            let object = &self.objects[index];
            object.model.bind(command_buffer);
            object.model.draw(command_buffer, index as u32);
        }

        self.draw_skybox(context, command_buffer, render_pass, frame)?;
        Ok(())
    }

    fn update_buffers(
        &mut self,
        context: &VulkanContext,
        frame: u64,
        aspect_ratio: f32,
    ) -> VulkanResult<()> {
        let position = self.camera.position();
        let camera_data = GpuCameraData {
            view: self.camera.view_matrix().into(),
            projection: self.camera.projection_matrix(aspect_ratio).into(),
            position: [position.x, position.y, position.z, 1.0],
        };
        self.global.update_camera(context, frame, &camera_data)?;

        let scene_data = GpuSceneData {
            ambient_color: self.lighting.ambient_color,
            sun_direction: self.lighting.sun_direction,
            sun_color: self.lighting.sun_color,
            params: [self.skybox.prefilter_mip_levels() as f32, 0.0, 0.0, 0.0],
        };
        self.global.update_scene(context, frame, &scene_data)?;

        let light_data = GpuLightData {
            positions: self.lighting.light_positions,
            colors: self.lighting.light_colors,
        };
        self.global.update_lights(context, frame, &light_data)?;

        let view_projection =
            self.camera.projection_matrix(aspect_ratio) * self.camera.view_matrix();
        let object_data: Vec<GpuObjectData> = self
            .objects
            .iter_mut()
            .map(|object| {
                let model = object.transform.matrix();
                GpuObjectData {
                    model: model.into(),
                    mvp: (view_projection * model).into(),
                }
            })
            .collect();
        if !object_data.is_empty() {
            self.global.update_objects(context, frame, &object_data)?;
        }
        Ok(())
    }

    fn draw_skybox(
        &mut self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        frame: u64,
    ) -> VulkanResult<()> {
        let handle = self.skybox.material();
        let material = self.materials.get_mut(handle).ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "skybox material missing from arena".to_string(),
            }
        })?;

        // The skybox samples only the scene set, but shares the pipeline
        // layout shape with the object materials
        let set_layouts = [self.global.scene_layout(), self.global.object_layout()];
        if !material.is_ready() {
            material.setup(context, &set_layouts, render_pass)?;
        }
        let layout = material.pipeline_layout()?;
        self.global.bind_scene(command_buffer, layout, frame);
        self.global.bind_objects(command_buffer, layout, frame);
        self.materials[handle].bind(command_buffer)?;
        self.skybox.draw(command_buffer);
        Ok(())
    }

    /// Convenience wrapper spinning every object about the Y axis
    pub fn rotate_objects(&mut self, degrees_per_frame: f32) {
        for object in &mut self.objects {
            object.transform.rotate(Vec3::new(0.0, degrees_per_frame, 0.0));
        }
    }
}
