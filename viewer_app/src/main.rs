//! PBR viewer demo application
//!
//! Renders a ring of spheres under image-based lighting baked from an
//! HDR panorama, with a skybox drawn behind everything.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use pbr_engine::config::RenderConfig;
use pbr_engine::prelude::*;
use pbr_engine::render::cubemap::CaptureShaders;
use pbr_engine::render::skybox::SkyboxShaders;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => RenderConfig::load_from_file(&path)?,
        None => RenderConfig::default(),
    };

    let mut window = Window::new(
        &config.window.title,
        config.window.width,
        config.window.height,
    )?;
    let context = VulkanContext::new(&mut window, &config.window.title)?;
    let mut renderer = Renderer::new(&context, &window)?;

    let mut scene = build_scene(&context, &renderer, &config)?;

    log::info!("Scene ready, entering frame loop");
    let mut last_report = Instant::now();
    let mut frames = 0u32;

    while !window.should_close() {
        window.poll_events();

        scene.rotate_objects(0.4);

        if let Some(frame) = renderer.begin_frame(&context, &mut window)? {
            renderer.begin_render_pass(&context, frame.command_buffer);
            scene.draw(
                &context,
                frame.command_buffer,
                renderer.render_pass(),
                frame.frame,
                renderer.aspect_ratio(),
            )?;
            renderer.end_render_pass(&context, frame.command_buffer);
            renderer.end_frame(&context, &mut window)?;
        }

        frames += 1;
        if last_report.elapsed().as_secs_f64() >= 1.0 {
            let ms_per_frame = last_report.elapsed().as_secs_f64() * 1000.0 / f64::from(frames);
            window.set_title_suffix(&config.window.title, &format!("{:.3} ms", ms_per_frame));
            frames = 0;
            last_report = Instant::now();
        }
    }

    context.wait_idle();
    Ok(())
}

fn build_scene(
    context: &VulkanContext,
    renderer: &Renderer,
    config: &RenderConfig,
) -> Result<Scene, Box<dyn Error>> {
    let cube = Arc::new(Model::from_obj(context, config.model_path("cube.obj"))?);
    let sphere = Arc::new(Model::from_obj(context, config.model_path("sphere.obj"))?);

    let skybox_shaders = SkyboxShaders {
        skybox_vert: config.shader_path("skybox.vert.spv"),
        skybox_frag: config.shader_path("skybox.frag.spv"),
        equi_to_cube_frag: config.shader_path("equi_to_cube.frag.spv"),
        capture: CaptureShaders {
            cubemap_vert: config.shader_path("cubemap.vert.spv"),
            irradiance_frag: config.shader_path("irradiance_convolution.frag.spv"),
            prefilter_frag: config.shader_path("prefilter.frag.spv"),
        },
    };

    let mut camera = Camera::new(70.0);
    camera.set_position(Vec3::new(0.0, 0.0, -3.0));
    camera.set_rotation(90.0, 0.0);

    let mut scene = Scene::new(
        context,
        cube,
        &config.environment,
        &config.shader_path("brdf.comp.spv"),
        &skybox_shaders,
        renderer.frame_count(),
        camera,
    )?;

    let brick_material = {
        let albedo = Arc::new(Texture::from_file(
            context,
            "textures/PaintedBricks001_1K_Color.png",
            TextureFormat::Srgb,
        )?);
        let normal = Arc::new(Texture::from_file(
            context,
            "textures/PaintedBricks001_1K_Normal.png",
            TextureFormat::Linear,
        )?);
        let mask = Arc::new(Texture::from_file(
            context,
            "textures/PaintedBricks001_1K_Mask.png",
            TextureFormat::Linear,
        )?);

        let mut material = Material::new(
            &config.shader_path("pbr.vert.spv"),
            &config.shader_path("pbr.frag.spv"),
        );
        material.add_texture(albedo);
        material.add_texture(normal);
        material.add_texture(mask);
        scene.add_material(material)
    };

    let metal_material = {
        let albedo = Arc::new(Texture::from_file(
            context,
            "textures/Metal011_1K_Color.png",
            TextureFormat::Srgb,
        )?);
        let normal = Arc::new(Texture::from_file(
            context,
            "textures/Metal011_1K_NormalGL.png",
            TextureFormat::Linear,
        )?);
        let mask = Arc::new(Texture::from_file(
            context,
            "textures/Metal011_1K_Mask.png",
            TextureFormat::Linear,
        )?);

        let mut material = Material::new(
            &config.shader_path("pbr.vert.spv"),
            &config.shader_path("pbr.frag.spv"),
        );
        material.add_texture(albedo);
        material.add_texture(normal);
        material.add_texture(mask);
        scene.add_material(material)
    };

    scene.add_object(
        sphere.clone(),
        brick_material,
        Transform::new(Vec3::new(-1.2, 0.0, 0.0), Vec3::zeros()),
    );
    scene.add_object(
        sphere,
        metal_material,
        Transform::new(Vec3::new(1.2, 0.0, 0.0), Vec3::zeros()),
    );

    Ok(scene)
}
