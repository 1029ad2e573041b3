//! Renderable object: mesh + material + transform

use std::sync::Arc;

use crate::render::material::MaterialHandle;
use crate::render::model::Model;
use crate::render::transform::Transform;

/// A drawable scene entry
///
/// Models are shared by reference count; materials are shared through the
/// scene's material arena and referenced by handle.
pub struct RenderObject {
    pub model: Arc<Model>,
    pub material: MaterialHandle,
    pub transform: Transform,
}

impl RenderObject {
    pub fn new(model: Arc<Model>, material: MaterialHandle, transform: Transform) -> Self {
        Self {
            model,
            material,
            transform,
        }
    }
}
