//! Mesh loading and GPU vertex/index buffers

use ash::{vk, Device};
use std::mem;
use std::path::Path;

use crate::render::texture::AssetError;
use crate::render::vulkan::buffer::{self, AllocatedBuffer};
use crate::render::vulkan::VulkanContext;

/// Interleaved vertex layout shared by every pipeline in the engine
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coord: [f32; 2],
    pub color: [f32; 3],
}

unsafe impl bytemuck::Pod for Vertex {}
unsafe impl bytemuck::Zeroable for Vertex {}

impl Vertex {
    /// Vertex buffer binding description
    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription {
            binding: 0,
            stride: mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    /// Vertex attribute descriptions matching the shader input locations
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: mem::size_of::<[f32; 3]>() as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: mem::size_of::<[f32; 6]>() as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 3,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: mem::size_of::<[f32; 8]>() as u32,
            },
        ]
    }
}

/// A mesh uploaded to device-local vertex and index buffers
pub struct Model {
    device: Device,
    vertex_buffer: AllocatedBuffer,
    vertex_count: u32,
    index_buffer: AllocatedBuffer,
    index_count: u32,
}

impl Model {
    /// Load an OBJ file into GPU buffers
    pub fn from_obj<P: AsRef<Path>>(context: &VulkanContext, path: P) -> Result<Self, AssetError> {
        let path_display = path.as_ref().display().to_string();

        let (models, _materials) = tobj::load_obj(path.as_ref(), &tobj::GPU_LOAD_OPTIONS)
            .map_err(|e| AssetError::Decode {
                path: path_display.clone(),
                reason: e.to_string(),
            })?;

        let mut vertices: Vec<Vertex> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();

        for model in &models {
            let mesh = &model.mesh;
            let base_vertex = vertices.len() as u32;
            let vertex_count = mesh.positions.len() / 3;

            for i in 0..vertex_count {
                let normal = if mesh.normals.len() >= (i + 1) * 3 {
                    [
                        mesh.normals[3 * i],
                        mesh.normals[3 * i + 1],
                        mesh.normals[3 * i + 2],
                    ]
                } else {
                    [0.0, 1.0, 0.0]
                };
                let tex_coord = if mesh.texcoords.len() >= (i + 1) * 2 {
                    [mesh.texcoords[2 * i], mesh.texcoords[2 * i + 1]]
                } else {
                    [0.0, 0.0]
                };

                vertices.push(Vertex {
                    position: [
                        mesh.positions[3 * i],
                        mesh.positions[3 * i + 1],
                        mesh.positions[3 * i + 2],
                    ],
                    normal,
                    tex_coord,
                    color: [1.0, 1.0, 1.0],
                });
            }

            indices.extend(mesh.indices.iter().map(|&index| base_vertex + index));
        }

        if vertices.len() < 3 || indices.len() < 3 {
            return Err(AssetError::Decode {
                path: path_display,
                reason: "mesh has fewer than 3 vertices".to_string(),
            });
        }

        log::info!(
            "Loaded model {}: {} vertices, {} indices",
            path_display,
            vertices.len(),
            indices.len()
        );

        Self::from_data(context, &vertices, &indices).map_err(AssetError::Gpu)
    }

    /// Upload prebuilt vertex and index data
    pub fn from_data(
        context: &VulkanContext,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> crate::render::vulkan::VulkanResult<Self> {
        let vertex_buffer = buffer::create_device_local_buffer(
            context,
            bytemuck::cast_slice(vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = buffer::create_device_local_buffer(
            context,
            bytemuck::cast_slice(indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        Ok(Self {
            device: context.device().clone(),
            vertex_buffer,
            vertex_count: vertices.len() as u32,
            index_buffer,
            index_count: indices.len() as u32,
        })
    }

    /// Bind vertex and index buffers
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        let buffers = [self.vertex_buffer.buffer];
        let offsets = [0];
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, 0, &buffers, &offsets);
            self.device.cmd_bind_index_buffer(
                command_buffer,
                self.index_buffer.buffer,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    /// Issue an indexed draw
    ///
    /// `first_instance` carries the object index so shaders can address
    /// per-object data in the storage buffer.
    pub fn draw(&self, command_buffer: vk::CommandBuffer, first_instance: u32) {
        unsafe {
            self.device
                .cmd_draw_indexed(command_buffer, self.index_count, 1, 0, 0, first_instance);
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.vertex_buffer.destroy(&self.device);
        self.index_buffer.destroy(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(mem::size_of::<Vertex>(), 11 * mem::size_of::<f32>());

        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(attributes[3].offset, 32);
    }

    #[test]
    fn binding_stride_matches_vertex_size() {
        let bindings = Vertex::binding_descriptions();
        assert_eq!(bindings[0].stride as usize, mem::size_of::<Vertex>());
    }
}
