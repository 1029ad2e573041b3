//! Global scene descriptors
//!
//! Per-frame-in-flight ring of uniform buffers for camera, scene, and
//! light data plus a storage buffer of per-object matrices, bound with
//! dynamic offsets. The ring index advances exactly once per frame,
//! keyed by an explicit frame serial number passed into every call.

use ash::{vk, Device};
use std::mem;

use crate::render::vulkan::{
    AllocatedBuffer, MemoryClass, VulkanContext, VulkanError, VulkanResult,
};

/// Upper bound of objects addressable in the per-frame storage buffer
pub const MAX_OBJECTS: usize = 10_000;

/// Camera data as laid out for the shaders
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuCameraData {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

unsafe impl bytemuck::Pod for GpuCameraData {}
unsafe impl bytemuck::Zeroable for GpuCameraData {}

/// Ambient and sun lighting parameters
///
/// `params.x` carries the prefiltered-specular mip count for the IBL
/// lookup; the remaining components are unused.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuSceneData {
    pub ambient_color: [f32; 4],
    pub sun_direction: [f32; 4],
    pub sun_color: [f32; 4],
    pub params: [f32; 4],
}

unsafe impl bytemuck::Pod for GpuSceneData {}
unsafe impl bytemuck::Zeroable for GpuSceneData {}

/// Point light array; color alpha carries intensity
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuLightData {
    pub positions: [[f32; 4]; 4],
    pub colors: [[f32; 4]; 4],
}

unsafe impl bytemuck::Pod for GpuLightData {}
unsafe impl bytemuck::Zeroable for GpuLightData {}

/// Per-object matrices stored in the object storage buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuObjectData {
    pub model: [[f32; 4]; 4],
    pub mvp: [[f32; 4]; 4],
}

unsafe impl bytemuck::Pod for GpuObjectData {}
unsafe impl bytemuck::Zeroable for GpuObjectData {}

/// Ring cursor advanced exactly once per observed frame serial
///
/// Repeated calls with the same serial return the same index; a new
/// serial advances the ring by one. The very first serial observed keeps
/// the starting index.
#[derive(Debug)]
pub struct FrameCursor {
    index: usize,
    count: usize,
    last_frame: Option<u64>,
}

impl FrameCursor {
    pub fn new(count: usize) -> Self {
        debug_assert!(count > 0);
        Self {
            index: 0,
            count,
            last_frame: None,
        }
    }

    /// Ring index for the given frame serial
    pub fn position(&mut self, frame: u64) -> usize {
        if self.last_frame != Some(frame) {
            if self.last_frame.is_some() {
                self.index = (self.index + 1) % self.count;
            }
            self.last_frame = Some(frame);
        }
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Image views sampled by the scene descriptor set
pub struct IblViews {
    pub irradiance: vk::ImageView,
    pub prefilter: vk::ImageView,
    pub prefilter_mip_levels: u32,
    pub brdf_lut: vk::ImageView,
}

/// Global descriptor manager for camera/scene/light uniforms and
/// per-object storage buffers
pub struct GlobalDescriptor {
    device: Device,

    scene_set_layout: vk::DescriptorSetLayout,
    object_set_layout: vk::DescriptorSetLayout,

    camera_buffer: AllocatedBuffer,
    scene_buffer: AllocatedBuffer,
    light_buffer: AllocatedBuffer,
    object_buffers: Vec<AllocatedBuffer>,

    camera_stride: vk::DeviceSize,
    scene_stride: vk::DeviceSize,
    light_stride: vk::DeviceSize,

    samplers: Vec<vk::Sampler>,
    scene_descriptors: Vec<vk::DescriptorSet>,
    object_descriptors: Vec<vk::DescriptorSet>,

    cursor: FrameCursor,
}

impl GlobalDescriptor {
    /// Build layouts, buffers, and descriptor sets for `frame_count` frames
    pub fn new(
        context: &VulkanContext,
        frame_count: usize,
        ibl: &IblViews,
    ) -> VulkanResult<Self> {
        let device = context.device().clone();

        let (scene_set_layout, object_set_layout) = Self::create_layouts(&device)?;

        let camera_stride =
            context.pad_uniform_buffer_size(mem::size_of::<GpuCameraData>() as vk::DeviceSize);
        let scene_stride =
            context.pad_uniform_buffer_size(mem::size_of::<GpuSceneData>() as vk::DeviceSize);
        let light_stride =
            context.pad_uniform_buffer_size(mem::size_of::<GpuLightData>() as vk::DeviceSize);

        let frames = frame_count as vk::DeviceSize;
        let camera_buffer = context.create_buffer(
            camera_stride * frames,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryClass::CpuToGpu,
        )?;
        let scene_buffer = context.create_buffer(
            scene_stride * frames,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryClass::CpuToGpu,
        )?;
        let light_buffer = context.create_buffer(
            light_stride * frames,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryClass::CpuToGpu,
        )?;

        // IBL samplers: irradiance and BRDF LUT are single-mip, the
        // prefiltered map selects its mip by roughness
        let mut samplers = Vec::with_capacity(3);
        for max_lod in [1.0, ibl.prefilter_mip_levels as f32, 1.0] {
            let sampler_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .min_lod(0.0)
                .max_lod(max_lod);
            let sampler = unsafe {
                device
                    .create_sampler(&sampler_info, None)
                    .map_err(VulkanError::Api)?
            };
            samplers.push(sampler);
        }

        let mut scene_descriptors = Vec::with_capacity(frame_count);
        let mut object_descriptors = Vec::with_capacity(frame_count);
        let mut object_buffers = Vec::with_capacity(frame_count);

        for _ in 0..frame_count {
            let scene_set = context.allocate_descriptor_set(scene_set_layout)?;

            let camera_info = vk::DescriptorBufferInfo {
                buffer: camera_buffer.buffer,
                offset: 0,
                range: mem::size_of::<GpuCameraData>() as vk::DeviceSize,
            };
            let scene_info = vk::DescriptorBufferInfo {
                buffer: scene_buffer.buffer,
                offset: 0,
                range: mem::size_of::<GpuSceneData>() as vk::DeviceSize,
            };
            let light_info = vk::DescriptorBufferInfo {
                buffer: light_buffer.buffer,
                offset: 0,
                range: mem::size_of::<GpuLightData>() as vk::DeviceSize,
            };

            let irradiance_info = vk::DescriptorImageInfo {
                sampler: samplers[0],
                image_view: ibl.irradiance,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };
            let prefilter_info = vk::DescriptorImageInfo {
                sampler: samplers[1],
                image_view: ibl.prefilter,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };
            let brdf_info = vk::DescriptorImageInfo {
                sampler: samplers[2],
                image_view: ibl.brdf_lut,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };

            let writes = [
                Self::write_buffer_descriptor(
                    scene_set,
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    &camera_info,
                ),
                Self::write_buffer_descriptor(
                    scene_set,
                    1,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    &scene_info,
                ),
                Self::write_buffer_descriptor(
                    scene_set,
                    2,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    &light_info,
                ),
                Self::write_image_descriptor(scene_set, 3, &irradiance_info),
                Self::write_image_descriptor(scene_set, 4, &prefilter_info),
                Self::write_image_descriptor(scene_set, 5, &brdf_info),
            ];
            unsafe {
                device.update_descriptor_sets(&writes, &[]);
            }
            scene_descriptors.push(scene_set);

            let object_buffer = context.create_buffer(
                (mem::size_of::<GpuObjectData>() * MAX_OBJECTS) as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryClass::CpuToGpu,
            )?;
            let object_set = context.allocate_descriptor_set(object_set_layout)?;

            let object_info = vk::DescriptorBufferInfo {
                buffer: object_buffer.buffer,
                offset: 0,
                range: (mem::size_of::<GpuObjectData>() * MAX_OBJECTS) as vk::DeviceSize,
            };
            let object_write = Self::write_buffer_descriptor(
                object_set,
                0,
                vk::DescriptorType::STORAGE_BUFFER,
                &object_info,
            );
            unsafe {
                device.update_descriptor_sets(&[object_write], &[]);
            }

            object_buffers.push(object_buffer);
            object_descriptors.push(object_set);
        }

        Ok(Self {
            device,
            scene_set_layout,
            object_set_layout,
            camera_buffer,
            scene_buffer,
            light_buffer,
            object_buffers,
            camera_stride,
            scene_stride,
            light_stride,
            samplers,
            scene_descriptors,
            object_descriptors,
            cursor: FrameCursor::new(frame_count),
        })
    }

    fn create_layouts(
        device: &Device,
    ) -> VulkanResult<(vk::DescriptorSetLayout, vk::DescriptorSetLayout)> {
        let binding = |index, ty, stages| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(index)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stages)
                .build()
        };

        let vert_frag = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let scene_bindings = [
            binding(0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, vert_frag),
            binding(1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, vert_frag),
            binding(
                2,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                vk::ShaderStageFlags::FRAGMENT,
            ),
            binding(
                3,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            ),
            binding(
                4,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            ),
            binding(
                5,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            ),
        ];
        let scene_layout_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&scene_bindings);
        let scene_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&scene_layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let object_bindings = [binding(
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        )];
        let object_layout_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&object_bindings);
        let object_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&object_layout_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok((scene_set_layout, object_set_layout))
    }

    fn write_buffer_descriptor(
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        info: &vk::DescriptorBufferInfo,
    ) -> vk::WriteDescriptorSet {
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(std::slice::from_ref(info))
            .build()
    }

    fn write_image_descriptor(
        set: vk::DescriptorSet,
        binding: u32,
        info: &vk::DescriptorImageInfo,
    ) -> vk::WriteDescriptorSet {
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(info))
            .build()
    }

    /// Layout of the scene descriptor set (set 0)
    pub fn scene_layout(&self) -> vk::DescriptorSetLayout {
        self.scene_set_layout
    }

    /// Layout of the object descriptor set (set 1)
    pub fn object_layout(&self) -> vk::DescriptorSetLayout {
        self.object_set_layout
    }

    /// Write camera data into the current frame's slice
    pub fn update_camera(
        &mut self,
        context: &VulkanContext,
        frame: u64,
        data: &GpuCameraData,
    ) -> VulkanResult<()> {
        let index = self.cursor.position(frame) as vk::DeviceSize;
        context.write_buffer(
            &self.camera_buffer,
            self.camera_stride * index,
            bytemuck::bytes_of(data),
        )
    }

    /// Write scene data into the current frame's slice
    pub fn update_scene(
        &mut self,
        context: &VulkanContext,
        frame: u64,
        data: &GpuSceneData,
    ) -> VulkanResult<()> {
        let index = self.cursor.position(frame) as vk::DeviceSize;
        context.write_buffer(
            &self.scene_buffer,
            self.scene_stride * index,
            bytemuck::bytes_of(data),
        )
    }

    /// Write light data into the current frame's slice
    pub fn update_lights(
        &mut self,
        context: &VulkanContext,
        frame: u64,
        data: &GpuLightData,
    ) -> VulkanResult<()> {
        let index = self.cursor.position(frame) as vk::DeviceSize;
        context.write_buffer(
            &self.light_buffer,
            self.light_stride * index,
            bytemuck::bytes_of(data),
        )
    }

    /// Write per-object matrices into the current frame's storage buffer
    pub fn update_objects(
        &mut self,
        context: &VulkanContext,
        frame: u64,
        objects: &[GpuObjectData],
    ) -> VulkanResult<()> {
        debug_assert!(objects.len() <= MAX_OBJECTS);
        let index = self.cursor.position(frame);
        context.write_buffer(
            &self.object_buffers[index],
            0,
            bytemuck::cast_slice(objects),
        )
    }

    /// Bind the scene set (set 0) with this frame's dynamic offsets
    pub fn bind_scene(
        &mut self,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        frame: u64,
    ) {
        let index = self.cursor.position(frame);
        let offsets = [
            (self.camera_stride * index as vk::DeviceSize) as u32,
            (self.scene_stride * index as vk::DeviceSize) as u32,
            (self.light_stride * index as vk::DeviceSize) as u32,
        ];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[self.scene_descriptors[index]],
                &offsets,
            );
        }
    }

    /// Bind the object set (set 1) for this frame
    pub fn bind_objects(
        &mut self,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        frame: u64,
    ) {
        let index = self.cursor.position(frame);
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                1,
                &[self.object_descriptors[index]],
                &[],
            );
        }
    }
}

impl Drop for GlobalDescriptor {
    fn drop(&mut self) {
        unsafe {
            for &sampler in &self.samplers {
                self.device.destroy_sampler(sampler, None);
            }
            self.device
                .destroy_descriptor_set_layout(self.scene_set_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.object_set_layout, None);
        }
        self.camera_buffer.destroy(&self.device);
        self.scene_buffer.destroy(&self.device);
        self.light_buffer.destroy(&self.device);
        for buffer in &self.object_buffers {
            buffer.destroy(&self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_frame_does_not_advance() {
        let mut cursor = FrameCursor::new(3);
        assert_eq!(cursor.position(1), 0);
        assert_eq!(cursor.position(1), 0);
        assert_eq!(cursor.position(1), 0);
    }

    #[test]
    fn new_frame_advances_exactly_once() {
        let mut cursor = FrameCursor::new(3);
        assert_eq!(cursor.position(1), 0);
        assert_eq!(cursor.position(2), 1);
        assert_eq!(cursor.position(2), 1);
        assert_eq!(cursor.position(3), 2);
    }

    #[test]
    fn cycle_returns_to_start_after_count_new_frames() {
        let mut cursor = FrameCursor::new(3);
        let start = cursor.position(1);
        assert_eq!(cursor.position(2), (start + 1) % 3);
        assert_eq!(cursor.position(3), (start + 2) % 3);
        assert_eq!(cursor.position(4), start);
    }

    #[test]
    fn interleaved_updates_and_binds_share_an_index() {
        let mut cursor = FrameCursor::new(2);
        let update_index = cursor.position(7);
        let bind_index = cursor.position(7);
        let second_bind = cursor.position(7);
        assert_eq!(update_index, bind_index);
        assert_eq!(bind_index, second_bind);
    }

    #[test]
    fn gpu_struct_sizes_are_stable() {
        assert_eq!(mem::size_of::<GpuCameraData>(), 144);
        assert_eq!(mem::size_of::<GpuSceneData>(), 64);
        assert_eq!(mem::size_of::<GpuLightData>(), 128);
        assert_eq!(mem::size_of::<GpuObjectData>(), 128);
    }
}
