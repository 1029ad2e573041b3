//! Vulkan context management
//!
//! Owns the instance, device, queues, command pool, and descriptor pool,
//! and provides buffer/image allocation and one-shot command submission
//! for the rest of the engine.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};

use crate::render::vulkan::{AllocatedBuffer, AllocatedImage, VulkanError, VulkanResult};
use crate::render::window::Window;

/// Memory class of an allocation, selecting the backing memory properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// Device-local memory, not host visible
    GpuOnly,
    /// Host-visible, host-coherent memory written by the CPU
    CpuToGpu,
}

impl MemoryClass {
    fn property_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuToGpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// Queue family indices used by the engine
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyIndices {
    /// Graphics queue family
    pub graphics: u32,
    /// Presentation queue family
    pub present: u32,
}

/// Swapchain support details for a surface/device pair
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Round `size` up to the next multiple of `min_alignment`
///
/// `min_alignment` must be zero or a power of two, which is what Vulkan
/// guarantees for `minUniformBufferOffsetAlignment`.
pub fn pad_uniform_size(min_alignment: vk::DeviceSize, size: vk::DeviceSize) -> vk::DeviceSize {
    if min_alignment > 0 {
        (size + min_alignment - 1) & !(min_alignment - 1)
    } else {
        size
    }
}

/// Vulkan device context shared by every GPU resource
pub struct VulkanContext {
    _entry: Entry,
    instance: Instance,
    #[cfg(debug_assertions)]
    debug_utils: Option<DebugUtils>,
    #[cfg(debug_assertions)]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_families: QueueFamilyIndices,
    device: Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
}

impl VulkanContext {
    /// Create the full Vulkan context for a window
    pub fn new(window: &mut Window, app_name: &str) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e))
        })?;

        let instance = Self::create_instance(&entry, window, app_name)?;

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = Self::create_debug_messenger(&entry, &instance)?;

        let surface = window
            .create_vulkan_surface(instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let surface_loader = Surface::new(&entry, &instance);

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        let device = Self::create_logical_device(&instance, physical_device, queue_families)?;
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let command_pool = Self::create_command_pool(&device, queue_families.graphics)?;
        let descriptor_pool = Self::create_descriptor_pool(&device)?;

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!("Using GPU: {}", device_name.to_string_lossy());

        Ok(Self {
            _entry: entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
            surface_loader,
            surface,
            physical_device,
            properties,
            queue_families,
            device,
            graphics_queue,
            present_queue,
            command_pool,
            descriptor_pool,
        })
    }

    fn create_instance(
        entry: &Entry,
        window: &Window,
        app_name: &str,
    ) -> VulkanResult<Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("Invalid app name".to_string()))?;
        let engine_name_cstr = CString::new("pbr_engine")
            .map_err(|_| VulkanError::InitializationFailed("Invalid engine name".to_string()))?;

        // Multiview render passes require Vulkan 1.1
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let required_extensions = window.required_instance_extensions().map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to get required extensions: {}", e))
        })?;

        let cstr_extensions: Vec<CString> = required_extensions
            .iter()
            .filter_map(|ext| CString::new(ext.as_str()).ok())
            .collect();

        #[allow(unused_mut)]
        let mut extensions: Vec<*const i8> =
            cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        #[cfg(debug_assertions)]
        extensions.push(DebugUtils::name().as_ptr());

        let layer_names: Vec<CString> = if cfg!(debug_assertions) {
            vec![CString::new("VK_LAYER_KHRONOS_validation")
                .map_err(|_| VulkanError::InitializationFailed("Invalid layer name".to_string()))?]
        } else {
            vec![]
        };
        let layer_ptrs: Vec<*const i8> = layer_names.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);

        unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    #[cfg(debug_assertions)]
    fn create_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> VulkanResult<(Option<DebugUtils>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let messenger = unsafe {
            debug_utils
                .create_debug_utils_messenger(&messenger_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok((Some(debug_utils), Some(messenger)))
    }

    fn pick_physical_device(
        instance: &Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> VulkanResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        for device in devices {
            if let Some(families) =
                Self::find_queue_families(instance, surface_loader, surface, device)?
            {
                if Self::device_is_suitable(instance, surface_loader, surface, device)? {
                    return Ok((device, families));
                }
            }
        }

        Err(VulkanError::InitializationFailed(
            "No suitable GPU found".to_string(),
        ))
    }

    fn find_queue_families(
        instance: &Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> VulkanResult<Option<QueueFamilyIndices>> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(index);
            }

            let supports_present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };
            if supports_present && present.is_none() {
                present = Some(index);
            }

            if let (Some(graphics), Some(present)) = (graphics, present) {
                return Ok(Some(QueueFamilyIndices { graphics, present }));
            }
        }

        Ok(None)
    }

    fn device_is_suitable(
        instance: &Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> VulkanResult<bool> {
        // Swapchain extension support
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let has_swapchain = extensions.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Ok(false);
        }

        // At least one surface format and present mode
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(device, surface)
                .map_err(VulkanError::Api)?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device, surface)
                .map_err(VulkanError::Api)?
        };
        if formats.is_empty() || present_modes.is_empty() {
            return Ok(false);
        }

        // Multiview is required by the cubemap capture pass
        let mut multiview = vk::PhysicalDeviceMultiviewFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut multiview)
            .build();
        unsafe { instance.get_physical_device_features2(device, &mut features2) };
        Ok(multiview.multiview == vk::TRUE)
    }

    fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilyIndices,
    ) -> VulkanResult<Device> {
        let mut unique_families = vec![families.graphics];
        if families.present != families.graphics {
            unique_families.push(families.present);
        }

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_names = [SwapchainLoader::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();
        let mut multiview_features =
            vk::PhysicalDeviceMultiviewFeatures::builder().multiview(true);

        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut multiview_features);

        unsafe {
            instance
                .create_device(physical_device, &device_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_command_pool(device: &Device, graphics_family: u32) -> VulkanResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_family);

        unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_descriptor_pool(device: &Device) -> VulkanResult<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 100,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 100,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 100,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 200,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 10,
            },
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(200)
            .pool_sizes(&pool_sizes);

        unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Logical device handle
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Vulkan instance handle
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Query surface capabilities, formats, and present modes
    pub fn swapchain_support(&self) -> VulkanResult<SwapchainSupport> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(VulkanError::Api)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(VulkanError::Api)?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(VulkanError::Api)?;
            Ok(SwapchainSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Round a uniform buffer slice size up to the device offset alignment
    pub fn pad_uniform_buffer_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        pad_uniform_size(
            self.properties.limits.min_uniform_buffer_offset_alignment,
            size,
        )
    }

    /// Find a supported format from an ordered candidate list
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> VulkanResult<vk::Format> {
        for &format in candidates {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            };
            let supported = match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                _ => props.optimal_tiling_features.contains(features),
            };
            if supported {
                return Ok(format);
            }
        }
        Err(VulkanError::InitializationFailed(
            "No supported format found".to_string(),
        ))
    }

    fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        let mem_properties = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };

        for i in 0..mem_properties.memory_type_count {
            if (type_filter & (1 << i)) != 0
                && mem_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
            {
                return Ok(i);
            }
        }

        Err(VulkanError::NoSuitableMemoryType)
    }

    /// Create a buffer with bound memory of the given class
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_class: MemoryClass,
    ) -> VulkanResult<AllocatedBuffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index =
            self.find_memory_type(requirements.memory_type_bits, memory_class.property_flags())?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(AllocatedBuffer {
            buffer,
            memory,
            size,
        })
    }

    /// Create an image with bound memory of the given class
    pub fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo,
        memory_class: MemoryClass,
    ) -> VulkanResult<AllocatedImage> {
        let image = unsafe {
            self.device
                .create_image(image_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory_type_index =
            self.find_memory_type(requirements.memory_type_bits, memory_class.property_flags())?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            self.device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            self.device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(AllocatedImage { image, memory })
    }

    /// Write bytes into a host-visible buffer at the given offset
    pub fn write_buffer(
        &self,
        buffer: &AllocatedBuffer,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> VulkanResult<()> {
        unsafe {
            let data = self
                .device
                .map_memory(
                    buffer.memory,
                    offset,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data as *mut u8, bytes.len());
            self.device.unmap_memory(buffer.memory);
        }
        Ok(())
    }

    /// Allocate a descriptor set from the shared pool
    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);

        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        Ok(sets[0])
    }

    /// Begin a one-shot command buffer
    pub fn begin_single_time_commands(&self) -> VulkanResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(self.command_pool)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        Ok(command_buffer)
    }

    /// Submit a one-shot command buffer and block until it completes
    pub fn end_single_time_commands(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .map_err(VulkanError::Api)?;
            self.device
                .queue_wait_idle(self.graphics_queue)
                .map_err(VulkanError::Api)?;

            self.device
                .free_command_buffers(self.command_pool, &command_buffers);
        }
        Ok(())
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            #[cfg(debug_assertions)]
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(debug_assertions)]
unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {}", message);
    } else {
        log::warn!("[vulkan] {}", message);
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::pad_uniform_size;

    #[test]
    fn padding_is_idempotent() {
        for alignment in [1u64, 16, 64, 256] {
            for size in [0u64, 1, 63, 64, 65, 200, 256, 1000] {
                let once = pad_uniform_size(alignment, size);
                assert_eq!(pad_uniform_size(alignment, once), once);
            }
        }
    }

    #[test]
    fn padding_never_shrinks_and_aligns() {
        for alignment in [1u64, 2, 16, 64, 256] {
            for size in [1u64, 17, 100, 255, 256, 257] {
                let padded = pad_uniform_size(alignment, size);
                assert!(padded >= size);
                assert_eq!(padded % alignment, 0);
            }
        }
    }

    #[test]
    fn zero_alignment_passes_through() {
        assert_eq!(pad_uniform_size(0, 100), 100);
    }
}
