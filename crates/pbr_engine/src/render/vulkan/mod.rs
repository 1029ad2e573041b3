//! Vulkan rendering backend
//!
//! Low-level Vulkan wrappers: device context, memory-backed buffers and
//! images, pipelines, and the swapchain.

pub mod buffer;
pub mod context;
pub mod image;
pub mod pipeline;
pub mod swapchain;

pub use buffer::AllocatedBuffer;
pub use context::{MemoryClass, VulkanContext};
pub use image::AllocatedImage;
pub use pipeline::{Pipeline, PipelineConfig, ShaderModule};
pub use swapchain::{FrameAcquire, PresentOutcome, Swapchain, MAX_FRAMES_IN_FLIGHT};

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Shader module loading failed
    #[error("Failed to load shader {path}: {reason}")]
    ShaderLoad {
        /// Path of the shader binary
        path: String,
        /// Underlying failure
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
