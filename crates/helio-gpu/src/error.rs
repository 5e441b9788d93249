//! GPU error types.

use crate::features::Operation;
use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Initialization-time errors (no suitable device, queue family, memory type,
/// or surface format) describe unsatisfiable hard requirements and are never
/// retried. `SwapchainOutOfDate` is advisory: the surface must be recreated
/// before the next frame.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No physical device satisfies the requested features and extensions.
    #[error("no suitable GPU found")]
    NoSuitableDevice,

    /// A required operation has no compatible queue family.
    #[error("no queue family supports required operation {0:?}")]
    NoCompatibleQueueFamily(Operation),

    /// No queue family can present to an attached surface.
    #[error("no queue family supports presentation to the surface")]
    NoPresentQueueFamily,

    /// No device memory type satisfies the requested property flags.
    #[error("no compatible memory type for requested properties")]
    NoCompatibleMemoryType,

    /// The surface reports no usable formats.
    #[error("surface reports no supported formats")]
    NoSurfaceFormat,

    /// Surface creation failed.
    #[error("surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches the surface; recreate it.
    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    /// Pipeline creation failed.
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// An object was used outside its lifecycle contract.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
