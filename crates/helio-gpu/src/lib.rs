//! Vulkan device, resource, and presentation layer for the Helio renderer.
//!
//! This crate provides:
//! - Instance and logical device management with scored device selection
//! - Queue derivation per operation category (graphics, transfer, compute)
//! - Command pool and command buffer lifecycle, recorded and transient
//! - Buffer and texture resources with explicit staging and layout control
//! - Swapchain handling with the acquire/present/recreate protocol
//! - Descriptor pool, set layout, and pipeline layout construction

pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod features;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod render_target;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::{Buffer, BufferUsage};
pub use command::{begin_recorded, end_recorded, submit, CommandPool, PoolParams};
pub use context::{DeviceContext, DeviceRequirements, QueueAssignment};
pub use descriptors::{DescriptorKind, DescriptorPool, DescriptorWrite, LayoutBinding};
pub use error::{GpuError, Result};
pub use features::{
    DeviceFeatures, Operation, OperationRequest, ShaderStage, ShaderStages,
};
pub use instance::{Instance, InstanceBuilder};
pub use memory::{find_memory_type_index, MemoryLocation};
pub use pipeline::{
    create_pipeline_layout, ComputePipeline, PushConstantRange, RenderPipeline,
    RenderPipelineDesc, ShaderSource, VertexAttribute, VertexBinding, VertexLayout,
};
pub use render_target::{RenderPass, RenderTarget};
pub use surface::{Surface, SurfaceConfig};
pub use swapchain::{PresentMode, Swapchain};
pub use sync::{create_fence, create_semaphore, reset_fence, wait_for_fence};
pub use texture::{
    mip_level_count, Texture, TextureDesc, TextureKind, TextureUsage,
};
