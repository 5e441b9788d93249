//! GPU image resources.
//!
//! A [`Texture`] either owns its image and memory, or borrows an image the
//! presentation engine owns (swapchain images). Only owned backings allocate
//! and free memory. Image layout is tracked explicitly: callers transition
//! `Undefined -> TransferDst` before copies and on to `ShaderReadOnly`
//! before sampling.

use crate::buffer::Buffer;
use crate::command::CommandPool;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::{self, MemoryLocation};
use ash::vk;

bitflags::bitflags! {
    /// What a texture will be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

impl TextureUsage {
    /// Map onto the raw API usage mask.
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(Self::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(Self::COLOR_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(Self::DEPTH_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// Image dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    D1,
    D2,
    D3,
    Cube,
}

impl TextureKind {
    pub fn image_type(self) -> vk::ImageType {
        match self {
            Self::D1 => vk::ImageType::TYPE_1D,
            Self::D2 | Self::Cube => vk::ImageType::TYPE_2D,
            Self::D3 => vk::ImageType::TYPE_3D,
        }
    }

    pub fn view_type(self) -> vk::ImageViewType {
        match self {
            Self::D1 => vk::ImageViewType::TYPE_1D,
            Self::D2 => vk::ImageViewType::TYPE_2D,
            Self::D3 => vk::ImageViewType::TYPE_3D,
            Self::Cube => vk::ImageViewType::CUBE,
        }
    }

    /// Array layers implied by the kind (cube maps are six-layer images).
    pub fn base_array_layers(self) -> u32 {
        match self {
            Self::Cube => 6,
            _ => 1,
        }
    }
}

/// Creation parameters for an owned texture.
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Mip chain length; use [`mip_level_count`] for a full chain.
    pub mip_levels: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// A single-mip 2D texture.
    pub fn d2(format: vk::Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            kind: TextureKind::D2,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            usage,
        }
    }
}

/// Full mip chain length for a `width` x `height` image.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Linear dimension of a mip level, halving per level with a floor of 1.
pub fn mip_dimension(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// The subresource aspect implied by a format.
pub(crate) fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Access masks and pipeline stages for a supported layout transition.
fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<(
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
)> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::UNDEFINED, L::GENERAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL)
        | (L::GENERAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => {
            return Err(GpuError::InvalidState(format!(
                "unsupported layout transition {old:?} -> {new:?}"
            )))
        }
    };

    Ok(masks)
}

/// Whether the image and its memory belong to this texture.
enum ImageBacking {
    /// Texture allocated and bound its own memory; freed on destroy.
    Owned { memory: vk::DeviceMemory },
    /// Externally owned image (swapchain); never freed here.
    Borrowed,
}

/// A GPU image with view, tracked layout, and owned or borrowed backing.
pub struct Texture {
    image: vk::Image,
    view: vk::ImageView,
    backing: ImageBacking,
    kind: TextureKind,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    usage: TextureUsage,
    layout: vk::ImageLayout,
}

impl Texture {
    /// Create an owned, device-local texture.
    pub fn new(ctx: &DeviceContext, desc: &TextureDesc) -> Result<Self> {
        let device = ctx.device();
        let array_layers = desc.kind.base_array_layers();

        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };

        let mut create_info = vk::ImageCreateInfo::default()
            .image_type(desc.kind.image_type())
            .format(desc.format)
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        if desc.kind == TextureKind::Cube {
            create_info = create_info.flags(vk::ImageCreateFlags::CUBE_COMPATIBLE);
        }

        let image = unsafe { device.create_image(&create_info, None)? };

        let memory = match unsafe {
            memory::allocate_image_memory(
                device,
                ctx.memory_properties(),
                image,
                MemoryLocation::DeviceLocal,
            )
        } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            create_view(
                device,
                image,
                desc.kind.view_type(),
                desc.format,
                desc.mip_levels,
                array_layers,
            )?
        };

        Ok(Self {
            image,
            view,
            backing: ImageBacking::Owned { memory },
            kind: desc.kind,
            format: desc.format,
            extent,
            mip_levels: desc.mip_levels,
            array_layers,
            usage: desc.usage,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Wrap a swapchain-owned image without taking ownership.
    ///
    /// Used by `Surface` for its render targets; the presentation engine
    /// keeps ownership of the image and its memory.
    pub(crate) fn from_swapchain_image(
        device: &ash::Device,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let view = unsafe { create_view(device, image, vk::ImageViewType::TYPE_2D, format, 1, 1)? };

        Ok(Self {
            image,
            view,
            backing: ImageBacking::Borrowed,
            kind: TextureKind::D2,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            usage: TextureUsage::COLOR_ATTACHMENT,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn kind(&self) -> TextureKind {
        self.kind
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    /// The layout the image was last transitioned to.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a layout transition into a caller-owned command stream.
    pub fn record_transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        if self.layout == new_layout {
            return Ok(());
        }

        let (src_access, dst_access, src_stage, dst_stage) =
            transition_masks(self.layout, new_layout)?;

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(self.format))
                    .base_mip_level(0)
                    .level_count(self.mip_levels)
                    .base_array_layer(0)
                    .layer_count(self.array_layers),
            )
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        self.layout = new_layout;
        Ok(())
    }

    /// Synchronously transition the image layout via a one-shot submit.
    pub fn transition_layout(
        &mut self,
        device: &ash::Device,
        pool: &CommandPool,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        if self.layout == new_layout {
            return Ok(());
        }

        let cmd = unsafe { pool.begin_one_shot(device)? };
        self.record_transition(device, cmd, new_layout)?;
        unsafe { pool.end_one_shot(device, cmd) }
    }

    /// Synchronously copy pixel data from a staging buffer into mip 0.
    ///
    /// The image must currently be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_from_buffer(
        &mut self,
        device: &ash::Device,
        pool: &CommandPool,
        src: &Buffer,
    ) -> Result<()> {
        debug_assert!(
            self.layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            "image must be transitioned to transfer-dst before a copy"
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect_mask(self.format))
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(self.array_layers),
            )
            .image_extent(self.extent);

        unsafe {
            pool.with_one_shot(device, |cmd| {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    src.handle(),
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            })
        }
    }

    /// Generate the full mip chain by blitting each level from its
    /// predecessor.
    ///
    /// Expects mip 0 in `TRANSFER_DST_OPTIMAL` (the state after
    /// [`Texture::copy_from_buffer`]); leaves every level in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn generate_mipmaps(&mut self, device: &ash::Device, pool: &CommandPool) -> Result<()> {
        debug_assert!(
            self.layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            "mip generation expects the base level in transfer-dst"
        );
        debug_assert!(
            self.usage
                .contains(TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST),
            "mip generation blits require transfer-src and transfer-dst usage"
        );

        let aspect = aspect_mask(self.format);
        let image = self.image;
        let layers = self.array_layers;
        let mip_levels = self.mip_levels;
        let extent = self.extent;

        unsafe {
            pool.with_one_shot(device, |cmd| {
                let subrange = |level: u32| {
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(aspect)
                        .base_mip_level(level)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(layers)
                };
                let sublayers = |level: u32| {
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(level)
                        .base_array_layer(0)
                        .layer_count(layers)
                };
                let barrier = |old, new, src_access, dst_access, level| {
                    vk::ImageMemoryBarrier::default()
                        .old_layout(old)
                        .new_layout(new)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(image)
                        .subresource_range(subrange(level))
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                };

                for level in 1..mip_levels {
                    // Level `level - 1` holds data: make it the blit source.
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier(
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::TRANSFER_READ,
                            level - 1,
                        )],
                    );
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier(
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::empty(),
                            vk::AccessFlags::TRANSFER_WRITE,
                            level,
                        )],
                    );

                    let src_extent = [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: mip_dimension(extent.width, level - 1) as i32,
                            y: mip_dimension(extent.height, level - 1) as i32,
                            z: 1,
                        },
                    ];
                    let dst_extent = [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: mip_dimension(extent.width, level) as i32,
                            y: mip_dimension(extent.height, level) as i32,
                            z: 1,
                        },
                    ];

                    let blit = vk::ImageBlit::default()
                        .src_offsets(src_extent)
                        .src_subresource(sublayers(level - 1))
                        .dst_offsets(dst_extent)
                        .dst_subresource(sublayers(level));

                    device.cmd_blit_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );

                    // Source level is final: move it to shader-read.
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier(
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            vk::AccessFlags::TRANSFER_READ,
                            vk::AccessFlags::SHADER_READ,
                            level - 1,
                        )],
                    );
                }

                // The last level was only ever a blit destination.
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier(
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        mip_levels - 1,
                    )],
                );
            })?;
        }

        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    /// Destroy the view and, for owned backings, the image and its memory.
    ///
    /// # Safety
    /// The device must be valid and the image must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        if let ImageBacking::Owned { memory } = self.backing {
            device.destroy_image(self.image, None);
            device.free_memory(memory, None);
        }
        self.image = vk::Image::null();
        self.view = vk::ImageView::null();
        self.backing = ImageBacking::Borrowed;
    }
}

unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    mip_levels: u32,
    array_layers: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask(format))
                .base_mip_level(0)
                .level_count(mip_levels)
                .base_array_layer(0)
                .layer_count(array_layers),
        );

    let view = device.create_image_view(&view_info, None)?;
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mip_chain_length() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(640, 480), 10);
        assert_eq!(mip_level_count(1, 1024), 11);
    }

    #[test]
    fn mip_dimensions_halve_with_floor_one() {
        assert_eq!(mip_dimension(256, 0), 256);
        assert_eq!(mip_dimension(256, 1), 128);
        assert_eq!(mip_dimension(256, 8), 1);
        assert_eq!(mip_dimension(256, 12), 1);
        assert_eq!(mip_dimension(3, 1), 1);
    }

    #[test]
    fn usage_maps_exactly() {
        let usage = TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST;
        assert_eq!(
            usage.to_vk(),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            TextureUsage::DEPTH_ATTACHMENT.to_vk(),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
    }

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_mask(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn cube_textures_have_six_layers() {
        assert_eq!(TextureKind::Cube.base_array_layers(), 6);
        assert_eq!(TextureKind::D2.base_array_layers(), 1);
        assert_eq!(TextureKind::Cube.image_type(), vk::ImageType::TYPE_2D);
        assert_eq!(TextureKind::Cube.view_type(), vk::ImageViewType::CUBE);
    }

    #[test]
    fn known_transitions_resolve() {
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        )
        .is_ok());
        assert!(transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        )
        .is_ok());
    }

    #[test]
    fn unknown_transition_is_rejected() {
        assert!(transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::UNDEFINED
        )
        .is_err());
    }
}
