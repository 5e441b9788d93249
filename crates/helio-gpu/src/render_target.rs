//! Render pass and per-image render targets for surface presentation.
//!
//! One render pass is shared by all of a surface's targets; each target owns
//! a framebuffer over a borrowed swapchain color view plus, optionally, its
//! own depth texture.

use crate::context::DeviceContext;
use crate::error::Result;
use crate::texture::{Texture, TextureDesc, TextureUsage};
use ash::vk;

/// A render pass matching the surface's color format, with an optional
/// depth attachment.
pub struct RenderPass {
    handle: vk::RenderPass,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
}

impl RenderPass {
    /// Create a forward pass rendering into a presentable image.
    ///
    /// The color attachment is cleared on load and left in present layout;
    /// depth contents are discarded after the pass.
    pub(crate) fn new(
        device: &ash::Device,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
    ) -> Result<Self> {
        let mut attachments = vec![vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        if let Some(depth_format) = depth_format {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        if depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        // The pass may not write attachments until the acquired image is
        // actually released by the presentation engine.
        let mut stage_mask = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut access_mask = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth_format.is_some() {
            stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stage_mask)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stage_mask)
            .dst_access_mask(access_mask);

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        let handle = unsafe { device.create_render_pass(&create_info, None)? };

        Ok(Self {
            handle,
            color_format,
            depth_format,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    /// # Safety
    /// The device must be valid and no pipeline or framebuffer may still
    /// reference the pass.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_render_pass(self.handle, None);
        self.handle = vk::RenderPass::null();
    }
}

/// Framebuffer over one swapchain image, with an optional owned depth
/// texture.
pub struct RenderTarget {
    framebuffer: vk::Framebuffer,
    color: Texture,
    depth: Option<Texture>,
    extent: vk::Extent2D,
}

impl RenderTarget {
    /// Build a target for one swapchain image.
    ///
    /// The color texture borrows the swapchain image; the depth texture,
    /// when the pass wants one, is owned by this target.
    pub(crate) fn new(
        ctx: &DeviceContext,
        render_pass: &RenderPass,
        swapchain_image: vk::Image,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let device = ctx.device();

        let color = Texture::from_swapchain_image(
            device,
            swapchain_image,
            render_pass.color_format(),
            extent,
        )?;

        let depth = match render_pass.depth_format() {
            Some(format) => Some(Texture::new(
                ctx,
                &TextureDesc::d2(
                    format,
                    extent.width,
                    extent.height,
                    TextureUsage::DEPTH_ATTACHMENT,
                ),
            )?),
            None => None,
        };

        let mut attachments = vec![color.view()];
        if let Some(depth) = &depth {
            attachments.push(depth.view());
        }

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe { device.create_framebuffer(&create_info, None)? };

        Ok(Self {
            framebuffer,
            color,
            depth,
            extent,
        })
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn color(&self) -> &Texture {
        &self.color
    }

    pub fn depth(&self) -> Option<&Texture> {
        self.depth.as_ref()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// # Safety
    /// The device must be valid and the target must not be referenced by
    /// pending command buffers.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_framebuffer(self.framebuffer, None);
        self.framebuffer = vk::Framebuffer::null();
        self.color.destroy(device);
        if let Some(depth) = &mut self.depth {
            depth.destroy(device);
        }
    }
}
