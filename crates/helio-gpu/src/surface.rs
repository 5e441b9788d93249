//! Presentable surfaces and the acquire/present state machine.
//!
//! A [`Surface`] is created against the instance, attached to a
//! [`DeviceContext`] during its initialization (which picks a presentation
//! queue family for this surface), and from then on owns the swapchain, one
//! render target and command buffer per image, and the two semaphores the
//! frame protocol runs on. Every `acquire` must be paired with exactly one
//! `present` before the next `acquire`; violations are rejected.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::features::Operation;
use crate::render_target::{RenderPass, RenderTarget};
use crate::swapchain::{
    choose_extent, choose_present_mode, choose_surface_format, PresentMode, Swapchain,
};
use crate::sync::create_semaphore;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::time::Duration;

/// Caller-facing surface configuration.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceConfig {
    /// Requested swapchain size, clamped to surface capability bounds.
    pub width: u32,
    pub height: u32,
    /// Requested presentation mode; falls back per the documented order.
    pub present_mode: PresentMode,
    /// Depth attachment format, or `None` for color-only targets.
    pub depth_format: Option<vk::Format>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            present_mode: PresentMode::Fifo,
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }
}

/// Frame protocol position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceState {
    /// No device attached yet.
    Uninitialized,
    /// Swapchain exists, no image held.
    Ready,
    /// Holding the image at this index until it is presented.
    Acquired(u32),
}

impl SurfaceState {
    fn begin_acquire(self) -> Result<()> {
        match self {
            Self::Ready => Ok(()),
            Self::Uninitialized => Err(GpuError::InvalidState(
                "acquire on an uninitialized surface".to_string(),
            )),
            Self::Acquired(_) => Err(GpuError::InvalidState(
                "acquire while an image is already held; present it first".to_string(),
            )),
        }
    }

    fn begin_present(self) -> Result<u32> {
        match self {
            Self::Acquired(index) => Ok(index),
            _ => Err(GpuError::InvalidState(
                "present without a prior acquire".to_string(),
            )),
        }
    }
}

/// Everything rebuilt wholesale when the swapchain is recreated.
struct Chain {
    swapchain: Swapchain,
    render_pass: RenderPass,
    targets: Vec<RenderTarget>,
    command_buffers: Vec<vk::CommandBuffer>,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

impl Chain {
    unsafe fn destroy(&mut self, ctx: &DeviceContext, loader: &ash::khr::swapchain::Device) {
        let device = ctx.device();

        if let Some(pool) = ctx.default_pool() {
            pool.free(device, &self.command_buffers);
        }
        self.command_buffers.clear();

        for target in &mut self.targets {
            target.destroy(device);
        }
        self.targets.clear();

        self.render_pass.destroy(device);
        self.swapchain.destroy(loader);

        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
    }
}

/// A presentable window surface.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    config: SurfaceConfig,
    present_family: Option<u32>,
    present_queue: Option<vk::Queue>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    chain: Option<Chain>,
    state: SurfaceState,
}

impl Surface {
    /// Create a native surface for a window.
    ///
    /// The surface stays uninitialized until a [`DeviceContext`] is
    /// initialized against it.
    pub fn new<W>(
        instance: &crate::instance::Instance,
        window: &W,
        config: SurfaceConfig,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("no display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("no window handle: {e}")))?;

        let handle = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.handle(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        Ok(Self {
            handle,
            loader,
            config,
            present_family: None,
            present_queue: None,
            swapchain_loader: None,
            chain: None,
            state: SurfaceState::Uninitialized,
        })
    }

    /// Get the raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// First queue family, in declaration order, able to present here.
    pub(crate) fn find_present_family(
        &self,
        physical_device: vk::PhysicalDevice,
        family_count: u32,
    ) -> Result<Option<u32>> {
        for family in 0..family_count {
            let supported = unsafe {
                self.loader.get_physical_device_surface_support(
                    physical_device,
                    family,
                    self.handle,
                )?
            };
            if supported {
                return Ok(Some(family));
            }
        }
        Ok(None)
    }

    pub(crate) fn assign_present_family(&mut self, family: u32) {
        self.present_family = Some(family);
    }

    /// The presentation queue family chosen during device initialization.
    pub fn present_family(&self) -> Option<u32> {
        self.present_family
    }

    /// Post-device initialization: build the swapchain, render targets,
    /// per-image command buffers, and frame semaphores.
    pub(crate) fn initialize(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.state != SurfaceState::Uninitialized {
            return Err(GpuError::InvalidState(
                "surface is already initialized".to_string(),
            ));
        }

        let family = self.present_family.ok_or_else(|| {
            GpuError::InvalidState("no presentation queue family assigned".to_string())
        })?;
        self.present_queue = Some(unsafe { ctx.device().get_device_queue(family, 0) });
        self.swapchain_loader = Some(ash::khr::swapchain::Device::new(
            ctx.instance(),
            ctx.device(),
        ));

        let chain = self.build_chain(ctx, None)?;
        self.chain = Some(chain);
        self.state = SurfaceState::Ready;
        Ok(())
    }

    fn build_chain(&self, ctx: &DeviceContext, old: Option<vk::SwapchainKHR>) -> Result<Chain> {
        let device = ctx.device();
        let loader = self
            .swapchain_loader
            .as_ref()
            .expect("swapchain loader set before chain construction");

        let capabilities = unsafe {
            self.loader
                .get_physical_device_surface_capabilities(ctx.physical_device(), self.handle)?
        };
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(ctx.physical_device(), self.handle)?
        };
        let present_modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(ctx.physical_device(), self.handle)?
        };

        let format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, self.config.present_mode);
        let extent = choose_extent(&capabilities, self.config.width, self.config.height);

        let graphics_family = ctx.queue_family(Operation::Graphics).ok_or_else(|| {
            GpuError::InvalidState("surface presentation requires a graphics queue".to_string())
        })?;
        let present_family = self
            .present_family
            .expect("present family assigned before chain construction");

        let swapchain = unsafe {
            Swapchain::new(
                loader,
                self.handle,
                &capabilities,
                format,
                present_mode,
                extent,
                graphics_family,
                present_family,
                old,
            )?
        };

        let render_pass = RenderPass::new(device, format.format, self.config.depth_format)?;

        let targets = swapchain
            .images()
            .iter()
            .map(|&image| RenderTarget::new(ctx, &render_pass, image, extent))
            .collect::<Result<Vec<_>>>()?;

        let pool = ctx.default_pool().ok_or_else(|| {
            GpuError::InvalidState("surface initialization requires the default pool".to_string())
        })?;
        let command_buffers =
            unsafe { pool.allocate_many(device, swapchain.image_count() as u32, true)? };

        let image_available = unsafe { create_semaphore(device)? };
        let render_finished = unsafe { create_semaphore(device)? };

        Ok(Chain {
            swapchain,
            render_pass,
            targets,
            command_buffers,
            image_available,
            render_finished,
        })
    }

    fn chain(&self) -> &Chain {
        self.chain.as_ref().expect("surface is initialized")
    }

    /// Request the next presentable image.
    ///
    /// Blocks up to `timeout` (unbounded when `None`); the returned index
    /// selects the command buffer and render target for this frame.
    /// `Err(SwapchainOutOfDate)` means no image was acquired and the caller
    /// must [`Surface::recreate`].
    pub fn acquire(&mut self, timeout: Option<Duration>) -> Result<u32> {
        debug_assert!(
            !matches!(self.state, SurfaceState::Acquired(_)),
            "acquire called while an image is already held"
        );
        self.state.begin_acquire()?;

        let timeout_ns = timeout.map_or(u64::MAX, |t| {
            u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)
        });

        let loader = self.swapchain_loader.as_ref().expect("surface initialized");
        let chain = self.chain.as_ref().expect("surface initialized");

        let (index, suboptimal) = unsafe {
            chain
                .swapchain
                .acquire_next_image(loader, chain.image_available, timeout_ns)?
        };
        if suboptimal {
            tracing::debug!("acquired image {index} from a suboptimal swapchain");
        }

        self.state = SurfaceState::Acquired(index);
        Ok(index)
    }

    /// Submit the acquired image's command buffer and present it.
    ///
    /// The submit waits on image-available at the color-output stage and
    /// signals render-finished, which the present request waits on. Returns
    /// `false` when the presentation engine reports the chain stale — an
    /// advisory to [`Surface::recreate`], not a failure.
    pub fn present(&mut self, ctx: &DeviceContext) -> Result<bool> {
        debug_assert!(
            matches!(self.state, SurfaceState::Acquired(_)),
            "present called without a prior acquire"
        );
        let index = self.state.begin_present()?;

        let device = ctx.device();
        let queue = ctx
            .queue(Operation::Graphics)
            .expect("graphics queue exists for presenting surfaces")
            .queue;
        let present_queue = self.present_queue.expect("surface initialized");
        let loader = self.swapchain_loader.as_ref().expect("surface initialized");
        let chain = self.chain.as_ref().expect("surface initialized");

        let wait_semaphores = [chain.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [chain.render_finished];

        unsafe {
            crate::command::submit(
                device,
                queue,
                &[chain.command_buffers[index as usize]],
                &wait_semaphores,
                &wait_stages,
                &signal_semaphores,
                vk::Fence::null(),
            )?;
        }

        let clean = unsafe {
            chain
                .swapchain
                .present(loader, present_queue, index, &signal_semaphores)?
        };
        if !clean {
            tracing::debug!("present reported a stale swapchain");
        }

        // Keeps host and device observably in sync while validating.
        if ctx.validation_enabled() {
            ctx.wait_idle()?;
        }

        self.state = SurfaceState::Ready;
        Ok(clean)
    }

    /// Rebuild the swapchain, render targets, and command buffers at a new
    /// size.
    ///
    /// Old resources are destroyed only after the new chain exists. All
    /// command buffers must be re-recorded before the next present.
    pub fn recreate(&mut self, ctx: &DeviceContext, width: u32, height: u32) -> Result<()> {
        if self.state == SurfaceState::Uninitialized {
            return Err(GpuError::InvalidState(
                "recreate on an uninitialized surface".to_string(),
            ));
        }

        ctx.wait_idle()?;

        self.config.width = width;
        self.config.height = height;

        let old_handle = self.chain().swapchain.handle();
        let new_chain = self.build_chain(ctx, Some(old_handle))?;

        tracing::info!("swapchain recreated at {width}x{height}");

        let loader = self.swapchain_loader.as_ref().expect("surface initialized");
        if let Some(mut old) = self.chain.take() {
            unsafe { old.destroy(ctx, loader) };
        }
        self.chain = Some(new_chain);
        self.state = SurfaceState::Ready;
        Ok(())
    }

    /// The command buffer recorded for a swapchain image.
    pub fn command_buffer(&self, index: u32) -> vk::CommandBuffer {
        self.chain().command_buffers[index as usize]
    }

    /// The render target for a swapchain image.
    pub fn render_target(&self, index: u32) -> &RenderTarget {
        &self.chain().targets[index as usize]
    }

    /// The render pass all of this surface's targets share.
    pub fn render_pass(&self) -> &RenderPass {
        &self.chain().render_pass
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.chain().swapchain.extent()
    }

    /// Current swapchain color format.
    pub fn format(&self) -> vk::Format {
        self.chain().swapchain.format().format
    }

    /// Number of images in the chain.
    pub fn image_count(&self) -> usize {
        self.chain().swapchain.image_count()
    }

    /// Destroy the swapchain resources and the native surface.
    ///
    /// # Safety
    /// Must be called before the [`DeviceContext`] is dropped; the caller
    /// must ensure no frame is in flight (an idle wait is performed).
    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        let _ = ctx.wait_idle();

        if let Some(mut chain) = self.chain.take() {
            let loader = self.swapchain_loader.as_ref().expect("loader exists");
            chain.destroy(ctx, loader);
        }

        self.loader.destroy_surface(self.handle, None);
        self.handle = vk::SurfaceKHR::null();
        self.state = SurfaceState::Uninitialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_requires_ready() {
        assert!(SurfaceState::Ready.begin_acquire().is_ok());
        assert!(SurfaceState::Uninitialized.begin_acquire().is_err());
    }

    #[test]
    fn double_acquire_is_rejected() {
        assert!(SurfaceState::Acquired(0).begin_acquire().is_err());
    }

    #[test]
    fn present_requires_acquired_image() {
        assert_eq!(SurfaceState::Acquired(2).begin_present().unwrap(), 2);
        assert!(SurfaceState::Ready.begin_present().is_err());
        assert!(SurfaceState::Uninitialized.begin_present().is_err());
    }
}
