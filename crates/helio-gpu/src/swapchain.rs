//! Swapchain creation and the pure selection heuristics behind it.

use crate::error::{GpuError, Result};
use ash::vk;

/// Presentation modes a caller can request.
///
/// `Fifo` is the universal fallback every implementation must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    /// Queue-backed vsync; always available.
    Fifo,
    /// Triple-buffered low-latency presentation.
    Mailbox,
    /// Unthrottled presentation, may tear.
    Immediate,
}

impl PresentMode {
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Choose a surface format: prefer 32-bit sRGB, else the first offered.
pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or(GpuError::NoSurfaceFormat)
}

/// Choose a present mode: the requested one when offered, then falling back
/// through MAILBOX, IMMEDIATE, and finally FIFO (always supported).
pub(crate) fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: PresentMode,
) -> vk::PresentModeKHR {
    let preference = [
        requested.to_vk(),
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::IMMEDIATE,
    ];

    preference
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Choose the swapchain extent: the platform's fixed current extent when it
/// dictates one, otherwise the requested size clamped to capability bounds.
pub(crate) fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Choose the image count: at least three when the surface allows it,
/// clamped to the capability maximum when one is reported.
pub(crate) fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count.max(3);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// The presentable image chain.
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain sized to the surface.
    ///
    /// When presentation and graphics live on different families the images
    /// are shared concurrently between them; otherwise exclusive ownership
    /// avoids the sharing overhead.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn new(
        loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        graphics_family: u32,
        present_family: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let image_count = choose_image_count(capabilities);
        let queue_families = [graphics_family, present_family];

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        create_info = if graphics_family == present_family {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        };

        let handle = loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = loader.get_swapchain_images(handle)?;

        tracing::info!(
            "swapchain created: {} images, {:?}, {}x{}",
            images.len(),
            format.format,
            extent.width,
            extent.height,
        );

        Ok(Self {
            handle,
            images,
            format,
            extent,
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Request the next presentable image, signaling `semaphore` when the
    /// presentation engine releases it.
    ///
    /// Returns the image index plus a staleness hint (`true` when the chain
    /// is suboptimal for the surface).
    ///
    /// # Safety
    /// All handles must be valid.
    pub(crate) unsafe fn acquire_next_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        match loader.acquire_next_image(self.handle, timeout_ns, semaphore, vk::Fence::null()) {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            // No image was acquired; the chain must be recreated.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Queue a present request for `image_index`.
    ///
    /// Returns `true` on a clean present, `false` when the presentation
    /// engine reports the chain stale (advisory: recreate before the next
    /// frame).
    ///
    /// # Safety
    /// All handles must be valid.
    pub(crate) unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(!suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain handle.
    ///
    /// # Safety
    /// The chain must not be in use; image views derived from it must be
    /// destroyed by their owners first.
    pub(crate) unsafe fn destroy(&mut self, loader: &ash::khr::swapchain::Device) {
        loader.destroy_swapchain(self.handle, None);
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_prefers_bgra_srgb() {
        let fallback = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = choose_surface_format(&[fallback, preferred]).unwrap();
        assert_eq!(chosen.format, preferred.format);
    }

    #[test]
    fn format_falls_back_to_first() {
        let only = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[only]).unwrap();
        assert_eq!(chosen.format, only.format);
    }

    #[test]
    fn no_formats_is_an_error() {
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_honors_request() {
        let available = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(
            choose_present_mode(&available, PresentMode::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn present_mode_fallback_order() {
        // Requested mode missing: mailbox, then immediate, then fifo.
        let mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&mailbox, PresentMode::Immediate),
            vk::PresentModeKHR::MAILBOX
        );

        let immediate = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&immediate, PresentMode::Mailbox),
            vk::PresentModeKHR::IMMEDIATE
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, PresentMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn fixed_extent_wins() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };

        let chosen = choose_extent(&capabilities, 1920, 1080);
        assert_eq!((chosen.width, chosen.height), (1280, 720));
    }

    #[test]
    fn variable_extent_clamps_to_bounds() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 320,
                height: 240,
            },
            max_image_extent: vk::Extent2D {
                width: 1600,
                height: 900,
            },
            ..Default::default()
        };

        let chosen = choose_extent(&capabilities, 1920, 100);
        assert_eq!((chosen.width, chosen.height), (1600, 240));
    }

    #[test]
    fn image_count_is_at_least_three_when_unbounded() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn image_count_respects_bounds() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 2);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 4);
    }
}
