//! Closed sets of device features, operation categories, and shader stages.
//!
//! These replace direct use of the raw API's flag soup at the crate boundary:
//! callers request work in terms of these types, and each maps onto the
//! corresponding `vk` value in exactly one place.

use ash::vk;
use std::ffi::CStr;

/// Operation categories a queue can be requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Graphics,
    Transfer,
    Compute,
}

impl Operation {
    /// The queue capability flag a family must expose to serve this operation.
    pub fn queue_flags(self) -> vk::QueueFlags {
        match self {
            Self::Graphics => vk::QueueFlags::GRAPHICS,
            Self::Transfer => vk::QueueFlags::TRANSFER,
            Self::Compute => vk::QueueFlags::COMPUTE,
        }
    }
}

/// A requested operation and whether initialization must fail without it.
#[derive(Debug, Clone, Copy)]
pub struct OperationRequest {
    pub operation: Operation,
    pub required: bool,
}

impl OperationRequest {
    /// Request an operation that initialization cannot proceed without.
    pub fn required(operation: Operation) -> Self {
        Self {
            operation,
            required: true,
        }
    }

    /// Request an operation that is used when available.
    pub fn optional(operation: Operation) -> Self {
        Self {
            operation,
            required: false,
        }
    }
}

/// Device features the layer knows how to request.
///
/// A device missing any requested feature scores zero during selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
    pub geometry_shader: bool,
    pub sample_rate_shading: bool,
    pub wide_lines: bool,
}

impl DeviceFeatures {
    /// Check that every requested feature is present in `available`.
    pub fn supported_by(&self, available: &vk::PhysicalDeviceFeatures) -> bool {
        let ok = |wanted: bool, present: vk::Bool32| !wanted || present == vk::TRUE;

        ok(self.sampler_anisotropy, available.sampler_anisotropy)
            && ok(self.fill_mode_non_solid, available.fill_mode_non_solid)
            && ok(self.geometry_shader, available.geometry_shader)
            && ok(self.sample_rate_shading, available.sample_rate_shading)
            && ok(self.wide_lines, available.wide_lines)
    }

    /// Build the feature struct passed to logical device creation.
    pub fn to_vk(&self) -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(self.sampler_anisotropy)
            .fill_mode_non_solid(self.fill_mode_non_solid)
            .geometry_shader(self.geometry_shader)
            .sample_rate_shading(self.sample_rate_shading)
            .wide_lines(self.wide_lines)
    }
}

/// Device extensions implied by a feature set and the need to present.
///
/// Pure mapping: the features in the closed set above are all core, so today
/// the only conditional entry is the swapchain extension, required exactly
/// when at least one surface is attached.
pub fn device_extensions(
    _features: &DeviceFeatures,
    needs_presentation: bool,
) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if needs_presentation {
        extensions.push(ash::khr::swapchain::NAME);
    }
    extensions
}

bitflags::bitflags! {
    /// Shader stages a binding or push-constant range is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

impl ShaderStages {
    /// Map onto the raw API stage mask.
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        let mut flags = vk::ShaderStageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(Self::FRAGMENT) {
            flags |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(Self::COMPUTE) {
            flags |= vk::ShaderStageFlags::COMPUTE;
        }
        flags
    }
}

/// Execution stage tag carried by a compiled shader blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_supported_when_available() {
        let requested = DeviceFeatures {
            sampler_anisotropy: true,
            ..Default::default()
        };
        let available = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        assert!(requested.supported_by(&available));
    }

    #[test]
    fn missing_feature_is_unsupported() {
        let requested = DeviceFeatures {
            geometry_shader: true,
            ..Default::default()
        };
        let available = vk::PhysicalDeviceFeatures::default();
        assert!(!requested.supported_by(&available));
    }

    #[test]
    fn unrequested_features_do_not_matter() {
        let requested = DeviceFeatures::default();
        let available = vk::PhysicalDeviceFeatures::default();
        assert!(requested.supported_by(&available));
    }

    #[test]
    fn swapchain_extension_follows_presentation() {
        let features = DeviceFeatures::default();
        assert!(device_extensions(&features, false).is_empty());
        assert_eq!(
            device_extensions(&features, true),
            vec![ash::khr::swapchain::NAME]
        );
    }

    #[test]
    fn shader_stage_mask_maps_exactly() {
        let stages = ShaderStages::VERTEX | ShaderStages::FRAGMENT;
        assert_eq!(
            stages.to_vk(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            ShaderStages::COMPUTE.to_vk(),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn operation_queue_flags() {
        assert_eq!(
            Operation::Graphics.queue_flags(),
            vk::QueueFlags::GRAPHICS
        );
        assert_eq!(
            Operation::Transfer.queue_flags(),
            vk::QueueFlags::TRANSFER
        );
        assert_eq!(Operation::Compute.queue_flags(), vk::QueueFlags::COMPUTE);
    }
}
