//! Vulkan instance creation and physical device scoring.

use crate::error::{GpuError, Result};
use crate::features::DeviceFeatures;
use ash::vk;
use std::collections::HashSet;
use std::ffi::{CStr, CString};

/// Required instance extensions for windowed rendering.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    let extensions = vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ];

    extensions
}

/// Validation layers to request when validation is enabled.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x1002 => "AMD",
        0x10DE => "NVIDIA",
        0x13B5 => "ARM",
        0x5143 => "Qualcomm",
        0x8086 => "Intel",
        0x106B => "Apple",
        _ => "unknown",
    }
}

/// Process-wide handle to the graphics API.
///
/// Created once, destroyed last: every other object in this crate is derived
/// from an `Instance` and must be dropped before it.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    validation: bool,
}

/// Builder for creating an [`Instance`].
pub struct InstanceBuilder {
    app_name: String,
    validation: bool,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            app_name: "helio".to_string(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl InstanceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    /// Build the instance.
    pub fn build(self) -> Result<Instance> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::InvalidState(format!("failed to load Vulkan: {e}")))?;

        let app_name = CString::new(self.app_name).unwrap_or_default();
        let engine_name = c"helio";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let extension_names: Vec<*const i8> = required_instance_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let layers = if self.validation {
            validation_layers()
        } else {
            vec![]
        };

        // Warn about requested layers the loader does not know.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        for layer in &layers {
            let found = available_layers.iter().any(|props| {
                (unsafe { CStr::from_ptr(props.layer_name.as_ptr()) }) == *layer
            });
            if !found {
                tracing::warn!("validation layer {:?} not available", layer);
            }
        }

        let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        let handle = unsafe { entry.create_instance(&create_info, None)? };

        Ok(Instance {
            entry,
            handle,
            validation: self.validation,
        })
    }
}

impl Instance {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the raw instance handle.
    pub fn handle(&self) -> &ash::Instance {
        &self.handle
    }

    /// Whether validation was enabled at creation.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.handle.destroy_instance(None);
        }
    }
}

/// Everything about a candidate device that selection looks at.
pub(crate) struct Adapter {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: HashSet<String>,
}

impl Adapter {
    /// Query selection-relevant data for every physical device.
    pub fn enumerate(instance: &ash::Instance) -> Result<Vec<Self>> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        let adapters = devices
            .into_iter()
            .map(|handle| {
                let properties = unsafe { instance.get_physical_device_properties(handle) };
                let features = unsafe { instance.get_physical_device_features(handle) };
                let queue_families = unsafe {
                    instance.get_physical_device_queue_family_properties(handle)
                };
                let extensions = unsafe {
                    instance
                        .enumerate_device_extension_properties(handle)
                        .unwrap_or_default()
                }
                .iter()
                .filter_map(|ext| {
                    unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                        .to_str()
                        .ok()
                        .map(String::from)
                })
                .collect();

                Self {
                    handle,
                    properties,
                    features,
                    queue_families,
                    extensions,
                }
            })
            .collect();

        Ok(adapters)
    }

    /// Whether the adapter supports every requested feature and extension.
    pub fn supports(&self, features: &DeviceFeatures, extensions: &[&CStr]) -> bool {
        features.supported_by(&self.features)
            && extensions.iter().all(|ext| {
                ext.to_str()
                    .is_ok_and(|name| self.extensions.contains(name))
            })
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy()
            .into_owned()
    }

    pub fn description(&self) -> String {
        format!(
            "{} [{}]",
            self.name(),
            vendor_name(self.properties.vendor_id)
        )
    }
}

/// Score a candidate device.
///
/// Zero means unusable: a device missing any required feature or extension
/// never scores above a device that has them all. Among usable devices,
/// discrete GPUs outrank integrated ones, and ties break on the maximum 2D
/// image dimension (monotonic capability term).
pub(crate) fn score_device(
    device_type: vk::PhysicalDeviceType,
    max_image_dimension_2d: u32,
    requirements_met: bool,
) -> u64 {
    if !requirements_met {
        return 0;
    }

    let class_bonus: u64 = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1 << 40,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1 << 32,
        _ => 0,
    };

    class_bonus + u64::from(max_image_dimension_2d)
}

/// Index of the highest-scoring device, if any scored above zero.
pub(crate) fn pick_best(scores: &[u64]) -> Option<usize> {
    let (index, &best) = scores
        .iter()
        .enumerate()
        .max_by_key(|(_, &score)| score)?;

    (best > 0).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmet_requirements_score_zero() {
        assert_eq!(
            score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 16384, false),
            0
        );
    }

    #[test]
    fn discrete_outranks_integrated() {
        let discrete = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, true);
        let integrated = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 16384, true);
        assert!(discrete > integrated);
    }

    #[test]
    fn image_dimension_breaks_ties() {
        let small = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, true);
        let large = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 16384, true);
        assert!(large > small);
    }

    #[test]
    fn other_classes_get_no_bonus() {
        let cpu = score_device(vk::PhysicalDeviceType::CPU, 4096, true);
        assert_eq!(cpu, 4096);
    }

    #[test]
    fn best_pick_skips_unusable_devices() {
        let discrete_unmet = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 16384, false);
        let integrated_met = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 4096, true);
        assert_eq!(pick_best(&[discrete_unmet, integrated_met]), Some(1));
    }

    #[test]
    fn all_zero_scores_pick_nothing() {
        assert_eq!(pick_best(&[0, 0, 0]), None);
        assert_eq!(pick_best(&[]), None);
    }
}
