//! Device context: physical device selection, queue derivation, logical
//! device construction, and command pool access.

use crate::command::{CommandPool, PoolParams};
use crate::error::{GpuError, Result};
use crate::features::{self, DeviceFeatures, Operation, OperationRequest};
use crate::instance::{pick_best, score_device, Adapter, Instance};
use crate::surface::Surface;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;

/// What a [`DeviceContext`] is asked to provide.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Features the selected device must expose.
    pub features: DeviceFeatures,
    /// Operation categories to derive queues for, in declaration order.
    pub operations: Vec<OperationRequest>,
    /// Parameters for the default graphics command pool.
    pub default_pool: PoolParams,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            features: DeviceFeatures::default(),
            operations: vec![
                OperationRequest::required(Operation::Graphics),
                OperationRequest::required(Operation::Transfer),
            ],
            default_pool: PoolParams::recorded(),
        }
    }
}

/// A derived queue: family index plus the retrieved queue handle.
#[derive(Debug, Clone, Copy)]
pub struct QueueAssignment {
    pub family: u32,
    pub queue: vk::Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    operation: Operation,
    transient: bool,
}

/// First queue family, in declaration order, whose flags contain `required`.
pub(crate) fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    required: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_flags.contains(required))
        .map(|index| index as u32)
}

/// Order-preserving dedup of queue family indices.
///
/// Operations and surfaces frequently land on the same family; the logical
/// device must request each family once.
pub(crate) fn dedup_queue_families(families: &[u32]) -> Vec<u32> {
    let mut unique = Vec::with_capacity(families.len());
    for &family in families {
        if !unique.contains(&family) {
            unique.push(family);
        }
    }
    unique
}

/// Owns the selected physical device, the logical device, one queue per
/// requested operation category, and the command pools created from it.
///
/// Created after [`Instance`], destroyed before it. Destruction waits for
/// the device to idle and frees all owned command pools first. Every
/// resource created from a context must be destroyed before the context.
pub struct DeviceContext {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    queues: HashMap<Operation, QueueAssignment>,
    pools: Mutex<HashMap<PoolKey, CommandPool>>,
    default_pool: Option<CommandPool>,
    validation: bool,
}

impl DeviceContext {
    /// Select a physical device, derive queues, create the logical device,
    /// and initialize every attached surface against it.
    ///
    /// Surfaces must be created (against the instance) beforehand; their
    /// swapchains are built here, after the device exists — order matters.
    pub fn initialize(
        instance: &Instance,
        surfaces: &mut [&mut Surface],
        requirements: &DeviceRequirements,
    ) -> Result<Self> {
        let adapters = Adapter::enumerate(instance.handle())?;
        let extensions = features::device_extensions(&requirements.features, !surfaces.is_empty());

        let scores: Vec<u64> = adapters
            .iter()
            .map(|adapter| {
                score_device(
                    adapter.properties.device_type,
                    adapter.properties.limits.max_image_dimension2_d,
                    adapter.supports(&requirements.features, &extensions),
                )
            })
            .collect();

        for (adapter, &score) in adapters.iter().zip(&scores) {
            tracing::debug!("candidate {}: score {}", adapter.description(), score);
        }

        let adapter = &adapters[pick_best(&scores).ok_or(GpuError::NoSuitableDevice)?];
        tracing::info!("selected GPU: {}", adapter.description());

        // Derive one family per requested operation, in declaration order.
        let mut assignments: Vec<(Operation, u32)> = Vec::new();
        for request in &requirements.operations {
            let family = find_queue_family(&adapter.queue_families, request.operation.queue_flags());
            match family {
                Some(family) => {
                    tracing::debug!(
                        "operation {:?} -> queue family {}",
                        request.operation,
                        family
                    );
                    assignments.push((request.operation, family));
                }
                None if request.required => {
                    return Err(GpuError::NoCompatibleQueueFamily(request.operation));
                }
                None => {
                    tracing::debug!(
                        "optional operation {:?} has no compatible queue family",
                        request.operation
                    );
                }
            }
        }

        // Each surface independently searches for a presentation-capable
        // family on the selected device.
        for surface in surfaces.iter_mut() {
            let family = surface
                .find_present_family(adapter.handle, adapter.queue_families.len() as u32)?
                .ok_or(GpuError::NoPresentQueueFamily)?;
            surface.assign_present_family(family);
        }

        let mut requested_families: Vec<u32> =
            assignments.iter().map(|&(_, family)| family).collect();
        requested_families.extend(surfaces.iter().filter_map(|s| s.present_family()));
        let unique_families = dedup_queue_families(&requested_families);

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();
        let enabled_features = requirements.features.to_vk();

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&enabled_features);

        let device = unsafe {
            instance
                .handle()
                .create_device(adapter.handle, &device_create_info, None)?
        };

        let queues: HashMap<Operation, QueueAssignment> = assignments
            .iter()
            .map(|&(operation, family)| {
                let queue = unsafe { device.get_device_queue(family, 0) };
                (operation, QueueAssignment { family, queue })
            })
            .collect();

        let memory_properties = unsafe {
            instance
                .handle()
                .get_physical_device_memory_properties(adapter.handle)
        };

        let mut ctx = Self {
            instance: instance.handle().clone(),
            physical_device: adapter.handle,
            properties: adapter.properties,
            memory_properties,
            device,
            queues,
            pools: Mutex::new(HashMap::new()),
            default_pool: None,
            validation: instance.validation_enabled(),
        };

        // Default pool for graphics work, kept for convenience access.
        if ctx.queues.contains_key(&Operation::Graphics) {
            let pool = ctx.command_pool(Operation::Graphics, requirements.default_pool)?;
            ctx.default_pool = Some(pool);
        }

        // Device before surfaces: swapchains need the logical device.
        for surface in surfaces.iter_mut() {
            surface.initialize(&ctx)?;
        }

        Ok(ctx)
    }

    /// Get the logical device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the instance the device was created from.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the selected physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the selected device's properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Get the selected device's memory type table.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// The queue derived for an operation, if one was requested and found.
    pub fn queue(&self, operation: Operation) -> Option<QueueAssignment> {
        self.queues.get(&operation).copied()
    }

    /// The queue family derived for an operation.
    pub fn queue_family(&self, operation: Operation) -> Option<u32> {
        self.queue(operation).map(|assignment| assignment.family)
    }

    /// The default graphics command pool, when graphics was requested.
    pub fn default_pool(&self) -> Option<CommandPool> {
        self.default_pool
    }

    /// Whether validation was enabled on the owning instance.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    /// Get or create the command pool for `(operation, params.transient)`.
    ///
    /// Idempotent per key: a second call with the same transience hint
    /// returns the existing pool; its reset mode must match.
    pub fn command_pool(&self, operation: Operation, params: PoolParams) -> Result<CommandPool> {
        let key = PoolKey {
            operation,
            transient: params.transient,
        };

        let mut pools = self.pools.lock();
        if let Some(existing) = pools.get(&key) {
            debug_assert_eq!(
                existing.params().reset_command_buffers,
                params.reset_command_buffers,
                "existing pool for {operation:?} has a different reset mode"
            );
            return Ok(*existing);
        }

        let assignment = self.queue(operation).ok_or_else(|| {
            GpuError::InvalidState(format!("no queue was derived for operation {operation:?}"))
        })?;

        let pool = unsafe {
            CommandPool::new(&self.device, assignment.family, assignment.queue, params)?
        };
        tracing::debug!(
            "created {} command pool on queue family {}",
            if params.transient { "transient" } else { "recorded" },
            assignment.family
        );

        pools.insert(key, pool);
        Ok(pool)
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Owned pools go before the device.
            for pool in self.pools.lock().values() {
                pool.destroy(&self.device);
            }

            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn first_matching_family_wins() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
        ];

        assert_eq!(find_queue_family(&families, vk::QueueFlags::TRANSFER), Some(0));
        assert_eq!(find_queue_family(&families, vk::QueueFlags::GRAPHICS), Some(1));
        assert_eq!(find_queue_family(&families, vk::QueueFlags::COMPUTE), Some(1));
    }

    #[test]
    fn missing_capability_finds_nothing() {
        let families = [family(vk::QueueFlags::TRANSFER)];
        assert_eq!(find_queue_family(&families, vk::QueueFlags::GRAPHICS), None);
    }

    #[test]
    fn combined_family_dedups_to_one_queue() {
        // One family serving graphics, transfer, and presentation must be
        // requested exactly once from the logical device.
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];

        let graphics = find_queue_family(&families, vk::QueueFlags::GRAPHICS).unwrap();
        let transfer = find_queue_family(&families, vk::QueueFlags::TRANSFER).unwrap();
        let present = 0; // combined family also presents

        let unique = dedup_queue_families(&[graphics, transfer, present]);
        assert_eq!(unique, vec![0]);
    }

    #[test]
    fn dedup_preserves_declaration_order() {
        assert_eq!(dedup_queue_families(&[2, 0, 2, 1, 0]), vec![2, 0, 1]);
        assert_eq!(dedup_queue_families(&[]), Vec::<u32>::new());
    }
}
