//! Descriptor pools, set layouts, and set allocation.
//!
//! A pool's capacity is fixed at construction: a total set count plus a
//! per-kind descriptor budget. The pool owns every layout and set it
//! produces; destroying it invalidates all of them, so any pipeline built
//! against one of its layouts must be destroyed first.

use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::features::ShaderStages;
use crate::texture::Texture;
use ash::vk;

/// Shader-visible binding types the pool partitions its capacity by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// One entry of an ordered binding list a layout is built from.
#[derive(Debug, Clone, Copy)]
pub struct LayoutBinding {
    pub binding: u32,
    pub stages: ShaderStages,
    pub kind: DescriptorKind,
}

/// Initial contents written into a freshly allocated set.
pub enum DescriptorWrite<'a> {
    UniformBuffer { binding: u32, buffer: &'a Buffer },
    StorageBuffer { binding: u32, buffer: &'a Buffer },
    CombinedImageSampler {
        binding: u32,
        texture: &'a Texture,
        sampler: vk::Sampler,
    },
    StorageImage { binding: u32, texture: &'a Texture },
}

/// Per-kind pool sizes from the declared capacities.
pub(crate) fn pool_sizes(capacities: &[(DescriptorKind, u32)]) -> Vec<vk::DescriptorPoolSize> {
    capacities
        .iter()
        .map(|&(kind, count)| {
            vk::DescriptorPoolSize::default()
                .ty(kind.to_vk())
                .descriptor_count(count)
        })
        .collect()
}

/// Fixed-capacity descriptor pool owning its layouts and sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    layouts: Vec<vk::DescriptorSetLayout>,
    max_sets: u32,
    allocated: u32,
}

impl DescriptorPool {
    /// Create a pool with room for `max_sets` sets drawing on the given
    /// per-kind descriptor budgets.
    pub fn new(
        device: &ash::Device,
        max_sets: u32,
        capacities: &[(DescriptorKind, u32)],
    ) -> Result<Self> {
        let sizes = pool_sizes(capacities);

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };

        Ok(Self {
            pool,
            layouts: Vec::new(),
            max_sets,
            allocated: 0,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Build a set layout from an ordered binding list and keep it in the
    /// pool; the returned index names it in later allocations.
    pub fn create_layout(
        &mut self,
        device: &ash::Device,
        bindings: &[LayoutBinding],
    ) -> Result<usize> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.kind.to_vk())
                    .descriptor_count(1)
                    .stage_flags(binding.stages.to_vk())
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

        self.layouts.push(layout);
        Ok(self.layouts.len() - 1)
    }

    /// The layout created at `index`.
    pub fn layout(&self, index: usize) -> vk::DescriptorSetLayout {
        self.layouts[index]
    }

    /// Allocate one set from a previously created layout and write its
    /// bindings immediately.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout_index: usize,
        writes: &[DescriptorWrite<'_>],
    ) -> Result<vk::DescriptorSet> {
        if self.allocated >= self.max_sets {
            return Err(GpuError::InvalidState(
                "descriptor pool set capacity exhausted".to_string(),
            ));
        }

        let layouts = [self.layouts[layout_index]];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let set = unsafe { device.allocate_descriptor_sets(&alloc_info)?[0] };
        self.allocated += 1;

        write_set(device, set, writes);
        Ok(set)
    }

    /// Allocate several sets over heterogeneous layouts in one call.
    pub fn allocate_many(
        &mut self,
        device: &ash::Device,
        requests: &[(usize, &[DescriptorWrite<'_>])],
    ) -> Result<Vec<vk::DescriptorSet>> {
        requests
            .iter()
            .map(|&(layout_index, writes)| self.allocate(device, layout_index, writes))
            .collect()
    }

    /// Sets handed out so far.
    pub fn allocated_sets(&self) -> u32 {
        self.allocated
    }

    /// Destroy the pool, its layouts, and every set allocated from it.
    ///
    /// # Safety
    /// The device must be valid; no pipeline built against these layouts
    /// and no set from this pool may still be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for layout in self.layouts.drain(..) {
            device.destroy_descriptor_set_layout(layout, None);
        }
        device.destroy_descriptor_pool(self.pool, None);
        self.pool = vk::DescriptorPool::null();
        self.allocated = 0;
    }
}

fn write_set(device: &ash::Device, set: vk::DescriptorSet, writes: &[DescriptorWrite<'_>]) {
    for write in writes {
        match *write {
            DescriptorWrite::UniformBuffer { binding, buffer } => {
                write_buffer(device, set, binding, buffer, DescriptorKind::UniformBuffer);
            }
            DescriptorWrite::StorageBuffer { binding, buffer } => {
                write_buffer(device, set, binding, buffer, DescriptorKind::StorageBuffer);
            }
            DescriptorWrite::CombinedImageSampler {
                binding,
                texture,
                sampler,
            } => {
                let image_info = vk::DescriptorImageInfo::default()
                    .image_view(texture.view())
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .sampler(sampler);

                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(&image_info));

                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorWrite::StorageImage { binding, texture } => {
                let image_info = vk::DescriptorImageInfo::default()
                    .image_view(texture.view())
                    .image_layout(vk::ImageLayout::GENERAL);

                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&image_info));

                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
        }
    }
}

fn write_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: &Buffer,
    kind: DescriptorKind,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer.handle())
        .offset(0)
        .range(buffer.size());

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(kind.to_vk())
        .buffer_info(std::slice::from_ref(&buffer_info));

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_exactly() {
        assert_eq!(
            DescriptorKind::UniformBuffer.to_vk(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            DescriptorKind::StorageBuffer.to_vk(),
            vk::DescriptorType::STORAGE_BUFFER
        );
        assert_eq!(
            DescriptorKind::CombinedImageSampler.to_vk(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            DescriptorKind::StorageImage.to_vk(),
            vk::DescriptorType::STORAGE_IMAGE
        );
    }

    #[test]
    fn capacities_partition_by_kind() {
        let sizes = pool_sizes(&[
            (DescriptorKind::UniformBuffer, 8),
            (DescriptorKind::CombinedImageSampler, 4),
        ]);

        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 8);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 4);
    }
}
