//! Pipeline layout construction and render/compute pipelines.
//!
//! Shader bytecode arrives as opaque compiled blobs with a stage tag and
//! entry point; fixed-function state is a declarative record. Pipelines own
//! their layout and are immutable once created.

use crate::error::{GpuError, Result};
use crate::features::{ShaderStage, ShaderStages};
use crate::render_target::RenderPass;
use ash::vk;
use std::ffi::CString;

/// A compiled shader blob plus its stage and entry point.
pub struct ShaderSource {
    pub code: Vec<u32>,
    pub stage: ShaderStage,
    pub entry: CString,
}

impl ShaderSource {
    pub fn new(code: Vec<u32>, stage: ShaderStage) -> Self {
        Self {
            code,
            stage,
            entry: CString::new("main").expect("static entry name"),
        }
    }

    pub fn with_entry(mut self, entry: &str) -> Self {
        self.entry = CString::new(entry).unwrap_or_default();
        self
    }
}

/// A push-constant range visible to the given stages.
#[derive(Debug, Clone, Copy)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    pub(crate) fn to_vk(self) -> vk::PushConstantRange {
        vk::PushConstantRange::default()
            .stage_flags(self.stages.to_vk())
            .offset(self.offset)
            .size(self.size)
    }
}

/// One vertex attribute within a binding.
#[derive(Debug, Clone, Copy)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// One vertex buffer binding and its attributes.
#[derive(Debug, Clone)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Vertex input description consumed by render pipelines.
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    pub bindings: Vec<VertexBinding>,
}

impl VertexLayout {
    pub(crate) fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.bindings
            .iter()
            .map(|binding| {
                vk::VertexInputBindingDescription::default()
                    .binding(binding.binding)
                    .stride(binding.stride)
                    .input_rate(vk::VertexInputRate::VERTEX)
            })
            .collect()
    }

    pub(crate) fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.bindings
            .iter()
            .flat_map(|binding| {
                binding.attributes.iter().map(|attribute| {
                    vk::VertexInputAttributeDescription::default()
                        .location(attribute.location)
                        .binding(binding.binding)
                        .format(attribute.format)
                        .offset(attribute.offset)
                })
            })
            .collect()
    }
}

/// Build a pipeline layout from set layouts and push-constant ranges.
pub fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let ranges: Vec<vk::PushConstantRange> = push_constant_ranges
        .iter()
        .map(|range| range.to_vk())
        .collect();

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(&ranges);

    let layout = unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?
    };
    Ok(layout)
}

/// Declarative fixed-function state for a render pipeline.
pub struct RenderPipelineDesc {
    pub vertex_shader: ShaderSource,
    pub fragment_shader: ShaderSource,
    pub vertex_layout: VertexLayout,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub blend_enable: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    /// Viewport and scissor set at draw time instead of baked in.
    pub dynamic_viewport: bool,
    /// Fixed viewport size, used when `dynamic_viewport` is off.
    pub viewport_extent: vk::Extent2D,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

impl RenderPipelineDesc {
    /// A new description with conventional defaults for the rest of the
    /// fixed-function state.
    pub fn new(vertex_shader: ShaderSource, fragment_shader: ShaderSource) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_layout: VertexLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            blend_enable: false,
            depth_test: true,
            depth_write: true,
            dynamic_viewport: true,
            viewport_extent: vk::Extent2D::default(),
            set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
        }
    }
}

/// A graphics pipeline and its layout.
pub struct RenderPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl RenderPipeline {
    /// Create a render pipeline against a surface-compatible render pass.
    pub fn new(
        device: &ash::Device,
        render_pass: &RenderPass,
        desc: &RenderPipelineDesc,
    ) -> Result<Self> {
        debug_assert!(desc.vertex_shader.stage == ShaderStage::Vertex);
        debug_assert!(desc.fragment_shader.stage == ShaderStage::Fragment);

        let vert_module = create_shader_module(device, &desc.vertex_shader.code)?;
        let frag_module = match create_shader_module(device, &desc.fragment_shader.code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(desc.vertex_shader.stage.to_vk())
                .module(vert_module)
                .name(&desc.vertex_shader.entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(desc.fragment_shader.stage.to_vk())
                .module(frag_module)
                .name(&desc.fragment_shader.entry),
        ];

        let binding_descriptions = desc.vertex_layout.binding_descriptions();
        let attribute_descriptions = desc.vertex_layout.attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        let viewports = [vk::Viewport::default()
            .width(desc.viewport_extent.width as f32)
            .height(desc.viewport_extent.height as f32)
            .max_depth(1.0)];
        let scissors = [vk::Rect2D::default().extent(desc.viewport_extent)];

        let viewport_state = if desc.dynamic_viewport {
            vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1)
        } else {
            vk::PipelineViewportStateCreateInfo::default()
                .viewports(&viewports)
                .scissors(&scissors)
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachment = if desc.blend_enable {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(std::slice::from_ref(&blend_attachment));

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = if desc.dynamic_viewport {
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states)
        } else {
            vk::PipelineDynamicStateCreateInfo::default()
        };

        let layout = match create_pipeline_layout(
            device,
            &desc.set_layouts,
            &desc.push_constant_ranges,
        ) {
            Ok(layout) => layout,
            Err(e) => {
                unsafe {
                    device.destroy_shader_module(vert_module, None);
                    device.destroy_shader_module(frag_module, None);
                }
                return Err(e);
            }
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        }

        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}

/// A compute pipeline and its layout.
pub struct ComputePipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Create a compute pipeline from a single compute shader blob.
    pub fn new(
        device: &ash::Device,
        shader: &ShaderSource,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[PushConstantRange],
    ) -> Result<Self> {
        debug_assert!(shader.stage == ShaderStage::Compute);

        let module = create_shader_module(device, &shader.code)?;

        let layout = match create_pipeline_layout(device, set_layouts, push_constant_ranges) {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(shader.stage.to_vk())
            .module(module)
            .name(&shader.entry);

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        unsafe { device.destroy_shader_module(module, None) };

        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}

fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
    let module = unsafe {
        device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::PipelineCreation(format!("shader module: {e}")))?
    };
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_range_maps_exactly() {
        let range = PushConstantRange {
            stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
            offset: 16,
            size: 64,
        };
        let vk_range = range.to_vk();
        assert_eq!(
            vk_range.stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(vk_range.offset, 16);
        assert_eq!(vk_range.size, 64);
    }

    #[test]
    fn vertex_layout_flattens_attributes() {
        let layout = VertexLayout {
            bindings: vec![VertexBinding {
                binding: 0,
                stride: 32,
                attributes: vec![
                    VertexAttribute {
                        location: 0,
                        format: vk::Format::R32G32B32_SFLOAT,
                        offset: 0,
                    },
                    VertexAttribute {
                        location: 1,
                        format: vk::Format::R32G32_SFLOAT,
                        offset: 12,
                    },
                ],
            }],
        };

        let bindings = layout.binding_descriptions();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 32);

        let attributes = layout.attribute_descriptions();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].binding, 0);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 12);
    }

    #[test]
    fn shader_entry_defaults_to_main() {
        let source = ShaderSource::new(vec![0x0723_0203], ShaderStage::Vertex);
        assert_eq!(source.entry.as_c_str(), c"main");

        let custom = ShaderSource::new(vec![], ShaderStage::Compute).with_entry("cs_main");
        assert_eq!(custom.entry.as_c_str(), c"cs_main");
    }
}
