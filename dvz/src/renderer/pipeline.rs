// Graphics/Compute pipeline objects (3.4, 3.6): accumulate shader
// modules, vertex bindings/attributes and fixed-function state as
// `Set`/`AttachShader` requests arrive, then build the real
// VkPipeline lazily once everything required is present.
//
// Authored fresh against plain ash 0.37 builder calls; the builder
// idiom itself is grounded on `device.rs`'s `*CreateInfo::builder()`
// usage throughout.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;

use crate::device::Device;
use crate::error::{DvzError, Result};
use crate::renderer::slots::{DescriptorsVk, SlotBindingValue, SlotsVk};

#[derive(Debug, Clone, Copy)]
pub struct VertexBindingDesc {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Debug, Clone, Copy)]
pub struct VertexAttrDesc {
    pub binding: u32,
    pub location: u32,
    pub offset: u32,
    pub format: vk::Format,
}

#[derive(Debug, Clone, Copy)]
pub struct FixedState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub blend_enable: bool,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl Default for FixedState {
    fn default() -> Self {
        FixedState {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            blend_enable: false,
            depth_test: false,
            depth_write: false,
        }
    }
}

/// A Graphics pipeline under construction/built. Shader modules and
/// fixed state accumulate via `Set`/`AttachShader` requests (3.6);
/// the actual `VkPipeline` is deferred until `pipeline_for` since it
/// needs a compatible renderpass, which only exists once a canvas
/// targets this pipeline from a recorder.
pub struct GraphicsVk {
    pub slots_id: Option<crate::idmap::Id>,
    shader_modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    vertex_bindings: Vec<VertexBindingDesc>,
    vertex_attrs: Vec<VertexAttrDesc>,
    state: FixedState,
    pipeline_layout: Option<vk::PipelineLayout>,
    built: HashMap<vk::RenderPass, vk::Pipeline>,
    /// This pipeline's own descriptor sets, one per in-flight image.
    /// Built lazily the first time a `bind` request targets this
    /// pipeline, since that's the first point the renderer knows how
    /// many images it needs (3.6: a `Bind` request addresses the
    /// pipeline directly rather than a separate Descriptors object).
    descriptors: Option<DescriptorsVk>,
}

impl GraphicsVk {
    pub fn new() -> Self {
        GraphicsVk {
            slots_id: None,
            shader_modules: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attrs: Vec::new(),
            state: FixedState::default(),
            pipeline_layout: None,
            built: HashMap::new(),
            descriptors: None,
        }
    }

    pub fn attach_shader(&mut self, stage: vk::ShaderStageFlags, module: vk::ShaderModule) {
        self.shader_modules.push((stage, module));
    }

    pub fn add_vertex_binding(&mut self, binding: VertexBindingDesc) {
        self.vertex_bindings.push(binding);
    }

    pub fn add_vertex_attr(&mut self, attr: VertexAttrDesc) {
        self.vertex_attrs.push(attr);
    }

    pub fn set_state(&mut self, state: FixedState) {
        self.state = state;
    }

    /// Checks 4.5's stride invariant: the attributes assigned to a
    /// binding must not overrun that binding's declared stride.
    pub fn check_vertex_strides(&self) -> Result<()> {
        for binding in &self.vertex_bindings {
            let used: u32 = self
                .vertex_attrs
                .iter()
                .filter(|a| a.binding == binding.binding)
                .map(|a| attr_size(a.format))
                .sum();
            if used > binding.stride {
                return Err(DvzError::InvalidStride);
            }
        }
        Ok(())
    }

    /// True once shader modules and a Slots layout have both been
    /// attached (3.6: "created once all shaders are present").
    pub fn is_ready(&self) -> bool {
        !self.shader_modules.is_empty() && self.slots_id.is_some()
    }

    fn ensure_layout(&mut self, dev: &Device, slots: &SlotsVk) -> Result<vk::PipelineLayout> {
        if let Some(layout) = self.pipeline_layout {
            return Ok(layout);
        }
        let set_layouts = [slots.layout];
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&slots.push_constant_ranges);
        let layout = unsafe {
            dev.dev
                .create_pipeline_layout(&info, None)
                .map_err(|_| DvzError::ResourceExhausted("pipeline layout creation".to_string()))?
        };
        self.pipeline_layout = Some(layout);
        Ok(layout)
    }

    /// Builds (or returns the cached) `VkPipeline` compatible with
    /// `renderpass`/`subpass`.
    pub fn pipeline_for(
        &mut self,
        dev: &Device,
        slots: &SlotsVk,
        renderpass: vk::RenderPass,
        subpass: u32,
    ) -> Result<vk::Pipeline> {
        if let Some(p) = self.built.get(&renderpass) {
            return Ok(*p);
        }
        if !self.is_ready() {
            return Err(DvzError::Other(
                "graphics pipeline missing shaders/slots".to_string(),
            ));
        }

        let layout = self.ensure_layout(dev, slots)?;
        let entry = CString::new("main").unwrap();

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = self
            .shader_modules
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(*stage)
                    .module(*module)
                    .name(&entry)
                    .build()
            })
            .collect();

        let binding_descs: Vec<vk::VertexInputBindingDescription> = self
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: b.input_rate,
            })
            .collect();
        let attr_descs: Vec<vk::VertexInputAttributeDescription> = self
            .vertex_attrs
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                binding: a.binding,
                location: a.location,
                offset: a.offset,
                format: a.format,
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descs)
            .vertex_attribute_descriptions(&attr_descs);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.state.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(self.state.polygon_mode)
            .cull_mode(self.state.cull_mode)
            .front_face(self.state.front_face)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.state.depth_test)
            .depth_write_enable(self.state.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(self.state.blend_enable)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build();
        let blend_attachments = [blend_attachment];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(renderpass)
            .subpass(subpass)
            .build();

        let pipeline = unsafe {
            dev.dev
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, _)| DvzError::ResourceExhausted("graphics pipeline creation".to_string()))?[0]
        };

        self.built.insert(renderpass, pipeline);
        Ok(pipeline)
    }

    /// Writes `value` into `slot_idx` of this pipeline's descriptor
    /// sets, lazily allocating them against `slots`/`image_count` on
    /// first use.
    pub fn bind(
        &mut self,
        dev: &Device,
        slots: &SlotsVk,
        image_count: u32,
        slot_idx: u32,
        value: SlotBindingValue,
    ) -> Result<()> {
        if self.descriptors.is_none() {
            self.descriptors = Some(DescriptorsVk::new(dev, slots, image_count)?);
        }
        self.descriptors
            .as_mut()
            .unwrap()
            .bind(dev, slots, slot_idx, value)
    }

    /// The descriptor set to bind for image `image_idx`, if any binds
    /// have happened yet.
    pub fn descriptor_set(&self, image_idx: usize) -> Option<vk::DescriptorSet> {
        self.descriptors.as_ref().and_then(|d| d.sets.get(image_idx).copied())
    }

    pub fn pipeline_layout(&self) -> Option<vk::PipelineLayout> {
        self.pipeline_layout
    }

    pub fn destroy(&mut self, dev: &Device) {
        unsafe {
            for (_, p) in self.built.drain() {
                dev.dev.destroy_pipeline(p, None);
            }
            if let Some(layout) = self.pipeline_layout.take() {
                dev.dev.destroy_pipeline_layout(layout, None);
            }
            for (_, module) in self.shader_modules.drain(..) {
                dev.dev.destroy_shader_module(module, None);
            }
        }
        if let Some(mut d) = self.descriptors.take() {
            d.destroy(dev);
        }
    }
}

impl Default for GraphicsVk {
    fn default() -> Self {
        Self::new()
    }
}

fn attr_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R32_UINT | vk::Format::R32_SINT => 4,
        vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_UINT => 4,
        _ => 16,
    }
}

/// A Compute pipeline: a single shader stage plus a Slots layout.
/// Built eagerly once both are present since compute pipelines don't
/// need a renderpass.
pub struct ComputeVk {
    pub slots_id: Option<crate::idmap::Id>,
    shader_module: Option<vk::ShaderModule>,
    pipeline_layout: Option<vk::PipelineLayout>,
    pipeline: Option<vk::Pipeline>,
    descriptors: Option<DescriptorsVk>,
}

impl ComputeVk {
    pub fn new() -> Self {
        ComputeVk {
            slots_id: None,
            shader_module: None,
            pipeline_layout: None,
            pipeline: None,
            descriptors: None,
        }
    }

    pub fn attach_shader(&mut self, module: vk::ShaderModule) {
        self.shader_module = Some(module);
    }

    pub fn is_ready(&self) -> bool {
        self.shader_module.is_some() && self.slots_id.is_some()
    }

    pub fn pipeline(&mut self, dev: &Device, slots: &SlotsVk) -> Result<vk::Pipeline> {
        if let Some(p) = self.pipeline {
            return Ok(p);
        }
        if !self.is_ready() {
            return Err(DvzError::Other(
                "compute pipeline missing shader/slots".to_string(),
            ));
        }

        let set_layouts = [slots.layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&slots.push_constant_ranges);
        let layout = unsafe {
            dev.dev
                .create_pipeline_layout(&layout_info, None)
                .map_err(|_| DvzError::ResourceExhausted("compute layout creation".to_string()))?
        };
        self.pipeline_layout = Some(layout);

        let entry = CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader_module.unwrap())
            .name(&entry)
            .build();
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let pipeline = unsafe {
            dev.dev
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, _)| DvzError::ResourceExhausted("compute pipeline creation".to_string()))?[0]
        };
        self.pipeline = Some(pipeline);
        Ok(pipeline)
    }

    pub fn bind(
        &mut self,
        dev: &Device,
        slots: &SlotsVk,
        image_count: u32,
        slot_idx: u32,
        value: SlotBindingValue,
    ) -> Result<()> {
        if self.descriptors.is_none() {
            self.descriptors = Some(DescriptorsVk::new(dev, slots, image_count)?);
        }
        self.descriptors
            .as_mut()
            .unwrap()
            .bind(dev, slots, slot_idx, value)
    }

    pub fn descriptor_set(&self, image_idx: usize) -> Option<vk::DescriptorSet> {
        self.descriptors.as_ref().and_then(|d| d.sets.get(image_idx).copied())
    }

    pub fn pipeline_layout(&self) -> Option<vk::PipelineLayout> {
        self.pipeline_layout
    }

    pub fn destroy(&mut self, dev: &Device) {
        unsafe {
            if let Some(p) = self.pipeline.take() {
                dev.dev.destroy_pipeline(p, None);
            }
            if let Some(layout) = self.pipeline_layout.take() {
                dev.dev.destroy_pipeline_layout(layout, None);
            }
            if let Some(module) = self.shader_module.take() {
                dev.dev.destroy_shader_module(module, None);
            }
        }
        if let Some(mut d) = self.descriptors.take() {
            d.destroy(dev);
        }
    }
}

impl Default for ComputeVk {
    fn default() -> Self {
        Self::new()
    }
}
