// Full-screen graphics operation
//
// Draws one triangle covering the target (the vertex shader generates it from
// gl_VertexIndex) into every output image as a color attachment. Input images
// are sampled through the fragment shader's samplers in connection order.

use anyhow::{Context, Result};
use ash::vk;

use super::ShaderBindings;
use crate::backend::{pipeline, shader, VulkanDevice};
use crate::graph::{CompileContext, Direction, LayoutContract, Operation, RecordContext, Resource};
use crate::reflection::{ReflectionError, ShaderReflection, ShaderStage};
use crate::uniform::UniformSet;

pub struct RenderOperation {
    name: String,
    vertex: Vec<u32>,
    fragment: Vec<u32>,
    bindings: ShaderBindings,
    clear: Option<[f32; 4]>,

    modules: Vec<vk::ShaderModule>,
    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    attachment_count: usize,
}

impl RenderOperation {
    pub fn new(name: impl Into<String>, vertex: Vec<u32>, fragment: Vec<u32>) -> Result<Self, ReflectionError> {
        let name = name.into();
        let bindings = reflect(&name, &vertex, &fragment)?;
        Ok(Self {
            name,
            vertex,
            fragment,
            bindings,
            clear: None,
            modules: Vec::new(),
            render_pass: vk::RenderPass::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
            attachment_count: 0,
        })
    }

    /// Clear the targets at the start of the pass instead of loading them.
    pub fn with_clear(mut self, color: [f32; 4]) -> Self {
        self.clear = Some(color);
        self
    }

    pub fn reflection(&self, stage: ShaderStage) -> Option<&ShaderReflection> {
        self.bindings.reflection(stage)
    }

    fn entry_point(&self, stage: ShaderStage) -> &str {
        self.bindings.reflection(stage).map_or("main", |r| r.entry_point.as_str())
    }
}

fn reflect(name: &str, vertex: &[u32], fragment: &[u32]) -> Result<ShaderBindings, ReflectionError> {
    let vertex = ShaderReflection::parse(&format!("{}.vert", name), vertex)?;
    let fragment = ShaderReflection::parse(&format!("{}.frag", name), fragment)?;
    Ok(ShaderBindings::new(vec![vertex, fragment]))
}

impl Operation for RenderOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self, resource: &Resource, direction: Direction) -> LayoutContract {
        if !resource.is_image() {
            return LayoutContract::ANY;
        }
        match direction {
            Direction::Input => LayoutContract::same(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            Direction::Output => {
                let start = match self.clear {
                    Some(_) => vk::ImageLayout::UNDEFINED,
                    None => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                };
                let end = if resource.is_swapchain() {
                    vk::ImageLayout::PRESENT_SRC_KHR
                } else {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                };
                LayoutContract::new(start, end)
            }
        }
    }

    fn compile(&mut self, ctx: &CompileContext<'_>) -> Result<()> {
        let device = ctx.device;
        self.extent = ctx.extent;
        self.bindings.build(ctx)?;

        let load_op = match self.clear {
            Some(_) => vk::AttachmentLoadOp::CLEAR,
            None => vk::AttachmentLoadOp::LOAD,
        };
        let targets: Vec<_> = ctx.outputs().filter(|(_, r)| r.is_image()).collect();
        let attachments: Vec<pipeline::AttachmentSpec> = targets
            .iter()
            .map(|&(id, resource)| {
                let contract = self.layout(resource, ctx.direction_of(id));
                pipeline::AttachmentSpec {
                    format: resource.format().unwrap_or(vk::Format::UNDEFINED),
                    load_op,
                    initial_layout: contract.start,
                    final_layout: contract.end,
                }
            })
            .collect();
        self.attachment_count = attachments.len();
        self.render_pass = pipeline::create_render_pass(device, &attachments)?;

        let vertex = shader::create_shader_module(device, &self.vertex)?;
        self.modules.push(vertex);
        let fragment = shader::create_shader_module(device, &self.fragment)?;
        self.modules.push(fragment);

        self.pipeline = pipeline::create_graphics_pipeline(
            device,
            self.render_pass,
            self.bindings.pipeline_layout(),
            self.extent,
            (vertex, self.entry_point(ShaderStage::Vertex)),
            (fragment, self.entry_point(ShaderStage::Fragment)),
            attachments.len(),
        )
        .with_context(|| format!("Failed to create pipeline for '{}'", self.name))?;

        for frame in 0..ctx.frames {
            let views = targets
                .iter()
                .map(|(_, resource)| {
                    resource
                        .image_view(frame)
                        .with_context(|| format!("Target '{}' has no view for frame {}", resource.name(), frame))
                })
                .collect::<Result<Vec<_>>>()?;
            let framebuffer = pipeline::create_framebuffer(device, self.render_pass, &views, self.extent)?;
            self.framebuffers.push(framebuffer);
        }

        log::debug!(
            "Compiled render operation '{}' ({} targets, {}x{})",
            self.name,
            attachments.len(),
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    fn record(&self, ctx: &RecordContext<'_>) -> Result<()> {
        let framebuffer = *self
            .framebuffers
            .get(ctx.frame)
            .with_context(|| format!("'{}' has no framebuffer for frame {}", self.name, ctx.frame))?;

        let clear_values = vec![
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.clear.unwrap_or_default() },
            };
            self.attachment_count
        ];
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            ctx.device
                .cmd_begin_render_pass(ctx.command_buffer, &render_pass_info, vk::SubpassContents::INLINE);
            ctx.device
                .cmd_bind_pipeline(ctx.command_buffer, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            self.bindings
                .bind(ctx.device, ctx.command_buffer, vk::PipelineBindPoint::GRAPHICS, ctx.frame);
            ctx.device.cmd_draw(ctx.command_buffer, 3, 1, 0, 0);
            ctx.device.cmd_end_render_pass(ctx.command_buffer);
        }
        Ok(())
    }

    fn uniforms_mut(&mut self, stage: ShaderStage) -> Option<&mut UniformSet> {
        self.bindings.uniforms_mut(stage)
    }

    fn flush(&mut self, frame: usize) -> Result<()> {
        self.bindings.flush(frame)
    }

    fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.device.destroy_framebuffer(framebuffer, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.render_pass != vk::RenderPass::null() {
                device.device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
            for module in self.modules.drain(..) {
                device.device.destroy_shader_module(module, None);
            }
        }
        self.bindings.destroy(device);
    }
}
