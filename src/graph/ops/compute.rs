// Compute dispatch over the operation's extent
//
// One invocation per texel of the target: workgroup counts are the extent
// divided by the shader's LocalSize, rounded up. Output images are bound as
// storage images in GENERAL layout.

use anyhow::{Context, Result};
use ash::vk;

use super::ShaderBindings;
use crate::backend::{pipeline, shader, VulkanDevice};
use crate::graph::{CompileContext, Direction, LayoutContract, Operation, RecordContext, Resource};
use crate::reflection::{ReflectionError, ShaderReflection, ShaderStage};
use crate::uniform::UniformSet;

pub struct ComputeOperation {
    name: String,
    words: Vec<u32>,
    local_size: [u32; 3],
    entry_point: String,
    bindings: ShaderBindings,

    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
    groups: [u32; 3],
}

impl ComputeOperation {
    pub fn new(name: impl Into<String>, words: Vec<u32>) -> Result<Self, ReflectionError> {
        let name = name.into();
        let reflection = ShaderReflection::parse(&format!("{}.comp", name), &words)?;
        let local_size = reflection.local_size.unwrap_or([1, 1, 1]);
        let entry_point = reflection.entry_point.clone();
        Ok(Self {
            name,
            words,
            local_size,
            entry_point,
            bindings: ShaderBindings::new(vec![reflection]),
            module: vk::ShaderModule::null(),
            pipeline: vk::Pipeline::null(),
            groups: [1, 1, 1],
        })
    }

    /// Workgroups dispatched for `extent`.
    pub fn group_count(&self, extent: vk::Extent2D) -> [u32; 3] {
        [
            groups(extent.width, self.local_size[0]),
            groups(extent.height, self.local_size[1]),
            1,
        ]
    }
}

fn groups(size: u32, local: u32) -> u32 {
    let local = local.max(1);
    (size + local - 1) / local
}

impl Operation for ComputeOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self, resource: &Resource, direction: Direction) -> LayoutContract {
        if !resource.is_image() {
            return LayoutContract::ANY;
        }
        match direction {
            Direction::Input => LayoutContract::same(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            Direction::Output => LayoutContract::same(vk::ImageLayout::GENERAL),
        }
    }

    fn compile(&mut self, ctx: &CompileContext<'_>) -> Result<()> {
        self.bindings.build(ctx)?;
        self.module = shader::create_shader_module(ctx.device, &self.words)?;
        self.pipeline =
            pipeline::create_compute_pipeline(ctx.device, self.bindings.pipeline_layout(), self.module, &self.entry_point)
                .with_context(|| format!("Failed to create pipeline for '{}'", self.name))?;
        self.groups = self.group_count(ctx.extent);

        log::debug!("Compiled compute operation '{}' dispatching {:?}", self.name, self.groups);
        Ok(())
    }

    fn record(&self, ctx: &RecordContext<'_>) -> Result<()> {
        let [x, y, z] = self.groups;
        unsafe {
            ctx.device
                .cmd_bind_pipeline(ctx.command_buffer, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            self.bindings
                .bind(ctx.device, ctx.command_buffer, vk::PipelineBindPoint::COMPUTE, ctx.frame);
            ctx.device.cmd_dispatch(ctx.command_buffer, x, y, z);
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
            if self.pipeline != vk::Pipeline::null() {
                device.device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.module != vk::ShaderModule::null() {
                device.device.destroy_shader_module(self.module, None);
                self.module = vk::ShaderModule::null();
            }
        }
        self.bindings.destroy(device);
    }
}
