// Clear every output image to a constant color with a transfer command.

use anyhow::Result;
use ash::vk;

use crate::graph::{CompileContext, Direction, LayoutContract, Operation, RecordContext, Resource};

pub struct ClearOperation {
    name: String,
    color: [f32; 4],
}

impl ClearOperation {
    pub fn new(name: impl Into<String>, color: [f32; 4]) -> Self {
        Self { name: name.into(), color }
    }

    pub fn color(&self) -> [f32; 4] {
        self.color
    }

    pub fn set_color(&mut self, color: [f32; 4]) {
        self.color = color;
    }
}

impl Operation for ClearOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self, resource: &Resource, direction: Direction) -> LayoutContract {
        match direction {
            Direction::Output if resource.is_image() => LayoutContract::same(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            _ => LayoutContract::ANY,
        }
    }

    fn compile(&mut self, _ctx: &CompileContext<'_>) -> Result<()> {
        Ok(())
    }

    // The color is baked into the recorded command; changes apply on the next compile.
    fn record(&self, ctx: &RecordContext<'_>) -> Result<()> {
        let clear = vk::ClearColorValue { float32: self.color };
        for resource in ctx.outputs() {
            let Some(image) = resource.vk_image(ctx.frame) else {
                continue;
            };
            let range = crate::backend::buffer::subresource_range(vk::ImageAspectFlags::COLOR);
            unsafe {
                ctx.device.cmd_clear_color_image(
                    ctx.command_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear,
                    &[range],
                );
            }
        }
        Ok(())
    }
}
