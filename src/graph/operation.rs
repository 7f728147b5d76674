// Operation interface
//
// An operation is one unit of GPU work. The graph asks it which layouts it
// needs its resources in, compiles it once target extents are known and has
// it record itself into every frame's command buffer.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::connection::{ConnectionSet, Direction, OperationId, ResourceId};
use super::resource::Resource;
use crate::backend::VulkanDevice;
use crate::reflection::ShaderStage;
use crate::uniform::UniformSet;

/// Layouts an operation needs a resource in when it starts, and leaves it
/// in when it ends. A `start` of `UNDEFINED` accepts any layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutContract {
    pub start: vk::ImageLayout,
    pub end: vk::ImageLayout,
}

impl LayoutContract {
    pub const ANY: Self = Self::same(vk::ImageLayout::UNDEFINED);

    pub const fn new(start: vk::ImageLayout, end: vk::ImageLayout) -> Self {
        Self { start, end }
    }

    pub const fn same(layout: vk::ImageLayout) -> Self {
        Self { start: layout, end: layout }
    }
}

/// Everything an operation can look at while building its pipeline state.
pub struct CompileContext<'a> {
    pub device: &'a Arc<VulkanDevice>,
    pub id: OperationId,
    /// Common extent of the operation's output images (1x1 without any).
    pub extent: vk::Extent2D,
    pub frames: usize,
    pub connections: &'a ConnectionSet,
    pub resources: &'a [Resource],
}

impl<'a> CompileContext<'a> {
    pub fn inputs(&self) -> impl Iterator<Item = (ResourceId, &'a Resource)> + '_ {
        let resources = self.resources;
        self.connections.inputs(self.id).map(move |id| (id, &resources[id.index()]))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (ResourceId, &'a Resource)> + '_ {
        let resources = self.resources;
        self.connections.outputs(self.id).map(move |id| (id, &resources[id.index()]))
    }

    /// Side the graph takes `resource`'s contract from; writes win over reads.
    pub fn direction_of(&self, resource: ResourceId) -> Direction {
        if self.connections.writes(self.id, resource) {
            Direction::Output
        } else {
            Direction::Input
        }
    }
}

/// Recording state for one frame's command buffer.
pub struct RecordContext<'a> {
    pub device: &'a ash::Device,
    pub command_buffer: vk::CommandBuffer,
    pub frame: usize,
    pub id: OperationId,
    pub connections: &'a ConnectionSet,
    pub resources: &'a [Resource],
}

impl<'a> RecordContext<'a> {
    pub fn inputs(&self) -> impl Iterator<Item = &'a Resource> + '_ {
        let resources = self.resources;
        self.connections.inputs(self.id).map(move |id| &resources[id.index()])
    }

    pub fn outputs(&self) -> impl Iterator<Item = &'a Resource> + '_ {
        let resources = self.resources;
        self.connections.outputs(self.id).map(move |id| &resources[id.index()])
    }
}

pub trait Operation {
    fn name(&self) -> &str;

    /// Layouts this operation needs `resource` in, seen from `direction`.
    fn layout(&self, resource: &Resource, direction: Direction) -> LayoutContract;

    /// Build pipelines and per-frame state. Called on every graph compile,
    /// after `destroy` released whatever the previous compile built.
    fn compile(&mut self, ctx: &CompileContext<'_>) -> Result<()>;

    fn record(&self, ctx: &RecordContext<'_>) -> Result<()>;

    /// Staging uniforms for one of this operation's shader stages.
    fn uniforms_mut(&mut self, _stage: ShaderStage) -> Option<&mut UniformSet> {
        None
    }

    /// Copy staged uniforms into `frame`'s GPU buffers.
    fn flush(&mut self, _frame: usize) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _device: &VulkanDevice) {}
}
