// Render graph - compiler and executor
//
// Resources and operations live in arenas owned by the graph and are named by
// index handles. `compile` allocates resources, schedules passes, synthesises
// layout barriers and pre-records one command buffer per frame in flight;
// `submit` and `present` replay them. Only uniform contents change between
// frames.

pub mod barrier;
pub mod connection;
pub mod operation;
pub mod ops;
pub mod resource;
pub mod schedule;

pub use barrier::{FramePlan, ImageTransition, PlanStep};
pub use connection::{Connection, ConnectionSet, Direction, OperationId, ResourceId};
pub use operation::{CompileContext, LayoutContract, Operation, RecordContext};
pub use resource::{ImageDesc, ImageExtent, Resource, ResourceKind, SurfaceInfo};
pub use schedule::Pass;

use anyhow::{Context, Result};
use ash::vk;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::backend::{command, PresentStatus, Swapchain, VulkanDevice};
use crate::reflection::ShaderStage;
use crate::uniform::{UniformSet, UniformView};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("render graph has not been compiled")]
    NotCompiled,

    #[error("frame index {frame} out of range ({frames} frames in flight)")]
    FrameOutOfRange { frame: usize, frames: usize },

    #[error(
        "operation '{operation}' writes '{resource}' at {}x{} but its first output is {}x{}",
        .found.width, .found.height, .expected.width, .expected.height
    )]
    ExtentMismatch {
        operation: String,
        resource: String,
        expected: vk::Extent2D,
        found: vk::Extent2D,
    },

    #[error("image '{resource}' is sized to the swapchain but no surface is bound")]
    UnboundExtent { resource: String },

    #[error("dependency cycle through operations {operations:?}")]
    Cycle { operations: Vec<OperationId> },

    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
}

/// Placeholder extent for operations that write no image.
const DEFAULT_EXTENT: vk::Extent2D = vk::Extent2D { width: 1, height: 1 };

struct Compiled {
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    passes: Vec<Pass>,
}

pub struct RenderGraph {
    resources: Vec<Resource>,
    operations: Vec<Box<dyn Operation>>,
    connections: ConnectionSet,
    frames: usize,
    surface: Option<SurfaceInfo>,
    device: Option<Arc<VulkanDevice>>,
    compiled: Option<Compiled>,
}

impl RenderGraph {
    /// `frames` is the frames-in-flight count used when the graph has no
    /// swapchain image; otherwise the swapchain's image count wins.
    pub fn new(frames: usize) -> Self {
        Self {
            resources: Vec::new(),
            operations: Vec::new(),
            connections: ConnectionSet::new(),
            frames: frames.max(1),
            surface: None,
            device: None,
            compiled: None,
        }
    }

    // ---- construction ----

    pub fn add_resource(&mut self, resource: Resource) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        log::trace!("Added resource {} '{}'", id, resource.name());
        self.resources.push(resource);
        id
    }

    pub fn add_image(&mut self, name: impl Into<String>, desc: ImageDesc) -> ResourceId {
        self.add_resource(Resource::image(name, desc))
    }

    pub fn import_image(
        &mut self,
        name: impl Into<String>,
        desc: ImageDesc,
        images: Vec<(vk::Image, vk::ImageView)>,
    ) -> ResourceId {
        self.add_resource(Resource::imported_image(name, desc, images))
    }

    pub fn add_buffer(&mut self, name: impl Into<String>, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> ResourceId {
        self.add_resource(Resource::buffer(name, size, usage))
    }

    pub fn add_swapchain_image(&mut self, name: impl Into<String>) -> ResourceId {
        self.add_resource(Resource::swapchain_image(name))
    }

    pub fn add_operation(&mut self, operation: impl Operation + 'static) -> OperationId {
        let id = OperationId(self.operations.len() as u32);
        log::trace!("Added operation {} '{}'", id, operation.name());
        self.operations.push(Box::new(operation));
        id
    }

    /// Declare that `operation` reads `resource`.
    pub fn read(&mut self, operation: OperationId, resource: ResourceId) -> Result<(), GraphError> {
        self.check(operation, resource)?;
        self.connections.read(operation, resource);
        Ok(())
    }

    /// Declare that `operation` writes `resource`.
    pub fn write(&mut self, operation: OperationId, resource: ResourceId) -> Result<(), GraphError> {
        self.check(operation, resource)?;
        self.connections.write(operation, resource);
        Ok(())
    }

    fn check(&self, operation: OperationId, resource: ResourceId) -> Result<(), GraphError> {
        if operation.index() >= self.operations.len() {
            return Err(GraphError::UnknownOperation(operation));
        }
        if resource.index() >= self.resources.len() {
            return Err(GraphError::UnknownResource(resource));
        }
        Ok(())
    }

    /// Set the presentation target picked up by swapchain images and
    /// swapchain-relative images. Takes effect on the next `compile`.
    pub fn bind_surface(&mut self, surface: SurfaceInfo) {
        for resource in &mut self.resources {
            resource.bind_surface(&surface);
        }
        self.surface = Some(surface);
    }

    // ---- queries ----

    pub fn frames_in_flight(&self) -> usize {
        match &self.surface {
            Some(surface) if !surface.images.is_empty() && self.resources.iter().any(Resource::is_swapchain) => {
                surface.images.len()
            }
            _ => self.frames,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(id.index())
    }

    pub fn operation(&self, id: OperationId) -> Option<&dyn Operation> {
        self.operations.get(id.index()).map(|op| op.as_ref())
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    fn operation_ids(&self) -> Vec<OperationId> {
        (0..self.operations.len() as u32).map(OperationId).collect()
    }

    /// Schedule operations into passes: layering, then write-write splitting.
    pub fn passes(&self) -> Result<Vec<Pass>, GraphError> {
        let layered = schedule::get_passes(&self.connections, &self.operation_ids())?;
        Ok(schedule::separate_passes(layered, &self.connections))
    }

    /// Barrier/execute stream for `frame`, as `compile` records it.
    pub fn plan(&self, frame: usize) -> Result<FramePlan, GraphError> {
        let frames = self.frames_in_flight();
        if frame >= frames {
            return Err(GraphError::FrameOutOfRange { frame, frames });
        }
        let passes = self.passes()?;
        Ok(barrier::plan_frame(frame, &passes, &self.connections, &self.resources, &self.operations))
    }

    /// Extent `operation` renders at: that of its first output image, which
    /// every other output image must share.
    pub fn operation_extent(&self, operation: OperationId) -> Result<vk::Extent2D, GraphError> {
        let op = self.operations.get(operation.index()).ok_or(GraphError::UnknownOperation(operation))?;
        let mut first: Option<vk::Extent2D> = None;

        for id in self.connections.outputs(operation) {
            let resource = &self.resources[id.index()];
            if !resource.is_image() {
                continue;
            }
            let found = resource
                .extent()
                .ok_or_else(|| GraphError::UnboundExtent { resource: resource.name().to_string() })?;
            match first {
                None => first = Some(found),
                Some(expected) if expected != found => {
                    return Err(GraphError::ExtentMismatch {
                        operation: op.name().to_string(),
                        resource: resource.name().to_string(),
                        expected,
                        found,
                    });
                }
                Some(_) => {}
            }
        }

        Ok(first.unwrap_or(DEFAULT_EXTENT))
    }

    /// Human readable schedule, one line per pass.
    pub fn describe(&self) -> String {
        let passes = match self.passes() {
            Ok(passes) => passes,
            Err(e) => return format!("<unschedulable: {}>", e),
        };
        let mut out = String::new();
        for (index, pass) in passes.iter().enumerate() {
            let names: Vec<&str> = pass.operations.iter().map(|op| self.operations[op.index()].name()).collect();
            let inputs: Vec<&str> = pass.inputs.iter().map(|r| self.resources[r.index()].name()).collect();
            let outputs: Vec<&str> = pass.outputs.iter().map(|r| self.resources[r.index()].name()).collect();
            let _ = writeln!(out, "pass {}: [{}] reads [{}] writes [{}]", index, names.join(", "), inputs.join(", "), outputs.join(", "));
        }
        out
    }

    // ---- compile ----

    /// Allocate resources, schedule, synthesise barriers and record one
    /// command buffer per frame in flight. Recompiling releases everything a
    /// previous compile created first.
    pub fn compile(&mut self, device: &Arc<VulkanDevice>) -> Result<()> {
        self.release();
        self.device = Some(device.clone());
        let compiled = self.build(device);
        self.finish_compile(compiled)
    }

    /// Keep a successful compile, or release whatever a failed one allocated
    /// so the graph reads as uncompiled.
    fn finish_compile(&mut self, compiled: Result<Compiled>) -> Result<()> {
        match compiled {
            Ok(compiled) => {
                self.compiled = Some(compiled);
                Ok(())
            }
            Err(e) => {
                self.release();
                self.compiled = None;
                Err(e)
            }
        }
    }

    fn build(&mut self, device: &Arc<VulkanDevice>) -> Result<Compiled> {
        if let Some(surface) = &self.surface {
            for resource in &mut self.resources {
                resource.bind_surface(surface);
            }
        }

        let frames = self.frames_in_flight();
        let passes = self.passes()?;
        let extents = self
            .operation_ids()
            .into_iter()
            .map(|op| self.operation_extent(op))
            .collect::<Result<Vec<_>, _>>()?;

        for resource in &mut self.resources {
            resource
                .allocate(device, frames)
                .with_context(|| format!("Failed to allocate resource '{}'", resource.name()))?;
        }

        let command_pool = command::create_command_pool(device)?;
        match self.record_all(device, command_pool, frames, &passes, &extents) {
            Ok(command_buffers) => Ok(Compiled { command_pool, command_buffers, passes }),
            Err(e) => {
                if let Err(idle) = device.wait_idle() {
                    log::warn!("wait_idle after failed compile: {}", idle);
                }
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                Err(e)
            }
        }
    }

    fn record_all(
        &mut self,
        device: &Arc<VulkanDevice>,
        command_pool: vk::CommandPool,
        frames: usize,
        passes: &[Pass],
        extents: &[vk::Extent2D],
    ) -> Result<Vec<vk::CommandBuffer>> {
        self.initial_transitions(device, command_pool, frames)?;

        for (index, operation) in self.operations.iter_mut().enumerate() {
            let ctx = CompileContext {
                device,
                id: OperationId(index as u32),
                extent: extents[index],
                frames,
                connections: &self.connections,
                resources: &self.resources,
            };
            operation
                .compile(&ctx)
                .with_context(|| format!("Failed to compile operation '{}'", operation.name()))?;
        }

        let command_buffers = command::allocate_command_buffers(device, command_pool, frames as u32)?;
        let mut tracked = vec![Vec::with_capacity(frames); self.resources.len()];
        let mut barrier_count = 0;

        for (frame, &cmd) in command_buffers.iter().enumerate() {
            let plan = barrier::plan_frame(frame, passes, &self.connections, &self.resources, &self.operations);
            barrier_count += plan.transitions().count();
            self.record(device, cmd, &plan)?;
            for (id, layout) in &plan.final_layouts {
                tracked[id.index()].push(*layout);
            }
        }

        for (resource, layouts) in self.resources.iter_mut().zip(tracked) {
            resource.track_layouts(layouts);
        }

        log::info!(
            "Render graph compiled: {} passes, {} operations, {} barriers over {} command buffers",
            passes.len(),
            self.operations.len(),
            barrier_count,
            command_buffers.len()
        );
        for (index, pass) in passes.iter().enumerate() {
            let names: Vec<&str> = pass.operations.iter().map(|op| self.operations[op.index()].name()).collect();
            log::debug!("  pass {}: {}", index, names.join(", "));
        }
        Ok(command_buffers)
    }

    /// Move graph-owned images into their initial layout once after allocation.
    fn initial_transitions(&self, device: &VulkanDevice, pool: vk::CommandPool, frames: usize) -> Result<()> {
        let mut barriers = Vec::new();
        for (index, resource) in self.resources.iter().enumerate() {
            if !resource.needs_initial_transition() {
                continue;
            }
            let transition = ImageTransition {
                resource: ResourceId(index as u32),
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: resource.start_layout(),
            };
            for frame in 0..frames {
                if let Some(image) = resource.vk_image(frame) {
                    barriers.push(transition.to_vk(image, resource.aspect()));
                }
            }
        }
        if barriers.is_empty() {
            return Ok(());
        }

        log::debug!("Transitioning {} image instances to their initial layout", barriers.len());
        command::one_time_submit(device, pool, |device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        })
        .context("Failed to transition images to their initial layout")
    }

    fn record(&self, device: &VulkanDevice, cmd: vk::CommandBuffer, plan: &FramePlan) -> Result<()> {
        let frame = plan.frame;
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin recording command buffer")?;
        }

        for step in &plan.steps {
            match step {
                PlanStep::Barriers(transitions) => {
                    let barriers: Vec<vk::ImageMemoryBarrier> = transitions
                        .iter()
                        .filter_map(|t| {
                            let resource = &self.resources[t.resource.index()];
                            resource.vk_image(frame).map(|image| t.to_vk(image, resource.aspect()))
                        })
                        .collect();
                    unsafe {
                        device.device.cmd_pipeline_barrier(
                            cmd,
                            vk::PipelineStageFlags::ALL_COMMANDS,
                            vk::PipelineStageFlags::ALL_COMMANDS,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &barriers,
                        );
                    }
                }
                PlanStep::Execute(op) => {
                    let operation = &self.operations[op.index()];
                    let ctx = RecordContext {
                        device: &device.device,
                        command_buffer: cmd,
                        frame,
                        id: *op,
                        connections: &self.connections,
                        resources: &self.resources,
                    };
                    operation
                        .record(&ctx)
                        .with_context(|| format!("Failed to record operation '{}' for frame {}", operation.name(), frame))?;
                }
            }
        }

        unsafe { device.device.end_command_buffer(cmd) }.context("Failed to end command buffer")
    }

    // ---- per-frame ----

    /// Staging view over uniform block `block` of `operation`'s `stage`.
    /// Unknown operations, stages or blocks yield a null view.
    ///
    /// Uniform blocks reach the GPU on `flush`. Push constants are recorded
    /// into the command buffers by `compile`, so writes to them after that
    /// need a recompile; `flush` warns when it sees such a write.
    ///
    /// ```ignore
    /// graph.uniform(op, ShaderStage::Fragment, "Params").field("time").write(&t);
    /// ```
    pub fn uniform(&mut self, operation: OperationId, stage: ShaderStage, block: &str) -> UniformView<'_> {
        match self.uniforms_mut(operation, stage) {
            Some(set) => set.get(block),
            None => {
                log::trace!("{} has no {:?} uniforms", operation, stage);
                UniformView::null()
            }
        }
    }

    pub fn uniforms_mut(&mut self, operation: OperationId, stage: ShaderStage) -> Option<&mut UniformSet> {
        self.operations.get_mut(operation.index())?.uniforms_mut(stage)
    }

    /// Copy staged uniforms into `frame`'s GPU buffers. Call before `submit`.
    pub fn flush(&mut self, frame: usize) -> Result<()> {
        let frames = self.compiled_frames()?;
        if frame >= frames {
            return Err(GraphError::FrameOutOfRange { frame, frames }.into());
        }
        for operation in &mut self.operations {
            operation
                .flush(frame)
                .with_context(|| format!("Failed to flush uniforms of '{}'", operation.name()))?;
        }
        Ok(())
    }

    fn compiled_frames(&self) -> Result<usize, GraphError> {
        self.compiled
            .as_ref()
            .map(|c| c.command_buffers.len())
            .ok_or(GraphError::NotCompiled)
    }

    /// Submit `frame`'s pre-recorded command buffer.
    pub fn submit(
        &self,
        frame: usize,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let (compiled, device) = match (&self.compiled, &self.device) {
            (Some(compiled), Some(device)) => (compiled, device),
            _ => {
                log::error!("Submit of frame {} on an uncompiled render graph", frame);
                return Err(GraphError::NotCompiled.into());
            }
        };
        let Some(&cmd) = compiled.command_buffers.get(frame) else {
            let frames = compiled.command_buffers.len();
            log::error!("Submit of frame {} but only {} frames are recorded", frame, frames);
            return Err(GraphError::FrameOutOfRange { frame, frames }.into());
        };

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores);

        unsafe { device.device.queue_submit(device.queue, &[submit_info.build()], fence) }.map_err(|e| {
            log::error!("Queue submit failed for frame {}: {:?}", frame, e);
            anyhow::anyhow!("Failed to submit frame {}: {:?}", frame, e)
        })
    }

    /// Present swapchain image `image_index` once `wait_semaphores` signal.
    pub fn present(&self, swapchain: &Swapchain, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> Result<PresentStatus> {
        let frames = self.compiled_frames().map_err(|e| {
            log::error!("Present on an uncompiled render graph");
            e
        })?;
        if image_index as usize >= frames {
            log::error!("Present of image {} but only {} frames are recorded", image_index, frames);
            return Err(GraphError::FrameOutOfRange { frame: image_index as usize, frames }.into());
        }
        let device = self.device.as_ref().ok_or(GraphError::NotCompiled)?;
        swapchain.present(device.queue, image_index, wait_semaphores)
    }

    /// Passes of the last successful compile.
    pub fn compiled_passes(&self) -> Option<&[Pass]> {
        self.compiled.as_ref().map(|c| c.passes.as_slice())
    }

    /// Drop everything `compile` created. The graph's description stays.
    pub fn release(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        if let Err(e) = device.wait_idle() {
            log::warn!("wait_idle before render graph release failed: {}", e);
        }
        if let Some(compiled) = self.compiled.take() {
            unsafe {
                if !compiled.command_buffers.is_empty() {
                    device.device.free_command_buffers(compiled.command_pool, &compiled.command_buffers);
                }
                device.device.destroy_command_pool(compiled.command_pool, None);
            }
        }
        for operation in &mut self.operations {
            operation.destroy(&device);
        }
        for resource in &mut self.resources {
            resource.release(&device);
        }
        log::debug!("Render graph resources released");
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        self.release();
    }
}
