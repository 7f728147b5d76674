// Layout tracking and barrier synthesis
//
// Walks the scheduled passes once per frame in flight with a table of the
// current layout of every image resource. Before each operation, resources
// whose required start layout differs from the tracked one get a transition;
// afterwards the table holds the operation's end layout. A final set of
// transitions returns images to the layout they rest in between frames.
//
// Commands inside one pre-recorded buffer already run in order, so the
// barriers only exist to move layouts: ALL_COMMANDS on both sides, no access masks.

use ash::vk;
use std::collections::BTreeMap;

use super::connection::{ConnectionSet, Direction, OperationId, ResourceId};
use super::operation::Operation;
use super::resource::Resource;
use super::schedule::Pass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub resource: ResourceId,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

impl ImageTransition {
    pub fn to_vk(&self, image: vk::Image, aspect: vk::ImageAspectFlags) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(crate::backend::buffer::subresource_range(aspect))
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Barriers(Vec<ImageTransition>),
    Execute(OperationId),
}

/// Command stream for one frame in flight.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub frame: usize,
    pub steps: Vec<PlanStep>,
    /// Layout of every image resource once the stream has run.
    pub final_layouts: BTreeMap<ResourceId, vk::ImageLayout>,
}

impl FramePlan {
    pub fn transitions(&self) -> impl Iterator<Item = &ImageTransition> {
        self.steps.iter().flat_map(|step| match step {
            PlanStep::Barriers(transitions) => transitions.as_slice(),
            PlanStep::Execute(_) => &[][..],
        })
    }

    pub fn executed(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Execute(op) => Some(*op),
            PlanStep::Barriers(_) => None,
        })
    }
}

pub fn plan_frame(
    frame: usize,
    passes: &[Pass],
    connections: &ConnectionSet,
    resources: &[Resource],
    operations: &[Box<dyn Operation>],
) -> FramePlan {
    let mut current: BTreeMap<ResourceId, vk::ImageLayout> = resources
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_image())
        .map(|(index, r)| (ResourceId(index as u32), r.start_layout()))
        .collect();

    let mut steps = Vec::new();

    for pass in passes {
        for &op in &pass.operations {
            let operation = &operations[op.index()];
            let mut transitions = Vec::new();

            // Inputs first, then outputs; a resource on both sides uses its output contract
            let touched = connections
                .inputs(op)
                .filter(|&r| !connections.writes(op, r))
                .map(|r| (r, Direction::Input))
                .chain(connections.outputs(op).map(|r| (r, Direction::Output)));

            for (id, direction) in touched {
                let Some(layout) = current.get_mut(&id) else {
                    continue;
                };
                let contract = operation.layout(&resources[id.index()], direction);
                if contract.start != vk::ImageLayout::UNDEFINED && contract.start != *layout {
                    transitions.push(ImageTransition { resource: id, old_layout: *layout, new_layout: contract.start });
                }
                *layout = contract.end;
            }

            if !transitions.is_empty() {
                steps.push(PlanStep::Barriers(transitions));
            }
            steps.push(PlanStep::Execute(op));
        }
    }

    let mut returns = Vec::new();
    for (&id, layout) in current.iter_mut() {
        if let Some(rest) = resources[id.index()].return_layout() {
            if *layout != rest {
                returns.push(ImageTransition { resource: id, old_layout: *layout, new_layout: rest });
                *layout = rest;
            }
        }
    }
    if !returns.is_empty() {
        steps.push(PlanStep::Barriers(returns));
    }

    FramePlan { frame, steps, final_layouts: current }
}
