// Scheduling and barrier planning, exercised without a device: swapchain
// images are fake handles and operations only declare layout contracts.

use anyhow::Result;
use ash::vk::{self, Handle};
use rstest::{fixture, rstest};

use stimulus_render::graph::ops::ClearOperation;
use stimulus_render::graph::{
    CompileContext, Direction, GraphError, ImageDesc, LayoutContract, Operation, OperationId, RecordContext,
    RenderGraph, Resource, ResourceId, SurfaceInfo,
};
use stimulus_render::ShaderStage;

struct Contracted {
    name: String,
    input: LayoutContract,
    output: LayoutContract,
}

impl Contracted {
    fn new(name: &str, input: LayoutContract, output: LayoutContract) -> Self {
        Self { name: name.to_string(), input, output }
    }

    fn any(name: &str) -> Self {
        Self::new(name, LayoutContract::ANY, LayoutContract::ANY)
    }
}

impl Operation for Contracted {
    fn name(&self) -> &str {
        &self.name
    }

    fn layout(&self, _resource: &Resource, direction: Direction) -> LayoutContract {
        match direction {
            Direction::Input => self.input,
            Direction::Output => self.output,
        }
    }

    fn compile(&mut self, _ctx: &CompileContext<'_>) -> Result<()> {
        Ok(())
    }

    fn record(&self, _ctx: &RecordContext<'_>) -> Result<()> {
        Ok(())
    }
}

fn color_image() -> ImageDesc {
    ImageDesc::new(
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    )
}

fn fake_surface(images: u64) -> SurfaceInfo {
    SurfaceInfo {
        extent: vk::Extent2D { width: 640, height: 480 },
        format: vk::Format::B8G8R8A8_SRGB,
        images: (1..=images)
            .map(|i| (vk::Image::from_raw(i), vk::ImageView::from_raw(100 + i)))
            .collect(),
    }
}

fn pass_index(passes: &[stimulus_render::graph::Pass], op: OperationId) -> usize {
    passes
        .iter()
        .position(|p| p.operations.contains(&op))
        .expect("operation was scheduled")
}

struct Sample {
    graph: RenderGraph,
    first: OperationId,
    second: OperationId,
    intermediate: ResourceId,
    backbuffer: ResourceId,
}

/// Operation 1 renders into R; operation 2 samples R into the swapchain image.
#[fixture]
fn sample() -> Sample {
    let mut graph = RenderGraph::new(2);
    let intermediate = graph.add_image(
        "R",
        color_image().with_initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
    );
    let backbuffer = graph.add_swapchain_image("backbuffer");

    let first = graph.add_operation(Contracted::new(
        "first",
        LayoutContract::ANY,
        LayoutContract::same(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
    ));
    let second = graph.add_operation(Contracted::new(
        "second",
        LayoutContract::same(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        LayoutContract::new(vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR),
    ));

    graph.write(first, intermediate).unwrap();
    graph.read(second, intermediate).unwrap();
    graph.write(second, backbuffer).unwrap();
    graph.bind_surface(fake_surface(2));

    Sample { graph, first, second, intermediate, backbuffer }
}

#[rstest]
#[case(0)]
#[case(1)]
fn sample_graph_records_one_transition_into_the_read(sample: Sample, #[case] frame: usize) {
    assert_eq!(sample.graph.frames_in_flight(), 2);

    let plan = sample.graph.plan(frame).unwrap();
    assert_eq!(plan.executed().collect::<Vec<_>>(), [sample.first, sample.second]);

    let into_read: Vec<_> = plan
        .transitions()
        .filter(|t| t.resource == sample.intermediate && t.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .collect();
    assert_eq!(into_read.len(), 1);
    assert_eq!(into_read[0].old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    assert_eq!(plan.final_layouts[&sample.intermediate], vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(plan.final_layouts[&sample.backbuffer], vk::ImageLayout::PRESENT_SRC_KHR);
}

#[rstest]
fn frames_past_the_swapchain_are_rejected(sample: Sample) {
    assert!(matches!(
        sample.graph.plan(2),
        Err(GraphError::FrameOutOfRange { frame: 2, frames: 2 })
    ));
}

#[rstest]
fn uncompiled_graph_refuses_to_submit(mut sample: Sample) {
    let err = sample
        .graph
        .submit(0, &[], &[], &[], vk::Fence::null())
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::NotCompiled)));

    let err = sample.graph.flush(0).unwrap_err();
    assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::NotCompiled)));
    assert!(!sample.graph.is_compiled());
}

#[rstest]
fn operations_without_uniforms_hand_out_null_views(mut sample: Sample) {
    let mut view = sample.graph.uniform(sample.first, ShaderStage::Fragment, "Params");
    assert!(view.is_null());
    view.field("time").write(&1.0f32);
    assert!(view.field("time").is_null());
}

#[test]
fn presented_clear_returns_to_present_layout() {
    let mut graph = RenderGraph::new(1);
    let backbuffer = graph.add_swapchain_image("backbuffer");
    let clear = graph.add_operation(ClearOperation::new("clear", [0.0, 0.0, 0.0, 1.0]));
    graph.write(clear, backbuffer).unwrap();
    graph.bind_surface(fake_surface(3));

    assert_eq!(graph.frames_in_flight(), 3);
    for frame in 0..3 {
        let plan = graph.plan(frame).unwrap();
        let transitions: Vec<_> = plan.transitions().map(|t| (t.old_layout, t.new_layout)).collect();
        assert_eq!(
            transitions,
            [
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
            ]
        );
        assert_eq!(plan.final_layouts[&backbuffer], vk::ImageLayout::PRESENT_SRC_KHR);
    }
}

#[rstest]
#[case(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
#[case(vk::ImageLayout::GENERAL)]
#[case(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)]
fn images_end_the_frame_in_their_initial_layout(#[case] initial: vk::ImageLayout) {
    let mut graph = RenderGraph::new(2);
    let history = graph.add_image("history", color_image().with_extent(64, 64).with_initial_layout(initial));
    let scratch = graph.add_image("scratch", color_image().with_extent(64, 64));

    let write = graph.add_operation(Contracted::new(
        "write",
        LayoutContract::ANY,
        LayoutContract::same(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
    ));
    graph.write(write, history).unwrap();
    graph.write(write, scratch).unwrap();

    for frame in 0..2 {
        let plan = graph.plan(frame).unwrap();
        assert_eq!(plan.final_layouts[&history], initial);
        // Scratch contents are not preserved, so nothing returns it anywhere
        assert!(plan.transitions().all(|t| t.resource != scratch || t.old_layout == vk::ImageLayout::UNDEFINED));
        assert_eq!(plan.final_layouts[&scratch], vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
}

#[test]
fn producers_come_before_consumers() {
    // a -> r0 -> b -> r1 -> d
    //      r0 -> c -> r2 -> d
    // e reads r3 which nothing writes
    let mut graph = RenderGraph::new(1);
    let r: Vec<_> = (0..4).map(|i| graph.add_image(format!("r{}", i), color_image().with_extent(8, 8))).collect();
    let ops: Vec<_> = ["d", "c", "b", "a", "e"].iter().map(|n| graph.add_operation(Contracted::any(n))).collect();
    let (d, c, b, a, e) = (ops[0], ops[1], ops[2], ops[3], ops[4]);

    graph.write(a, r[0]).unwrap();
    graph.read(b, r[0]).unwrap();
    graph.read(c, r[0]).unwrap();
    graph.write(b, r[1]).unwrap();
    graph.write(c, r[2]).unwrap();
    graph.read(d, r[1]).unwrap();
    graph.read(d, r[2]).unwrap();
    graph.read(e, r[3]).unwrap();

    let passes = graph.passes().unwrap();
    for edge in graph.connections().edges().iter().filter(|e| e.direction == Direction::Input) {
        for writer in graph.connections().writers(edge.resource) {
            assert!(
                pass_index(&passes, writer) < pass_index(&passes, edge.operation),
                "{} must run before {}",
                writer,
                edge.operation
            );
        }
    }
    assert_eq!(pass_index(&passes, e), 0);
    assert!(graph.describe().contains("pass 0: [a, e]"));
}

#[test]
fn shared_writers_never_share_a_pass() {
    let mut graph = RenderGraph::new(1);
    let target = graph.add_image("target", color_image().with_extent(8, 8));
    let other = graph.add_image("other", color_image().with_extent(8, 8));

    let ops: Vec<_> = (0..3).map(|i| graph.add_operation(Contracted::any(&format!("draw{}", i)))).collect();
    let solo = graph.add_operation(Contracted::any("solo"));
    for &op in &ops {
        graph.write(op, target).unwrap();
    }
    graph.write(solo, other).unwrap();

    let passes = graph.passes().unwrap();
    for pass in &passes {
        let writers = pass
            .operations
            .iter()
            .filter(|&&op| graph.connections().writes(op, target))
            .count();
        assert!(writers <= 1, "pass {:?} has {} writers of the same image", pass.operations, writers);
    }
    assert_eq!(passes.len(), 4);
    assert_eq!(passes[0].operations, [solo]);
}

#[test]
fn mismatched_target_extents_are_rejected() {
    let mut graph = RenderGraph::new(1);
    let big = graph.add_image("big", color_image().with_extent(64, 64));
    let small = graph.add_image("small", color_image().with_extent(32, 32));
    let op = graph.add_operation(Contracted::any("mrt"));
    graph.write(op, big).unwrap();
    graph.write(op, small).unwrap();

    match graph.operation_extent(op) {
        Err(GraphError::ExtentMismatch { operation, resource, expected, found }) => {
            assert_eq!(operation, "mrt");
            assert_eq!(resource, "small");
            assert_eq!(expected, vk::Extent2D { width: 64, height: 64 });
            assert_eq!(found, vk::Extent2D { width: 32, height: 32 });
        }
        other => panic!("expected an extent mismatch, got {:?}", other),
    }
}

#[test]
fn extents_follow_targets_or_fall_back_to_one_pixel() {
    let mut graph = RenderGraph::new(1);
    let relative = graph.add_image("relative", color_image());
    let buffer = graph.add_buffer("particles", 1024, vk::BufferUsageFlags::STORAGE_BUFFER);
    let draw = graph.add_operation(Contracted::any("draw"));
    let simulate = graph.add_operation(Contracted::any("simulate"));
    graph.write(draw, relative).unwrap();
    graph.write(simulate, buffer).unwrap();

    assert!(matches!(graph.operation_extent(draw), Err(GraphError::UnboundExtent { .. })));
    graph.bind_surface(SurfaceInfo::offscreen(800, 600, vk::Format::B8G8R8A8_SRGB));
    assert_eq!(graph.operation_extent(draw).unwrap(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(graph.operation_extent(simulate).unwrap(), vk::Extent2D { width: 1, height: 1 });
    // No swapchain image in the graph, so the requested count stands
    assert_eq!(graph.frames_in_flight(), 1);
}

#[test]
fn cycles_and_foreign_handles_are_errors() {
    let mut graph = RenderGraph::new(1);
    let a_out = graph.add_image("a_out", color_image().with_extent(8, 8));
    let b_out = graph.add_image("b_out", color_image().with_extent(8, 8));
    let source = graph.add_operation(Contracted::any("source"));
    let a = graph.add_operation(Contracted::any("a"));
    let b = graph.add_operation(Contracted::any("b"));
    let seed = graph.add_image("seed", color_image().with_extent(8, 8));

    graph.write(source, seed).unwrap();
    graph.read(a, seed).unwrap();
    graph.read(a, b_out).unwrap();
    graph.write(a, a_out).unwrap();
    graph.read(b, a_out).unwrap();
    graph.write(b, b_out).unwrap();

    assert!(matches!(graph.passes(), Err(GraphError::Cycle { .. })));
    assert!(graph.describe().starts_with("<unschedulable"));

    let mut other = RenderGraph::new(1);
    for i in 0..5 {
        other.add_image(format!("x{}", i), color_image());
    }
    let foreign = other.add_image("foreign", color_image());
    assert!(matches!(graph.read(a, foreign), Err(GraphError::UnknownResource(_))));
}

#[test]
fn cycle_with_no_source_operation_is_an_error() {
    let mut graph = RenderGraph::new(1);
    let ping = graph.add_image("ping", color_image().with_extent(8, 8));
    let pong = graph.add_image("pong", color_image().with_extent(8, 8));
    let a = graph.add_operation(Contracted::any("a"));
    let b = graph.add_operation(Contracted::any("b"));

    graph.read(a, ping).unwrap();
    graph.write(a, pong).unwrap();
    graph.read(b, pong).unwrap();
    graph.write(b, ping).unwrap();

    match graph.passes() {
        Err(GraphError::Cycle { operations }) => assert_eq!(operations, [a, b]),
        other => panic!("expected a cycle, got {:?}", other.map(|p| p.len())),
    }
}
