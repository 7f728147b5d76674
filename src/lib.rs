// Stimulus render graph
//
// SPIR-V reflection, typed uniform access and a render graph that compiles a
// set of operations and resources into pre-recorded Vulkan command buffers.

pub mod backend;
pub mod config;
pub mod graph;
pub mod reflection;
pub mod shader_watch;
pub mod uniform;

pub use graph::{GraphError, OperationId, RenderGraph, ResourceId};
pub use reflection::{ReflectionError, ShaderReflection, ShaderStage};
pub use uniform::{UniformError, UniformView};
