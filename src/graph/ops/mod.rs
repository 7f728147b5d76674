// Built-in operations
//
// Each owns its pipeline state and derives descriptor layouts from the
// reflection of its shaders.

mod bindings;
mod clear;
mod compute;
mod render;

pub use bindings::ShaderBindings;
pub use clear::ClearOperation;
pub use compute::ComputeOperation;
pub use render::RenderOperation;
