// Shader reflection
//
// Turns a compiled SPIR-V binary into a typed description of its interface:
// uniform/storage buffer objects with their full field trees, samplers,
// storage images, subpass inputs and stage inputs/outputs.
//
// Every list is sorted by binding (descriptors) or location (stage
// variables) so descriptor set construction is deterministic.

mod builder;
pub(crate) mod spirv;

use ash::vk;
use rspirv::spirv::{Dim, ExecutionModel};
use std::io::Cursor;
use thiserror::Error;

/// Hard failures while reflecting a shader. All of them mean the binary
/// violates an assumption the rest of the engine depends on.
#[derive(Debug, Error)]
pub enum ReflectionError {
    #[error("{shader}: not a SPIR-V module (magic {found:#010x})")]
    BadMagic { shader: String, found: u32 },

    #[error("{shader}: unreadable SPIR-V binary: {source}")]
    Unreadable {
        shader: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{shader}: malformed module: {reason}")]
    Malformed { shader: String, reason: String },

    #[error("{shader}: reference to undeclared id %{id}")]
    UnknownId { shader: String, id: u32 },

    #[error("{shader}: module declares no entry point")]
    NoEntryPoint { shader: String },

    #[error("{shader}: unsupported type for '{field}' (base {base}, vector width {vecsize}, columns {columns})")]
    UnsupportedType {
        shader: String,
        field: String,
        base: String,
        vecsize: u32,
        columns: u32,
    },

    #[error("{shader}: '{target}' is missing required decoration {decoration}")]
    MissingDecoration {
        shader: String,
        target: String,
        decoration: &'static str,
    },

    #[error("{shader}: '{name}' is an array of buffer blocks; declare one binding per block instead")]
    BufferArray { shader: String, name: String },
}

/// Pipeline stage a shader module was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn from_execution_model(model: ExecutionModel) -> Option<Self> {
        match model {
            ExecutionModel::Vertex => Some(Self::Vertex),
            ExecutionModel::TessellationControl => Some(Self::TessellationControl),
            ExecutionModel::TessellationEvaluation => Some(Self::TessellationEvaluation),
            ExecutionModel::Geometry => Some(Self::Geometry),
            ExecutionModel::Fragment => Some(Self::Fragment),
            ExecutionModel::GLCompute => Some(Self::Compute),
            _ => None,
        }
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Scalar component kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Int64,
    UInt64,
    Float,
    Double,
}

impl ScalarKind {
    pub fn size(self) -> u32 {
        match self {
            Self::Int64 | Self::UInt64 | Self::Double => 8,
            _ => 4,
        }
    }
}

/// Type tag of a reflected field.
///
/// Matrices are named `MatCxR` (columns x rows) as in GLSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    BVec2,
    BVec3,
    BVec4,
    Int,
    IVec2,
    IVec3,
    IVec4,
    UInt,
    UVec2,
    UVec3,
    UVec4,
    Int64,
    I64Vec2,
    I64Vec3,
    I64Vec4,
    UInt64,
    U64Vec2,
    U64Vec3,
    U64Vec4,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Double,
    DVec2,
    DVec3,
    DVec4,
    Mat2,
    Mat2x3,
    Mat2x4,
    Mat3x2,
    Mat3,
    Mat3x4,
    Mat4x2,
    Mat4x3,
    Mat4,
    DMat2,
    DMat2x3,
    DMat2x4,
    DMat3x2,
    DMat3,
    DMat3x4,
    DMat4x2,
    DMat4x3,
    DMat4,
    Struct,
}

impl FieldType {
    /// Translate a (scalar kind, vector width, column count) triple.
    ///
    /// Returns `None` for combinations the engine does not model, such as
    /// boolean or integer matrices.
    pub fn from_components(kind: ScalarKind, vecsize: u32, columns: u32) -> Option<Self> {
        use FieldType::*;
        use ScalarKind as K;

        let ty = match (kind, vecsize, columns) {
            (K::Bool, 1, 1) => Bool,
            (K::Bool, 2, 1) => BVec2,
            (K::Bool, 3, 1) => BVec3,
            (K::Bool, 4, 1) => BVec4,
            (K::Int, 1, 1) => Int,
            (K::Int, 2, 1) => IVec2,
            (K::Int, 3, 1) => IVec3,
            (K::Int, 4, 1) => IVec4,
            (K::UInt, 1, 1) => UInt,
            (K::UInt, 2, 1) => UVec2,
            (K::UInt, 3, 1) => UVec3,
            (K::UInt, 4, 1) => UVec4,
            (K::Int64, 1, 1) => Int64,
            (K::Int64, 2, 1) => I64Vec2,
            (K::Int64, 3, 1) => I64Vec3,
            (K::Int64, 4, 1) => I64Vec4,
            (K::UInt64, 1, 1) => UInt64,
            (K::UInt64, 2, 1) => U64Vec2,
            (K::UInt64, 3, 1) => U64Vec3,
            (K::UInt64, 4, 1) => U64Vec4,
            (K::Float, 1, 1) => Float,
            (K::Float, 2, 1) => Vec2,
            (K::Float, 3, 1) => Vec3,
            (K::Float, 4, 1) => Vec4,
            (K::Double, 1, 1) => Double,
            (K::Double, 2, 1) => DVec2,
            (K::Double, 3, 1) => DVec3,
            (K::Double, 4, 1) => DVec4,
            (K::Float, 2, 2) => Mat2,
            (K::Float, 3, 2) => Mat2x3,
            (K::Float, 4, 2) => Mat2x4,
            (K::Float, 2, 3) => Mat3x2,
            (K::Float, 3, 3) => Mat3,
            (K::Float, 4, 3) => Mat3x4,
            (K::Float, 2, 4) => Mat4x2,
            (K::Float, 3, 4) => Mat4x3,
            (K::Float, 4, 4) => Mat4,
            (K::Double, 2, 2) => DMat2,
            (K::Double, 3, 2) => DMat2x3,
            (K::Double, 4, 2) => DMat2x4,
            (K::Double, 2, 3) => DMat3x2,
            (K::Double, 3, 3) => DMat3,
            (K::Double, 4, 3) => DMat3x4,
            (K::Double, 2, 4) => DMat4x2,
            (K::Double, 3, 4) => DMat4x3,
            (K::Double, 4, 4) => DMat4,
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_matrix(self) -> bool {
        use FieldType::*;
        matches!(
            self,
            Mat2 | Mat2x3 | Mat2x4 | Mat3x2 | Mat3 | Mat3x4 | Mat4x2 | Mat4x3 | Mat4
                | DMat2 | DMat2x3 | DMat2x4 | DMat3x2 | DMat3 | DMat3x4 | DMat4x2 | DMat4x3 | DMat4
        )
    }
}

/// One array dimension of a field. `len == None` marks a runtime-sized array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    pub len: Option<u32>,
    pub stride: u32,
}

/// A node in a shader type tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    /// Byte offset within the parent struct.
    pub offset: u32,
    /// Byte size of one element (after every array dimension is indexed).
    pub size: u32,
    /// Array dimensions, outermost first.
    pub array: Vec<ArrayDim>,
    /// Child fields for `FieldType::Struct`, in declaration order.
    pub members: Vec<Field>,
}

impl Field {
    pub fn is_array(&self) -> bool {
        !self.array.is_empty()
    }

    pub fn is_unbounded(&self) -> bool {
        self.array.first().map_or(false, |dim| dim.len.is_none())
    }

    /// Bytes covered by the field including every array element.
    /// Zero for runtime-sized arrays.
    pub fn total_size(&self) -> u32 {
        match self.array.first() {
            Some(ArrayDim { len: Some(len), stride }) => len * stride,
            Some(ArrayDim { len: None, .. }) => 0,
            None => self.size,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Field> {
        self.members.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Uniform,
    Storage,
    PushConstant,
}

/// A uniform/storage buffer block (or push-constant block).
#[derive(Debug, Clone, PartialEq)]
pub struct BufferObject {
    /// Block type name, falling back to the instance name.
    pub name: String,
    pub instance_name: String,
    pub kind: BufferKind,
    pub binding: u32,
    pub descriptor_set: u32,
    pub fields: Vec<Field>,
}

impl BufferObject {
    pub fn has_fixed_size(&self) -> bool {
        !self.fields.iter().any(Field::is_unbounded)
    }

    /// Last field's offset plus its size; 0 when the block ends in a
    /// runtime-sized array.
    pub fn full_size(&self) -> u32 {
        if !self.has_fixed_size() {
            return 0;
        }
        self.fields.last().map_or(0, |last| last.offset + last.total_size())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn descriptor_type(&self) -> Option<vk::DescriptorType> {
        match self.kind {
            BufferKind::Uniform => Some(vk::DescriptorType::UNIFORM_BUFFER),
            BufferKind::Storage => Some(vk::DescriptorType::STORAGE_BUFFER),
            BufferKind::PushConstant => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDim {
    D1,
    D2,
    D3,
    Cube,
    Rect,
    Buffer,
    SubpassData,
}

impl ImageDim {
    pub(crate) fn from_spirv(dim: Dim) -> Option<Self> {
        match dim {
            Dim::Dim1D => Some(Self::D1),
            Dim::Dim2D => Some(Self::D2),
            Dim::Dim3D => Some(Self::D3),
            Dim::DimCube => Some(Self::Cube),
            Dim::DimRect => Some(Self::Rect),
            Dim::DimBuffer => Some(Self::Buffer),
            Dim::DimSubpassData => Some(Self::SubpassData),
            _ => None,
        }
    }
}

/// A combined image sampler binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampler {
    pub name: String,
    pub binding: u32,
    pub descriptor_set: u32,
    pub dim: ImageDim,
    pub arrayed: bool,
    pub array_size: Option<u32>,
}

/// A storage image binding (`image2D` etc. in GLSL).
#[derive(Debug, Clone, PartialEq)]
pub struct StorageImage {
    pub name: String,
    pub binding: u32,
    pub descriptor_set: u32,
    pub dim: ImageDim,
    pub array_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubpassInput {
    pub name: String,
    pub binding: u32,
    pub descriptor_set: u32,
    pub input_attachment_index: u32,
}

/// A stage input or output variable.
#[derive(Debug, Clone, PartialEq)]
pub struct StageVariable {
    pub name: String,
    pub location: Option<u32>,
    pub ty: FieldType,
    pub array_size: Option<u32>,
}

/// Reflected interface of one shader module.
#[derive(Debug, Clone)]
pub struct ShaderReflection {
    pub name: String,
    pub version: (u8, u8),
    pub stage: ShaderStage,
    pub entry_point: String,
    /// Workgroup size for compute shaders.
    pub local_size: Option<[u32; 3]>,
    pub buffers: Vec<BufferObject>,
    pub push_constants: Vec<BufferObject>,
    pub samplers: Vec<Sampler>,
    pub storage_images: Vec<StorageImage>,
    pub subpass_inputs: Vec<SubpassInput>,
    pub inputs: Vec<StageVariable>,
    pub outputs: Vec<StageVariable>,
}

impl ShaderReflection {
    /// Reflect a SPIR-V word stream. `name` is only used in diagnostics.
    pub fn parse(name: &str, words: &[u32]) -> Result<Self, ReflectionError> {
        let module = spirv::Module::parse(name, words)?;
        let reflection = builder::build(name, &module)?;
        log::debug!(
            "Reflected {} ({:?}): {} buffers, {} samplers, {} inputs, {} outputs",
            name,
            reflection.stage,
            reflection.buffers.len(),
            reflection.samplers.len(),
            reflection.inputs.len(),
            reflection.outputs.len()
        );
        Ok(reflection)
    }

    /// Reflect a SPIR-V binary as read from disk.
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self, ReflectionError> {
        let words = spirv_words(name, bytes)?;
        Self::parse(name, &words)
    }

    pub fn buffer(&self, name: &str) -> Option<&BufferObject> {
        self.buffers.iter().find(|b| b.name == name || b.instance_name == name)
    }
}

/// Convert a SPIR-V binary blob into words (byte order fixed up).
pub fn spirv_words(name: &str, bytes: &[u8]) -> Result<Vec<u32>, ReflectionError> {
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|source| ReflectionError::Unreadable {
        shader: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests;
