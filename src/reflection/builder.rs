// Field tree construction from parsed SPIR-V declarations

use rspirv::spirv::{Dim, StorageClass, Word};

use super::spirv::{Decorations, Module, Type};
use super::{
    ArrayDim, BufferKind, BufferObject, Field, FieldType, ImageDim, ReflectionError, Sampler,
    ScalarKind, ShaderReflection, ShaderStage, StageVariable, StorageImage, SubpassInput,
};

pub(super) fn build(shader: &str, module: &Module) -> Result<ShaderReflection, ReflectionError> {
    let entry = module
        .entry_points
        .first()
        .ok_or_else(|| ReflectionError::NoEntryPoint { shader: shader.to_string() })?;
    let stage = ShaderStage::from_execution_model(entry.execution_model)
        .ok_or_else(|| ReflectionError::NoEntryPoint { shader: shader.to_string() })?;

    let builder = Builder { shader, module };
    let mut reflection = ShaderReflection {
        name: shader.to_string(),
        version: module.version,
        stage,
        entry_point: entry.name.clone(),
        local_size: entry.local_size,
        buffers: Vec::new(),
        push_constants: Vec::new(),
        samplers: Vec::new(),
        storage_images: Vec::new(),
        subpass_inputs: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
    };

    for variable in &module.variables {
        let pointee = match module.ty(shader, variable.pointer_type)? {
            Type::Pointer { pointee, .. } => *pointee,
            _ => continue,
        };

        match variable.storage_class {
            StorageClass::Uniform | StorageClass::StorageBuffer | StorageClass::PushConstant => {
                let object = builder.buffer_object(variable.id, variable.storage_class, pointee)?;
                if object.kind == BufferKind::PushConstant {
                    reflection.push_constants.push(object);
                } else {
                    reflection.buffers.push(object);
                }
            }
            StorageClass::UniformConstant => builder.opaque(variable.id, pointee, &mut reflection)?,
            StorageClass::Input | StorageClass::Output => {
                if !entry.interface.is_empty() && !entry.interface.contains(&variable.id) {
                    continue;
                }
                if let Some(stage_variable) = builder.stage_variable(variable.id, pointee)? {
                    if variable.storage_class == StorageClass::Input {
                        reflection.inputs.push(stage_variable);
                    } else {
                        reflection.outputs.push(stage_variable);
                    }
                }
            }
            _ => {}
        }
    }

    reflection.buffers.sort_by_key(|b| b.binding);
    reflection.samplers.sort_by_key(|s| s.binding);
    reflection.storage_images.sort_by_key(|s| s.binding);
    reflection.subpass_inputs.sort_by_key(|s| s.binding);
    reflection.inputs.sort_by_key(|v| v.location);
    reflection.outputs.sort_by_key(|v| v.location);

    Ok(reflection)
}

struct Builder<'a> {
    shader: &'a str,
    module: &'a Module,
}

impl Builder<'_> {
    fn missing(&self, target: impl Into<String>, decoration: &'static str) -> ReflectionError {
        ReflectionError::MissingDecoration {
            shader: self.shader.to_string(),
            target: target.into(),
            decoration,
        }
    }

    fn decorations(&self, id: Word) -> Decorations {
        self.module.decorations(id).cloned().unwrap_or_default()
    }

    fn variable_name(&self, id: Word) -> String {
        self.module.debug_name(id).to_string()
    }

    fn buffer_object(&self, variable: Word, storage_class: StorageClass, pointee: Word) -> Result<BufferObject, ReflectionError> {
        let instance_name = self.variable_name(variable);

        let ty = self.module.ty(self.shader, pointee)?;
        if matches!(ty, Type::Array { .. } | Type::RuntimeArray { .. }) {
            return Err(ReflectionError::BufferArray { shader: self.shader.to_string(), name: instance_name });
        }

        let type_decorations = self.decorations(pointee);
        let kind = match storage_class {
            StorageClass::PushConstant => BufferKind::PushConstant,
            StorageClass::StorageBuffer => BufferKind::Storage,
            _ if type_decorations.buffer_block => BufferKind::Storage,
            _ => BufferKind::Uniform,
        };

        let type_name = self.module.debug_name(pointee);
        let name = if type_name.is_empty() { instance_name.clone() } else { type_name.to_string() };

        let variable_decorations = self.decorations(variable);
        let binding = match kind {
            BufferKind::PushConstant => 0,
            _ => variable_decorations.binding.ok_or_else(|| self.missing(name.as_str(), "Binding"))?,
        };

        let fields = self.struct_members(&name, pointee)?;

        Ok(BufferObject {
            name,
            instance_name,
            kind,
            binding,
            descriptor_set: variable_decorations.descriptor_set.unwrap_or(0),
            fields,
        })
    }

    fn struct_members(&self, owner: &str, struct_id: Word) -> Result<Vec<Field>, ReflectionError> {
        let members = match self.module.ty(self.shader, struct_id)? {
            Type::Struct { members } => members,
            _ => {
                return Err(ReflectionError::UnsupportedType {
                    shader: self.shader.to_string(),
                    field: owner.to_string(),
                    base: "non-struct block".to_string(),
                    vecsize: 0,
                    columns: 0,
                })
            }
        };

        let mut fields = Vec::with_capacity(members.len());
        for (index, &member_type) in members.iter().enumerate() {
            let index = index as u32;
            let name = self.module.member_name(struct_id, index).to_string();
            let target = format!("{}.{}", owner, name);
            let decorations = self.module.member_decorations(struct_id, index).cloned().unwrap_or_default();
            let offset = decorations.offset.ok_or_else(|| self.missing(target.as_str(), "Offset"))?;
            fields.push(self.field(name, &target, member_type, offset, &decorations)?);
        }
        Ok(fields)
    }

    fn field(
        &self,
        name: String,
        target: &str,
        type_id: Word,
        offset: u32,
        member: &Decorations,
    ) -> Result<Field, ReflectionError> {
        // Peel array dimensions, outermost first; each array type carries its own stride.
        let mut array = Vec::new();
        let mut element = type_id;
        loop {
            match self.module.ty(self.shader, element)? {
                Type::Array { element: inner, length } => {
                    let stride = self
                        .decorations(element)
                        .array_stride
                        .ok_or_else(|| self.missing(target, "ArrayStride"))?;
                    let len = self
                        .module
                        .constants
                        .get(length)
                        .copied()
                        .ok_or_else(|| ReflectionError::UnknownId { shader: self.shader.to_string(), id: *length })?;
                    array.push(ArrayDim { len: Some(len), stride });
                    element = *inner;
                }
                Type::RuntimeArray { element: inner } => {
                    let stride = self
                        .decorations(element)
                        .array_stride
                        .ok_or_else(|| self.missing(target, "ArrayStride"))?;
                    array.push(ArrayDim { len: None, stride });
                    element = *inner;
                }
                _ => break,
            }
        }

        let (ty, size, members) = match self.module.ty(self.shader, element)? {
            Type::Struct { .. } => {
                let members = self.struct_members(target, element)?;
                let size = members.last().map_or(0, |last| last.offset + last.total_size());
                (FieldType::Struct, size, members)
            }
            Type::Matrix { column, columns } => {
                let (kind, rows) = self.vector_components(target, *column)?;
                let ty = self.translate(target, kind, rows, *columns)?;
                let stride = member.matrix_stride.ok_or_else(|| self.missing(target, "MatrixStride"))?;
                let size = if member.row_major { stride * rows } else { stride * columns };
                (ty, size, Vec::new())
            }
            _ => {
                let (kind, count) = self.vector_components(target, element)?;
                let ty = self.translate(target, kind, count, 1)?;
                (ty, kind.size() * count, Vec::new())
            }
        };

        Ok(Field { name, ty, offset, size, array, members })
    }

    /// (scalar kind, component count) of a scalar or vector type.
    fn vector_components(&self, target: &str, type_id: Word) -> Result<(ScalarKind, u32), ReflectionError> {
        match self.module.ty(self.shader, type_id)? {
            Type::Vector { component, count } => Ok((self.scalar(target, *component)?, *count)),
            _ => Ok((self.scalar(target, type_id)?, 1)),
        }
    }

    fn scalar(&self, target: &str, type_id: Word) -> Result<ScalarKind, ReflectionError> {
        let ty = self.module.ty(self.shader, type_id)?;
        let kind = match ty {
            Type::Bool => Some(ScalarKind::Bool),
            Type::Int { width: 32, signed: true } => Some(ScalarKind::Int),
            Type::Int { width: 32, signed: false } => Some(ScalarKind::UInt),
            Type::Int { width: 64, signed: true } => Some(ScalarKind::Int64),
            Type::Int { width: 64, signed: false } => Some(ScalarKind::UInt64),
            Type::Float { width: 32 } => Some(ScalarKind::Float),
            Type::Float { width: 64 } => Some(ScalarKind::Double),
            _ => None,
        };
        kind.ok_or_else(|| ReflectionError::UnsupportedType {
            shader: self.shader.to_string(),
            field: target.to_string(),
            base: format!("{:?}", ty),
            vecsize: 1,
            columns: 1,
        })
    }

    fn translate(&self, target: &str, kind: ScalarKind, vecsize: u32, columns: u32) -> Result<FieldType, ReflectionError> {
        FieldType::from_components(kind, vecsize, columns).ok_or_else(|| ReflectionError::UnsupportedType {
            shader: self.shader.to_string(),
            field: target.to_string(),
            base: format!("{:?}", kind),
            vecsize,
            columns,
        })
    }

    /// Samplers, storage images and subpass inputs.
    fn opaque(&self, variable: Word, pointee: Word, reflection: &mut ShaderReflection) -> Result<(), ReflectionError> {
        let name = self.variable_name(variable);
        let decorations = self.decorations(variable);

        let mut array_size = None;
        let mut ty_id = pointee;
        loop {
            match self.module.ty(self.shader, ty_id)? {
                Type::Array { element, length } => {
                    array_size = self.module.constants.get(length).copied();
                    ty_id = *element;
                }
                Type::RuntimeArray { element } => {
                    ty_id = *element;
                }
                _ => break,
            }
        }

        let binding = || decorations.binding.ok_or_else(|| self.missing(name.as_str(), "Binding"));
        let descriptor_set = decorations.descriptor_set.unwrap_or(0);

        match self.module.ty(self.shader, ty_id)? {
            Type::SampledImage { image } => {
                let (dim, arrayed) = match self.module.ty(self.shader, *image)? {
                    Type::Image { dim, arrayed, .. } => (ImageDim::from_spirv(*dim).unwrap_or(ImageDim::D2), *arrayed),
                    _ => (ImageDim::D2, false),
                };
                reflection.samplers.push(Sampler {
                    name: name.clone(),
                    binding: binding()?,
                    descriptor_set,
                    dim,
                    arrayed,
                    array_size,
                });
            }
            Type::Image { dim: Dim::DimSubpassData, .. } => {
                let input_attachment_index = decorations
                    .input_attachment_index
                    .ok_or_else(|| self.missing(name.as_str(), "InputAttachmentIndex"))?;
                reflection.subpass_inputs.push(SubpassInput {
                    name: name.clone(),
                    binding: binding()?,
                    descriptor_set,
                    input_attachment_index,
                });
            }
            Type::Image { dim, sampled: 2, .. } => {
                reflection.storage_images.push(StorageImage {
                    name: name.clone(),
                    binding: binding()?,
                    descriptor_set,
                    dim: ImageDim::from_spirv(*dim).unwrap_or(ImageDim::D2),
                    array_size,
                });
            }
            other => {
                log::debug!("{}: skipping uniform constant '{}' of type {:?}", self.shader, name, other);
            }
        }
        Ok(())
    }

    fn stage_variable(&self, variable: Word, pointee: Word) -> Result<Option<StageVariable>, ReflectionError> {
        let decorations = self.decorations(variable);
        if decorations.builtin.is_some() {
            return Ok(None);
        }

        let name = self.variable_name(variable);
        let mut array_size = None;
        let mut ty_id = pointee;
        if let Type::Array { element, length } = self.module.ty(self.shader, ty_id)? {
            array_size = self.module.constants.get(length).copied();
            ty_id = *element;
        }

        let ty = match self.module.ty(self.shader, ty_id)? {
            Type::Struct { members } => {
                // gl_PerVertex and friends
                let builtin_block = (0..members.len() as u32).any(|m| {
                    self.module
                        .member_decorations(ty_id, m)
                        .map_or(false, |d| d.builtin.is_some())
                });
                if builtin_block {
                    return Ok(None);
                }
                FieldType::Struct
            }
            Type::Matrix { column, columns } => {
                let (kind, rows) = self.vector_components(&name, *column)?;
                self.translate(&name, kind, rows, *columns)?
            }
            _ => {
                let (kind, count) = self.vector_components(&name, ty_id)?;
                self.translate(&name, kind, count, 1)?
            }
        };

        Ok(Some(StageVariable { name, location: decorations.location, ty, array_size }))
    }
}
