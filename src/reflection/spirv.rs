// SPIR-V declaration tables
//
// Loads a module with rspirv and indexes the declarations reflection needs:
// names, decorations, types, constants, variables and entry points. Function
// bodies are ignored. Nothing here interprets layout; see builder.rs.

use std::collections::HashMap;

use rspirv::dr::{self, Instruction, Operand};
use rspirv::spirv::{BuiltIn, Decoration, Dim, ExecutionMode, ExecutionModel, Op, StorageClass, Word, MAGIC_NUMBER};

use super::ReflectionError;

/// Decorations attached to an id or a struct member.
///
/// Every field is optional at this level; callers decide which ones are
/// required for the construct they are reflecting.
#[derive(Debug, Clone, Default)]
pub struct Decorations {
    pub binding: Option<u32>,
    pub descriptor_set: Option<u32>,
    pub offset: Option<u32>,
    pub array_stride: Option<u32>,
    pub matrix_stride: Option<u32>,
    pub location: Option<u32>,
    pub input_attachment_index: Option<u32>,
    pub builtin: Option<BuiltIn>,
    pub block: bool,
    pub buffer_block: bool,
    pub row_major: bool,
}

impl Decorations {
    fn apply(&mut self, decoration: Decoration, params: &[Operand]) {
        let literal = params.iter().find_map(|op| match op {
            Operand::LiteralBit32(value) => Some(*value),
            _ => None,
        });
        match decoration {
            Decoration::Block => self.block = true,
            Decoration::BufferBlock => self.buffer_block = true,
            Decoration::RowMajor => self.row_major = true,
            Decoration::ArrayStride => self.array_stride = literal,
            Decoration::MatrixStride => self.matrix_stride = literal,
            Decoration::Location => self.location = literal,
            Decoration::Binding => self.binding = literal,
            Decoration::DescriptorSet => self.descriptor_set = literal,
            Decoration::Offset => self.offset = literal,
            Decoration::InputAttachmentIndex => self.input_attachment_index = literal,
            Decoration::BuiltIn => {
                self.builtin = params.iter().find_map(|op| match op {
                    Operand::BuiltIn(builtin) => Some(*builtin),
                    _ => None,
                })
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Word, count: u32 },
    Matrix { column: Word, columns: u32 },
    Image { sampled_type: Word, dim: Dim, arrayed: bool, multisampled: bool, sampled: u32 },
    Sampler,
    SampledImage { image: Word },
    Array { element: Word, length: Word },
    RuntimeArray { element: Word },
    Struct { members: Vec<Word> },
    Pointer { storage_class: StorageClass, pointee: Word },
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub id: Word,
    pub pointer_type: Word,
    pub storage_class: StorageClass,
}

#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub execution_model: ExecutionModel,
    pub function: Word,
    pub name: String,
    pub interface: Vec<Word>,
    pub local_size: Option<[u32; 3]>,
}

/// Declarations of one SPIR-V module.
#[derive(Debug, Default)]
pub struct Module {
    pub version: (u8, u8),
    pub names: HashMap<Word, String>,
    pub member_names: HashMap<(Word, u32), String>,
    pub decorations: HashMap<Word, Decorations>,
    pub member_decorations: HashMap<(Word, u32), Decorations>,
    pub types: HashMap<Word, Type>,
    pub constants: HashMap<Word, u32>,
    pub variables: Vec<Variable>,
    pub entry_points: Vec<EntryPoint>,
}

/// Typed operand access for one instruction, failing with the shader name.
struct Operands<'a> {
    shader: &'a str,
    inst: &'a Instruction,
}

impl<'a> Operands<'a> {
    fn malformed(&self) -> ReflectionError {
        ReflectionError::Malformed {
            shader: self.shader.to_string(),
            reason: format!("unexpected operands for Op{:?}", self.inst.class.opcode),
        }
    }

    fn get(&self, index: usize) -> Result<&'a Operand, ReflectionError> {
        self.inst.operands.get(index).ok_or_else(|| self.malformed())
    }

    fn id(&self, index: usize) -> Result<Word, ReflectionError> {
        match self.get(index)? {
            Operand::IdRef(id) => Ok(*id),
            _ => Err(self.malformed()),
        }
    }

    fn literal(&self, index: usize) -> Result<u32, ReflectionError> {
        match self.get(index)? {
            Operand::LiteralBit32(value) => Ok(*value),
            _ => Err(self.malformed()),
        }
    }

    fn string(&self, index: usize) -> Result<String, ReflectionError> {
        match self.get(index)? {
            Operand::LiteralString(value) => Ok(value.clone()),
            _ => Err(self.malformed()),
        }
    }

    fn decoration(&self, index: usize) -> Result<Decoration, ReflectionError> {
        match self.get(index)? {
            Operand::Decoration(decoration) => Ok(*decoration),
            _ => Err(self.malformed()),
        }
    }

    fn result_id(&self) -> Result<Word, ReflectionError> {
        self.inst.result_id.ok_or_else(|| self.malformed())
    }

    fn rest(&self, from: usize) -> &'a [Operand] {
        self.inst.operands.get(from..).unwrap_or(&[])
    }
}

impl Module {
    pub fn parse(shader: &str, words: &[u32]) -> Result<Self, ReflectionError> {
        match words.first() {
            Some(&MAGIC_NUMBER) => {}
            found => {
                return Err(ReflectionError::BadMagic {
                    shader: shader.to_string(),
                    found: found.copied().unwrap_or(0),
                })
            }
        }

        let loaded = dr::load_words(words).map_err(|state| ReflectionError::Malformed {
            shader: shader.to_string(),
            reason: format!("{:?}", state),
        })?;

        let mut module = Module {
            version: loaded.header.as_ref().map_or((1, 0), |header| header.version()),
            ..Default::default()
        };

        for inst in &loaded.debug_names {
            module.record_name(shader, inst)?;
        }
        for inst in &loaded.annotations {
            module.record_annotation(shader, inst)?;
        }
        for inst in &loaded.types_global_values {
            module.record_declaration(shader, inst)?;
        }

        let mut local_sizes = HashMap::new();
        for inst in &loaded.execution_modes {
            let ops = Operands { shader, inst };
            if let Operand::ExecutionMode(ExecutionMode::LocalSize) = ops.get(1)? {
                local_sizes.insert(ops.id(0)?, [ops.literal(2)?, ops.literal(3)?, ops.literal(4)?]);
            }
        }

        for inst in &loaded.entry_points {
            let ops = Operands { shader, inst };
            let execution_model = match ops.get(0)? {
                Operand::ExecutionModel(model) => *model,
                _ => return Err(ops.malformed()),
            };
            let function = ops.id(1)?;
            let interface = ops
                .rest(3)
                .iter()
                .filter_map(|op| match op {
                    Operand::IdRef(id) => Some(*id),
                    _ => None,
                })
                .collect();
            module.entry_points.push(EntryPoint {
                execution_model,
                function,
                name: ops.string(2)?,
                interface,
                local_size: local_sizes.get(&function).copied(),
            });
        }

        Ok(module)
    }

    fn record_name(&mut self, shader: &str, inst: &Instruction) -> Result<(), ReflectionError> {
        let ops = Operands { shader, inst };
        match inst.class.opcode {
            Op::Name => {
                self.names.insert(ops.id(0)?, ops.string(1)?);
            }
            Op::MemberName => {
                self.member_names.insert((ops.id(0)?, ops.literal(1)?), ops.string(2)?);
            }
            _ => {}
        }
        Ok(())
    }

    fn record_annotation(&mut self, shader: &str, inst: &Instruction) -> Result<(), ReflectionError> {
        let ops = Operands { shader, inst };
        match inst.class.opcode {
            Op::Decorate => {
                let decoration = ops.decoration(1)?;
                self.decorations.entry(ops.id(0)?).or_default().apply(decoration, ops.rest(2));
            }
            Op::MemberDecorate => {
                let decoration = ops.decoration(2)?;
                self.member_decorations
                    .entry((ops.id(0)?, ops.literal(1)?))
                    .or_default()
                    .apply(decoration, ops.rest(3));
            }
            _ => {}
        }
        Ok(())
    }

    fn record_declaration(&mut self, shader: &str, inst: &Instruction) -> Result<(), ReflectionError> {
        let ops = Operands { shader, inst };
        let ty = match inst.class.opcode {
            Op::TypeVoid => Type::Void,
            Op::TypeBool => Type::Bool,
            Op::TypeInt => Type::Int { width: ops.literal(0)?, signed: ops.literal(1)? != 0 },
            Op::TypeFloat => Type::Float { width: ops.literal(0)? },
            Op::TypeVector => Type::Vector { component: ops.id(0)?, count: ops.literal(1)? },
            Op::TypeMatrix => Type::Matrix { column: ops.id(0)?, columns: ops.literal(1)? },
            Op::TypeImage => {
                let dim = match ops.get(1)? {
                    Operand::Dim(dim) => *dim,
                    _ => return Err(ops.malformed()),
                };
                Type::Image {
                    sampled_type: ops.id(0)?,
                    dim,
                    arrayed: ops.literal(3)? != 0,
                    multisampled: ops.literal(4)? != 0,
                    sampled: ops.literal(5)?,
                }
            }
            Op::TypeSampler => Type::Sampler,
            Op::TypeSampledImage => Type::SampledImage { image: ops.id(0)? },
            Op::TypeArray => Type::Array { element: ops.id(0)?, length: ops.id(1)? },
            Op::TypeRuntimeArray => Type::RuntimeArray { element: ops.id(0)? },
            Op::TypeStruct => {
                let members = (0..inst.operands.len()).map(|index| ops.id(index)).collect::<Result<_, _>>()?;
                Type::Struct { members }
            }
            Op::TypePointer => {
                let storage_class = match ops.get(0)? {
                    Operand::StorageClass(class) => *class,
                    _ => return Err(ops.malformed()),
                };
                Type::Pointer { storage_class, pointee: ops.id(1)? }
            }
            Op::Constant | Op::SpecConstant => {
                // Only the low word matters: constants feed array lengths.
                let value = match ops.get(0)? {
                    Operand::LiteralBit32(value) => *value,
                    Operand::LiteralBit64(value) => *value as u32,
                    _ => return Err(ops.malformed()),
                };
                self.constants.insert(ops.result_id()?, value);
                return Ok(());
            }
            Op::Variable => {
                let storage_class = match ops.get(0)? {
                    Operand::StorageClass(class) => *class,
                    _ => return Err(ops.malformed()),
                };
                self.variables.push(Variable {
                    id: ops.result_id()?,
                    pointer_type: inst.result_type.ok_or_else(|| ops.malformed())?,
                    storage_class,
                });
                return Ok(());
            }
            _ => return Ok(()),
        };

        self.types.insert(ops.result_id()?, ty);
        Ok(())
    }

    pub fn ty(&self, shader: &str, id: Word) -> Result<&Type, ReflectionError> {
        self.types.get(&id).ok_or_else(|| ReflectionError::UnknownId { shader: shader.to_string(), id })
    }

    pub fn decorations(&self, id: Word) -> Option<&Decorations> {
        self.decorations.get(&id)
    }

    pub fn member_decorations(&self, struct_id: Word, member: u32) -> Option<&Decorations> {
        self.member_decorations.get(&(struct_id, member))
    }

    pub fn member_name(&self, struct_id: Word, member: u32) -> &str {
        self.member_names.get(&(struct_id, member)).map(String::as_str).unwrap_or("")
    }

    pub fn debug_name(&self, id: Word) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let words = [0xdead_beef, 0x0001_0000, 0, 1, 0];
        assert!(matches!(
            Module::parse("bad", &words),
            Err(ReflectionError::BadMagic { found: 0xdead_beef, .. })
        ));
        assert!(matches!(Module::parse("empty", &[]), Err(ReflectionError::BadMagic { found: 0, .. })));
    }

    #[test]
    fn rejects_instruction_past_end() {
        // OpName claiming 4 words with only 2 present
        let words = [MAGIC_NUMBER, 0x0001_0300, 0, 8, 0, (4 << 16) | Op::Name as u32, 1];
        let err = Module::parse("short", &words).unwrap_err();
        assert!(matches!(err, ReflectionError::Malformed { .. }));
        assert!(err.to_string().starts_with("short:"));
    }

    #[test]
    fn header_only_module_has_nothing_declared() {
        let module = Module::parse("header", &[MAGIC_NUMBER, 0x0001_0300, 0, 1, 0]).unwrap();
        assert_eq!(module.version, (1, 3));
        assert!(module.entry_points.is_empty());
        assert!(module.types.is_empty());
    }
}
