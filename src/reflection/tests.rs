use rspirv::binary::Assemble;
use rspirv::dr::{Builder, Operand};
use rspirv::spirv::{
    AddressingModel, BuiltIn, Capability, Decoration, Dim, ExecutionMode, ExecutionModel, ImageFormat, MemoryModel,
    StorageClass, Word,
};
use rstest::rstest;

use super::*;

fn module() -> Builder {
    let mut b = Builder::new();
    b.set_version(1, 0);
    b.capability(Capability::Shader);
    b.memory_model(AddressingModel::Logical, MemoryModel::GLSL450);
    b
}

fn finish(b: Builder) -> Vec<u32> {
    b.module().assemble()
}

fn literal(value: u32) -> [Operand; 1] {
    [Operand::LiteralBit32(value)]
}

/// Struct with named members at the given offsets.
fn struct_type(b: &mut Builder, name: &str, members: &[(&str, Word, u32)]) -> Word {
    let id = b.type_struct(members.iter().map(|(_, ty, _)| *ty));
    b.name(id, name);
    for (index, (member, _, offset)) in members.iter().enumerate() {
        b.member_name(id, index as u32, *member);
        b.member_decorate(id, index as u32, Decoration::Offset, literal(*offset));
    }
    id
}

fn array_type(b: &mut Builder, element: Word, len: u32, stride: u32) -> Word {
    let uint = b.type_int(32, 0);
    let length = b.constant_bit32(uint, len);
    let id = b.type_array(element, length);
    b.decorate(id, Decoration::ArrayStride, literal(stride));
    id
}

fn runtime_array_type(b: &mut Builder, element: Word, stride: u32) -> Word {
    let id = b.type_runtime_array(element);
    b.decorate(id, Decoration::ArrayStride, literal(stride));
    id
}

fn variable(b: &mut Builder, storage_class: StorageClass, pointee: Word, name: &str) -> Word {
    let pointer = b.type_pointer(None, storage_class, pointee);
    let id = b.variable(pointer, None, storage_class, None);
    b.name(id, name);
    id
}

/// Uniform block variable decorated with set/binding.
fn uniform_block(b: &mut Builder, block: Word, name: &str, set: u32, binding: u32) -> Word {
    b.decorate(block, Decoration::Block, []);
    let id = variable(b, StorageClass::Uniform, block, name);
    b.decorate(id, Decoration::DescriptorSet, literal(set));
    b.decorate(id, Decoration::Binding, literal(binding));
    id
}

fn entry_point(b: &mut Builder, model: ExecutionModel, interface: &[Word]) -> Word {
    let function = b.id();
    b.entry_point(model, function, "main", interface);
    function
}

fn params_ubo() -> Vec<u32> {
    let mut b = module();
    let float = b.type_float(32);
    let vec3 = b.type_vector(float, 3);
    let vec4 = b.type_vector(float, 4);
    let mat4 = b.type_matrix(vec4, 4);
    let block = struct_type(&mut b, "Params", &[("a", vec3, 0), ("b", float, 12), ("c", mat4, 16)]);
    b.member_decorate(block, 2, Decoration::MatrixStride, literal(16));
    uniform_block(&mut b, block, "params", 0, 1);
    entry_point(&mut b, ExecutionModel::Fragment, &[]);
    finish(b)
}

fn samples_ssbo(len: Option<u32>) -> Vec<u32> {
    let mut b = module();
    let float = b.type_float(32);
    let vec4 = b.type_vector(float, 4);
    let data = match len {
        Some(len) => array_type(&mut b, float, len, 4),
        None => runtime_array_type(&mut b, float, 4),
    };
    let block = struct_type(&mut b, "Samples", &[("header", vec4, 0), ("data", data, 16)]);
    b.decorate(block, Decoration::Block, []);
    let samples = variable(&mut b, StorageClass::StorageBuffer, block, "samples");
    b.decorate(samples, Decoration::Binding, literal(3));
    entry_point(&mut b, ExecutionModel::GLCompute, &[]);
    finish(b)
}

#[test]
fn ubo_fields_keep_declaration_order() {
    let reflection = ShaderReflection::parse("params.frag", &params_ubo()).unwrap();

    assert_eq!(reflection.stage, ShaderStage::Fragment);
    assert_eq!(reflection.entry_point, "main");
    assert_eq!(reflection.version, (1, 0));
    assert_eq!(reflection.buffers.len(), 1);

    let ubo = &reflection.buffers[0];
    assert_eq!(ubo.name, "Params");
    assert_eq!(ubo.instance_name, "params");
    assert_eq!(ubo.kind, BufferKind::Uniform);
    assert_eq!((ubo.descriptor_set, ubo.binding), (0, 1));

    let names: Vec<_> = ubo.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "c"]);
    let types: Vec<_> = ubo.fields.iter().map(|f| f.ty).collect();
    assert_eq!(types, [FieldType::Vec3, FieldType::Float, FieldType::Mat4]);

    for pair in ubo.fields.windows(2) {
        assert!(pair[1].offset >= pair[0].offset + pair[0].total_size());
    }

    let last = ubo.fields.last().unwrap();
    assert_eq!(last.size, 64);
    assert_eq!(ubo.full_size(), last.offset + last.size);
    assert_eq!(ubo.full_size(), 80);
    assert!(ubo.has_fixed_size());
}

#[test]
fn runtime_array_makes_block_unbounded() {
    let reflection = ShaderReflection::parse("samples.comp", &samples_ssbo(None)).unwrap();
    let ssbo = &reflection.buffers[0];

    assert_eq!(ssbo.kind, BufferKind::Storage);
    assert_eq!(ssbo.descriptor_set, 0);
    assert!(ssbo.field("data").unwrap().is_unbounded());
    assert!(!ssbo.has_fixed_size());
    assert_eq!(ssbo.full_size(), 0);
}

#[test]
fn fixed_array_contributes_stride_times_length() {
    let reflection = ShaderReflection::parse("samples.comp", &samples_ssbo(Some(8))).unwrap();
    let ssbo = &reflection.buffers[0];
    let data = ssbo.field("data").unwrap();

    assert!(ssbo.has_fixed_size());
    assert_eq!(data.array, vec![ArrayDim { len: Some(8), stride: 4 }]);
    assert_eq!(data.size, 4);
    assert_eq!(data.total_size(), 32);
    assert_eq!(ssbo.full_size(), 16 + 32);
}

#[test]
fn nested_structs_and_array_of_arrays() {
    let mut b = module();
    let float = b.type_float(32);
    let vec3 = b.type_vector(float, 3);
    let light = struct_type(&mut b, "Light", &[("position", vec3, 0), ("intensity", float, 12)]);
    let lights = array_type(&mut b, light, 4, 16);
    let row = array_type(&mut b, float, 3, 16);
    let grid = array_type(&mut b, row, 2, 48);
    let block = struct_type(&mut b, "Scene", &[("lights", lights, 0), ("grid", grid, 64)]);
    uniform_block(&mut b, block, "", 1, 0);
    entry_point(&mut b, ExecutionModel::Fragment, &[]);

    let reflection = ShaderReflection::parse("scene.frag", &finish(b)).unwrap();
    let scene = reflection.buffer("Scene").unwrap();
    assert_eq!(scene.descriptor_set, 1);

    let lights = scene.field("lights").unwrap();
    assert_eq!(lights.ty, FieldType::Struct);
    assert_eq!(lights.size, 16);
    assert_eq!(lights.total_size(), 64);
    assert_eq!(lights.member("intensity").unwrap().offset, 12);

    let grid = scene.field("grid").unwrap();
    assert_eq!(
        grid.array,
        vec![ArrayDim { len: Some(2), stride: 48 }, ArrayDim { len: Some(3), stride: 16 }]
    );
    assert_eq!(grid.size, 4);
    assert_eq!(scene.full_size(), 64 + 96);
}

#[test]
fn array_of_uniform_blocks_is_rejected() {
    let mut b = module();
    let float = b.type_float(32);
    let block = struct_type(&mut b, "Item", &[("value", float, 0)]);
    b.decorate(block, Decoration::Block, []);
    let blocks = array_type(&mut b, block, 3, 16);
    let items = variable(&mut b, StorageClass::Uniform, blocks, "items");
    b.decorate(items, Decoration::Binding, literal(0));
    entry_point(&mut b, ExecutionModel::Fragment, &[]);

    let err = ShaderReflection::parse("items.frag", &finish(b)).unwrap_err();
    assert!(matches!(err, ReflectionError::BufferArray { ref name, .. } if name == "items"));
}

#[test]
fn missing_offset_is_a_named_error() {
    let mut b = module();
    let float = b.type_float(32);
    // Member left without its Offset decoration.
    let block = b.type_struct([float]);
    b.name(block, "Bare");
    b.member_name(block, 0, "value");
    uniform_block(&mut b, block, "bare", 0, 0);
    entry_point(&mut b, ExecutionModel::Fragment, &[]);

    let err = ShaderReflection::parse("bare.frag", &finish(b)).unwrap_err();
    match err {
        ReflectionError::MissingDecoration { target, decoration, .. } => {
            assert_eq!(target, "Bare.value");
            assert_eq!(decoration, "Offset");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_binding_is_a_named_error() {
    let mut b = module();
    let float = b.type_float(32);
    let block = struct_type(&mut b, "Loose", &[("value", float, 0)]);
    b.decorate(block, Decoration::Block, []);
    variable(&mut b, StorageClass::Uniform, block, "loose");
    entry_point(&mut b, ExecutionModel::Fragment, &[]);

    let err = ShaderReflection::parse("loose.frag", &finish(b)).unwrap_err();
    assert!(matches!(err, ReflectionError::MissingDecoration { decoration: "Binding", .. }));
}

#[test]
fn half_floats_are_unsupported() {
    let mut b = module();
    let half = b.type_float(16);
    let block = struct_type(&mut b, "Half", &[("value", half, 0)]);
    uniform_block(&mut b, block, "half", 0, 0);
    entry_point(&mut b, ExecutionModel::Fragment, &[]);

    let err = ShaderReflection::parse("half.frag", &finish(b)).unwrap_err();
    assert!(err.to_string().contains("half.frag"));
    assert!(matches!(err, ReflectionError::UnsupportedType { .. }));
}

#[test]
fn descriptors_are_sorted_by_binding() {
    let mut b = module();
    let float = b.type_float(32);
    let image = b.type_image(float, Dim::Dim2D, 0, 0, 0, 1, ImageFormat::Unknown, None);
    let sampled = b.type_sampled_image(image);
    let subpass = b.type_image(float, Dim::DimSubpassData, 0, 0, 0, 2, ImageFormat::Unknown, None);

    let late = variable(&mut b, StorageClass::UniformConstant, sampled, "late");
    b.decorate(late, Decoration::Binding, literal(5));
    let early = variable(&mut b, StorageClass::UniformConstant, sampled, "early");
    b.decorate(early, Decoration::Binding, literal(2));
    let input = variable(&mut b, StorageClass::UniformConstant, subpass, "previous");
    b.decorate(input, Decoration::Binding, literal(0));
    b.decorate(input, Decoration::InputAttachmentIndex, literal(0));
    entry_point(&mut b, ExecutionModel::Fragment, &[]);

    let reflection = ShaderReflection::parse("sorted.frag", &finish(b)).unwrap();
    let names: Vec<_> = reflection.samplers.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["early", "late"]);
    assert_eq!(reflection.samplers[0].dim, ImageDim::D2);
    assert_eq!(reflection.subpass_inputs.len(), 1);
    assert_eq!(reflection.subpass_inputs[0].input_attachment_index, 0);
}

#[test]
fn stage_variables_skip_builtins_and_sort_by_location() {
    let mut b = module();
    let float = b.type_float(32);
    let vec2 = b.type_vector(float, 2);
    let vec3 = b.type_vector(float, 3);
    let vec4 = b.type_vector(float, 4);

    let uv = variable(&mut b, StorageClass::Input, vec2, "uv");
    b.decorate(uv, Decoration::Location, literal(1));
    let position = variable(&mut b, StorageClass::Input, vec3, "position");
    b.decorate(position, Decoration::Location, literal(0));

    let per_vertex = struct_type(&mut b, "gl_PerVertex", &[("gl_Position", vec4, 0)]);
    b.member_decorate(per_vertex, 0, Decoration::BuiltIn, [Operand::BuiltIn(BuiltIn::Position)]);
    let builtin_out = variable(&mut b, StorageClass::Output, per_vertex, "");
    let out_uv = variable(&mut b, StorageClass::Output, vec2, "out_uv");
    b.decorate(out_uv, Decoration::Location, literal(0));

    entry_point(&mut b, ExecutionModel::Vertex, &[uv, position, builtin_out, out_uv]);

    let reflection = ShaderReflection::parse("quad.vert", &finish(b)).unwrap();
    assert_eq!(reflection.stage, ShaderStage::Vertex);
    let inputs: Vec<_> = reflection.inputs.iter().map(|v| (v.location, v.ty)).collect();
    assert_eq!(inputs, [(Some(0), FieldType::Vec3), (Some(1), FieldType::Vec2)]);
    assert_eq!(reflection.outputs.len(), 1);
    assert_eq!(reflection.outputs[0].name, "out_uv");
}

#[test]
fn compute_reflection_reports_workgroup_and_storage_images() {
    let mut b = module();
    let float = b.type_float(32);
    let storage = b.type_image(float, Dim::Dim2D, 0, 0, 0, 2, ImageFormat::Rgba8, None);
    let target = variable(&mut b, StorageClass::UniformConstant, storage, "target");
    b.decorate(target, Decoration::Binding, literal(1));
    let function = entry_point(&mut b, ExecutionModel::GLCompute, &[]);
    b.execution_mode(function, ExecutionMode::LocalSize, [8u32, 8, 1]);

    let reflection = ShaderReflection::parse("fill.comp", &finish(b)).unwrap();
    assert_eq!(reflection.stage, ShaderStage::Compute);
    assert_eq!(reflection.local_size, Some([8, 8, 1]));
    assert_eq!(reflection.storage_images.len(), 1);
    assert_eq!(reflection.storage_images[0].binding, 1);
}

#[test]
fn bytes_and_words_reflect_identically() {
    let words = params_ubo();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let reflection = ShaderReflection::from_bytes("params.frag", &bytes).unwrap();
    assert_eq!(reflection.buffers[0].full_size(), 80);
}

#[test]
fn big_endian_binaries_are_swapped() {
    let words = params_ubo();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    assert_eq!(spirv_words("params.frag", &bytes).unwrap(), words);
}

#[rstest]
#[case::ragged(vec![0x03, 0x02, 0x23])]
#[case::no_magic(vec![0; 20])]
fn unreadable_binaries_name_the_shader(#[case] bytes: Vec<u8>) {
    let err = ShaderReflection::from_bytes("broken.spv", &bytes).unwrap_err();
    assert!(matches!(err, ReflectionError::Unreadable { .. }));
    assert!(err.to_string().starts_with("broken.spv:"));
}

#[rstest]
#[case(ScalarKind::Float, 3, 1, Some(FieldType::Vec3))]
#[case(ScalarKind::Double, 4, 4, Some(FieldType::DMat4))]
#[case(ScalarKind::Float, 3, 4, Some(FieldType::Mat4x3))]
#[case(ScalarKind::UInt64, 2, 1, Some(FieldType::U64Vec2))]
#[case(ScalarKind::Bool, 4, 1, Some(FieldType::BVec4))]
#[case(ScalarKind::Int, 2, 2, None)]
#[case(ScalarKind::Float, 5, 1, None)]
fn translates_component_triples(
    #[case] kind: ScalarKind,
    #[case] vecsize: u32,
    #[case] columns: u32,
    #[case] expected: Option<FieldType>,
) {
    assert_eq!(FieldType::from_components(kind, vecsize, columns), expected);
}
