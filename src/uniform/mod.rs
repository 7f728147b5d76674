// Uniform views
//
// Byte-exact, named/indexed access into uniform memory laid out by a
// reflected BufferObject. A view is a cursor: the field it addresses, its
// absolute byte offset and size, and the array dimensions still waiting
// for an index.
//
//   set.get("Params").field("lights").at(2).field("color").write(&color);
//
// Navigation panics on layout mismatches (wrong name, wrong kind, index out
// of range, wrong byte size); `try_*` variants report the same conditions
// as `UniformError`. A null view has no storage: navigation returns another
// null view and writes are ignored.

mod storage;

pub use storage::{ExternalStorage, UniformData, UniformSet, UniformStorage};

use crate::reflection::{ArrayDim, BufferObject, Field, FieldType};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UniformError {
    #[error("'{field}' is {expected} bytes, got a {actual}-byte value")]
    SizeMismatch { field: String, expected: u32, actual: usize },

    #[error("index {index} out of range for '{field}' (length {len})")]
    IndexOutOfRange { field: String, index: u32, len: u32 },

    #[error("no field named '{name}' in '{parent}'")]
    UnknownField { parent: String, name: String },

    #[error("cannot {action} '{field}': view addresses {kind:?}")]
    WrongKind { field: String, kind: ViewKind, action: &'static str },

    #[error("'{field}' ends at byte {end} but storage holds {len}")]
    OutOfStorage { field: String, end: usize, len: usize },
}

/// What a view currently addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// A struct (or the block root); accepts `field`.
    Struct,
    /// A leaf value; accepts `write`/`read`.
    Variable,
    /// An array with at least one dimension left; accepts `at`.
    Array,
}

pub struct UniformView<'a> {
    bytes: Option<&'a mut [u8]>,
    /// Display name for diagnostics.
    label: &'a str,
    field: Option<&'a Field>,
    /// Children reachable through `field`.
    members: &'a [Field],
    dims: &'a [ArrayDim],
    offset: u32,
    size: u32,
    kind: ViewKind,
}

impl<'a> UniformView<'a> {
    /// Root view over a whole buffer object.
    pub fn new(object: &'a BufferObject, bytes: &'a mut [u8]) -> Self {
        Self {
            bytes: Some(bytes),
            label: &object.name,
            field: None,
            members: &object.fields,
            dims: &[],
            offset: 0,
            size: object.full_size(),
            kind: ViewKind::Struct,
        }
    }

    /// View that ignores writes and navigates to itself.
    pub fn null() -> Self {
        Self {
            bytes: None,
            label: "<null>",
            field: None,
            members: &[],
            dims: &[],
            offset: 0,
            size: 0,
            kind: ViewKind::Struct,
        }
    }

    pub fn is_null(&self) -> bool {
        self.bytes.is_none()
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Absolute byte offset from the start of the block.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn field_info(&self) -> Option<&'a Field> {
        self.field
    }

    /// Length of the outermost remaining array dimension.
    /// `None` for non-arrays and runtime-sized arrays.
    pub fn len(&self) -> Option<u32> {
        match self.kind {
            ViewKind::Array => self.dims.first().and_then(|d| d.len),
            _ => None,
        }
    }

    fn wrong_kind(&self, action: &'static str) -> UniformError {
        UniformError::WrongKind { field: self.label.to_string(), kind: self.kind, action }
    }

    pub fn try_field(&mut self, name: &str) -> Result<UniformView<'_>, UniformError> {
        if self.is_null() {
            return Ok(UniformView::null());
        }
        if self.kind != ViewKind::Struct {
            return Err(self.wrong_kind("select a field of"));
        }
        let field = self.members.iter().find(|f| f.name == name).ok_or_else(|| UniformError::UnknownField {
            parent: self.label.to_string(),
            name: name.to_string(),
        })?;

        let (kind, size) = match field.array.first() {
            Some(dim) => (ViewKind::Array, array_extent(dim)),
            None => (element_kind(field), field.size),
        };
        Ok(UniformView {
            bytes: self.bytes.as_deref_mut(),
            label: &field.name,
            field: Some(field),
            members: &field.members,
            dims: &field.array,
            offset: self.offset.saturating_add(field.offset),
            size,
            kind,
        })
    }

    pub fn try_at(&mut self, index: u32) -> Result<UniformView<'_>, UniformError> {
        if self.is_null() {
            return Ok(UniformView::null());
        }
        if self.kind != ViewKind::Array {
            return Err(self.wrong_kind("index"));
        }
        let (dim, rest) = match self.dims.split_first() {
            Some(split) => split,
            None => return Err(self.wrong_kind("index")),
        };
        if let Some(len) = dim.len {
            if index >= len {
                return Err(UniformError::IndexOutOfRange { field: self.label.to_string(), index, len });
            }
        }

        // Runtime arrays have no length to check against, so the element
        // offset itself may not fit.
        let offset = u64::from(self.offset) + u64::from(index) * u64::from(dim.stride);
        let offset = u32::try_from(offset).map_err(|_| UniformError::OutOfStorage {
            field: self.label.to_string(),
            end: usize::try_from(offset).unwrap_or(usize::MAX),
            len: self.storage_len(),
        })?;

        let (kind, size) = match (rest.first(), self.field) {
            (Some(next), _) => (ViewKind::Array, array_extent(next)),
            (None, Some(field)) => (element_kind(field), field.size),
            (None, None) => (ViewKind::Variable, dim.stride),
        };
        Ok(UniformView {
            bytes: self.bytes.as_deref_mut(),
            label: self.label,
            field: self.field,
            members: self.members,
            dims: rest,
            offset,
            size,
            kind,
        })
    }

    /// Copy `value` over the addressed bytes. `size_of::<T>()` must equal
    /// the view size.
    pub fn try_write<T: bytemuck::Pod>(&mut self, value: &T) -> Result<(), UniformError> {
        self.try_write_bytes(bytemuck::bytes_of(value))
    }

    pub fn try_write_bytes(&mut self, data: &[u8]) -> Result<(), UniformError> {
        if self.is_null() {
            return Ok(());
        }
        if self.kind == ViewKind::Array {
            return Err(self.wrong_kind("write"));
        }
        if data.len() != self.size as usize {
            return Err(UniformError::SizeMismatch {
                field: self.label.to_string(),
                expected: self.size,
                actual: data.len(),
            });
        }
        let range = self.range()?;
        if let Some(bytes) = self.bytes.as_deref_mut() {
            bytes[range].copy_from_slice(data);
        }
        Ok(())
    }

    pub fn try_read<T: bytemuck::Pod>(&self) -> Result<T, UniformError> {
        let bytes = match self.bytes.as_deref() {
            Some(bytes) => bytes,
            None => return Ok(T::zeroed()),
        };
        if self.kind == ViewKind::Array {
            return Err(self.wrong_kind("read"));
        }
        if std::mem::size_of::<T>() != self.size as usize {
            return Err(UniformError::SizeMismatch {
                field: self.label.to_string(),
                expected: self.size,
                actual: std::mem::size_of::<T>(),
            });
        }
        let range = self.range()?;
        Ok(bytemuck::pod_read_unaligned(&bytes[range]))
    }

    fn storage_len(&self) -> usize {
        self.bytes.as_deref().map_or(0, <[u8]>::len)
    }

    fn range(&self) -> Result<std::ops::Range<usize>, UniformError> {
        let start = self.offset as usize;
        let end = start + self.size as usize;
        let len = self.storage_len();
        if end > len {
            return Err(UniformError::OutOfStorage { field: self.label.to_string(), end, len });
        }
        Ok(start..end)
    }

    pub fn field(&mut self, name: &str) -> UniformView<'_> {
        self.try_field(name).unwrap_or_else(|e| panic!("uniform layout mismatch: {e}"))
    }

    pub fn at(&mut self, index: u32) -> UniformView<'_> {
        self.try_at(index).unwrap_or_else(|e| panic!("uniform layout mismatch: {e}"))
    }

    pub fn write<T: bytemuck::Pod>(&mut self, value: &T) {
        if let Err(e) = self.try_write(value) {
            panic!("uniform layout mismatch: {e}");
        }
    }

    pub fn read<T: bytemuck::Pod>(&self) -> T {
        self.try_read().unwrap_or_else(|e| panic!("uniform layout mismatch: {e}"))
    }

    /// Reborrow for repeated navigation from the same parent.
    pub fn view(&mut self) -> UniformView<'_> {
        UniformView {
            bytes: self.bytes.as_deref_mut(),
            label: self.label,
            field: self.field,
            members: self.members,
            dims: self.dims,
            offset: self.offset,
            size: self.size,
            kind: self.kind,
        }
    }
}

/// Bytes spanned by a sized array dimension; 0 for runtime arrays.
fn array_extent(dim: &ArrayDim) -> u32 {
    dim.len.map_or(0, |len| len.saturating_mul(dim.stride))
}

fn element_kind(field: &Field) -> ViewKind {
    if field.ty == FieldType::Struct {
        ViewKind::Struct
    } else {
        ViewKind::Variable
    }
}

impl std::fmt::Debug for UniformView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniformView")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("null", &self.is_null())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::BufferKind;

    fn leaf(name: &str, ty: FieldType, offset: u32, size: u32) -> Field {
        Field { name: name.into(), ty, offset, size, array: Vec::new(), members: Vec::new() }
    }

    // layout(std140) uniform Params { vec4 color; float weights[4]; Light lights[2]; }
    // struct Light { vec3 position; float radius; }
    fn params() -> BufferObject {
        let mut weights = leaf("weights", FieldType::Float, 16, 4);
        weights.array = vec![ArrayDim { len: Some(4), stride: 16 }];

        let mut lights = leaf("lights", FieldType::Struct, 80, 16);
        lights.array = vec![ArrayDim { len: Some(2), stride: 16 }];
        lights.members = vec![
            leaf("position", FieldType::Vec3, 0, 12),
            leaf("radius", FieldType::Float, 12, 4),
        ];

        BufferObject {
            name: "Params".into(),
            instance_name: "params".into(),
            kind: BufferKind::Uniform,
            binding: 0,
            descriptor_set: 0,
            fields: vec![leaf("color", FieldType::Vec4, 0, 16), weights, lights],
        }
    }

    #[test]
    fn sixteen_byte_write_lands_at_field_offset() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        let mut root = UniformView::new(&object, &mut bytes);

        let color = [0.25f32, 0.5, 0.75, 1.0];
        root.field("color").write(&color);

        assert_eq!(&bytes[0..16], bytemuck::bytes_of(&color));
        assert!(bytes[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn eight_byte_write_to_sixteen_byte_field_fails() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        let mut root = UniformView::new(&object, &mut bytes);

        let err = root.field("color").try_write(&[1.0f32, 2.0]).unwrap_err();
        assert_eq!(
            err,
            UniformError::SizeMismatch { field: "color".into(), expected: 16, actual: 8 }
        );
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "uniform layout mismatch")]
    fn panicking_write_rejects_wrong_size() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        UniformView::new(&object, &mut bytes).field("color").write(&1.0f32);
    }

    #[test]
    fn array_elements_are_stride_apart() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        let mut root = UniformView::new(&object, &mut bytes);

        let mut weights = root.field("weights");
        assert_eq!(weights.kind(), ViewKind::Array);
        assert_eq!(weights.len(), Some(4));
        for i in 0..4u32 {
            let mut element = weights.at(i);
            assert_eq!(element.kind(), ViewKind::Variable);
            assert_eq!((element.offset(), element.size()), (16 + i * 16, 4));
            element.write(&(i as f32 + 1.0));
        }

        for i in 0..4usize {
            let start = 16 + i * 16;
            let value: f32 = bytemuck::pod_read_unaligned(&bytes[start..start + 4]);
            assert_eq!(value, i as f32 + 1.0);
        }
    }

    #[test]
    fn indexing_past_the_end_fails() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        let mut root = UniformView::new(&object, &mut bytes);

        let err = root.field("weights").try_at(4).unwrap_err();
        assert_eq!(err, UniformError::IndexOutOfRange { field: "weights".into(), index: 4, len: 4 });
    }

    #[test]
    fn struct_array_elements_expose_members() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        let mut root = UniformView::new(&object, &mut bytes);

        let mut light = root.field("lights");
        let mut second = light.at(1);
        assert_eq!(second.kind(), ViewKind::Struct);
        second.field("radius").write(&8.0f32);

        let radius = root.field("lights").at(1).field("radius").read::<f32>();
        assert_eq!(radius, 8.0);
        assert_eq!(&bytes[108..112], bytemuck::bytes_of(&8.0f32));
    }

    #[test]
    fn wrong_kind_and_unknown_names_are_reported() {
        let object = params();
        let mut bytes = vec![0u8; object.full_size() as usize];
        let mut root = UniformView::new(&object, &mut bytes);

        assert!(matches!(root.try_field("missing"), Err(UniformError::UnknownField { .. })));
        assert!(matches!(root.field("color").try_at(0), Err(UniformError::WrongKind { .. })));
        assert!(matches!(root.field("weights").try_write(&[0u8; 64]), Err(UniformError::WrongKind { .. })));
    }

    // layout(std430) buffer Samples { uint count; vec4 data[]; }
    fn samples() -> BufferObject {
        let mut data = leaf("data", FieldType::Vec4, 16, 16);
        data.array = vec![ArrayDim { len: None, stride: 16 }];
        BufferObject {
            name: "Samples".into(),
            instance_name: "samples".into(),
            kind: BufferKind::Storage,
            binding: 0,
            descriptor_set: 0,
            fields: vec![leaf("count", FieldType::UInt, 0, 4), data],
        }
    }

    #[test]
    fn runtime_array_elements_are_bounded_by_storage() {
        let object = samples();
        let mut bytes = vec![0u8; 80];
        let mut root = UniformView::new(&object, &mut bytes);

        let mut data = root.field("data");
        assert_eq!(data.len(), None);
        data.at(3).write(&[2.0f32; 4]);
        assert!(matches!(data.at(4).try_write(&[2.0f32; 4]), Err(UniformError::OutOfStorage { end: 96, len: 80, .. })));

        assert_eq!(&bytes[64..80], bytemuck::bytes_of(&[2.0f32; 4]));
    }

    #[test]
    fn huge_runtime_index_does_not_wrap_onto_element_zero() {
        let object = samples();
        let mut bytes = vec![0u8; 80];
        let mut root = UniformView::new(&object, &mut bytes);

        let mut data = root.field("data");
        for index in [0x1000_0000, u32::MAX] {
            let err = data.try_at(index).unwrap_err();
            assert!(matches!(err, UniformError::OutOfStorage { len: 80, .. }), "{err}");
        }

        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn null_view_absorbs_everything() {
        let mut view = UniformView::null();
        let mut deep = view.field("anything");
        let mut deeper = deep.at(99);
        deeper.write(&[1.0f32; 4]);
        assert!(deeper.is_null());
        assert_eq!(deeper.read::<u32>(), 0);
    }
}
