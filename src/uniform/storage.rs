// Backing memory for uniform views

use std::ptr::NonNull;

use super::UniformView;
use crate::reflection::{BufferKind, BufferObject, ShaderReflection, ShaderStage};

/// Byte storage a `UniformData` can expose to views.
pub trait UniformStorage {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl UniformStorage for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// Externally owned memory, typically a persistently mapped GPU allocation.
pub struct ExternalStorage {
    ptr: NonNull<u8>,
    len: usize,
}

impl ExternalStorage {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// this value lives, and nothing else may access that memory meanwhile.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }
}

impl UniformStorage for ExternalStorage {
    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// One buffer object's layout plus the bytes it describes.
pub struct UniformData<S: UniformStorage = Vec<u8>> {
    object: BufferObject,
    storage: S,
}

impl UniformData<Vec<u8>> {
    /// Zeroed staging bytes sized to the block. Blocks ending in a runtime
    /// array get no room for it; use `with_len` for those.
    pub fn new(object: BufferObject) -> Self {
        let len = object.full_size() as usize;
        Self::with_len(object, len)
    }

    pub fn with_len(object: BufferObject, len: usize) -> Self {
        Self { object, storage: vec![0; len] }
    }
}

impl UniformData<ExternalStorage> {
    pub fn external(object: BufferObject, storage: ExternalStorage) -> Self {
        Self { object, storage }
    }
}

impl<S: UniformStorage> UniformData<S> {
    pub fn object(&self) -> &BufferObject {
        &self.object
    }

    pub fn name(&self) -> &str {
        &self.object.name
    }

    pub fn bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.bytes_mut()
    }

    pub fn view(&mut self) -> UniformView<'_> {
        UniformView::new(&self.object, self.storage.bytes_mut())
    }
}

/// Staging data for the uniform blocks and push constants one shader stage
/// declares. Storage buffers live in graph resources, so they have no staging
/// here and `get` hands out null views for them.
pub struct UniformSet {
    stage: ShaderStage,
    data: Vec<UniformData>,
}

impl UniformSet {
    pub fn new(reflection: &ShaderReflection) -> Self {
        let data = reflection
            .buffers
            .iter()
            .filter(|b| b.kind != BufferKind::Storage)
            .chain(&reflection.push_constants)
            .cloned()
            .map(UniformData::new)
            .collect();
        Self { stage: reflection.stage, data }
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// View over the block named `name` (type or instance name), or a null
    /// view when this stage declares no such block.
    pub fn get(&mut self, name: &str) -> UniformView<'_> {
        let stage = self.stage;
        match self.find_mut(name) {
            Some(data) => data.view(),
            None => {
                log::trace!("{:?} stage has no uniform block '{}'", stage, name);
                UniformView::null()
            }
        }
    }

    pub fn data(&self, name: &str) -> Option<&UniformData> {
        self.data.iter().find(|d| matches_name(d.object(), name))
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut UniformData> {
        self.data.iter_mut().find(|d| matches_name(d.object(), name))
    }

    /// The uniform block bound at (`set`, `binding`).
    pub fn block_at(&self, set: u32, binding: u32) -> Option<&UniformData> {
        self.uniform_blocks().find(|d| d.object().descriptor_set == set && d.object().binding == binding)
    }

    pub fn block_at_mut(&mut self, set: u32, binding: u32) -> Option<&mut UniformData> {
        self.data.iter_mut().find(|d| {
            let object = d.object();
            object.kind == BufferKind::Uniform && object.descriptor_set == set && object.binding == binding
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &UniformData> {
        self.data.iter()
    }

    /// Uniform blocks, without push constants.
    pub fn uniform_blocks(&self) -> impl Iterator<Item = &UniformData> {
        self.data.iter().filter(|d| d.object().kind == BufferKind::Uniform)
    }

    pub fn push_constants(&self) -> impl Iterator<Item = &UniformData> {
        self.data.iter().filter(|d| d.object().kind == BufferKind::PushConstant)
    }
}

fn matches_name(object: &BufferObject, name: &str) -> bool {
    object.name == name || object.instance_name == name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{Field, FieldType};

    fn block(name: &str, kind: BufferKind, binding: u32) -> BufferObject {
        BufferObject {
            name: name.into(),
            instance_name: name.to_lowercase(),
            kind,
            binding,
            descriptor_set: 0,
            fields: vec![Field {
                name: "value".into(),
                ty: FieldType::Vec4,
                offset: 0,
                size: 16,
                array: Vec::new(),
                members: Vec::new(),
            }],
        }
    }

    fn reflection() -> ShaderReflection {
        ShaderReflection {
            name: "test.frag".into(),
            version: (1, 0),
            stage: ShaderStage::Fragment,
            entry_point: "main".into(),
            local_size: None,
            buffers: vec![block("Globals", BufferKind::Uniform, 0), block("Particles", BufferKind::Storage, 1)],
            push_constants: vec![block("Push", BufferKind::PushConstant, 0)],
            samplers: Vec::new(),
            storage_images: Vec::new(),
            subpass_inputs: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[test]
    fn owned_storage_is_zeroed_and_exactly_sized() {
        let data = UniformData::new(block("Globals", BufferKind::Uniform, 0));
        assert_eq!(data.bytes(), &[0u8; 16]);
    }

    #[test]
    fn set_dispenses_one_instance_per_block() {
        let mut set = UniformSet::new(&reflection());
        assert_eq!(set.iter().count(), 2);
        assert_eq!(set.uniform_blocks().count(), 1);
        assert_eq!(set.push_constants().count(), 1);

        set.get("globals").field("value").write(&[1.0f32; 4]);
        let bytes = set.data("Globals").unwrap().bytes();
        assert_eq!(bytes, bytemuck::bytes_of(&[1.0f32; 4]));
    }

    #[test]
    fn missing_block_yields_null_view() {
        let mut set = UniformSet::new(&reflection());
        let mut view = set.get("Missing");
        assert!(view.is_null());
        view.field("value").write(&0u8);
    }

    #[test]
    fn storage_blocks_have_no_staging() {
        let mut set = UniformSet::new(&reflection());
        assert!(set.data("Particles").is_none());

        let mut view = set.get("Particles");
        assert!(view.is_null());
        view.field("value").write(&[1.0f32; 4]);
        assert!(set.iter().all(|d| d.object().kind != BufferKind::Storage));
    }

    #[test]
    fn blocks_are_found_by_binding() {
        let mut set = UniformSet::new(&reflection());
        assert_eq!(set.block_at(0, 0).map(|d| d.name()), Some("Globals"));
        assert!(set.block_at(0, 1).is_none());

        set.block_at_mut(0, 0).unwrap().bytes_mut()[0] = 7;
        assert_eq!(set.data("Globals").unwrap().bytes()[0], 7);
    }

    #[test]
    fn external_storage_shares_indexing_semantics() {
        let mut backing = [0u8; 16];
        let storage = unsafe { ExternalStorage::new(backing.as_mut_ptr(), backing.len()) }.unwrap();
        let mut data = UniformData::external(block("Globals", BufferKind::Uniform, 0), storage);

        data.view().field("value").write(&[2.0f32, 0.0, 0.0, 3.0]);
        drop(data);

        assert_eq!(&backing[..4], bytemuck::bytes_of(&2.0f32));
        assert_eq!(&backing[12..], bytemuck::bytes_of(&3.0f32));
    }
}
