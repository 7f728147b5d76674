// Descriptor state derived from shader reflection
//
// Shared by the built-in operations. Layouts come straight from the reflected
// bindings of every stage, merged by (set, binding). Resources are matched to
// descriptors by connection order:
//   samplers        <- input images
//   storage images  <- output images
//   storage buffers <- buffer resources
// Uniform blocks get one host-visible buffer per frame in flight, filled from
// the stage's `UniformSet` on flush. A block several stages declare at the
// same (set, binding) is one buffer: writes through any stage's set are
// mirrored into the others before the next access or flush.
//
// Push constants are baked into the command buffers when the graph is
// compiled; later writes only take effect after a recompile.

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::collections::BTreeMap;

use crate::backend::{buffer, VulkanDevice};
use crate::graph::CompileContext;
use crate::reflection::{BufferKind, ShaderReflection, ShaderStage};
use crate::uniform::UniformSet;

#[derive(Debug, Clone, Copy)]
struct LayoutBinding {
    ty: vk::DescriptorType,
    count: u32,
    stages: vk::ShaderStageFlags,
}

/// A uniform block backed by per-frame GPU buffers.
struct UniformTarget {
    stage: usize,
    block: String,
    set: u32,
    binding: u32,
    size: u32,
}

pub struct ShaderBindings {
    stages: Vec<(ShaderReflection, UniformSet)>,
    layout_bindings: BTreeMap<(u32, u32), LayoutBinding>,
    targets: Vec<UniformTarget>,
    /// Stage whose uniforms were last handed out for writing.
    last_written: Option<usize>,
    /// Push-constant bytes as recorded, [stage][block].
    baked_push: Vec<Vec<Vec<u8>>>,
    stale_push_reported: bool,

    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layout: vk::PipelineLayout,
    pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    /// [frame][set]
    sets: Vec<Vec<vk::DescriptorSet>>,
    /// [frame][target]
    buffers: Vec<Vec<(vk::Buffer, Allocation)>>,
}

impl ShaderBindings {
    pub fn new(stages: Vec<ShaderReflection>) -> Self {
        let mut layout_bindings: BTreeMap<(u32, u32), LayoutBinding> = BTreeMap::new();
        let mut targets: Vec<UniformTarget> = Vec::new();

        let mut declare = |set: u32, binding: u32, ty: vk::DescriptorType, count: u32, stage: ShaderStage| {
            layout_bindings
                .entry((set, binding))
                .and_modify(|b| b.stages |= stage.to_vk())
                .or_insert(LayoutBinding { ty, count, stages: stage.to_vk() });
        };

        for (index, reflection) in stages.iter().enumerate() {
            let stage = reflection.stage;
            for object in &reflection.buffers {
                let Some(ty) = object.descriptor_type() else { continue };
                declare(object.descriptor_set, object.binding, ty, 1, stage);

                let shared = targets.iter().any(|t| t.set == object.descriptor_set && t.binding == object.binding);
                if object.kind == BufferKind::Uniform && !shared {
                    targets.push(UniformTarget {
                        stage: index,
                        block: object.name.clone(),
                        set: object.descriptor_set,
                        binding: object.binding,
                        size: object.full_size(),
                    });
                }
            }
            for sampler in &reflection.samplers {
                let count = sampler.array_size.unwrap_or(1);
                declare(sampler.descriptor_set, sampler.binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count, stage);
            }
            for image in &reflection.storage_images {
                let count = image.array_size.unwrap_or(1);
                declare(image.descriptor_set, image.binding, vk::DescriptorType::STORAGE_IMAGE, count, stage);
            }
            if !reflection.subpass_inputs.is_empty() {
                log::warn!("'{}': subpass inputs are not bound by built-in operations", reflection.name);
            }
        }

        let stages = stages
            .into_iter()
            .map(|reflection| {
                let uniforms = UniformSet::new(&reflection);
                (reflection, uniforms)
            })
            .collect();

        let mut bindings = Self {
            stages,
            layout_bindings,
            targets,
            last_written: None,
            baked_push: Vec::new(),
            stale_push_reported: false,
            set_layouts: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pool: vk::DescriptorPool::null(),
            sampler: vk::Sampler::null(),
            sets: Vec::new(),
            buffers: Vec::new(),
        };
        bindings.baked_push = bindings.push_constant_bytes();
        bindings
    }

    pub fn reflection(&self, stage: ShaderStage) -> Option<&ShaderReflection> {
        self.stages.iter().map(|(r, _)| r).find(|r| r.stage == stage)
    }

    pub fn uniforms_mut(&mut self, stage: ShaderStage) -> Option<&mut UniformSet> {
        self.sync_shared();
        let index = self.stages.iter().position(|(r, _)| r.stage == stage)?;
        self.last_written = Some(index);
        Some(&mut self.stages[index].1)
    }

    /// Mirror blocks shared between stages from the stage last written.
    fn sync_shared(&mut self) {
        let Some(source) = self.last_written.take() else {
            return;
        };
        for target in &self.targets {
            let Some(bytes) = self.stages[source].1.block_at(target.set, target.binding).map(|d| d.bytes().to_vec())
            else {
                continue;
            };
            for (index, (_, uniforms)) in self.stages.iter_mut().enumerate() {
                if index == source {
                    continue;
                }
                if let Some(data) = uniforms.block_at_mut(target.set, target.binding) {
                    let dst = data.bytes_mut();
                    let len = dst.len().min(bytes.len());
                    dst[..len].copy_from_slice(&bytes[..len]);
                }
            }
        }
    }

    fn push_constant_bytes(&self) -> Vec<Vec<Vec<u8>>> {
        self.stages
            .iter()
            .map(|(_, uniforms)| uniforms.push_constants().map(|d| d.bytes().to_vec()).collect())
            .collect()
    }

    /// Whether push constants were written since the command buffers were
    /// recorded.
    fn push_constants_stale(&self) -> bool {
        self.push_constant_bytes() != self.baked_push
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    fn set_count(&self) -> u32 {
        self.layout_bindings.keys().map(|&(set, _)| set + 1).max().unwrap_or(0)
    }

    /// Create layouts, the pipeline layout and per-frame descriptor sets
    /// pointing at the operation's resources.
    pub fn build(&mut self, ctx: &CompileContext<'_>) -> Result<()> {
        let device = ctx.device;

        for set in 0..self.set_count() {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
                .layout_bindings
                .range((set, 0)..=(set, u32::MAX))
                .map(|(&(_, binding), b)| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(binding)
                        .descriptor_type(b.ty)
                        .descriptor_count(b.count)
                        .stage_flags(b.stages)
                        .build()
                })
                .collect();
            let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            let layout = unsafe { device.device.create_descriptor_set_layout(&info, None) }
                .context("Failed to create descriptor set layout")?;
            self.set_layouts.push(layout);
        }

        let push_ranges: Vec<vk::PushConstantRange> = self
            .stages
            .iter()
            .flat_map(|(r, _)| r.push_constants.iter().map(move |p| (r.stage, p.full_size())))
            .map(|(stage, size)| vk::PushConstantRange { stage_flags: stage.to_vk(), offset: 0, size })
            .collect();
        self.pipeline_layout =
            crate::backend::pipeline::create_pipeline_layout(device, &self.set_layouts, &push_ranges)?;
        self.sync_shared();
        self.baked_push = self.push_constant_bytes();
        self.stale_push_reported = false;

        if self.layout_bindings.is_empty() {
            return Ok(());
        }

        self.create_pool(device, ctx.frames)?;
        if self.layout_bindings.values().any(|b| b.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER) {
            self.sampler = create_sampler(device)?;
        }

        for frame in 0..ctx.frames {
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.pool)
                .set_layouts(&self.set_layouts);
            let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
                .context("Failed to allocate descriptor sets")?;

            let mut frame_buffers = Vec::with_capacity(self.targets.len());
            for target in &self.targets {
                let label = format!("{}[{}]", target.block, frame);
                let (vk_buffer, allocation) = buffer::create_buffer(
                    device,
                    &label,
                    u64::from(target.size),
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                )?;
                let info = vk::DescriptorBufferInfo { buffer: vk_buffer, offset: 0, range: vk::WHOLE_SIZE };
                write_buffer(device, sets[target.set as usize], target.binding, vk::DescriptorType::UNIFORM_BUFFER, info);
                frame_buffers.push((vk_buffer, allocation));
            }
            self.buffers.push(frame_buffers);

            self.write_resources(ctx, frame, &sets)?;
            self.sets.push(sets);
        }

        log::debug!(
            "Operation {}: {} descriptor bindings in {} sets, {} uniform blocks",
            ctx.id,
            self.layout_bindings.len(),
            self.set_layouts.len(),
            self.targets.len()
        );
        Ok(())
    }

    fn create_pool(&mut self, device: &VulkanDevice, frames: usize) -> Result<()> {
        let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
        for b in self.layout_bindings.values() {
            *counts.entry(b.ty.as_raw()).or_default() += b.count * frames as u32;
        }
        let pool_sizes: Vec<vk::DescriptorPoolSize> = counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty: vk::DescriptorType::from_raw(ty), descriptor_count })
            .collect();

        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(self.set_layouts.len() as u32 * frames as u32)
            .pool_sizes(&pool_sizes);
        self.pool = unsafe { device.device.create_descriptor_pool(&info, None) }.context("Failed to create descriptor pool")?;
        Ok(())
    }

    fn write_resources(&self, ctx: &CompileContext<'_>, frame: usize, sets: &[vk::DescriptorSet]) -> Result<()> {
        let device = ctx.device;
        let mut input_images = ctx.inputs().filter(|(id, r)| r.is_image() && !ctx.connections.writes(ctx.id, *id));
        let mut output_images = ctx.outputs().filter(|(_, r)| r.is_image());
        let mut buffers = ctx.inputs().chain(ctx.outputs()).filter(|(_, r)| !r.is_image());

        for (reflection, _) in &self.stages {
            for sampler in &reflection.samplers {
                let Some((_, resource)) = input_images.next() else {
                    bail!("Sampler '{}' in '{}' has no input image to bind", sampler.name, reflection.name);
                };
                let view = resource
                    .image_view(frame)
                    .with_context(|| format!("Image '{}' has no view for frame {}", resource.name(), frame))?;
                let info = vk::DescriptorImageInfo {
                    sampler: self.sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                };
                write_image(device, sets[sampler.descriptor_set as usize], sampler.binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, info);
            }

            for image in &reflection.storage_images {
                let Some((_, resource)) = output_images.next() else {
                    bail!("Storage image '{}' in '{}' has no output image to bind", image.name, reflection.name);
                };
                let view = resource
                    .image_view(frame)
                    .with_context(|| format!("Image '{}' has no view for frame {}", resource.name(), frame))?;
                let info = vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                };
                write_image(device, sets[image.descriptor_set as usize], image.binding, vk::DescriptorType::STORAGE_IMAGE, info);
            }

            for object in reflection.buffers.iter().filter(|b| b.kind == BufferKind::Storage) {
                let Some((_, resource)) = buffers.next() else {
                    bail!("Storage buffer '{}' in '{}' has no buffer resource to bind", object.name, reflection.name);
                };
                let vk_buffer = resource
                    .vk_buffer(frame)
                    .with_context(|| format!("Buffer '{}' is not allocated", resource.name()))?;
                let info = vk::DescriptorBufferInfo { buffer: vk_buffer, offset: 0, range: vk::WHOLE_SIZE };
                write_buffer(device, sets[object.descriptor_set as usize], object.binding, vk::DescriptorType::STORAGE_BUFFER, info);
            }
        }
        Ok(())
    }

    /// Bind `frame`'s descriptor sets and the staged push constants.
    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, frame: usize) {
        unsafe {
            if let Some(sets) = self.sets.get(frame) {
                device.cmd_bind_descriptor_sets(cmd, bind_point, self.pipeline_layout, 0, sets, &[]);
            }
            for (reflection, uniforms) in &self.stages {
                for data in uniforms.push_constants() {
                    device.cmd_push_constants(cmd, self.pipeline_layout, reflection.stage.to_vk(), 0, data.bytes());
                }
            }
        }
    }

    /// Copy every uniform block's staging bytes into `frame`'s buffers.
    pub fn flush(&mut self, frame: usize) -> Result<()> {
        self.sync_shared();
        if !self.stale_push_reported && self.push_constants_stale() {
            log::warn!("Push constants changed after the graph was compiled; recompile to apply them");
            self.stale_push_reported = true;
        }
        let Some(frame_buffers) = self.buffers.get_mut(frame) else {
            return Ok(());
        };
        for (target, (_, allocation)) in self.targets.iter().zip(frame_buffers.iter_mut()) {
            let Some(data) = self.stages[target.stage].1.block_at(target.set, target.binding) else {
                continue;
            };
            let mapped = allocation
                .mapped_slice_mut()
                .with_context(|| format!("Uniform buffer '{}' is not host visible", target.block))?;
            let len = data.bytes().len().min(mapped.len());
            mapped[..len].copy_from_slice(&data.bytes()[..len]);
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            for frame_buffers in self.buffers.drain(..) {
                for (vk_buffer, allocation) in frame_buffers {
                    buffer::destroy_buffer(device, vk_buffer, allocation);
                }
            }
            self.sets.clear();
            if self.pool != vk::DescriptorPool::null() {
                device.device.destroy_descriptor_pool(self.pool, None);
                self.pool = vk::DescriptorPool::null();
            }
            if self.sampler != vk::Sampler::null() {
                device.device.destroy_sampler(self.sampler, None);
                self.sampler = vk::Sampler::null();
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.device.destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            for layout in self.set_layouts.drain(..) {
                device.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

fn write_image(device: &VulkanDevice, set: vk::DescriptorSet, binding: u32, ty: vk::DescriptorType, info: vk::DescriptorImageInfo) {
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .image_info(std::slice::from_ref(&info))
        .build();
    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

fn write_buffer(device: &VulkanDevice, set: vk::DescriptorSet, binding: u32, ty: vk::DescriptorType, info: vk::DescriptorBufferInfo) {
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .buffer_info(std::slice::from_ref(&info))
        .build();
    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(vk::LOD_CLAMP_NONE);
    unsafe { device.device.create_sampler(&info, None) }.context("Failed to create sampler")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{BufferObject, Field, FieldType};

    fn block(name: &str, kind: BufferKind) -> BufferObject {
        BufferObject {
            name: name.into(),
            instance_name: name.to_lowercase(),
            kind,
            binding: 0,
            descriptor_set: 0,
            fields: vec![Field {
                name: "tint".into(),
                ty: FieldType::Vec4,
                offset: 0,
                size: 16,
                array: Vec::new(),
                members: Vec::new(),
            }],
        }
    }

    fn reflection(stage: ShaderStage, buffers: Vec<BufferObject>, push_constants: Vec<BufferObject>) -> ShaderReflection {
        ShaderReflection {
            name: format!("{stage:?}"),
            version: (1, 0),
            stage,
            entry_point: "main".into(),
            local_size: None,
            buffers,
            push_constants,
            samplers: Vec::new(),
            storage_images: Vec::new(),
            subpass_inputs: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn shared_params() -> ShaderBindings {
        ShaderBindings::new(vec![
            reflection(ShaderStage::Vertex, vec![block("Params", BufferKind::Uniform)], Vec::new()),
            reflection(ShaderStage::Fragment, vec![block("Params", BufferKind::Uniform)], Vec::new()),
        ])
    }

    fn staged(bindings: &ShaderBindings, target: usize) -> Vec<u8> {
        let target = &bindings.targets[target];
        bindings.stages[target.stage].1.block_at(target.set, target.binding).unwrap().bytes().to_vec()
    }

    #[test]
    fn shared_block_is_one_target_for_both_stages() {
        let bindings = shared_params();
        assert_eq!(bindings.targets.len(), 1);
        let layout = bindings.layout_bindings[&(0, 0)];
        assert_eq!(layout.stages, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn writes_through_later_stage_reach_the_flushed_block() {
        let mut bindings = shared_params();
        let tint = [0.25f32, 0.5, 0.75, 1.0];
        bindings.uniforms_mut(ShaderStage::Fragment).unwrap().get("Params").field("tint").write(&tint);

        bindings.flush(0).unwrap();

        assert_eq!(staged(&bindings, 0), bytemuck::bytes_of(&tint));
    }

    #[test]
    fn stages_see_each_others_writes() {
        let mut bindings = shared_params();
        bindings.uniforms_mut(ShaderStage::Vertex).unwrap().get("params").field("tint").write(&[1.0f32; 4]);
        bindings.uniforms_mut(ShaderStage::Fragment).unwrap().get("params").field("tint").write(&[2.0f32; 4]);

        let vertex = bindings.uniforms_mut(ShaderStage::Vertex).unwrap();
        assert_eq!(vertex.data("Params").unwrap().bytes(), bytemuck::bytes_of(&[2.0f32; 4]));
    }

    #[test]
    fn push_constant_writes_after_recording_are_detected() {
        let mut bindings = ShaderBindings::new(vec![reflection(
            ShaderStage::Compute,
            Vec::new(),
            vec![block("Push", BufferKind::PushConstant)],
        )]);
        assert!(!bindings.push_constants_stale());

        bindings.uniforms_mut(ShaderStage::Compute).unwrap().get("Push").field("tint").write(&[3.0f32; 4]);

        assert!(bindings.push_constants_stale());
        bindings.flush(0).unwrap();
        assert!(bindings.stale_push_reported);
    }
}
