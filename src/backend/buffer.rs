// Buffer and image allocation through gpu-allocator
//
// Host-visible uniform/storage buffers and device-local render targets.
// Every allocation goes through the device's shared allocator.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;

/// Create a buffer and bind freshly allocated memory to it.
///
/// `CpuToGpu` allocations stay persistently mapped; see `Allocation::mapped_slice_mut`.
pub fn create_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<(vk::Buffer, Allocation)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size.max(1))
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .with_context(|| format!("Failed to create buffer '{}'", name))?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device
        .allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .context("Failed to bind buffer memory")?;
    }

    Ok((buffer, allocation))
}

pub fn destroy_buffer(device: &VulkanDevice, buffer: vk::Buffer, allocation: Allocation) {
    if let Err(e) = device.allocator.lock().free(allocation) {
        log::warn!("Failed to free buffer allocation: {}", e);
    }
    unsafe { device.device.destroy_buffer(buffer, None) };
}

/// Create a 2D, single-mip, device-local image.
pub fn create_image(
    device: &VulkanDevice,
    name: &str,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, Allocation)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .with_context(|| format!("Failed to create image '{}'", name))?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device
        .allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for image '{}'", name))?;

    unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
            .context("Failed to bind image memory")?;
    }

    Ok((image, allocation))
}

pub fn destroy_image(device: &VulkanDevice, image: vk::Image, allocation: Allocation) {
    if let Err(e) = device.allocator.lock().free(allocation) {
        log::warn!("Failed to free image allocation: {}", e);
    }
    unsafe { device.device.destroy_image(image, None) };
}

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(subresource_range(aspect));

    unsafe { device.device.create_image_view(&view_info, None) }.context("Failed to create image view")
}

/// Whole-image range for single-mip, single-layer images.
pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Aspect implied by a format.
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}
