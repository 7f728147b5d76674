// Graph resources
//
// A closed set of kinds: graph-owned images, host-visible buffers and the
// swapchain's images. Each kind keeps one instance per frame in flight; the
// graph talks to them through the capability methods on `Resource`.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use crate::backend::{buffer, VulkanDevice};

/// How an image's size is chosen at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageExtent {
    Absolute(vk::Extent2D),
    /// Track the bound surface; resized on every recompile.
    Swapchain,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub extent: ImageExtent,
    /// Layout the image rests in between frames. `UNDEFINED` means the
    /// contents are not preserved across frames.
    pub initial_layout: vk::ImageLayout,
}

impl ImageDesc {
    pub fn new(format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            usage,
            extent: ImageExtent::Swapchain,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = ImageExtent::Absolute(vk::Extent2D { width, height });
        self
    }

    pub fn with_initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.initial_layout = layout;
        self
    }
}

/// What the graph needs to know about the presentation target.
#[derive(Debug, Clone)]
pub struct SurfaceInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// One image/view pair per swapchain image.
    pub images: Vec<(vk::Image, vk::ImageView)>,
}

impl SurfaceInfo {
    /// A surface with no images, for graphs that never present.
    pub fn offscreen(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format,
            images: Vec::new(),
        }
    }
}

struct ImageInstance {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

pub struct ImageResource {
    desc: ImageDesc,
    instances: Vec<ImageInstance>,
    imported: bool,
    extent: Option<vk::Extent2D>,
}

pub struct BufferResource {
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    instances: Vec<(vk::Buffer, Allocation)>,
}

pub struct SwapchainImageResource {
    images: Vec<(vk::Image, vk::ImageView)>,
    format: vk::Format,
    extent: Option<vk::Extent2D>,
}

pub enum ResourceKind {
    Image(ImageResource),
    Buffer(BufferResource),
    SwapchainImage(SwapchainImageResource),
}

pub struct Resource {
    name: String,
    kind: ResourceKind,
    /// Layout each frame's instance is left in by the recorded command buffer.
    layouts: Vec<vk::ImageLayout>,
}

impl Resource {
    pub fn image(name: impl Into<String>, desc: ImageDesc) -> Self {
        Self::new(
            name,
            ResourceKind::Image(ImageResource {
                desc,
                instances: Vec::new(),
                imported: false,
                extent: None,
            }),
        )
    }

    /// Wrap externally owned images. With fewer images than frames in
    /// flight, frames share them round-robin.
    pub fn imported_image(name: impl Into<String>, desc: ImageDesc, images: Vec<(vk::Image, vk::ImageView)>) -> Self {
        let instances = images
            .into_iter()
            .map(|(image, view)| ImageInstance { image, view, allocation: None })
            .collect();
        Self::new(
            name,
            ResourceKind::Image(ImageResource {
                desc,
                instances,
                imported: true,
                extent: None,
            }),
        )
    }

    pub fn buffer(name: impl Into<String>, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self::new(
            name,
            ResourceKind::Buffer(BufferResource {
                size,
                usage,
                instances: Vec::new(),
            }),
        )
    }

    pub fn swapchain_image(name: impl Into<String>) -> Self {
        Self::new(
            name,
            ResourceKind::SwapchainImage(SwapchainImageResource {
                images: Vec::new(),
                format: vk::Format::UNDEFINED,
                extent: None,
            }),
        )
    }

    fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self { name: name.into(), kind, layouts: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Images and swapchain images take part in layout tracking.
    pub fn is_image(&self) -> bool {
        !matches!(self.kind, ResourceKind::Buffer(_))
    }

    pub fn is_swapchain(&self) -> bool {
        matches!(self.kind, ResourceKind::SwapchainImage(_))
    }

    pub fn vk_image(&self, frame: usize) -> Option<vk::Image> {
        self.image_pair(frame).map(|(image, _)| image)
    }

    pub fn image_view(&self, frame: usize) -> Option<vk::ImageView> {
        self.image_pair(frame).map(|(_, view)| view)
    }

    fn image_pair(&self, frame: usize) -> Option<(vk::Image, vk::ImageView)> {
        match &self.kind {
            ResourceKind::Image(image) if !image.instances.is_empty() => {
                let instance = &image.instances[frame % image.instances.len()];
                Some((instance.image, instance.view))
            }
            ResourceKind::SwapchainImage(swapchain) => swapchain.images.get(frame).copied(),
            _ => None,
        }
    }

    pub fn vk_buffer(&self, frame: usize) -> Option<vk::Buffer> {
        match &self.kind {
            ResourceKind::Buffer(buf) => buf.instances.get(frame).map(|(b, _)| *b),
            _ => None,
        }
    }

    pub fn buffer_size(&self) -> Option<vk::DeviceSize> {
        match &self.kind {
            ResourceKind::Buffer(buf) => Some(buf.size),
            _ => None,
        }
    }

    /// Host-mapped bytes of a buffer's instance for `frame`.
    pub fn mapped_mut(&mut self, frame: usize) -> Option<&mut [u8]> {
        match &mut self.kind {
            ResourceKind::Buffer(buf) => buf.instances.get_mut(frame)?.1.mapped_slice_mut(),
            _ => None,
        }
    }

    pub fn format(&self) -> Option<vk::Format> {
        match &self.kind {
            ResourceKind::Image(image) => Some(image.desc.format),
            ResourceKind::SwapchainImage(swapchain) => Some(swapchain.format),
            ResourceKind::Buffer(_) => None,
        }
    }

    /// Resolved extent; swapchain-relative images have none until a surface is bound.
    pub fn extent(&self) -> Option<vk::Extent2D> {
        match &self.kind {
            ResourceKind::Image(image) => match image.desc.extent {
                ImageExtent::Absolute(extent) => Some(extent),
                ImageExtent::Swapchain => image.extent,
            },
            ResourceKind::SwapchainImage(swapchain) => swapchain.extent,
            ResourceKind::Buffer(_) => None,
        }
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.format().map_or(vk::ImageAspectFlags::COLOR, buffer::format_aspect)
    }

    /// Layout at the start of every frame.
    pub fn start_layout(&self) -> vk::ImageLayout {
        match &self.kind {
            ResourceKind::Image(image) => image.desc.initial_layout,
            _ => vk::ImageLayout::UNDEFINED,
        }
    }

    /// Layout the image must be back in when the frame's commands end, if any.
    pub fn return_layout(&self) -> Option<vk::ImageLayout> {
        match &self.kind {
            ResourceKind::Image(image) if image.desc.initial_layout != vk::ImageLayout::UNDEFINED => {
                Some(image.desc.initial_layout)
            }
            ResourceKind::SwapchainImage(_) => Some(vk::ImageLayout::PRESENT_SRC_KHR),
            _ => None,
        }
    }

    /// Layout `frame`'s instance is left in after its command buffer runs.
    pub fn tracked_layout(&self, frame: usize) -> Option<vk::ImageLayout> {
        self.layouts.get(frame).copied()
    }

    pub(crate) fn track_layouts(&mut self, layouts: Vec<vk::ImageLayout>) {
        self.layouts = layouts;
    }

    /// Pick up the swapchain's images or size, as this kind requires.
    pub(crate) fn bind_surface(&mut self, surface: &SurfaceInfo) {
        match &mut self.kind {
            ResourceKind::SwapchainImage(swapchain) => {
                swapchain.images = surface.images.clone();
                swapchain.format = surface.format;
                swapchain.extent = Some(surface.extent);
            }
            ResourceKind::Image(image) if image.desc.extent == ImageExtent::Swapchain => {
                image.extent = Some(surface.extent);
            }
            _ => {}
        }
    }

    /// Graph-owned images that must be moved into their initial layout once
    /// after allocation.
    pub(crate) fn needs_initial_transition(&self) -> bool {
        match &self.kind {
            ResourceKind::Image(image) => {
                !image.imported && image.desc.initial_layout != vk::ImageLayout::UNDEFINED
            }
            _ => false,
        }
    }

    /// Allocate one instance per frame in flight.
    pub(crate) fn allocate(&mut self, device: &VulkanDevice, frames: usize) -> Result<()> {
        let extent = self.extent();
        let name = self.name.clone();
        match &mut self.kind {
            ResourceKind::Image(image) if !image.imported => {
                let extent = extent.with_context(|| {
                    format!("Image '{}' is sized to the swapchain but no surface is bound", name)
                })?;
                for frame in 0..frames {
                    let label = format!("{}[{}]", name, frame);
                    let (vk_image, allocation) =
                        buffer::create_image(device, &label, extent, image.desc.format, image.desc.usage)?;
                    let view = buffer::create_image_view(
                        device,
                        vk_image,
                        image.desc.format,
                        buffer::format_aspect(image.desc.format),
                    )?;
                    image.instances.push(ImageInstance { image: vk_image, view, allocation: Some(allocation) });
                }
                log::debug!("Allocated image '{}' {}x{} x{}", name, extent.width, extent.height, frames);
            }
            ResourceKind::Buffer(buf) => {
                for frame in 0..frames {
                    let label = format!("{}[{}]", name, frame);
                    let instance =
                        buffer::create_buffer(device, &label, buf.size, buf.usage, MemoryLocation::CpuToGpu)?;
                    buf.instances.push(instance);
                }
                log::debug!("Allocated buffer '{}' ({} bytes) x{}", name, buf.size, frames);
            }
            _ => {}
        }
        Ok(())
    }

    /// Free everything `allocate` created. Imported and swapchain images are
    /// left to their owners.
    pub(crate) fn release(&mut self, device: &VulkanDevice) {
        match &mut self.kind {
            ResourceKind::Image(image) if !image.imported => {
                for instance in image.instances.drain(..) {
                    unsafe { device.device.destroy_image_view(instance.view, None) };
                    if let Some(allocation) = instance.allocation {
                        buffer::destroy_image(device, instance.image, allocation);
                    }
                }
            }
            ResourceKind::Buffer(buf) => {
                for (vk_buffer, allocation) in buf.instances.drain(..) {
                    buffer::destroy_buffer(device, vk_buffer, allocation);
                }
            }
            _ => {}
        }
        self.layouts.clear();
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ResourceKind::Image(_) => "image",
            ResourceKind::Buffer(_) => "buffer",
            ResourceKind::SwapchainImage(_) => "swapchain image",
        };
        f.debug_struct("Resource").field("name", &self.name).field("kind", &kind).finish()
    }
}
