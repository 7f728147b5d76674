// Surface creation from raw window handles
//
// ash-window picks the platform surface extension (Win32, Xlib, XCB,
// Wayland, Metal, ...) from the display handle.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::c_char;

use super::VulkanDevice;

/// Instance extensions needed to present to windows on `display`.
pub fn required_extensions(display: &impl HasRawDisplayHandle) -> Result<Vec<*const c_char>> {
    let extensions = ash_window::enumerate_required_extensions(display.raw_display_handle())
        .context("Window system has no Vulkan surface support")?;
    Ok(extensions.to_vec())
}

/// Create a presentation surface for `window`.
pub fn create_surface<W>(device: &VulkanDevice, window: &W) -> Result<vk::SurfaceKHR>
where
    W: HasRawWindowHandle + HasRawDisplayHandle,
{
    let surface = unsafe {
        ash_window::create_surface(
            &device.entry,
            &device.instance,
            window.raw_display_handle(),
            window.raw_window_handle(),
            None,
        )
    }
    .context("Failed to create window surface")?;

    let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
    let supported = unsafe {
        surface_loader.get_physical_device_surface_support(device.physical_device, device.queue_family, surface)?
    };
    if !supported {
        unsafe { surface_loader.destroy_surface(surface, None) };
        anyhow::bail!("GPU doesn't support presenting to this surface");
    }

    Ok(surface)
}
