// Shader module loading
//
// SPIR-V arrives either from disk (compiled by build.rs) or as words
// produced elsewhere; both end up as a vk::ShaderModule per stage.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

use super::VulkanDevice;
use crate::reflection;

/// Create a shader module from SPIR-V words.
pub fn create_shader_module(device: &VulkanDevice, words: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    unsafe { device.device.create_shader_module(&create_info, None) }.context("Failed to create shader module")
}

/// Read a `.spv` file into words (byte order fixed up).
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    let words = reflection::spirv_words(&path.display().to_string(), &bytes)?;
    Ok(words)
}
