//! Vulkan/SPIR-V target options.

/// Errors parsing a workgroup size triple.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("workgroup size must have 1 to 3 components, got {0}")]
    ComponentCount(usize),
    #[error("invalid workgroup size component '{0}'")]
    InvalidComponent(String),
    #[error("workgroup size components must be non-zero")]
    Zero,
}

/// Options of the `vulkan-spirv` target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VulkanSpirvTargetOptions {
    /// Lower non-reduction dispatches through generic loop nests instead of
    /// the direct path.
    pub use_linalg_path: bool,
    /// Workgroup size forced onto dispatch functions on the generic path.
    pub linalg_workgroup_size: Option<[u32; 3]>,
}

/// Parses a comma-separated workgroup size such as `"8,8,1"`.
///
/// Missing trailing components default to 1.
pub fn parse_workgroup_size(text: &str) -> Result<[u32; 3], OptionsError> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(OptionsError::ComponentCount(parts.len()));
    }
    let mut size = [1u32; 3];
    for (slot, part) in size.iter_mut().zip(&parts) {
        let value: u32 = part
            .parse()
            .map_err(|_| OptionsError::InvalidComponent(part.to_string()))?;
        if value == 0 {
            return Err(OptionsError::Zero);
        }
        *slot = value;
    }
    Ok(size)
}
