//! SPIR-V executable definition types via prost derive.
//!
//! Hand-defined messages describing one compiled executable for the Vulkan
//! runtime. Field tags are part of the on-disk format and must not change.

use prost::Message;

/// Vulkan descriptor and stage constants used by the pipeline layout.
pub mod vk {
    /// `VK_DESCRIPTOR_TYPE_STORAGE_BUFFER`.
    pub const DESCRIPTOR_TYPE_STORAGE_BUFFER: u32 = 7;
    /// `VK_SHADER_STAGE_COMPUTE_BIT`.
    pub const SHADER_STAGE_COMPUTE_BIT: u32 = 0x0000_0020;
}

/// A compiled SPIR-V executable.
#[derive(Clone, PartialEq, Message)]
pub struct SpirVExecutableDef {
    /// Entry point names, addressed by the runtime through their position.
    #[prost(string, repeated, tag = "1")]
    pub entry_points: Vec<String>,
    /// SPIR-V words.
    #[prost(uint32, repeated, tag = "2")]
    pub code: Vec<u32>,
    #[prost(message, optional, tag = "3")]
    pub pipeline_layout: Option<VkPipelineLayoutDef>,
    /// Workgroup size of each entry point, aligned with `entry_points`.
    #[prost(message, repeated, tag = "4")]
    pub workgroup_sizes: Vec<WorkgroupSizeDef>,
}

/// Layout used to create the `VkPipelineLayout`.
#[derive(Clone, PartialEq, Message)]
pub struct VkPipelineLayoutDef {
    /// Descriptor set that buffer bindings live in.
    #[prost(uint32, tag = "1")]
    pub buffer_binding_set: u32,
    /// Indexed by descriptor set number.
    #[prost(message, repeated, tag = "2")]
    pub descriptor_set_layouts: Vec<VkDescriptorSetLayoutDef>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VkDescriptorSetLayoutDef {
    #[prost(message, repeated, tag = "1")]
    pub bindings: Vec<VkDescriptorSetLayoutBindingDef>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VkDescriptorSetLayoutBindingDef {
    #[prost(uint32, tag = "1")]
    pub binding: u32,
    #[prost(uint32, tag = "2")]
    pub descriptor_count: u32,
    #[prost(uint32, tag = "3")]
    pub descriptor_type: u32,
    #[prost(uint32, tag = "4")]
    pub stage_flags: u32,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct WorkgroupSizeDef {
    #[prost(uint32, tag = "1")]
    pub x: u32,
    #[prost(uint32, tag = "2")]
    pub y: u32,
    #[prost(uint32, tag = "3")]
    pub z: u32,
}

impl From<[u32; 3]> for WorkgroupSizeDef {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<WorkgroupSizeDef> for [u32; 3] {
    fn from(size: WorkgroupSizeDef) -> Self {
        [size.x, size.y, size.z]
    }
}
