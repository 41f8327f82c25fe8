//! Pipeline layout reflection over a hardware program's buffers.

use std::collections::{BTreeMap, BTreeSet};

use halo_ir::kernel::Module;

use crate::proto::{
    VkDescriptorSetLayoutBindingDef, VkDescriptorSetLayoutDef, VkPipelineLayoutDef, vk,
};

/// Builds the descriptor set layouts the runtime creates the pipeline with.
///
/// Every buffer is a single compute-stage storage buffer. Sets are listed
/// densely from 0 to the highest used set, bindings in ascending order.
pub fn pipeline_layout(module: &Module) -> VkPipelineLayoutDef {
    let mut sets: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for (_, global) in module.globals.iter() {
        sets.entry(global.binding.set)
            .or_default()
            .insert(global.binding.binding);
    }

    let count = sets.keys().next_back().map_or(0, |&max| max as usize + 1);
    let mut descriptor_set_layouts = vec![VkDescriptorSetLayoutDef::default(); count];
    for (set, bindings) in sets {
        descriptor_set_layouts[set as usize].bindings = bindings
            .into_iter()
            .map(|binding| VkDescriptorSetLayoutBindingDef {
                binding,
                descriptor_count: 1,
                descriptor_type: vk::DESCRIPTOR_TYPE_STORAGE_BUFFER,
                stage_flags: vk::SHADER_STAGE_COMPUTE_BIT,
            })
            .collect();
    }

    VkPipelineLayoutDef {
        buffer_binding_set: 0,
        descriptor_set_layouts,
    }
}
