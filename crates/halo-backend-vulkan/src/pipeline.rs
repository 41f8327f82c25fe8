//! Lowering pipeline selection.

use halo_backend_core::executable::flow_entries;
use halo_ir::{Context, Handle, OpKind, Operation};
use halo_opt::{
    ElementwiseToGeneric, GenericToLaunch, KernelOutlining, LoadStoreDataFlowOpt, PassManager,
    ReductionToGeneric, SetWorkgroupSize,
};

use crate::direct::DirectToSpirv;
use crate::lower::KernelToSpirv;
use crate::options::VulkanSpirvTargetOptions;

/// One of the mutually exclusive lowering pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pipeline {
    /// Reduction entries through generic loop nests and outlined kernels.
    Reduction,
    /// Elementwise dispatches through generic loop nests, opted into by
    /// [`VulkanSpirvTargetOptions::use_linalg_path`].
    Linalg,
    /// Dispatch functions straight to element-per-invocation kernels.
    Direct,
}

impl Pipeline {
    /// Picks the pipeline for a `flow.executable`.
    ///
    /// Reductions take precedence over the opt-in flag.
    pub fn select(
        ctx: &Context,
        flow_executable: Handle<Operation>,
        options: &VulkanSpirvTargetOptions,
    ) -> Self {
        let reduces = flow_entries(ctx, flow_executable)
            .into_iter()
            .any(|entry| ctx.op(entry).kind == OpKind::ReductionEntry);
        if reduces {
            Self::Reduction
        } else if options.use_linalg_path {
            Self::Linalg
        } else {
            Self::Direct
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Reduction => "reduction",
            Self::Linalg => "linalg",
            Self::Direct => "direct",
        }
    }

    /// The passes of this pipeline, in order.
    pub fn pass_manager(self, options: &VulkanSpirvTargetOptions) -> PassManager {
        let mut pm = PassManager::new();
        match self {
            Self::Reduction => {
                pm.add_pass(Box::new(ReductionToGeneric));
                pm.add_pass(Box::new(GenericToLaunch));
                pm.add_pass(Box::new(KernelOutlining));
                pm.add_pass(Box::new(KernelToSpirv));
            }
            Self::Linalg => {
                pm.add_pass(Box::new(ElementwiseToGeneric));
                pm.add_pass(Box::new(SetWorkgroupSize::new(options.linalg_workgroup_size)));
                pm.add_pass(Box::new(GenericToLaunch));
                pm.add_pass(Box::new(KernelOutlining));
                pm.add_pass(Box::new(KernelToSpirv));
            }
            Self::Direct => {
                pm.add_pass(Box::new(LoadStoreDataFlowOpt));
                pm.add_pass(Box::new(DirectToSpirv));
            }
        }
        pm
    }
}
