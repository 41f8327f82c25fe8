//! Dispatch-region formation and lowering passes for halo.
//!
//! Provides a [`Pass`] trait, a fail-fast [`PassManager`], and the passes
//! that take graph-level reductions through dispatch regions, generic loop
//! nests and launches down to outlined kernel modules.

mod elementwise_lowering;
mod generic_to_launch;
mod identify_reductions;
mod load_store;
mod outline;
mod reduction_lowering;
pub mod region;
pub mod utils;
mod workgroup;

pub use elementwise_lowering::ElementwiseToGeneric;
pub use generic_to_launch::GenericToLaunch;
pub use identify_reductions::IdentifyReductionRegions;
pub use load_store::LoadStoreDataFlowOpt;
pub use outline::{KERNEL_MODULE_SUFFIX, KernelOutlining};
pub use reduction_lowering::ReductionToGeneric;
pub use workgroup::SetWorkgroupSize;

use std::fmt::Debug;

use halo_ir::{Context, Handle, IrError, Location, Operation};

/// Errors reported by passes.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    /// Wrong operand count, rank, dangling reference or block structure.
    #[error("{location}: {message}")]
    Structural { location: Location, message: String },

    /// A construct the rewrite has no lowering for.
    #[error("{location}: unsupported: {message}")]
    Unsupported { location: Location, message: String },

    #[error(transparent)]
    Ir(#[from] IrError),
}

impl PassError {
    /// A structural error attached to `op`.
    pub fn structural(ctx: &Context, op: Handle<Operation>, message: impl Into<String>) -> Self {
        Self::Structural {
            location: ctx.op(op).location.clone(),
            message: message.into(),
        }
    }

    /// An unsupported-construct error attached to `op`.
    pub fn unsupported(ctx: &Context, op: Handle<Operation>, message: impl Into<String>) -> Self {
        Self::Unsupported {
            location: ctx.op(op).location.clone(),
            message: message.into(),
        }
    }

    /// Location of the offending operation, if known.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Structural { location, .. } | Self::Unsupported { location, .. } => {
                Some(location)
            }
            Self::Ir(IrError::Verification { location, .. }) => Some(location),
            Self::Ir(_) => None,
        }
    }
}

/// A transformation over a `builtin.module`.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on `module`. Returns `true` if anything was modified.
    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError>;
}

/// Runs passes in sequence, stopping at the first failure.
#[derive(Debug, Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    verify_each: bool,
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies the module after every pass.
    pub fn enable_verifier(&mut self, enabled: bool) {
        self.verify_each = enabled;
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Names of the scheduled passes, in order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass once. Returns `true` if any pass changed the module.
    pub fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let mut changed = false;
        for pass in &self.passes {
            log::debug!("running pass '{}'", pass.name());
            let modified = pass.run(ctx, module).inspect_err(|err| {
                log::debug!("pass '{}' failed: {err}", pass.name());
            })?;
            if self.verify_each {
                halo_ir::verify(ctx, module)?;
            }
            changed |= modified;
        }
        Ok(changed)
    }
}
