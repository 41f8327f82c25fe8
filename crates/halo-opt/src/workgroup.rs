//! Workgroup size override for dispatch functions.

use halo_ir::{Context, Handle, Operation};

use crate::utils::{functions, is_dispatch_function, set_workgroup_size, workgroup_size};
use crate::{Pass, PassError};

/// Sets `executable.workgroup_size` on every dispatch function.
///
/// With no size the pass leaves existing sizes alone.
#[derive(Debug, Default)]
pub struct SetWorkgroupSize {
    pub size: Option<[u32; 3]>,
}

impl SetWorkgroupSize {
    pub fn new(size: Option<[u32; 3]>) -> Self {
        Self { size }
    }
}

impl Pass for SetWorkgroupSize {
    fn name(&self) -> &str {
        "set-workgroup-size"
    }

    fn run(&self, ctx: &mut Context, module: Handle<Operation>) -> Result<bool, PassError> {
        let Some(size) = self.size else {
            return Ok(false);
        };
        let mut changed = false;
        for func in functions(ctx, module)? {
            if !is_dispatch_function(ctx, func) {
                continue;
            }
            if workgroup_size(ctx, func).ok() == Some(size) {
                continue;
            }
            log::debug!(
                "workgroup size of '{}' set to {size:?}",
                ctx.op(func).sym_name().unwrap_or_default()
            );
            set_workgroup_size(ctx, func, size);
            changed = true;
        }
        Ok(changed)
    }
}
