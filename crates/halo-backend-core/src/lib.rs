#![warn(missing_docs)]
//! Hardware target interface and registry for halo.
//!
//! Defines the [`Target`] trait that every executable backend implements,
//! the [`ExecutableTargetOptions`] selecting which targets run, and the
//! process-wide [`TARGETS`] registry they are looked up in.

pub mod executable;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use halo_ir::{Context, Handle, IrError, Location, OpKind, Operation};
use halo_opt::PassError;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// A backend that translates a `hal.executable` into a packed binary.
pub trait Target: Debug + Send + Sync {
    /// Registry key, e.g. `"vulkan-spirv"`.
    fn name(&self) -> &str;

    /// Lowers the source of `executable` and attaches a `hal.executable.binary`.
    ///
    /// On failure no binary is attached and the source is left unchanged.
    fn translate(
        &self,
        ctx: &mut Context,
        executable: Handle<Operation>,
        options: &ExecutableTargetOptions,
    ) -> Result<(), TargetError>;
}

/// Options shared by all targets of one compilation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutableTargetOptions {
    /// Registry keys of the targets to translate for, in order.
    pub targets: Vec<String>,
}

impl ExecutableTargetOptions {
    /// Options selecting the given targets.
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

/// Errors raised while translating an executable for a target.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// A lowering pass failed.
    #[error(transparent)]
    Pass(#[from] PassError),

    /// The IR is malformed.
    #[error(transparent)]
    Ir(#[from] IrError),

    /// The lowered program could not be serialized or packaged.
    #[error("{location}: {message}")]
    Serialization {
        /// Location of the source module.
        location: Location,
        /// What went wrong.
        message: String,
    },

    /// No target is registered under this key.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// The executable lacks the source it is translated from.
    #[error("{location}: {message}")]
    MissingSource {
        /// Location of the executable.
        location: Location,
        /// What is missing.
        message: String,
    },

    /// A packed executable definition is invalid.
    #[error("invalid executable definition: {0}")]
    Executable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A target failed; other targets were still translated.
    #[error("target '{target}' failed: {source}")]
    Failed {
        /// Registry key of the failing target.
        target: String,
        /// The underlying failure.
        #[source]
        source: Box<TargetError>,
    },
}

impl TargetError {
    /// A serialization error attached to `op`.
    pub fn serialization(ctx: &Context, op: Handle<Operation>, message: impl Into<String>) -> Self {
        Self::Serialization {
            location: ctx.op(op).location.clone(),
            message: message.into(),
        }
    }
}

/// Targets keyed by name.
///
/// Registration is append-only: a key is bound once and never replaced.
#[derive(Default)]
pub struct TargetRegistry {
    targets: RwLock<BTreeMap<String, Arc<dyn Target>>>,
}

impl TargetRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `target` under its name. Returns `false` if the name is taken,
    /// leaving the existing binding in place.
    pub fn register(&self, target: Arc<dyn Target>) -> bool {
        let mut targets = self.targets.write();
        let name = target.name().to_string();
        if targets.contains_key(&name) {
            log::warn!("target '{name}' is already registered");
            return false;
        }
        log::debug!("registered target '{name}'");
        targets.insert(name, target);
        true
    }

    /// The target registered under exactly `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Target>> {
        self.targets.read().get(name).cloned()
    }

    /// Returns `true` if `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.targets.read().contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }
}

impl Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.names())
            .finish()
    }
}

/// The process-wide target registry.
///
/// Backends register before compilation starts; nothing is removed.
pub static TARGETS: Lazy<TargetRegistry> = Lazy::new(TargetRegistry::new);

/// Translates every `hal.executable` of the top-level module for each target
/// in `options`.
///
/// Targets run independently: a failing target does not stop the others.
/// Returns the number of successful translations, or the first failure once
/// all targets have run.
pub fn translate_executables(
    ctx: &mut Context,
    registry: &TargetRegistry,
    options: &ExecutableTargetOptions,
) -> Result<usize, TargetError> {
    let module = ctx.module();
    let executables = ctx.collect_kind(module, OpKind::HalExecutable);
    let mut translated = 0;
    let mut first_failure = None;
    for name in &options.targets {
        let Some(target) = registry.get(name) else {
            log::warn!("no target registered as '{name}'");
            first_failure.get_or_insert(TargetError::UnknownTarget(name.clone()));
            continue;
        };
        for &executable in &executables {
            log::info!(
                "translating '{}' for target '{name}'",
                ctx.op(executable).sym_name().unwrap_or_default()
            );
            match target.translate(ctx, executable, options) {
                Ok(()) => translated += 1,
                Err(err) => {
                    log::warn!("target '{name}' failed: {err}");
                    first_failure.get_or_insert(TargetError::Failed {
                        target: name.clone(),
                        source: Box::new(err),
                    });
                }
            }
        }
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(translated),
    }
}
