//! Name-to-operation resolution within a symbol scope.

use std::collections::BTreeMap;

use crate::arena::Handle;
use crate::context::Context;
use crate::error::IrError;
use crate::op::Operation;

/// Symbols defined directly in the body of one scope op.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<String, Handle<Operation>>,
}

impl SymbolTable {
    /// Collects the `sym_name` of every op in the first block of `scope`.
    pub fn build(ctx: &Context, scope: Handle<Operation>) -> Result<Self, IrError> {
        let mut symbols = BTreeMap::new();
        let block = ctx.body(scope)?;
        for &op in &ctx.blocks[block].ops {
            let Some(name) = ctx.op(op).sym_name() else {
                continue;
            };
            if symbols.insert(name.to_string(), op).is_some() {
                return Err(IrError::Verification {
                    location: ctx.op(op).location.clone(),
                    message: format!("redefinition of symbol '{name}'"),
                });
            }
        }
        Ok(Self { symbols })
    }

    pub fn lookup(&self, name: &str) -> Option<Handle<Operation>> {
        self.symbols.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, op: Handle<Operation>) {
        self.symbols.insert(name.into(), op);
    }

    pub fn remove(&mut self, name: &str) -> Option<Handle<Operation>> {
        self.symbols.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    /// Symbols in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Handle<Operation>)> {
        self.symbols.iter().map(|(k, &v)| (k.as_str(), v))
    }
}
