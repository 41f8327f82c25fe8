//! Display implementations and text dump for debugging.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use crate::arena::{Handle, UniqueArena};
use crate::attr::{AffineExpr, AffineMap, Attribute};
use crate::context::Context;
use crate::kernel::{self, Expression, Literal, ResourceBinding, Statement, StorageAccess};
use crate::op::{Block, Operation, Value};
use crate::types::{Dimension, Scalar, ScalarKind, Type};

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "i1"),
            ScalarKind::Sint => write!(f, "i{}", self.width * 8),
            ScalarKind::Uint => write!(f, "u{}", self.width * 8),
            ScalarKind::Float => write!(f, "f{}", self.width * 8),
        }
    }
}

fn write_shaped(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    dims: &[Dimension],
    scalar: Scalar,
) -> fmt::Result {
    write!(f, "{name}<")?;
    for dim in dims {
        match dim {
            Dimension::Fixed(n) => write!(f, "{n}x")?,
            Dimension::Dynamic => write!(f, "?x")?,
        }
    }
    write!(f, "{scalar}>")
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Tensor { shape, scalar } => write_shaped(f, "tensor", &shape.dims, *scalar),
            Self::MemRef { shape, scalar } => write_shaped(f, "memref", &shape.dims, *scalar),
        }
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<_> = (0..self.num_dims).map(|d| format!("d{d}")).collect();
        let results: Vec<_> = self
            .results
            .iter()
            .map(|r| match r {
                AffineExpr::Dim(d) => format!("d{d}"),
                AffineExpr::Const(c) => c.to_string(),
            })
            .collect();
        write!(f, "({}) -> ({})", dims.join(", "), results.join(", "))
    }
}

impl fmt::Display for StorageAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let has_load = self.contains(StorageAccess::LOAD);
        let has_store = self.contains(StorageAccess::STORE);
        match (has_load, has_store) {
            (true, true) => write!(f, "read_write"),
            (true, false) => write!(f, "read"),
            (false, true) => write!(f, "write"),
            (false, false) => write!(f, "none"),
        }
    }
}

impl fmt::Display for ResourceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@set({}) @binding({})", self.set, self.binding)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}i"),
            Self::U32(v) => write!(f, "{v}u"),
            Self::F32(v) => write!(f, "{v}f"),
        }
    }
}

/// Formats an attribute value, resolving type handles against `types`.
pub fn format_attribute(attr: &Attribute, types: &UniqueArena<Type>) -> String {
    let list = |items: Vec<String>| format!("[{}]", items.join(", "));
    match attr {
        Attribute::Unit => "unit".into(),
        Attribute::Bool(v) => v.to_string(),
        Attribute::Int(v) => v.to_string(),
        Attribute::Float(v) => format!("{v:?}"),
        Attribute::Str(s) => format!("\"{s}\""),
        Attribute::SymbolRef(s) => format!("@{s}"),
        Attribute::IntList(v) => list(v.iter().map(i64::to_string).collect()),
        Attribute::Bytes(b) => format!("<{} bytes>", b.len()),
        Attribute::AffineMaps(maps) => list(maps.iter().map(ToString::to_string).collect()),
        Attribute::Iterators(its) => list(its.iter().map(|i| format!("\"{}\"", i.as_str())).collect()),
        Attribute::FunctionType(ft) => {
            let fmt_types = |tys: &[Handle<Type>]| {
                tys.iter()
                    .map(|&t| types[t].to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!("({}) -> ({})", fmt_types(&ft.inputs), fmt_types(&ft.results))
        }
    }
}

struct Printer<'a> {
    ctx: &'a Context,
    names: HashMap<Value, usize>,
    out: String,
}

impl Printer<'_> {
    fn name(&mut self, value: Value) -> String {
        let next = self.names.len();
        let id = *self.names.entry(value).or_insert(next);
        format!("%{id}")
    }

    fn op(&mut self, op: Handle<Operation>, indent: usize) {
        let ctx = self.ctx;
        let operation = ctx.op(op);
        let pad = " ".repeat(indent);
        let operands: Vec<_> = operation.operands.iter().map(|&v| self.name(v)).collect();
        let results: Vec<_> = operation.results.iter().map(|&v| self.name(v)).collect();

        self.out.push_str(&pad);
        if !results.is_empty() {
            let _ = write!(self.out, "{} = ", results.join(", "));
        }
        let _ = write!(self.out, "{}", operation.kind.name());
        if !operands.is_empty() {
            let _ = write!(self.out, "({})", operands.join(", "));
        }
        if !operation.attributes.is_empty() {
            let attrs: Vec<_> = operation
                .attributes
                .iter()
                .map(|(k, v)| format!("{k} = {}", format_attribute(v, &ctx.types)))
                .collect();
            let _ = write!(self.out, " {{{}}}", attrs.join(", "));
        }
        if !operation.results.is_empty() {
            let types: Vec<_> = operation
                .results
                .iter()
                .map(|&v| ctx.value_type(v).to_string())
                .collect();
            let _ = write!(self.out, " : {}", types.join(", "));
        }
        if let Some(program) = &operation.program {
            let _ = write!(
                self.out,
                " <{} buffers, {} entry points>",
                program.globals.len(),
                program.entry_points.len()
            );
        }
        for &region in &operation.regions {
            self.out.push_str(" {\n");
            for &block in &ctx.regions[region].blocks {
                self.block(block, indent + 2);
            }
            let _ = write!(self.out, "{pad}}}");
        }
        self.out.push('\n');
    }

    fn block(&mut self, block: Handle<Block>, indent: usize) {
        let ctx = self.ctx;
        let data = &ctx.blocks[block];
        if !data.arguments.is_empty() {
            let args: Vec<_> = data
                .arguments
                .iter()
                .map(|&a| format!("{}: {}", self.name(a), ctx.value_type(a)))
                .collect();
            let _ = writeln!(self.out, "{}^bb({}):", " ".repeat(indent.saturating_sub(2)), args.join(", "));
        }
        for &op in &data.ops {
            self.op(op, indent);
        }
    }
}

/// Produces an MLIR-like listing of `op` and everything nested under it.
pub fn dump(ctx: &Context, op: Handle<Operation>) -> String {
    let mut printer = Printer {
        ctx,
        names: HashMap::new(),
        out: String::new(),
    };
    printer.op(op, 0);
    printer.out
}

fn format_expr(handle: Handle<Expression>, exprs: &crate::Arena<Expression>) -> String {
    match &exprs[handle] {
        Expression::Literal(lit) => format!("{lit}"),
        Expression::GlobalInvocationId(c) => format!("GlobalInvocationId.{c}"),
        Expression::GlobalVariable(g) => format!("GlobalVariable({g:?})"),
        Expression::LocalVariable(l) => format!("LocalVariable({l:?})"),
        Expression::Load { pointer } => format!("Load({pointer:?})"),
        Expression::Access { base, index } => format!("Access({base:?}[{index:?}])"),
        Expression::Binary { op, left, right } => format!("{op:?}({left:?}, {right:?})"),
        Expression::Select {
            condition,
            accept,
            reject,
        } => format!("Select({condition:?} ? {accept:?} : {reject:?})"),
        Expression::Math { fun, arg, arg1 } => format!("{fun:?}({arg:?}, {arg1:?})"),
    }
}

fn write_stmt(out: &mut String, stmt: &Statement, indent: usize) {
    let pad = " ".repeat(indent);
    match stmt {
        Statement::Emit(list) => {
            let _ = writeln!(out, "{pad}Emit({list:?})");
        }
        Statement::Store { pointer, value } => {
            let _ = writeln!(out, "{pad}Store {pointer:?} = {value:?}");
        }
        Statement::If {
            condition,
            accept,
            reject,
        } => {
            let _ = writeln!(out, "{pad}If {condition:?} {{");
            for s in accept {
                write_stmt(out, s, indent + 2);
            }
            if !reject.is_empty() {
                let _ = writeln!(out, "{pad}}} else {{");
                for s in reject {
                    write_stmt(out, s, indent + 2);
                }
            }
            let _ = writeln!(out, "{pad}}}");
        }
        Statement::Loop {
            body,
            continuing,
            break_if,
        } => {
            let _ = writeln!(out, "{pad}Loop {{");
            for s in body {
                write_stmt(out, s, indent + 2);
            }
            if !continuing.is_empty() || break_if.is_some() {
                let _ = writeln!(out, "{pad}  Continuing {{");
                for s in continuing {
                    write_stmt(out, s, indent + 4);
                }
                if let Some(brk) = break_if {
                    let _ = writeln!(out, "{pad}    BreakIf({brk:?})");
                }
                let _ = writeln!(out, "{pad}  }}");
            }
            let _ = writeln!(out, "{pad}}}");
        }
        Statement::Break => {
            let _ = writeln!(out, "{pad}Break");
        }
        Statement::Return => {
            let _ = writeln!(out, "{pad}Return");
        }
    }
}

/// Produces a human-readable text dump of a hardware program.
pub fn dump_kernel(module: &kernel::Module) -> String {
    let mut out = String::new();

    if !module.globals.is_empty() {
        out.push_str("Buffers:\n");
        for (handle, var) in module.globals.iter() {
            let name = var.name.as_deref().unwrap_or("_");
            let _ = writeln!(
                out,
                "  {handle:?} {} var<storage, {}> {name}: array<{}>",
                var.binding, var.access, var.scalar
            );
        }
    }

    for ep in &module.entry_points {
        let [x, y, z] = ep.workgroup_size;
        let _ = writeln!(out, "\nEntry Point '{}' @workgroup_size({x}, {y}, {z}):", ep.name);
        let func = &ep.function;
        for (handle, local) in func.local_variables.iter() {
            let name = local.name.as_deref().unwrap_or("_");
            let _ = writeln!(out, "  {handle:?} var {name}: {}", local.scalar);
        }
        for (handle, _) in func.expressions.iter() {
            let _ = writeln!(out, "  {handle:?} {}", format_expr(handle, &func.expressions));
        }
        for stmt in &func.body {
            write_stmt(&mut out, stmt, 2);
        }
    }
    out
}
