//! Hand-written kernels substituted for recognized dispatch functions.
//!
//! A catalog entry matches a dispatch function of a fixed shape and builds a
//! program specialized on the matched extents. Serialized code is cached per
//! kernel, entry name and extents for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;

use halo_backend_core::TargetError;
use halo_ir::kernel::{self, BinaryOp, EntryPoint, Literal, ResourceBinding, StorageAccess};
use halo_ir::{Context, Handle, OpKind, Operation, Scalar, Value};
use halo_opt::utils;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::builder::FunctionBuilder;
use crate::spirv::{self, SpirvError};

/// A catalog entry.
#[derive(Debug)]
pub struct EmbeddedKernel {
    /// Catalog key.
    pub name: &'static str,
    /// Workgroup size the kernel is written for.
    pub workgroup_size: [u32; 3],
    /// Extents of the matched computation, or `None` on a miss.
    matcher: fn(&Context, Handle<Operation>) -> Option<Vec<u32>>,
    /// Builds the program for an entry name and the matched extents.
    builder: fn(&str, &[u32], [u32; 3]) -> kernel::Module,
}

/// Known kernels, tried in order.
pub static CATALOG: &[EmbeddedKernel] = &[
    EmbeddedKernel {
        name: "matmul",
        workgroup_size: [16, 16, 1],
        matcher: match_matmul,
        builder: build_matmul,
    },
    EmbeddedKernel {
        name: "conv2d_nhwc",
        workgroup_size: [1, 1, 1],
        matcher: match_conv2d,
        builder: build_conv2d,
    },
];

type CacheKey = (&'static str, String, Vec<u32>);

static CODE: Lazy<Mutex<HashMap<CacheKey, Arc<Vec<u32>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A dispatch function recognized by a catalog entry.
#[derive(Debug)]
pub struct EmbeddedMatch {
    pub kernel: &'static EmbeddedKernel,
    /// The matched dispatch function.
    pub function: Handle<Operation>,
    /// Entry point name, the dispatch function's name.
    pub entry: String,
    /// Extents the kernel is specialized on.
    pub dims: Vec<u32>,
}

impl EmbeddedMatch {
    /// The specialized program.
    pub fn module(&self) -> kernel::Module {
        (self.kernel.builder)(&self.entry, &self.dims, self.kernel.workgroup_size)
    }

    /// SPIR-V code of the specialized program.
    pub fn code(&self) -> Result<Arc<Vec<u32>>, SpirvError> {
        let key = (self.kernel.name, self.entry.clone(), self.dims.clone());
        if let Some(code) = CODE.lock().get(&key) {
            return Ok(Arc::clone(code));
        }
        let code = Arc::new(spirv::serialize(&self.module())?);
        log::debug!(
            "serialized embedded kernel '{}' for '{}' ({} words)",
            self.kernel.name,
            self.entry,
            code.len()
        );
        Ok(Arc::clone(CODE.lock().entry(key).or_insert(code)))
    }
}

/// Looks for a catalog kernel implementing the only dispatch function of
/// `inner`.
pub fn match_embedded(
    ctx: &Context,
    inner: Handle<Operation>,
) -> Result<Option<EmbeddedMatch>, TargetError> {
    let dispatches: Vec<_> = utils::functions(ctx, inner)?
        .into_iter()
        .filter(|&func| utils::is_dispatch_function(ctx, func) && !ctx.is_declaration(func))
        .collect();
    let [function] = dispatches[..] else {
        return Ok(None);
    };
    let entry = ctx.op(function).sym_name().unwrap_or_default().to_string();
    for kernel in CATALOG {
        if let Some(dims) = (kernel.matcher)(ctx, function) {
            log::info!("'{entry}' matches embedded kernel '{}' {dims:?}", kernel.name);
            return Ok(Some(EmbeddedMatch {
                kernel,
                function,
                entry,
                dims,
            }));
        }
    }
    Ok(None)
}

fn static_f32_dims(ctx: &Context, value: Value) -> Option<Vec<u32>> {
    let ty = ctx.value_type(value);
    if ty.element_scalar() != Some(Scalar::F32) {
        return None;
    }
    ty.shape()?
        .static_dims()?
        .into_iter()
        .map(|d| u32::try_from(d).ok())
        .collect()
}

/// Operands of the op computing the stored value of
/// `load_input a; load_input b; op(a, b); store_output` with the three
/// buffers being the function arguments in order.
fn binary_dispatch(ctx: &Context, func: Handle<Operation>, kind: OpKind) -> Option<[Value; 3]> {
    let block = utils::single_block(ctx, func).ok()?;
    let args = ctx.arguments(func).ok()?;
    let [a, b, out] = args[..] else {
        return None;
    };
    let ops: Vec<_> = ctx.blocks[block].ops.iter().map(|&op| ctx.op(op)).collect();
    let [lhs, rhs, compute, store, ret] = ops[..] else {
        return None;
    };
    let loads_from = |op: &Operation, buffer| op.kind == OpKind::LoadInput && op.operands == [buffer];
    if !loads_from(lhs, a)
        || !loads_from(rhs, b)
        || compute.kind != kind
        || compute.operands != [lhs.results[0], rhs.results[0]]
        || store.kind != OpKind::StoreOutput
        || store.operands != [compute.results[0], out]
        || ret.kind != OpKind::Return
    {
        return None;
    }
    Some([lhs.results[0], rhs.results[0], compute.results[0]])
}

/// `[M, K, N]` of a rank-2 f32 dot product.
fn match_matmul(ctx: &Context, func: Handle<Operation>) -> Option<Vec<u32>> {
    let [lhs, rhs, result] = binary_dispatch(ctx, func, OpKind::Dot)?;
    let (lhs, rhs, result) = (
        static_f32_dims(ctx, lhs)?,
        static_f32_dims(ctx, rhs)?,
        static_f32_dims(ctx, result)?,
    );
    match (&lhs[..], &rhs[..], &result[..]) {
        (&[m, k], &[k2, n], &[m2, n2]) if k == k2 && m == m2 && n == n2 => Some(vec![m, k, n]),
        _ => None,
    }
}

/// `[N, H, W, C, KH, KW, F]` of an unpadded unit-stride NHWC convolution
/// with an HWCF filter.
fn match_conv2d(ctx: &Context, func: Handle<Operation>) -> Option<Vec<u32>> {
    let [input, filter, result] = binary_dispatch(ctx, func, OpKind::Conv)?;
    let (input, filter, result) = (
        static_f32_dims(ctx, input)?,
        static_f32_dims(ctx, filter)?,
        static_f32_dims(ctx, result)?,
    );
    match (&input[..], &filter[..], &result[..]) {
        (&[n, h, w, c], &[kh, kw, c2, f], &[n2, oh, ow, f2])
            if c == c2
                && n == n2
                && f == f2
                && kh <= h
                && kw <= w
                && oh == h - kh + 1
                && ow == w - kw + 1 =>
        {
            Some(vec![n, h, w, c, kh, kw, f])
        }
        _ => None,
    }
}

/// Declares `lhs`, `rhs` and `out` at bindings 0, 1 and 2.
fn three_buffers(module: &mut kernel::Module, entry: &str) -> [Handle<kernel::GlobalVariable>; 3] {
    let mut buffer = |binding: u32, role: &str, access| {
        module.add_buffer(
            format!("{entry}.{role}"),
            ResourceBinding { set: 0, binding },
            Scalar::F32,
            access,
        )
    };
    [
        buffer(0, "lhs", StorageAccess::LOAD),
        buffer(1, "rhs", StorageAccess::LOAD),
        buffer(2, "out", StorageAccess::STORE),
    ]
}

/// `out[row][col] = sum_k lhs[row][k] * rhs[k][col]`, one invocation per
/// output element with `col` along x and `row` along y.
fn build_matmul(entry: &str, dims: &[u32], workgroup_size: [u32; 3]) -> kernel::Module {
    let mut module = kernel::Module::default();
    let [lhs, rhs, out] = three_buffers(&mut module, entry);
    let [m, k, n] = [dims[0], dims[1], dims[2]];

    let mut fb = FunctionBuilder::new(entry);
    let col = fb.global_id(0);
    let row = fb.global_id(1);
    let rows = fb.u32(m);
    let cols = fb.u32(n);
    let row_ok = fb.binary(BinaryOp::Less, row, rows);
    let col_ok = fb.binary(BinaryOp::Less, col, cols);
    let in_range = fb.binary(BinaryOp::LogicalAnd, row_ok, col_ok);
    fb.begin_if();
    let acc = fb.local("acc", Scalar::F32, Some(Literal::F32(0.0)));
    let zero = fb.u32(0);
    let depth = fb.u32(k);
    let one = fb.u32(1);
    let lp = fb.begin_loop("k", zero, depth);
    let a_index = fb.linearize(&[row, lp.index], &[m, k]);
    let b_index = fb.linearize(&[lp.index, col], &[k, n]);
    let lhs = fb.global(lhs);
    let rhs = fb.global(rhs);
    let a_ptr = fb.element(lhs, a_index);
    let b_ptr = fb.element(rhs, b_index);
    let a = fb.load(a_ptr);
    let b = fb.load(b_ptr);
    let product = fb.binary(BinaryOp::Multiply, a, b);
    let sum = fb.load(acc);
    let next = fb.binary(BinaryOp::Add, sum, product);
    fb.store(acc, next);
    fb.end_loop(lp, one);
    let out_index = fb.linearize(&[row, col], &[m, n]);
    let out = fb.global(out);
    let out_ptr = fb.element(out, out_index);
    let result = fb.load(acc);
    fb.store(out_ptr, result);
    fb.end_if(in_range);

    module.entry_points.push(EntryPoint {
        name: entry.to_string(),
        workgroup_size,
        function: fb.finish(),
    });
    module
}

/// Direct NHWC convolution: filter channel along x, output column along y,
/// batch and output row folded along z.
fn build_conv2d(entry: &str, dims: &[u32], workgroup_size: [u32; 3]) -> kernel::Module {
    let mut module = kernel::Module::default();
    let [input, filter, out] = three_buffers(&mut module, entry);
    let [n, h, w, c, kh, kw, f] = [dims[0], dims[1], dims[2], dims[3], dims[4], dims[5], dims[6]];
    let (oh, ow) = (h - kh + 1, w - kw + 1);

    let mut fb = FunctionBuilder::new(entry);
    let fc = fb.global_id(0);
    let ox = fb.global_id(1);
    let z = fb.global_id(2);
    let filters = fb.u32(f);
    let cols = fb.u32(ow);
    let planes = fb.u32(n * oh);
    let f_ok = fb.binary(BinaryOp::Less, fc, filters);
    let x_ok = fb.binary(BinaryOp::Less, ox, cols);
    let z_ok = fb.binary(BinaryOp::Less, z, planes);
    let fx_ok = fb.binary(BinaryOp::LogicalAnd, f_ok, x_ok);
    let in_range = fb.binary(BinaryOp::LogicalAnd, fx_ok, z_ok);
    fb.begin_if();
    let rows = fb.u32(oh);
    let batch = fb.binary(BinaryOp::Divide, z, rows);
    let oy = fb.binary(BinaryOp::Modulo, z, rows);
    let acc = fb.local("acc", Scalar::F32, Some(Literal::F32(0.0)));
    let zero = fb.u32(0);
    let one = fb.u32(1);

    let kh_end = fb.u32(kh);
    let ky = fb.begin_loop("ky", zero, kh_end);
    let kw_end = fb.u32(kw);
    let kx = fb.begin_loop("kx", zero, kw_end);
    let c_end = fb.u32(c);
    let ci = fb.begin_loop("ci", zero, c_end);
    let iy = fb.binary(BinaryOp::Add, oy, ky.index);
    let ix = fb.binary(BinaryOp::Add, ox, kx.index);
    let x_index = fb.linearize(&[batch, iy, ix, ci.index], &[n, h, w, c]);
    let w_index = fb.linearize(&[ky.index, kx.index, ci.index, fc], &[kh, kw, c, f]);
    let input = fb.global(input);
    let filter = fb.global(filter);
    let x_ptr = fb.element(input, x_index);
    let w_ptr = fb.element(filter, w_index);
    let x = fb.load(x_ptr);
    let wv = fb.load(w_ptr);
    let product = fb.binary(BinaryOp::Multiply, x, wv);
    let sum = fb.load(acc);
    let next = fb.binary(BinaryOp::Add, sum, product);
    fb.store(acc, next);
    fb.end_loop(ci, one);
    fb.end_loop(kx, one);
    fb.end_loop(ky, one);

    let out_index = fb.linearize(&[batch, oy, ox, fc], &[n, oh, ow, f]);
    let out = fb.global(out);
    let out_ptr = fb.element(out, out_index);
    let result = fb.load(acc);
    fb.store(out_ptr, result);
    fb.end_if(in_range);

    module.entry_points.push(EntryPoint {
        name: entry.to_string(),
        workgroup_size,
        function: fb.finish(),
    });
    module
}
