//! Binary and unary arithmetic: the broadcasting elementwise operations
//! and the pointwise math functions, with their gradients and both OpenCL
//! code paths.

use crate::backend::gpu::codegen::{emit_operand, emit_value, CodegenState};
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpKind};
use crate::ops::{
    self, constant_like, finish, link_node, CpuInput, Operator, TypePermutation,
};
use crate::shape::{broadcast_kind, broadcast_shape, broadcast_wrap};

// ---------------------------------------------------------------------------
// Builders

fn binary_builder(kind: OpKind, a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    let shape = broadcast_shape(
        &a.shape(),
        &b.shape(),
        a.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
        b.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
    )?;
    let dtype = a.data_type().promote(b.data_type());
    link_node(kind, dtype, shape, vec![a.clone(), b.clone()])
}

/// Elementwise sum of two broadcast-compatible tensors.
pub fn add(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(binary_builder(OpKind::Add, a, b))
}

/// Elementwise difference.
pub fn sub(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(binary_builder(OpKind::Sub, a, b))
}

/// Elementwise product.
pub fn mul(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(binary_builder(OpKind::Mul, a, b))
}

/// Elementwise quotient.
pub fn div(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(binary_builder(OpKind::Div, a, b))
}

/// Elementwise power `a ^ b`.
pub fn pow(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(binary_builder(OpKind::Pow, a, b))
}

fn monotone_builder(kind: OpKind, a: &NodeRef) -> FlintResult<NodeRef> {
    link_node(kind, a.data_type(), a.shape(), vec![a.clone()])
}

/// Result type of the pointwise float functions: integers are promoted to
/// double, floats keep their precision.
fn to_float(dtype: DataType) -> DataType {
    if dtype.is_int() {
        DataType::F64
    } else {
        dtype
    }
}

fn float_builder(kind: OpKind, a: &NodeRef) -> FlintResult<NodeRef> {
    link_node(kind, to_float(a.data_type()), a.shape(), vec![a.clone()])
}

pub fn neg(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(monotone_builder(OpKind::Neg, a))
}

pub fn abs(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(monotone_builder(OpKind::Abs, a))
}

pub fn log(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Log, a))
}

pub fn log2(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Log2, a))
}

pub fn log10(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Log10, a))
}

pub fn sin(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Sin, a))
}

pub fn cos(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Cos, a))
}

pub fn tan(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Tan, a))
}

pub fn asin(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Asin, a))
}

pub fn acos(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Acos, a))
}

pub fn atan(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Atan, a))
}

pub fn sqrt(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Sqrt, a))
}

pub fn exp(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(float_builder(OpKind::Exp, a))
}

/// Elementwise sign as `i32`: -1 for negative values, 1 otherwise.
pub fn sign(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(link_node(
        OpKind::Sign,
        DataType::I32,
        a.shape(),
        vec![a.clone()],
    ))
}

/// 1 where the (integer) element is even, 0 otherwise.
pub fn even(a: &NodeRef) -> FlintResult<NodeRef> {
    if !a.data_type().is_int() {
        return finish(Err(FlintError::WrongType(
            "even is only defined for integer tensors".to_string(),
        )));
    }
    finish(link_node(
        OpKind::Even,
        DataType::I32,
        a.shape(),
        vec![a.clone()],
    ))
}

// ---------------------------------------------------------------------------
// Shared kernel plumbing

pub(crate) struct Wrap {
    pub inv: usize,
    pub modulus: usize,
}

pub(crate) fn input_wrap(node: &NodeRef, input: &CpuInput) -> Wrap {
    let kind = broadcast_kind(&node.shape(), &input.shape, input.force_inverse);
    let (inv, modulus) = broadcast_wrap(node.num_elements(), input.num_elements(), kind);
    Wrap { inv, modulus }
}

fn binary_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    f: impl Fn(T, T) -> T,
) {
    let wa = input_wrap(node, &inputs[0]);
    let wb = input_wrap(node, &inputs[1]);
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let a: T = inputs[0].data.get((gi / wa.inv) % wa.modulus);
        let b: T = inputs[1].data.get((gi / wb.inv) % wb.modulus);
        *slot = f(a, b);
    }
}

fn unary_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    input: &CpuInput,
    f: impl Fn(T) -> T,
) {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = f(input.data.get(from + i));
    }
}

fn float_cpu<T: TensorElement>(out: &mut [T], from: usize, input: &CpuInput, f: impl Fn(f64) -> f64) {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = T::from_f64(f(input.data.get_f64(from + i)));
    }
}

fn neg_val<T: TensorElement>(x: T) -> T {
    T::zero() - x
}

fn abs_val<T: TensorElement>(x: T) -> T {
    if x < T::zero() {
        T::zero() - x
    } else {
        x
    }
}

fn binary_fragment(
    node: &NodeRef,
    name: &str,
    state: &mut CodegenState,
    expr: impl FnOnce(&str, &str) -> String,
) -> FlintResult<()> {
    let a = node.predecessor(0);
    let b = node.predecessor(1);
    let na = state.next_name();
    let nb = state.next_name();
    state.prepend(format!(
        "const {t} {name} = {expr};\n",
        t = node.data_type().ocl_name(),
        expr = expr(&na, &nb)
    ));
    emit_operand(state, node, &a, &na)?;
    emit_operand(state, node, &b, &nb)
}

fn unary_fragment(
    node: &NodeRef,
    name: &str,
    state: &mut CodegenState,
    expr: impl FnOnce(&str) -> String,
) -> FlintResult<()> {
    let a = node.predecessor(0);
    let na = state.next_name();
    state.prepend(format!(
        "const {t} {name} = {expr};\n",
        t = node.data_type().ocl_name(),
        expr = expr(&na)
    ));
    emit_value(state, &a, &na)
}

fn binary_eager(op: &str) -> String {
    format!(
        "if (index >= num_entries0 && index >= num_entries1) return;\n\
         R[index] = P0[(index / inv_broad0) % num_entries0] {op} \
         P1[(index / inv_broad1) % num_entries1];\n"
    )
}

fn unary_eager(expr: &str) -> String {
    format!("if (index >= num_entries0) return;\nR[index] = {expr};\n")
}

fn all_binary_permutations() -> Vec<TypePermutation> {
    let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
    let mut perms = Vec::new();
    for a in types {
        for b in types {
            perms.push((a.promote(b), vec![a, b]));
        }
    }
    perms
}

fn monotone_permutations() -> Vec<TypePermutation> {
    [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
        .into_iter()
        .map(|t| (t, vec![t]))
        .collect()
}

fn float_permutations() -> Vec<TypePermutation> {
    vec![
        (DataType::F32, vec![DataType::F32]),
        (DataType::F64, vec![DataType::F64]),
    ]
}

/// Elementwise results may overwrite an input buffer of equal footprint.
fn reuse_same_footprint(node: &NodeRef) -> Vec<bool> {
    let shape = node.shape();
    let size = node.data_type().size_of();
    node.predecessors()
        .iter()
        .map(|p| p.shape() == shape && p.data_type().size_of() == size)
        .collect()
}

// ---------------------------------------------------------------------------
// Binary operators

pub struct AddOp;

impl Operator for AddOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| binary_cpu(s, from, node, inputs, |a, b| a + b));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        binary_fragment(node, name, state, |a, b| format!("{a} + {b}"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        binary_eager("+")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        all_binary_permutations()
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(Some(adjoint.clone()))
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

pub struct SubOp;

impl Operator for SubOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| binary_cpu(s, from, node, inputs, |a, b| a - b));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        binary_fragment(node, name, state, |a, b| format!("{a} - {b}"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        binary_eager("-")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        all_binary_permutations()
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        if index == 0 {
            Ok(Some(adjoint.clone()))
        } else {
            neg(adjoint).map(Some)
        }
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

pub struct MulOp;

impl Operator for MulOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| binary_cpu(s, from, node, inputs, |a, b| a * b));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        binary_fragment(node, name, state, |a, b| format!("{a} * {b}"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        binary_eager("*")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        all_binary_permutations()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let other = node.predecessor(1 - index);
        mul(adjoint, &other).map(Some)
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

pub struct DivOp;

impl Operator for DivOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| binary_cpu(s, from, node, inputs, |a, b| a / b));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        binary_fragment(node, name, state, |a, b| format!("{a} / {b}"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        binary_eager("/")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        all_binary_permutations()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let a = node.predecessor(0);
        let b = node.predecessor(1);
        if index == 0 {
            // d(a / b)/da = 1 / b
            div(adjoint, &b).map(Some)
        } else {
            // d(a / b)/db = -a / b^2
            let b2 = mul(&b, &b)?;
            neg(&div(&mul(adjoint, &a)?, &b2)?).map(Some)
        }
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

pub struct PowOp;

impl Operator for PowOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| binary_cpu(s, from, node, inputs, |a, b| {
            TensorElement::from_f64(a.to_f64().powf(b.to_f64()))
        }));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let t = node.data_type();
        let (at, bt) = (
            node.predecessor(0).data_type(),
            node.predecessor(1).data_type(),
        );
        binary_fragment(node, name, state, |a, b| pow_expr(t, at, bt, a, b))
    }

    fn eager_source(&self, out: DataType, ins: &[DataType]) -> String {
        let a = "P0[(index / inv_broad0) % num_entries0]".to_string();
        let b = "P1[(index / inv_broad1) % num_entries1]".to_string();
        format!(
            "if (index >= num_entries0 && index >= num_entries1) return;\nR[index] = {};\n",
            pow_expr(out, ins[0], ins[1], &a, &b)
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        all_binary_permutations()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let a = node.predecessor(0);
        let b = node.predecessor(1);
        if index == 0 {
            // d(a^b)/da = b * a^(b - 1)
            let ones = ops::ones_like(&b, b.data_type())?;
            let lowered = pow(&a, &sub(&b, &ones)?)?;
            mul(adjoint, &mul(&b, &lowered)?).map(Some)
        } else {
            // d(a^b)/db = a^b * ln(a), forced to zero where a < 0 since
            // the expression is not differentiable there.
            let half = constant_like(0.5, &a, DataType::F64)?;
            let one = constant_like(1.0, &a, DataType::F64)?;
            let positive = mul(&add(&sign(&a)?, &one)?, &half)?;
            let ln = log(&abs(&a)?)?;
            let value = pow(&a, &b)?;
            mul(adjoint, &mul(&positive, &mul(&value, &ln)?)?).map(Some)
        }
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

/// The OpenCL expression for `a ^ b`, matching the host kernel's behavior
/// for every type pairing.
fn pow_expr(out: DataType, at: DataType, bt: DataType, a: &str, b: &str) -> String {
    let t = out.ocl_name();
    if at.is_float() && bt.is_float() {
        format!("pow(({t}){a}, ({t}){b})")
    } else if at == DataType::I64 && bt.is_int() {
        format!("(long)pown((double){a}, (int){b})")
    } else if at == DataType::I32 && bt.is_int() {
        format!("(int)pown((float){a}, (int){b})")
    } else {
        format!("({t})pow((double){a}, (double){b})")
    }
}

// ---------------------------------------------------------------------------
// Unary operators

pub struct NegOp;

impl Operator for NegOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let _ = node;
        dispatch_chunk!(out, |s| unary_cpu(s, from, &inputs[0], neg_val));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        unary_fragment(node, name, state, |a| format!("-{a}"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        unary_eager("-P0[index]")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        monotone_permutations()
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        neg(adjoint).map(Some)
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

pub struct AbsOp;

impl Operator for AbsOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let _ = node;
        dispatch_chunk!(out, |s| unary_cpu(s, from, &inputs[0], abs_val));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let t = node.data_type();
        unary_fragment(node, name, state, |a| {
            if t.is_int() {
                format!("abs({a})")
            } else {
                format!("fabs({a})")
            }
        })
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        if out.is_int() {
            unary_eager("abs(P0[index])")
        } else {
            unary_eager("fabs(P0[index])")
        }
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        monotone_permutations()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let a = node.predecessor(0);
        mul(adjoint, &sign(&a)?).map(Some)
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        reuse_same_footprint(node)
    }
}

/// The pointwise float functions share everything but the function itself
/// and the gradient rule, so they are generated together.
macro_rules! float_unary_op {
    ($op:ident, $fname:literal, $host:expr, $grad:expr) => {
        pub struct $op;

        impl Operator for $op {
            fn cpu_kernel(
                &self,
                node: &NodeRef,
                inputs: &[CpuInput],
                out: OutChunk<'_>,
                from: usize,
            ) -> FlintResult<()> {
                let _ = node;
                dispatch_chunk!(out, |s| float_cpu(s, from, &inputs[0], $host));
                Ok(())
            }

            fn lazy_fragment(
                &self,
                node: &NodeRef,
                name: &str,
                state: &mut CodegenState,
            ) -> FlintResult<()> {
                let t = node.data_type().ocl_name();
                unary_fragment(node, name, state, |a| {
                    format!("{fun}(({t}){a})", fun = $fname)
                })
            }

            fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
                unary_eager(&format!(
                    "{fun}(({t})P0[index])",
                    fun = $fname,
                    t = out.ocl_name()
                ))
            }

            fn type_permutations(&self) -> Vec<TypePermutation> {
                float_permutations()
            }

            fn operation_score(&self, _node: &NodeRef) -> usize {
                3
            }

            fn local_gradient(
                &self,
                node: &NodeRef,
                _index: usize,
                adjoint: &NodeRef,
            ) -> FlintResult<Option<NodeRef>> {
                let grad: fn(&NodeRef, &NodeRef) -> FlintResult<NodeRef> = $grad;
                grad(node, adjoint).map(Some)
            }

            fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
                reuse_same_footprint(node)
            }
        }
    };
}

float_unary_op!(LogOp, "log", |x: f64| x.ln(), |node, adj| {
    // d ln(a) = 1 / a
    div(adj, &node.predecessor(0))
});

float_unary_op!(Log2Op, "log2", |x: f64| x.log2(), |node, adj| {
    let a = node.predecessor(0);
    let ln2 = constant_like(std::f64::consts::LN_2, &a, DataType::F64)?;
    div(adj, &mul(&a, &ln2)?)
});

float_unary_op!(Log10Op, "log10", |x: f64| x.log10(), |node, adj| {
    let a = node.predecessor(0);
    let ln10 = constant_like(std::f64::consts::LN_10, &a, DataType::F64)?;
    div(adj, &mul(&a, &ln10)?)
});

float_unary_op!(SinOp, "sin", |x: f64| x.sin(), |node, adj| {
    mul(adj, &cos(&node.predecessor(0))?)
});

float_unary_op!(CosOp, "cos", |x: f64| x.cos(), |node, adj| {
    neg(&mul(adj, &sin(&node.predecessor(0))?)?)
});

float_unary_op!(TanOp, "tan", |x: f64| x.tan(), |node, adj| {
    // d tan(a) = 1 / cos(a)^2
    let c = cos(&node.predecessor(0))?;
    div(adj, &mul(&c, &c)?)
});

float_unary_op!(AsinOp, "asin", |x: f64| x.asin(), |node, adj| {
    let a = node.predecessor(0);
    let one = constant_like(1.0, &a, DataType::F64)?;
    div(adj, &sqrt(&sub(&one, &mul(&a, &a)?)?)?)
});

float_unary_op!(AcosOp, "acos", |x: f64| x.acos(), |node, adj| {
    let a = node.predecessor(0);
    let one = constant_like(1.0, &a, DataType::F64)?;
    neg(&div(adj, &sqrt(&sub(&one, &mul(&a, &a)?)?)?)?)
});

float_unary_op!(AtanOp, "atan", |x: f64| x.atan(), |node, adj| {
    let a = node.predecessor(0);
    let one = constant_like(1.0, &a, DataType::F64)?;
    div(adj, &add(&one, &mul(&a, &a)?)?)
});

float_unary_op!(SqrtOp, "sqrt", |x: f64| x.sqrt(), |node, adj| {
    // d sqrt(a) = 1 / (2 sqrt(a))
    let a = node.predecessor(0);
    let two = constant_like(2.0, &a, DataType::F64)?;
    div(adj, &mul(&two, &sqrt(&a)?)?)
});

float_unary_op!(ExpOp, "exp", |x: f64| x.exp(), |node, adj| {
    mul(adj, &exp(&node.predecessor(0))?)
});

pub struct SignOp;

impl Operator for SignOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let _ = node;
        let OutChunk::I32(out) = out else {
            return Err(FlintError::InternalError(
                "sign produces an i32 tensor".to_string(),
            ));
        };
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if inputs[0].data.get_f64(from + i) < 0.0 {
                -1
            } else {
                1
            };
        }
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        unary_fragment(node, name, state, |a| format!("{a} < 0 ? -1 : 1"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        unary_eager("P0[index] < 0 ? -1 : 1")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (DataType::I32, vec![t]))
            .collect()
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }
}

pub struct EvenOp;

impl Operator for EvenOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let _ = node;
        let OutChunk::I32(out) = out else {
            return Err(FlintError::InternalError(
                "even produces an i32 tensor".to_string(),
            ));
        };
        for (i, slot) in out.iter_mut().enumerate() {
            let v: i64 = inputs[0].data.get(from + i);
            *slot = if v % 2 == 0 { 1 } else { 0 };
        }
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        unary_fragment(node, name, state, |a| format!("{a} % 2 == 0 ? 1 : 0"))
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        unary_eager("P0[index] % 2 == 0 ? 1 : 0")
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        vec![
            (DataType::I32, vec![DataType::I32]),
            (DataType::I32, vec![DataType::I64]),
        ]
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;

    #[test]
    fn binary_shapes_promote_and_broadcast() {
        let a = new_store(TensorData::I32(vec![1, 2, 3, 4, 5, 6]), vec![2, 3]).unwrap();
        let b = new_store(TensorData::F32(vec![1.0, 2.0, 3.0]), vec![3]).unwrap();
        let s = add(&a, &b).unwrap();
        assert_eq!(s.shape(), vec![2, 3]);
        assert_eq!(s.data_type(), DataType::F32);
    }

    #[test]
    fn even_rejects_floats() {
        let a = new_store(TensorData::F32(vec![1.0]), vec![1]).unwrap();
        assert!(matches!(even(&a), Err(FlintError::WrongType(_))));
    }

    #[test]
    fn float_functions_promote_ints_to_double() {
        let a = new_store(TensorData::I32(vec![1, 2]), vec![2]).unwrap();
        assert_eq!(sin(&a).unwrap().data_type(), DataType::F64);
        let b = new_store(TensorData::F32(vec![1.0]), vec![1]).unwrap();
        assert_eq!(sin(&b).unwrap().data_type(), DataType::F32);
    }
}
