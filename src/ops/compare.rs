//! Comparisons and elementwise extrema. Comparisons produce 0/1 `i32`
//! tensors; min/max promote like the arithmetic operators and break
//! gradient ties in favor of their first operand.

use crate::backend::gpu::codegen::{emit_operand, CodegenState};
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpKind};
use crate::ops::arithmetic::{add, mul};
use crate::ops::{finish, link_node, CpuInput, Operator, TypePermutation};
use crate::shape::broadcast_shape;

fn comparison_builder(kind: OpKind, a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    let shape = broadcast_shape(
        &a.shape(),
        &b.shape(),
        a.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
        b.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
    )?;
    link_node(kind, DataType::I32, shape, vec![a.clone(), b.clone()])
}

/// 1 where `a < b`, 0 otherwise.
pub fn less(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(comparison_builder(OpKind::Less, a, b))
}

/// 1 where `a > b`, 0 otherwise.
pub fn greater(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(comparison_builder(OpKind::Greater, a, b))
}

/// 1 where `a == b`, 0 otherwise.
pub fn equal(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(comparison_builder(OpKind::Equal, a, b))
}

fn extremum_builder(kind: OpKind, a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    let shape = broadcast_shape(
        &a.shape(),
        &b.shape(),
        a.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
        b.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
    )?;
    let dtype = a.data_type().promote(b.data_type());
    link_node(kind, dtype, shape, vec![a.clone(), b.clone()])
}

/// Elementwise minimum.
pub fn minimum(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(extremum_builder(OpKind::Min, a, b))
}

/// Elementwise maximum.
pub fn maximum(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(extremum_builder(OpKind::Max, a, b))
}

fn comparison_cpu(
    node: &NodeRef,
    inputs: &[CpuInput],
    out: OutChunk<'_>,
    from: usize,
    f: impl Fn(f64, f64) -> bool,
) -> FlintResult<()> {
    let OutChunk::I32(out) = out else {
        return Err(FlintError::InternalError(
            "comparisons produce i32 tensors".to_string(),
        ));
    };
    let wa = super::arithmetic::input_wrap(node, &inputs[0]);
    let wb = super::arithmetic::input_wrap(node, &inputs[1]);
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let a = inputs[0].data.get_f64((gi / wa.inv) % wa.modulus);
        let b = inputs[1].data.get_f64((gi / wb.inv) % wb.modulus);
        *slot = if f(a, b) { 1 } else { 0 };
    }
    Ok(())
}

fn comparison_eager(op: &str) -> String {
    format!(
        "if (index >= num_entries0 && index >= num_entries1) return;\n\
         R[index] = P0[(index / inv_broad0) % num_entries0] {op} \
         P1[(index / inv_broad1) % num_entries1] ? 1 : 0;\n"
    )
}

fn comparison_permutations() -> Vec<TypePermutation> {
    let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
    let mut perms = Vec::new();
    for a in types {
        for b in types {
            perms.push((DataType::I32, vec![a, b]));
        }
    }
    perms
}

fn comparison_fragment(
    node: &NodeRef,
    name: &str,
    state: &mut CodegenState,
    op: &str,
) -> FlintResult<()> {
    let a = node.predecessor(0);
    let b = node.predecessor(1);
    let na = state.next_name();
    let nb = state.next_name();
    state.prepend(format!(
        "const int {name} = {na} {op} {nb} ? 1 : 0;\n"
    ));
    emit_operand(state, node, &a, &na)?;
    emit_operand(state, node, &b, &nb)
}

macro_rules! comparison_op {
    ($op:ident, $sym:literal, $f:expr) => {
        pub struct $op;

        impl Operator for $op {
            fn cpu_kernel(
                &self,
                node: &NodeRef,
                inputs: &[CpuInput],
                out: OutChunk<'_>,
                from: usize,
            ) -> FlintResult<()> {
                comparison_cpu(node, inputs, out, from, $f)
            }

            fn lazy_fragment(
                &self,
                node: &NodeRef,
                name: &str,
                state: &mut CodegenState,
            ) -> FlintResult<()> {
                comparison_fragment(node, name, state, $sym)
            }

            fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
                comparison_eager($sym)
            }

            fn type_permutations(&self) -> Vec<TypePermutation> {
                comparison_permutations()
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
    };
}

comparison_op!(LessOp, "<", |a, b| a < b);
comparison_op!(GreaterOp, ">", |a, b| a > b);
comparison_op!(EqualOp, "==", |a, b| a == b);

fn extremum_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    take_first: impl Fn(&T, &T) -> bool,
) {
    let wa = super::arithmetic::input_wrap(node, &inputs[0]);
    let wb = super::arithmetic::input_wrap(node, &inputs[1]);
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let a: T = inputs[0].data.get((gi / wa.inv) % wa.modulus);
        let b: T = inputs[1].data.get((gi / wb.inv) % wb.modulus);
        *slot = if take_first(&a, &b) { a } else { b };
    }
}

/// The 0/1 mask of positions where the gradient of an extremum flows to
/// operand `index`; ties route to the first operand.
fn extremum_mask(node: &NodeRef, index: usize, is_min: bool) -> FlintResult<NodeRef> {
    let a = node.predecessor(0);
    let b = node.predecessor(1);
    match (is_min, index) {
        (true, 0) => add(&less(&a, &b)?, &equal(&a, &b)?),
        (true, _) => greater(&a, &b),
        (false, 0) => add(&greater(&a, &b)?, &equal(&a, &b)?),
        (false, _) => less(&a, &b),
    }
}

pub struct MinOp;

impl Operator for MinOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| extremum_cpu(s, from, node, inputs, |a, b| a < b));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let t = node.data_type().ocl_name();
        let a = node.predecessor(0);
        let b = node.predecessor(1);
        let na = state.next_name();
        let nb = state.next_name();
        state.prepend(format!(
            "const {t} {name} = min(({t}){na}, ({t}){nb});\n"
        ));
        emit_operand(state, node, &a, &na)?;
        emit_operand(state, node, &b, &nb)
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        let t = out.ocl_name();
        format!(
            "if (index >= num_entries0 && index >= num_entries1) return;\n\
             R[index] = min(({t})P0[(index / inv_broad0) % num_entries0], \
             ({t})P1[(index / inv_broad1) % num_entries1]);\n"
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        comparison_permutations()
            .into_iter()
            .map(|(_, ins)| (ins[0].promote(ins[1]), ins))
            .collect()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let mask = extremum_mask(node, index, true)?;
        mul(adjoint, &mask).map(Some)
    }
}

pub struct MaxOp;

impl Operator for MaxOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| extremum_cpu(s, from, node, inputs, |a, b| a > b));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let t = node.data_type().ocl_name();
        let a = node.predecessor(0);
        let b = node.predecessor(1);
        let na = state.next_name();
        let nb = state.next_name();
        state.prepend(format!(
            "const {t} {name} = max(({t}){na}, ({t}){nb});\n"
        ));
        emit_operand(state, node, &a, &na)?;
        emit_operand(state, node, &b, &nb)
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        let t = out.ocl_name();
        format!(
            "if (index >= num_entries0 && index >= num_entries1) return;\n\
             R[index] = max(({t})P0[(index / inv_broad0) % num_entries0], \
             ({t})P1[(index / inv_broad1) % num_entries1]);\n"
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        comparison_permutations()
            .into_iter()
            .map(|(_, ins)| (ins[0].promote(ins[1]), ins))
            .collect()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let mask = extremum_mask(node, index, false)?;
        mul(adjoint, &mask).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;

    #[test]
    fn comparisons_yield_i32() {
        let a = new_store(TensorData::F64(vec![1.0, 2.0]), vec![2]).unwrap();
        let b = new_store(TensorData::F64(vec![2.0, 1.0]), vec![2]).unwrap();
        assert_eq!(less(&a, &b).unwrap().data_type(), DataType::I32);
        assert_eq!(minimum(&a, &b).unwrap().data_type(), DataType::F64);
    }
}
