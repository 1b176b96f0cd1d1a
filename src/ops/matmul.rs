//! Batched matrix multiplication. The last two dimensions contract; any
//! leading dimensions are batch dimensions, and a rank-2 operand is reused
//! for every batch of a higher-rank one.

use crate::backend::gpu::codegen::CodegenState;
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpKind};
use crate::ops::{finish, link_node, reshape, CpuInput, KernelArg, Operator, TypePermutation};

/// Matrix product of `(..., l, m)` and `(..., m, n)`, giving `(..., l, n)`.
pub fn matmul(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    finish(matmul_builder(a, b))
}

fn matmul_builder(a: &NodeRef, b: &NodeRef) -> FlintResult<NodeRef> {
    let sa = a.shape();
    let sb = b.shape();
    if sa.len() < 2 || sb.len() < 2 {
        return Err(FlintError::IllegalDimensionality(
            "matmul needs operands of rank 2 or higher".to_string(),
        ));
    }
    let (l, m) = (sa[sa.len() - 2], sa[sa.len() - 1]);
    let (mb, n) = (sb[sb.len() - 2], sb[sb.len() - 1]);
    if m != mb {
        return Err(FlintError::incompatible_shapes(
            &sa,
            &sb,
            "inner matmul dimensions differ",
        ));
    }
    let (batch, other) = if sa.len() >= sb.len() {
        (&sa[..sa.len() - 2], &sb[..sb.len() - 2])
    } else {
        (&sb[..sb.len() - 2], &sa[..sa.len() - 2])
    };
    if !other.is_empty() && other != &batch[batch.len() - other.len()..] {
        return Err(FlintError::incompatible_shapes(
            &sa,
            &sb,
            "batch dimensions do not line up",
        ));
    }
    let mut shape = batch.to_vec();
    shape.push(l);
    shape.push(n);
    let dtype = a.data_type().promote(b.data_type());
    link_node(OpKind::MatMul, dtype, shape, vec![a.clone(), b.clone()])
}

fn matmul_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
) {
    let sa = &inputs[0].shape;
    let sb = &inputs[1].shape;
    let l = sa[sa.len() - 2];
    let m = sa[sa.len() - 1];
    let n = sb[sb.len() - 1];
    let _ = node;
    for (i, slot) in out.iter_mut().enumerate() {
        let index = from + i;
        let j = (index % (l * n)) / n;
        let k = (index % (l * n)) % n;
        let base_a = if sa.len() > 2 {
            (index / (l * n)) * (l * m)
        } else {
            0
        };
        let base_b = if sb.len() > 2 {
            (index / (l * n)) * (m * n)
        } else {
            0
        };
        let mut acc = T::zero();
        for x in 0..m {
            let av: T = inputs[0].data.get(base_a + j * m + x);
            let bv: T = inputs[1].data.get(base_b + x * n + k);
            acc = acc + av * bv;
        }
        *slot = acc;
    }
}

pub struct MatMulOp;

impl Operator for MatMulOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| matmul_cpu(s, from, node, inputs));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let a = node.predecessor(0);
        let b = node.predecessor(1);
        let par1 = state.find_or_insert_parameter(&a);
        let par2 = state.find_or_insert_parameter(&b);
        let sa = a.shape();
        let sb = b.shape();
        let l = sa[sa.len() - 2];
        let m = sa[sa.len() - 1];
        let n = sb[sb.len() - 1];
        let t = node.data_type().ocl_name();
        let j = format!("((index % {ln}) / {n})", ln = l * n);
        let k = format!("((index % {ln}) % {n})", ln = l * n);
        let base_a = if sa.len() > 2 {
            format!("(index / {ln}) * {lm}", ln = l * n, lm = l * m)
        } else {
            "0".to_string()
        };
        let base_b = if sb.len() > 2 {
            format!("(index / {ln}) * {mn}", ln = l * n, mn = m * n)
        } else {
            "0".to_string()
        };
        state.prepend(format!(
            "for (int i = 0; i < {m}; i++) {{\n  {name} += {par1}[{base_a} + {j} * {m} + i] * {par2}[{base_b} + i * {n} + {k}];\n}}\n"
        ));
        state.prepend(format!("{t} {name} = 0;\n"));
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        format!(
            "if (index >= num_entriesR) return;\n\
             {t} res = 0;\n\
             long j = (index % (l * n)) / n;\n\
             long k = (index % (l * n)) % n;\n\
             long base_p0 = dimensions0 > 2 ? (index / (l * n)) * (l * m) : 0;\n\
             long base_p1 = dimensions1 > 2 ? (index / (l * n)) * (m * n) : 0;\n\
             for (long i = 0; i < m; i++) {{\n  res += P0[base_p0 + j * m + i] * P1[base_p1 + i * n + k];\n}}\n\
             R[index] = res;\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        let mut params = String::new();
        for (i, t) in in_types.iter().enumerate() {
            params.push_str(&format!(
                ", const __global {t}* P{i}, long num_entries{i}, int dimensions{i}",
                t = t.ocl_name()
            ));
        }
        params.push_str(", long l, long m, long n");
        params
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
        let mut perms = Vec::new();
        for a in types {
            for b in types {
                perms.push((a.promote(b), vec![a, b]));
            }
        }
        perms
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let sa = node.predecessor(0).shape();
        let sb = node.predecessor(1).shape();
        vec![
            KernelArg::Long(sa[sa.len() - 2] as i64),
            KernelArg::Long(sa[sa.len() - 1] as i64),
            KernelArg::Long(sb[sb.len() - 1] as i64),
        ]
    }

    fn per_input_args(&self, node: &NodeRef, input: usize) -> Vec<KernelArg> {
        vec![KernelArg::Int(node.predecessor(input).rank() as i32)]
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
            // dW/dA = adj . B^T
            matmul(adjoint, &reshape::transpose_last_two(&b)?).map(Some)
        } else {
            // dW/dB = A^T . adj
            matmul(&reshape::transpose_last_two(&a)?, adjoint).map(Some)
        }
    }

    fn operation_score(&self, node: &NodeRef) -> usize {
        let sa = node.predecessor(0).shape();
        sa[sa.len() - 1]
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;

    #[test]
    fn shape_rule() {
        let a = new_store(TensorData::F32(vec![0.0; 64 * 32 * 16]), vec![64, 32, 16]).unwrap();
        let b = new_store(TensorData::F32(vec![0.0; 16 * 24]), vec![16, 24]).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), vec![64, 32, 24]);
    }

    #[test]
    fn rank_one_is_rejected() {
        let a = new_store(TensorData::F32(vec![0.0; 4]), vec![4]).unwrap();
        let b = new_store(TensorData::F32(vec![0.0; 4]), vec![2, 2]).unwrap();
        assert!(matches!(
            matmul(&a, &b),
            Err(FlintError::IllegalDimensionality(_))
        ));
    }
}
