//! Rendering of the prebuilt eager kernels: one kernel per operation and
//! type permutation, assembled from the registry's body template and
//! parameter declaration. Pure text; the device runtime compiles the
//! result once at initialization.

use crate::data::DataType;
use crate::graph::OpCode;
use crate::ops::operator_for;

/// Mangled kernel name for one `(operation, type tuple)` pairing.
pub fn kernel_name(code: OpCode, out_type: DataType, in_types: &[DataType]) -> String {
    let mut name = format!("{code:?}_{out_type:?}").to_lowercase();
    for t in in_types {
        name.push_str(&format!("_{t:?}").to_lowercase());
    }
    name
}

/// Full OpenCL source of one eager kernel.
pub fn render_kernel(code: OpCode, out_type: DataType, in_types: &[DataType]) -> String {
    let op = operator_for(code);
    format!(
        "__kernel void {name}(__global {t}* R, const long num_entriesR{params}) {{\n\
         const long index = get_global_id(0);\n\
         {body}}}\n",
        name = kernel_name(code, out_type, in_types),
        t = out_type.ocl_name(),
        params = op.eager_params(out_type, in_types),
        body = op.eager_source(out_type, in_types),
    )
}

/// Renders the whole eager library: every operation crossed with its type
/// permutations. The result is one compilation unit per kernel, so a
/// backend can compile lazily per lookup or all at once.
pub fn render_library() -> Vec<(String, String)> {
    let codes = all_codes();
    let mut kernels = Vec::new();
    for code in codes {
        for (out_type, in_types) in operator_for(code).type_permutations() {
            kernels.push((
                kernel_name(code, out_type, &in_types),
                render_kernel(code, out_type, &in_types),
            ));
        }
    }
    kernels
}

pub(crate) fn all_codes() -> Vec<OpCode> {
    use OpCode::*;
    vec![
        Store, GenRandom, GenConstant, GenArange, Add, Sub, Mul, Div, Pow, Neg, Log, Sign, Even,
        Log2, Log10, Sin, Cos, Tan, Asin, Acos, Atan, Sqrt, Exp, Flatten, MatMul, Conversion,
        Reshape, Min, Max, ReduceSum, ReduceMul, ReduceMin, ReduceMax, Slice, Abs, Repeat,
        Transpose, Extend, Concat, Less, Equal, Greater, Convolve, GradientConvolve1,
        GradientConvolve2, Index, SetIndex, SlidingWindow, UnslideWindow, PoolingMax, PoolingSum,
        GradientPoolingMax, Dropout,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let lib = render_library();
        let mut names: Vec<&str> = lib.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn every_kernel_declares_its_name() {
        for (name, src) in render_library() {
            assert!(src.contains(&format!("__kernel void {name}(")), "{name}");
        }
    }
}
