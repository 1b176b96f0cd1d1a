//! Sliding windows and pooling. A sliding window materializes every
//! window as a new leading dimension; unsliding sums overlaps back.
//! Pooling slides over all but the last dimension and reduces each window
//! completely, the last dimension included.

use crate::backend::gpu::codegen::CodegenState;
use crate::data::{DataType, OutChunk, TensorData, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{new_store, NodeRef, OpKind};
use crate::ops::{conv, finish, link_node, CpuInput, KernelArg, Operator, TypePermutation};
use crate::shape::{accumulated_strides, num_elements};

/// Number of window positions along one dimension.
pub(crate) fn window_count(dim: usize, size: usize, step: usize) -> usize {
    let span = dim - size + 1;
    span.div_ceil(step)
}

// ---------------------------------------------------------------------------
// Builders

/// Materializes every window of `size` (stepping by `step`) as the
/// leading dimension of the result: shape `[windows, size...]`.
pub fn sliding_window(a: &NodeRef, size: &[usize], step: &[usize]) -> FlintResult<NodeRef> {
    finish(sliding_window_builder(a, size, step))
}

fn check_window(shape: &[usize], size: &[usize], step: &[usize]) -> FlintResult<()> {
    for d in 0..size.len() {
        if step[d] == 0 {
            return Err(FlintError::InvalidSelect(format!(
                "window step of dimension {d} is zero"
            )));
        }
        if size[d] == 0 || size[d] > shape[d] {
            return Err(FlintError::InvalidSelect(format!(
                "window size {} does not fit dimension {d} of size {}",
                size[d], shape[d]
            )));
        }
    }
    Ok(())
}

fn sliding_window_builder(a: &NodeRef, size: &[usize], step: &[usize]) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if size.len() != shape.len() || step.len() != shape.len() {
        return Err(FlintError::IllegalDimensionality(format!(
            "window arguments must have one entry per dimension, tensor has rank {}",
            shape.len()
        )));
    }
    check_window(&shape, size, step)?;
    let mut windows = 1usize;
    for d in 0..shape.len() {
        windows *= window_count(shape[d], size[d], step[d]);
    }
    let mut out = Vec::with_capacity(shape.len() + 1);
    out.push(windows);
    out.extend_from_slice(size);
    link_node(
        OpKind::SlidingWindow {
            size: size.to_vec(),
            step: step.to_vec(),
        },
        a.data_type(),
        out,
        vec![a.clone()],
    )
}

/// Inverts [`sliding_window`]: sums the windows of `a` back into a tensor
/// of `result_shape`, adding overlaps and zero-filling gaps.
pub fn unslide_window(a: &NodeRef, result_shape: &[usize], step: &[usize]) -> FlintResult<NodeRef> {
    finish(unslide_builder(a, result_shape, step))
}

fn unslide_builder(a: &NodeRef, result_shape: &[usize], step: &[usize]) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if shape.len() < 2 {
        return Err(FlintError::IllegalDimensionality(
            "unslide needs a windows tensor of rank 2 or higher".to_string(),
        ));
    }
    if result_shape.len() != shape.len() - 1 || step.len() != result_shape.len() {
        return Err(FlintError::IllegalDimensionality(
            "result shape and steps must have one entry per window dimension".to_string(),
        ));
    }
    let mut windows = 1usize;
    for d in 0..result_shape.len() {
        if step[d] == 0 || shape[d + 1] > result_shape[d] {
            return Err(FlintError::InvalidSelect(format!(
                "windows of size {} cannot tile dimension {d} of size {}",
                shape[d + 1],
                result_shape[d]
            )));
        }
        windows *= window_count(result_shape[d], shape[d + 1], step[d]);
    }
    if windows != shape[0] {
        return Err(FlintError::incompatible_shapes(
            &shape,
            result_shape,
            "window count does not match the leading dimension",
        ));
    }
    link_node(
        OpKind::UnslideWindow {
            step: step.to_vec(),
        },
        a.data_type(),
        result_shape.to_vec(),
        vec![a.clone()],
    )
}

/// Slides a window over all but the last dimension and sums each window
/// completely (the last dimension is always reduced in full).
pub fn pooling_sum(a: &NodeRef, size: &[usize], step: &[usize]) -> FlintResult<NodeRef> {
    finish(pooling_builder(a, size, step, false))
}

/// Like [`pooling_sum`] but keeping each window's maximum.
pub fn pooling_max(a: &NodeRef, size: &[usize], step: &[usize]) -> FlintResult<NodeRef> {
    finish(pooling_builder(a, size, step, true))
}

fn pooling_builder(
    a: &NodeRef,
    size: &[usize],
    step: &[usize],
    max: bool,
) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if shape.len() < 2 {
        return Err(FlintError::IllegalDimensionality(
            "pooling needs rank 2 or higher".to_string(),
        ));
    }
    if size.len() != shape.len() - 1 || step.len() != size.len() {
        return Err(FlintError::IllegalDimensionality(
            "pooling windows cover all dimensions but the last".to_string(),
        ));
    }
    check_window(&shape[..shape.len() - 1], size, step)?;
    let mut out = Vec::with_capacity(size.len());
    for d in 0..size.len() {
        out.push(window_count(shape[d], size[d], step[d]));
    }
    let kind = if max {
        OpKind::PoolingMax {
            size: size.to_vec(),
            step: step.to_vec(),
        }
    } else {
        OpKind::PoolingSum {
            size: size.to_vec(),
            step: step.to_vec(),
        }
    };
    link_node(kind, a.data_type(), out, vec![a.clone()])
}

pub(crate) fn window_params(node: &NodeRef) -> (Vec<usize>, Vec<usize>) {
    node.with_operation(|op| match &op.kind {
        OpKind::SlidingWindow { size, step }
        | OpKind::PoolingMax { size, step }
        | OpKind::PoolingSum { size, step }
        | OpKind::GradientPoolingMax { size, step } => (size.clone(), step.clone()),
        OpKind::UnslideWindow { step } => (Vec::new(), step.clone()),
        _ => (Vec::new(), Vec::new()),
    })
}

// ---------------------------------------------------------------------------
// Window iteration

/// Calls `f` with the linear number (over the full window grid described
/// by `counts`) of every window whose per-dimension position lies in
/// `[lo[d], hi[d]]`.
pub(crate) fn for_each_window(
    lo: &[usize],
    hi: &[usize],
    counts: &[usize],
    mut f: impl FnMut(usize, &[usize]),
) {
    if lo.iter().zip(hi).any(|(l, h)| l > h) {
        return;
    }
    let acc = accumulated_strides(counts);
    let mut coords = lo.to_vec();
    loop {
        let linear: usize = coords.iter().zip(&acc).map(|(&c, &a)| c * a).sum();
        f(linear, &coords);
        let mut d = coords.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            if coords[d] < hi[d] {
                coords[d] += 1;
                break;
            }
            coords[d] = lo[d];
        }
    }
}

/// Window range that covers coordinate `x` in a dimension of `count`
/// windows with the given extent and step.
pub(crate) fn covering_range(x: usize, extent: usize, step: usize, count: usize) -> (usize, usize) {
    let lo = if x + 1 > extent {
        (x + 1 - extent).div_ceil(step)
    } else {
        0
    };
    let hi = (x / step).min(count.saturating_sub(1));
    (lo, hi)
}

// ---------------------------------------------------------------------------
// CPU kernels

fn sliding_window_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    input: &CpuInput,
    size: &[usize],
    step: &[usize],
) {
    let rank = input.shape.len();
    let acc_pred = accumulated_strides(&input.shape);
    let acc_rest = accumulated_strides(size);
    let window_elems: usize = size.iter().product();
    let counts: Vec<usize> = (0..rank)
        .map(|d| window_count(input.shape[d], size[d], step[d]))
        .collect();
    let acc_win = accumulated_strides(&counts);
    let _ = node;
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let mut wi = gi / window_elems;
        let mut rest = gi % window_elems;
        let mut base = 0;
        let mut offset = 0;
        for d in 0..rank {
            let local_wi = wi / acc_win[d];
            wi %= acc_win[d];
            base += local_wi * step[d] * acc_pred[d];
            let local_ri = rest / acc_rest[d];
            rest %= acc_rest[d];
            offset += local_ri * acc_pred[d];
        }
        *slot = input.data.get(base + offset);
    }
}

fn unslide_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    input: &CpuInput,
    step: &[usize],
) {
    let shape = node.shape();
    let acc = accumulated_strides(&shape);
    let size = &input.shape[1..];
    let acc_window = accumulated_strides(size);
    let window_elems: usize = size.iter().product();
    let counts: Vec<usize> = (0..shape.len())
        .map(|d| window_count(shape[d], size[d], step[d]))
        .collect();
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let coords: Vec<usize> = (0..shape.len()).map(|d| (gi / acc[d]) % shape[d]).collect();
        let mut lo = Vec::with_capacity(shape.len());
        let mut hi = Vec::with_capacity(shape.len());
        for d in 0..shape.len() {
            let (l, h) = covering_range(coords[d], size[d], step[d], counts[d]);
            lo.push(l);
            hi.push(h);
        }
        let mut acc_value = T::zero();
        for_each_window(&lo, &hi, &counts, |w, wc| {
            let mut offset = 0;
            for d in 0..shape.len() {
                offset += (coords[d] - wc[d] * step[d]) * acc_window[d];
            }
            let v: T = input.data.get(w * window_elems + offset);
            acc_value = acc_value + v;
        });
        *slot = acc_value;
    }
}

fn pooling_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    input: &CpuInput,
    size: &[usize],
    step: &[usize],
    max: bool,
) {
    let out_shape = node.shape();
    let acc = accumulated_strides(&out_shape);
    let acc_pred = accumulated_strides(&input.shape);
    let acc_kernel = accumulated_strides(size);
    let kernel_elems: usize = size.iter().product();
    let last = *input.shape.last().expect("pooling input has rank >= 2");
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let mut base = 0;
        for d in 0..out_shape.len() {
            let di = (gi / acc[d]) % out_shape[d];
            base += di * step[d] * acc_pred[d];
        }
        let mut acc_value: Option<T> = None;
        for k in 0..kernel_elems {
            let mut offset = 0;
            for d in 0..size.len() {
                let dk = (k / acc_kernel[d]) % size[d];
                offset += dk * acc_pred[d];
            }
            for ld in 0..last {
                let v: T = input.data.get(base + offset + ld);
                acc_value = Some(match acc_value {
                    None => v,
                    Some(a) if max => {
                        if v > a {
                            v
                        } else {
                            a
                        }
                    }
                    Some(a) => a + v,
                });
            }
        }
        *slot = acc_value.unwrap_or_else(T::zero);
    }
}

fn gradient_pooling_max_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    size: &[usize],
    step: &[usize],
) {
    let image = &inputs[1];
    let adjoint = &inputs[0];
    let shape = node.shape();
    let rank = shape.len();
    let acc_img = accumulated_strides(&shape);
    let counts = &adjoint.shape;
    let acc_kernel = accumulated_strides(size);
    let kernel_elems: usize = size.iter().product();
    let last = shape[rank - 1];
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let coords: Vec<usize> = (0..rank).map(|d| (gi / acc_img[d]) % shape[d]).collect();
        let mut lo = Vec::with_capacity(rank - 1);
        let mut hi = Vec::with_capacity(rank - 1);
        for d in 0..rank - 1 {
            let (l, h) = covering_range(coords[d], size[d], step[d], counts[d]);
            lo.push(l);
            hi.push(h);
        }
        let mut acc_value = 0.0f64;
        for_each_window(&lo, &hi, counts, |w, wc| {
            // First maximum of the window by linear index.
            let mut best_pos = usize::MAX;
            let mut best = f64::NEG_INFINITY;
            for k in 0..kernel_elems {
                let mut pos = 0;
                for d in 0..rank - 1 {
                    let dk = (k / acc_kernel[d]) % size[d];
                    pos += (wc[d] * step[d] + dk) * acc_img[d];
                }
                for ld in 0..last {
                    let v = image.data.get_f64(pos + ld);
                    if v > best {
                        best = v;
                        best_pos = pos + ld;
                    }
                }
            }
            if best_pos == gi {
                acc_value += adjoint.data.get_f64(w);
            }
        });
        *slot = T::from_f64(acc_value);
    }
}

// ---------------------------------------------------------------------------
// Operators

pub struct SlidingWindowOp;

impl Operator for SlidingWindowOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let (size, step) = window_params(node);
        dispatch_chunk!(out, |s| sliding_window_cpu(
            s,
            from,
            node,
            &inputs[0],
            &size,
            &step
        ));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let pred = node.predecessor(0);
        let par = state.find_or_insert_parameter(&pred);
        let (size, step) = window_params(node);
        let pred_shape = pred.shape();
        let rank = pred_shape.len();
        let acc_pred = accumulated_strides(&pred_shape);
        let acc_rest = accumulated_strides(&size);
        let counts: Vec<usize> = (0..rank)
            .map(|d| window_count(pred_shape[d], size[d], step[d]))
            .collect();
        let acc_win = accumulated_strides(&counts);
        let window_elems: usize = size.iter().product();
        let t = node.data_type().ocl_name();
        let mut body = format!(
            "{t} {name};\n{{\nlong wi = index / {window_elems};\nlong rest = index % {window_elems};\nlong src = 0;\n"
        );
        for d in 0..rank {
            body.push_str(&format!(
                "src += (wi / {aw}) * {sp};\nwi %= {aw};\nsrc += (rest / {ar}) * {ap};\nrest %= {ar};\n",
                aw = acc_win[d],
                sp = step[d] * acc_pred[d],
                ar = acc_rest[d],
                ap = acc_pred[d]
            ));
        }
        body.push_str(&format!("{name} = {par}[src];\n}}\n"));
        state.prepend(body);
        Ok(())
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (window stride, step * source stride, rest
        // stride, source stride) per dimension.
        "if (index >= num_entriesR) return;\n\
         long wi = index / window_elems;\n\
         long rest = index % window_elems;\n\
         long src = 0;\n\
         for (int d = 0; d < dimensions0; d++) {\n\
           src += (wi / geometry[4 * d]) * geometry[4 * d + 1];\n\
           wi %= geometry[4 * d];\n\
           src += (rest / geometry[4 * d + 2]) * geometry[4 * d + 3];\n\
           rest %= geometry[4 * d + 2];\n\
         }\n\
         R[index] = P0[src];\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t}* P0, long num_entries0, int dimensions0, long window_elems, const __global long* geometry",
            t = in_types[0].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let pred = node.predecessor(0);
        let (size, step) = window_params(node);
        let pred_shape = pred.shape();
        let acc_pred = accumulated_strides(&pred_shape);
        let acc_rest = accumulated_strides(&size);
        let counts: Vec<usize> = (0..pred_shape.len())
            .map(|d| window_count(pred_shape[d], size[d], step[d]))
            .collect();
        let acc_win = accumulated_strides(&counts);
        let mut geometry = Vec::new();
        for d in 0..pred_shape.len() {
            geometry.push(acc_win[d] as i64);
            geometry.push((step[d] * acc_pred[d]) as i64);
            geometry.push(acc_rest[d] as i64);
            geometry.push(acc_pred[d] as i64);
        }
        vec![
            KernelArg::Long(size.iter().product::<usize>() as i64),
            KernelArg::LongVec(geometry),
        ]
    }

    fn per_input_args(&self, node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        vec![KernelArg::Int(node.predecessor(0).rank() as i32)]
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let pred = node.predecessor(0);
        let (_, step) = window_params(node);
        unslide_window(adjoint, &pred.shape(), &step).map(Some)
    }

    fn operation_score(&self, node: &NodeRef) -> usize {
        window_params(node).0.iter().product::<usize>().max(1)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

pub struct UnslideWindowOp;

impl Operator for UnslideWindowOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let (_, step) = window_params(node);
        dispatch_chunk!(out, |s| unslide_cpu(s, from, node, &inputs[0], &step));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        // Summing over a runtime-dependent set of windows keeps this out
        // of fusion; as a root it still needs a body, built like the eager
        // kernel with its geometry baked in.
        let pred = node.predecessor(0);
        let par = state.find_or_insert_parameter(&pred);
        let (_, step) = window_params(node);
        let shape = node.shape();
        let pred_shape = pred.shape();
        let size = &pred_shape[1..];
        let acc = accumulated_strides(&shape);
        let acc_window = accumulated_strides(size);
        let window_elems: usize = size.iter().product();
        let counts: Vec<usize> = (0..shape.len())
            .map(|d| window_count(shape[d], size[d], step[d]))
            .collect();
        let acc_counts = accumulated_strides(&counts);
        let t = node.data_type().ocl_name();
        let mut body = format!("{t} {name} = 0;\n{{\n");
        for d in 0..shape.len() {
            body.push_str(&format!(
                "const long x{d} = (index / {a}) % {s};\n\
                 const long lo{d} = x{d} + 1 > {e} ? (x{d} + 1 - {e} + {st} - 1) / {st} : 0;\n\
                 const long hi{d} = min(x{d} / {st}, (long){hc});\n",
                a = acc[d],
                s = shape[d],
                e = size[d],
                st = step[d],
                hc = counts[d] - 1
            ));
        }
        for d in 0..shape.len() {
            body.push_str(&format!("for (long w{d} = lo{d}; w{d} <= hi{d}; w{d}++) {{\n"));
        }
        let mut w_linear = String::from("0");
        let mut offset = String::from("0");
        for d in 0..shape.len() {
            w_linear.push_str(&format!(" + w{d} * {}", acc_counts[d]));
            offset.push_str(&format!(" + (x{d} - w{d} * {st}) * {aw}", st = step[d], aw = acc_window[d]));
        }
        body.push_str(&format!(
            "{name} += {par}[({w_linear}) * {window_elems} + ({offset})];\n"
        ));
        for _ in 0..shape.len() {
            body.push_str("}\n");
        }
        body.push_str("}\n");
        state.prepend(body);
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (destination stride, destination dim, window
        // extent, step, window stride, window count) per dimension; the
        // nested ranges are flattened into an odometer loop.
        format!(
            "if (index >= num_entriesR) return;\n\
             {t} acc = 0;\n\
             long lo[8]; long hi[8]; long w[8];\n\
             int empty = 0;\n\
             for (int d = 0; d < dimensionsR; d++) {{\n\
               long x = (index / geometry[6 * d]) % geometry[6 * d + 1];\n\
               long e = geometry[6 * d + 2];\n\
               long st = geometry[6 * d + 3];\n\
               lo[d] = x + 1 > e ? (x + 1 - e + st - 1) / st : 0;\n\
               hi[d] = min(x / st, geometry[6 * d + 5] - 1);\n\
               if (lo[d] > hi[d]) empty = 1;\n\
               w[d] = lo[d];\n\
             }}\n\
             while (!empty) {{\n\
               long wl = 0; long off = 0;\n\
               for (int d = 0; d < dimensionsR; d++) {{\n\
                 long x = (index / geometry[6 * d]) % geometry[6 * d + 1];\n\
                 wl += w[d] * geometry[6 * d + 4];\n\
                 off += (x - w[d] * geometry[6 * d + 3]) * acc_window[d];\n\
               }}\n\
               acc += P0[wl * window_elems + off];\n\
               int d = dimensionsR - 1;\n\
               while (d >= 0 && w[d] == hi[d]) {{ w[d] = lo[d]; d--; }}\n\
               if (d < 0) break;\n\
               w[d]++;\n\
             }}\n\
             R[index] = acc;\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t}* P0, long num_entries0, int dimensionsR, long window_elems, const __global long* geometry, const __global long* acc_window",
            t = in_types[0].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let pred = node.predecessor(0);
        let (_, step) = window_params(node);
        let shape = node.shape();
        let pred_shape = pred.shape();
        let size = &pred_shape[1..];
        let acc = accumulated_strides(&shape);
        let acc_window = accumulated_strides(size);
        let counts: Vec<usize> = (0..shape.len())
            .map(|d| window_count(shape[d], size[d], step[d]))
            .collect();
        let acc_counts = accumulated_strides(&counts);
        let mut geometry = Vec::new();
        for d in 0..shape.len() {
            geometry.push(acc[d] as i64);
            geometry.push(shape[d] as i64);
            geometry.push(size[d] as i64);
            geometry.push(step[d] as i64);
            geometry.push(acc_counts[d] as i64);
            geometry.push(counts[d] as i64);
        }
        vec![
            KernelArg::Int(shape.len() as i32),
            KernelArg::Long(size.iter().product::<usize>() as i64),
            KernelArg::LongVec(geometry),
            KernelArg::LongVec(acc_window.iter().map(|&a| a as i64).collect()),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let pred = node.predecessor(0);
        let (_, step) = window_params(node);
        let size = pred.shape()[1..].to_vec();
        sliding_window(adjoint, &size, &step).map(Some)
    }

    fn operation_score(&self, node: &NodeRef) -> usize {
        let pred = node.predecessor(0);
        pred.shape()[1..].iter().product::<usize>().max(1)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

fn pooling_lazy_fragment(
    node: &NodeRef,
    name: &str,
    state: &mut CodegenState,
    max: bool,
) -> FlintResult<()> {
    let pred = node.predecessor(0);
    let par = state.find_or_insert_parameter(&pred);
    let (size, step) = window_params(node);
    let out_shape = node.shape();
    let pred_shape = pred.shape();
    let acc = accumulated_strides(&out_shape);
    let acc_pred = accumulated_strides(&pred_shape);
    let acc_kernel = accumulated_strides(&size);
    let kernel_elems: usize = size.iter().product();
    let last = pred_shape[pred_shape.len() - 1];
    let t = node.data_type().ocl_name();
    let init = if max {
        match node.data_type() {
            DataType::I32 => "INT_MIN".to_string(),
            DataType::I64 => "LONG_MIN".to_string(),
            DataType::F32 => "-INFINITY".to_string(),
            DataType::F64 => "-INFINITY".to_string(),
        }
    } else {
        "0".to_string()
    };
    let mut body = format!("{t} {name} = {init};\n{{\nlong base = 0;\n");
    for d in 0..out_shape.len() {
        body.push_str(&format!(
            "base += ((index / {a}) % {s}) * {sp};\n",
            a = acc[d],
            s = out_shape[d],
            sp = step[d] * acc_pred[d]
        ));
    }
    body.push_str(&format!(
        "for (long k = 0; k < {kernel_elems}; k++) {{\nlong o = 0;\n"
    ));
    for d in 0..size.len() {
        body.push_str(&format!(
            "o += ((k / {ak}) % {s}) * {ap};\n",
            ak = acc_kernel[d],
            s = size[d],
            ap = acc_pred[d]
        ));
    }
    let fold = if max {
        format!("{name} = max({name}, v)")
    } else {
        format!("{name} += v")
    };
    body.push_str(&format!(
        "for (long ld = 0; ld < {last}; ld++) {{\nconst {t} v = {par}[base + o + ld];\n{fold};\n}}\n}}\n}}\n"
    ));
    state.prepend(body);
    Ok(())
}

macro_rules! pooling_op {
    ($op:ident, $max:expr) => {
        pub struct $op;

        impl Operator for $op {
            fn cpu_kernel(
                &self,
                node: &NodeRef,
                inputs: &[CpuInput],
                out: OutChunk<'_>,
                from: usize,
            ) -> FlintResult<()> {
                let (size, step) = window_params(node);
                dispatch_chunk!(out, |s| pooling_cpu(
                    s,
                    from,
                    node,
                    &inputs[0],
                    &size,
                    &step,
                    $max
                ));
                Ok(())
            }

            fn lazy_fragment(
                &self,
                node: &NodeRef,
                name: &str,
                state: &mut CodegenState,
            ) -> FlintResult<()> {
                pooling_lazy_fragment(node, name, state, $max)
            }

            fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
                let init = if $max { "P0[base]" } else { "0" };
                let fold = if $max { "acc = max(acc, v);" } else { "acc += v;" };
                format!(
                    "if (index >= num_entriesR) return;\n\
                     long base = 0;\n\
                     for (int d = 0; d < dimensionsR; d++) {{\n\
                       base += ((index / geometry[4 * d]) % geometry[4 * d + 1]) * geometry[4 * d + 2];\n\
                     }}\n\
                     {t} acc = {init};\n\
                     for (long k = 0; k < kernel_elems; k++) {{\n\
                       long o = 0; long kk = k;\n\
                       for (int d = 0; d < dimensionsR; d++) {{\n\
                         o += (kk / kacc[2 * d]) * kacc[2 * d + 1];\n\
                         kk %= kacc[2 * d];\n\
                       }}\n\
                       for (long ld = 0; ld < last_dim; ld++) {{\n\
                         {t} v = P0[base + o + ld];\n\
                         {fold}\n\
                       }}\n\
                     }}\n\
                     R[index] = acc;\n",
                    t = out.ocl_name()
                )
            }

            fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
                format!(
                    ", const __global {t}* P0, long num_entries0, int dimensionsR, long kernel_elems, long last_dim, const __global long* geometry, const __global long* kacc",
                    t = in_types[0].ocl_name()
                )
            }

            fn type_permutations(&self) -> Vec<TypePermutation> {
                [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
                    .into_iter()
                    .map(|t| (t, vec![t]))
                    .collect()
            }

            fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
                let pred = node.predecessor(0);
                let (size, step) = window_params(node);
                let out_shape = node.shape();
                let pred_shape = pred.shape();
                let acc = accumulated_strides(&out_shape);
                let acc_pred = accumulated_strides(&pred_shape);
                let acc_kernel = accumulated_strides(&size);
                let mut geometry = Vec::new();
                for d in 0..out_shape.len() {
                    geometry.push(acc[d] as i64);
                    geometry.push(out_shape[d] as i64);
                    geometry.push((step[d] * acc_pred[d]) as i64);
                    geometry.push(0);
                }
                let mut kacc = Vec::new();
                for d in 0..size.len() {
                    kacc.push(acc_kernel[d] as i64);
                    kacc.push(acc_pred[d] as i64);
                }
                vec![
                    KernelArg::Int(out_shape.len() as i32),
                    KernelArg::Long(size.iter().product::<usize>() as i64),
                    KernelArg::Long(pred_shape[pred_shape.len() - 1] as i64),
                    KernelArg::LongVec(geometry),
                    KernelArg::LongVec(kacc),
                ]
            }

            fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
                Vec::new()
            }

            fn local_gradient(
                &self,
                node: &NodeRef,
                _index: usize,
                adjoint: &NodeRef,
            ) -> FlintResult<Option<NodeRef>> {
                pooling_gradient(node, adjoint, $max).map(Some)
            }

            fn operation_score(&self, node: &NodeRef) -> usize {
                let pred = node.predecessor(0);
                let (size, _) = window_params(node);
                (size.iter().product::<usize>()
                    * pred.shape()[pred.rank() - 1])
                    .max(1)
            }

            fn pushes_parameters(&self) -> bool {
                true
            }
        }
    };
}

pooling_op!(PoolingSumOp, false);
pooling_op!(PoolingMaxOp, true);

fn pooling_gradient(node: &NodeRef, adjoint: &NodeRef, max: bool) -> FlintResult<NodeRef> {
    let image = node.predecessor(0);
    let (size, step) = window_params(node);
    if max {
        Ok(crate::graph::new_node(
            OpKind::GradientPoolingMax { size, step },
            DataType::F64,
            image.shape(),
            vec![adjoint.clone(), image.clone()],
        ))
    } else {
        // Summing every window element is a convolution with an all-ones
        // kernel, so the image adjoint is the matching gradient kernel.
        let image_shape = image.shape();
        let mut kernel_shape = size.clone();
        kernel_shape.push(image_shape[image_shape.len() - 1]);
        let ones = new_store(
            TensorData::F64(vec![1.0; num_elements(&kernel_shape)]),
            kernel_shape,
        )?;
        conv::gradient_convolve1(&ones, adjoint, &step, &image_shape)
    }
}

pub struct GradientPoolingMaxOp;

impl Operator for GradientPoolingMaxOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let (size, step) = window_params(node);
        dispatch_chunk!(out, |s| gradient_pooling_max_cpu(
            s, from, node, inputs, &size, &step
        ));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let adjoint = node.predecessor(0);
        let image = node.predecessor(1);
        let par_a = state.find_or_insert_parameter(&adjoint);
        let par_img = state.find_or_insert_parameter(&image);
        let (size, step) = window_params(node);
        let shape = node.shape();
        let rank = shape.len();
        let win_dims = rank - 1;
        let acc_img = accumulated_strides(&shape);
        let counts = adjoint.shape();
        let acc_counts = accumulated_strides(&counts);
        let acc_kernel = accumulated_strides(&size);
        let kernel_elems: usize = size.iter().product();
        let last = shape[rank - 1];
        let t = node.data_type().ocl_name();
        let mut body = format!("{t} {name} = 0;\n{{\n");
        for d in 0..win_dims {
            body.push_str(&format!(
                "const long x{d} = (index / {ai}) % {is};\n\
                 const long lo{d} = x{d} + 1 > {e} ? (x{d} + 1 - {e} + {st} - 1) / {st} : 0;\n\
                 const long hi{d} = min(x{d} / {st}, (long){hc});\n",
                ai = acc_img[d],
                is = shape[d],
                e = size[d],
                st = step[d],
                hc = counts[d] - 1
            ));
        }
        for d in 0..win_dims {
            body.push_str(&format!("for (long w{d} = lo{d}; w{d} <= hi{d}; w{d}++) {{\n"));
        }
        let mut w_linear = String::from("0");
        for d in 0..win_dims {
            w_linear.push_str(&format!(" + w{d} * {}", acc_counts[d]));
        }
        body.push_str("long best_pos = -1;\ndouble best = -INFINITY;\n");
        body.push_str(&format!(
            "for (long k = 0; k < {kernel_elems}; k++) {{\nlong pos = 0;\n"
        ));
        for d in 0..win_dims {
            body.push_str(&format!(
                "pos += (w{d} * {st} + (k / {ak}) % {ks}) * {ai};\n",
                st = step[d],
                ak = acc_kernel[d],
                ks = size[d],
                ai = acc_img[d]
            ));
        }
        body.push_str(&format!(
            "for (long ld = 0; ld < {last}; ld++) {{\n\
             const double v = (double){par_img}[pos + ld];\n\
             if (v > best) {{ best = v; best_pos = pos + ld; }}\n}}\n}}\n\
             if (best_pos == index) {name} += ({t}){par_a}[{w_linear}];\n"
        ));
        for _ in 0..win_dims {
            body.push_str("}\n");
        }
        body.push_str("}\n");
        state.prepend(body);
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (image stride, image dim, window extent, step,
        // window-grid stride, window count) per windowed dimension.
        format!(
            "if (index >= num_entriesR) return;\n\
             {t} acc = 0;\n\
             long lo[8]; long hi[8]; long w[8];\n\
             int empty = 0;\n\
             for (int d = 0; d < win_dims; d++) {{\n\
               long x = (index / geometry[6 * d]) % geometry[6 * d + 1];\n\
               long e = geometry[6 * d + 2];\n\
               long st = geometry[6 * d + 3];\n\
               lo[d] = x + 1 > e ? (x + 1 - e + st - 1) / st : 0;\n\
               hi[d] = min(x / st, geometry[6 * d + 5] - 1);\n\
               if (lo[d] > hi[d]) empty = 1;\n\
               w[d] = lo[d];\n\
             }}\n\
             while (!empty) {{\n\
               long wl = 0;\n\
               long best_pos = -1;\n\
               double best = -INFINITY;\n\
               for (int d = 0; d < win_dims; d++) wl += w[d] * geometry[6 * d + 4];\n\
               for (long k = 0; k < kernel_elems; k++) {{\n\
                 long pos = 0; long kk = k;\n\
                 for (int d = 0; d < win_dims; d++) {{\n\
                   pos += (w[d] * geometry[6 * d + 3] + kk / kacc[2 * d]) * geometry[6 * d];\n\
                   kk %= kacc[2 * d];\n\
                 }}\n\
                 for (long ld = 0; ld < last_dim; ld++) {{\n\
                   double v = (double)P1[pos + ld];\n\
                   if (v > best) {{ best = v; best_pos = pos + ld; }}\n\
                 }}\n\
               }}\n\
               if (best_pos == index) acc += ({t})P0[wl];\n\
               int d = win_dims - 1;\n\
               while (d >= 0 && w[d] == hi[d]) {{ w[d] = lo[d]; d--; }}\n\
               if (d < 0) break;\n\
               w[d]++;\n\
             }}\n\
             R[index] = acc;\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t0}* P0, long num_entries0, const __global {t1}* P1, long num_entries1, int win_dims, long kernel_elems, long last_dim, const __global long* geometry, const __global long* kacc",
            t0 = in_types[0].ocl_name(),
            t1 = in_types[1].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
        types.into_iter().map(|t| (DataType::F64, vec![DataType::F64, t])).collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let (size, step) = window_params(node);
        let shape = node.shape();
        let adjoint = node.predecessor(0);
        let acc_img = accumulated_strides(&shape);
        let counts = adjoint.shape();
        let acc_counts = accumulated_strides(&counts);
        let acc_kernel = accumulated_strides(&size);
        let acc_pred_like: Vec<i64> = (0..size.len()).map(|d| acc_img[d] as i64).collect();
        let mut geometry = Vec::new();
        for d in 0..size.len() {
            geometry.push(acc_img[d] as i64);
            geometry.push(shape[d] as i64);
            geometry.push(size[d] as i64);
            geometry.push(step[d] as i64);
            geometry.push(acc_counts[d] as i64);
            geometry.push(counts[d] as i64);
        }
        let mut kacc = Vec::new();
        for d in 0..size.len() {
            kacc.push(acc_kernel[d] as i64);
            kacc.push(acc_pred_like[d]);
        }
        vec![
            KernelArg::Int(size.len() as i32),
            KernelArg::Long(size.iter().product::<usize>() as i64),
            KernelArg::Long(shape[shape.len() - 1] as i64),
            KernelArg::LongVec(geometry),
            KernelArg::LongVec(kacc),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }

    fn operation_score(&self, node: &NodeRef) -> usize {
        window_params(node).0.iter().product::<usize>().max(1)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::new_store;

    #[test]
    fn sliding_window_shape() {
        let a = new_store(TensorData::I32((0..25).collect()), vec![5, 5]).unwrap();
        let w = sliding_window(&a, &[3, 3], &[1, 1]).unwrap();
        assert_eq!(w.shape(), vec![9, 3, 3]);
        let w = sliding_window(&a, &[3, 3], &[2, 2]).unwrap();
        assert_eq!(w.shape(), vec![4, 3, 3]);
    }

    #[test]
    fn pooling_shape_drops_last_dimension() {
        let a = new_store(TensorData::I32((0..24).collect()), vec![4, 3, 2]).unwrap();
        let p = pooling_sum(&a, &[2, 2], &[1, 1]).unwrap();
        assert_eq!(p.shape(), vec![3, 2]);
    }

    #[test]
    fn unslide_validates_window_count() {
        let a = new_store(TensorData::I32((0..36).collect()), vec![4, 3, 3]).unwrap();
        assert!(unslide_window(&a, &[5, 5], &[1, 2]).is_err());
        let b = new_store(TensorData::I32((0..54).collect()), vec![6, 3, 3]).unwrap();
        assert!(unslide_window(&b, &[5, 5], &[1, 2]).is_ok());
    }
}
