//! Convolution and its internal gradient helpers. A window slides over
//! all but the last dimension (which both operands share and contract);
//! windows start at every step inside the input, and kernel elements that
//! reach past the edge contribute nothing. A kernel of one rank more
//! enumerates filters in its first dimension, which becomes the last
//! output dimension.

use crate::backend::gpu::codegen::CodegenState;
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{new_node, NodeRef, OpKind};
use crate::ops::window::{covering_range, for_each_window};
use crate::ops::{finish, link_node, CpuInput, KernelArg, Operator, TypePermutation};
use crate::shape::accumulated_strides;

// ---------------------------------------------------------------------------
// Builders

/// Convolves `a` with `kernel`, stepping by `steps` (one entry per
/// windowed dimension, i.e. all but the last).
pub fn convolve(a: &NodeRef, kernel: &NodeRef, steps: &[usize]) -> FlintResult<NodeRef> {
    finish(convolve_builder(a, kernel, steps))
}

fn convolve_builder(a: &NodeRef, kernel: &NodeRef, steps: &[usize]) -> FlintResult<NodeRef> {
    let sa = a.shape();
    let sk = kernel.shape();
    if sa.len() < 2 {
        return Err(FlintError::IllegalDimensionality(
            "convolution input needs rank 2 or higher".to_string(),
        ));
    }
    let multifilter = match sk.len() {
        n if n == sa.len() => false,
        n if n == sa.len() + 1 => true,
        _ => {
            return Err(FlintError::IllegalDimensionality(
                "kernel rank must equal the input rank, or exceed it by one for filters"
                    .to_string(),
            ))
        }
    };
    if sk[sk.len() - 1] != sa[sa.len() - 1] {
        return Err(FlintError::incompatible_shapes(
            &sa,
            &sk,
            "the contracted last dimensions differ",
        ));
    }
    if steps.len() != sa.len() - 1 || steps.iter().any(|&s| s == 0) {
        return Err(FlintError::IllegalDimension(
            "convolution needs one positive step per windowed dimension".to_string(),
        ));
    }
    let mut shape = Vec::with_capacity(sa.len());
    for d in 0..sa.len() - 1 {
        shape.push(sa[d].div_ceil(steps[d]));
    }
    if multifilter {
        shape.push(sk[0]);
    }
    let dtype = a.data_type().promote(kernel.data_type());
    link_node(
        OpKind::Convolve {
            steps: steps.to_vec(),
        },
        dtype,
        shape,
        vec![a.clone(), kernel.clone()],
    )
}

/// Internal: the convolution adjoint with respect to the image.
/// Predecessors are the kernel and the upstream adjoint.
pub(crate) fn gradient_convolve1(
    kernel: &NodeRef,
    adjoint: &NodeRef,
    steps: &[usize],
    image_shape: &[usize],
) -> FlintResult<NodeRef> {
    Ok(new_node(
        OpKind::GradientConvolve1 {
            steps: steps.to_vec(),
        },
        DataType::F64,
        image_shape.to_vec(),
        vec![kernel.clone(), adjoint.clone()],
    ))
}

/// Internal: the convolution adjoint with respect to the kernel.
/// Predecessors are the image and the upstream adjoint.
fn gradient_convolve2(
    image: &NodeRef,
    adjoint: &NodeRef,
    steps: &[usize],
    kernel_shape: &[usize],
) -> FlintResult<NodeRef> {
    Ok(new_node(
        OpKind::GradientConvolve2 {
            steps: steps.to_vec(),
        },
        DataType::F64,
        kernel_shape.to_vec(),
        vec![image.clone(), adjoint.clone()],
    ))
}

pub(crate) fn conv_steps(node: &NodeRef) -> Vec<usize> {
    node.with_operation(|op| match &op.kind {
        OpKind::Convolve { steps }
        | OpKind::GradientConvolve1 { steps }
        | OpKind::GradientConvolve2 { steps } => steps.clone(),
        _ => Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// CPU kernels

fn convolve_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    steps: &[usize],
) {
    let image = &inputs[0];
    let kernel = &inputs[1];
    let out_shape = node.shape();
    let multifilter = kernel.shape.len() == image.shape.len() + 1;
    let acc_out = accumulated_strides(&out_shape);
    let acc_img = accumulated_strides(&image.shape);
    let acc_k = accumulated_strides(&kernel.shape);
    let win_dims = image.shape.len() - 1;
    let filter_off = if multifilter { 1 } else { 0 };
    // Kernel elements of one filter, the contracted last dimension
    // included.
    let kernel_elems: usize = kernel.shape[filter_off..].iter().product();
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let f = if multifilter {
            (gi / acc_out[win_dims]) % out_shape[win_dims]
        } else {
            0
        };
        let mut base = vec![0usize; win_dims];
        for (d, b) in base.iter_mut().enumerate() {
            *b = ((gi / acc_out[d]) % out_shape[d]) * steps[d];
        }
        let mut acc = T::zero();
        'kernel: for k in 0..kernel_elems {
            let mut src = 0usize;
            for d in 0..win_dims {
                let dk = (k / acc_k[d + filter_off]) % kernel.shape[d + filter_off];
                let pos = base[d] + dk;
                if pos >= image.shape[d] {
                    continue 'kernel;
                }
                src += pos * acc_img[d];
            }
            src += k % kernel.shape[kernel.shape.len() - 1];
            let kv: T = kernel.data.get(f * kernel_elems + k);
            let iv: T = image.data.get(src);
            acc = acc + kv * iv;
        }
        *slot = acc;
    }
}

fn gradient_convolve1_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    steps: &[usize],
) {
    let kernel = &inputs[0];
    let adjoint = &inputs[1];
    let image_shape = node.shape();
    let rank = image_shape.len();
    let win_dims = rank - 1;
    let multifilter = kernel.shape.len() == rank + 1;
    let filter_off = if multifilter { 1 } else { 0 };
    let filters = if multifilter { kernel.shape[0] } else { 1 };
    let acc_img = accumulated_strides(&image_shape);
    let acc_k = accumulated_strides(&kernel.shape);
    let kernel_elems: usize = kernel.shape[filter_off..].iter().product();
    let counts = &adjoint.shape[..win_dims];
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let coords: Vec<usize> = (0..rank)
            .map(|d| (gi / acc_img[d]) % image_shape[d])
            .collect();
        let mut lo = Vec::with_capacity(win_dims);
        let mut hi = Vec::with_capacity(win_dims);
        for d in 0..win_dims {
            let (l, h) = covering_range(coords[d], kernel.shape[d + filter_off], steps[d], counts[d]);
            lo.push(l);
            hi.push(h);
        }
        let mut acc = 0.0f64;
        for_each_window(&lo, &hi, counts, |w, wc| {
            let mut koff = coords[rank - 1];
            for d in 0..win_dims {
                koff += (coords[d] - wc[d] * steps[d]) * acc_k[d + filter_off];
            }
            for f in 0..filters {
                let kv = kernel.data.get_f64(f * kernel_elems + koff);
                let av = adjoint.data.get_f64(w * filters + f);
                acc += kv * av;
            }
        });
        *slot = T::from_f64(acc);
    }
}

fn gradient_convolve2_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    steps: &[usize],
) {
    let image = &inputs[0];
    let adjoint = &inputs[1];
    let kernel_shape = node.shape();
    let rank = image.shape.len();
    let win_dims = rank - 1;
    let multifilter = kernel_shape.len() == rank + 1;
    let filter_off = if multifilter { 1 } else { 0 };
    let filters = if multifilter { kernel_shape[0] } else { 1 };
    let acc_img = accumulated_strides(&image.shape);
    let acc_k = accumulated_strides(&kernel_shape);
    let kernel_elems: usize = kernel_shape[filter_off..].iter().product();
    let counts = &adjoint.shape[..win_dims];
    let acc_counts = accumulated_strides(counts);
    let windows: usize = counts.iter().product();
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let f = if multifilter { gi / kernel_elems } else { 0 };
        let k = gi % kernel_elems;
        // Kernel coordinates over the image dimensions.
        let mut kc = Vec::with_capacity(rank);
        for d in 0..rank {
            kc.push((k / acc_k[d + filter_off]) % kernel_shape[d + filter_off]);
        }
        let mut acc = 0.0f64;
        'window: for w in 0..windows {
            let mut src = kc[rank - 1];
            for d in 0..win_dims {
                let wd = (w / acc_counts[d]) % counts[d];
                let pos = wd * steps[d] + kc[d];
                if pos >= image.shape[d] {
                    continue 'window;
                }
                src += pos * acc_img[d];
            }
            acc += image.data.get_f64(src) * adjoint.data.get_f64(w * filters + f);
        }
        *slot = T::from_f64(acc);
    }
}

// ---------------------------------------------------------------------------
// Operators

pub struct ConvolveOp;

impl Operator for ConvolveOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let steps = conv_steps(node);
        dispatch_chunk!(out, |s| convolve_cpu(s, from, node, inputs, &steps));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let image = node.predecessor(0);
        let kernel = node.predecessor(1);
        let par_img = state.find_or_insert_parameter(&image);
        let par_k = state.find_or_insert_parameter(&kernel);
        let steps = conv_steps(node);
        let out_shape = node.shape();
        let si = image.shape();
        let sk = kernel.shape();
        let multifilter = sk.len() == si.len() + 1;
        let filter_off = if multifilter { 1 } else { 0 };
        let acc_out = accumulated_strides(&out_shape);
        let acc_img = accumulated_strides(&si);
        let acc_k = accumulated_strides(&sk);
        let win_dims = si.len() - 1;
        let kernel_elems: usize = sk[filter_off..].iter().product();
        let t = node.data_type().ocl_name();
        let f = if multifilter {
            format!(
                "(index / {a}) % {s}",
                a = acc_out[win_dims],
                s = out_shape[win_dims]
            )
        } else {
            "0".to_string()
        };
        let mut body = format!(
            "{t} {name} = 0;\n{{\nconst long f = {f};\n\
             for (long k = 0; k < {kernel_elems}; k++) {{\nlong src = k % {last};\nint skip = 0;\n",
            last = sk[sk.len() - 1]
        );
        for d in 0..win_dims {
            body.push_str(&format!(
                "{{\nconst long pos = ((index / {ao}) % {os}) * {st} + (k / {ak}) % {ks};\n\
                 if (pos >= {is}) skip = 1; else src += pos * {ai};\n}}\n",
                ao = acc_out[d],
                os = out_shape[d],
                st = steps[d],
                ak = acc_k[d + filter_off],
                ks = sk[d + filter_off],
                is = si[d],
                ai = acc_img[d]
            ));
        }
        body.push_str(&format!(
            "if (!skip) {name} += {par_k}[f * {kernel_elems} + k] * {par_img}[src];\n}}\n}}\n"
        ));
        state.prepend(body);
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (output stride, output dim, step, kernel stride,
        // kernel dim, image dim, image stride) per windowed dimension.
        format!(
            "if (index >= num_entriesR) return;\n\
             {t} acc = 0;\n\
             long f = multifilter ? (index / filter_stride) % filters : 0;\n\
             for (long k = 0; k < kernel_elems; k++) {{\n\
               long src = k % last_dim;\n\
               int skip = 0;\n\
               for (int d = 0; d < win_dims; d++) {{\n\
                 long pos = ((index / geometry[7 * d]) % geometry[7 * d + 1]) * geometry[7 * d + 2]\n\
                          + (k / geometry[7 * d + 3]) % geometry[7 * d + 4];\n\
                 if (pos >= geometry[7 * d + 5]) {{ skip = 1; break; }}\n\
                 src += pos * geometry[7 * d + 6];\n\
               }}\n\
               if (!skip) acc += P1[f * kernel_elems + k] * P0[src];\n\
             }}\n\
             R[index] = acc;\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t0}* P0, long num_entries0, const __global {t1}* P1, long num_entries1, int win_dims, long kernel_elems, long last_dim, int multifilter, long filter_stride, long filters, const __global long* geometry",
            t0 = in_types[0].ocl_name(),
            t1 = in_types[1].ocl_name()
        )
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
        let image = node.predecessor(0);
        let kernel = node.predecessor(1);
        let steps = conv_steps(node);
        let out_shape = node.shape();
        let si = image.shape();
        let sk = kernel.shape();
        let multifilter = sk.len() == si.len() + 1;
        let filter_off = if multifilter { 1 } else { 0 };
        let acc_out = accumulated_strides(&out_shape);
        let acc_img = accumulated_strides(&si);
        let acc_k = accumulated_strides(&sk);
        let win_dims = si.len() - 1;
        let mut geometry = Vec::new();
        for d in 0..win_dims {
            geometry.push(acc_out[d] as i64);
            geometry.push(out_shape[d] as i64);
            geometry.push(steps[d] as i64);
            geometry.push(acc_k[d + filter_off] as i64);
            geometry.push(sk[d + filter_off] as i64);
            geometry.push(si[d] as i64);
            geometry.push(acc_img[d] as i64);
        }
        vec![
            KernelArg::Int(win_dims as i32),
            KernelArg::Long(sk[filter_off..].iter().product::<usize>() as i64),
            KernelArg::Long(sk[sk.len() - 1] as i64),
            KernelArg::Int(multifilter as i32),
            KernelArg::Long(acc_out[win_dims.min(out_shape.len() - 1)] as i64),
            KernelArg::Long(if multifilter { sk[0] } else { 1 } as i64),
            KernelArg::LongVec(geometry),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let image = node.predecessor(0);
        let kernel = node.predecessor(1);
        let steps = conv_steps(node);
        if index == 0 {
            gradient_convolve1(&kernel, adjoint, &steps, &image.shape()).map(Some)
        } else {
            gradient_convolve2(&image, adjoint, &steps, &kernel.shape()).map(Some)
        }
    }

    fn operation_score(&self, node: &NodeRef) -> usize {
        let kernel = node.predecessor(1);
        kernel.num_elements().max(1)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

pub struct GradientConvolve1Op;

impl Operator for GradientConvolve1Op {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let steps = conv_steps(node);
        dispatch_chunk!(out, |s| gradient_convolve1_cpu(s, from, node, inputs, &steps));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let kernel = node.predecessor(0);
        let adjoint = node.predecessor(1);
        let par_k = state.find_or_insert_parameter(&kernel);
        let par_a = state.find_or_insert_parameter(&adjoint);
        let steps = conv_steps(node);
        let image_shape = node.shape();
        let rank = image_shape.len();
        let win_dims = rank - 1;
        let sk = kernel.shape();
        let multifilter = sk.len() == rank + 1;
        let filter_off = if multifilter { 1 } else { 0 };
        let filters = if multifilter { sk[0] } else { 1 };
        let acc_img = accumulated_strides(&image_shape);
        let acc_k = accumulated_strides(&sk);
        let kernel_elems: usize = sk[filter_off..].iter().product();
        let counts: Vec<usize> = adjoint.shape()[..win_dims].to_vec();
        let acc_counts = accumulated_strides(&counts);
        let t = node.data_type().ocl_name();
        let mut body = format!("{t} {name} = 0;\n{{\n");
        for d in 0..win_dims {
            body.push_str(&format!(
                "const long x{d} = (index / {ai}) % {is};\n\
                 const long lo{d} = x{d} + 1 > {ks} ? (x{d} + 1 - {ks} + {st} - 1) / {st} : 0;\n\
                 const long hi{d} = min(x{d} / {st}, (long){hc});\n",
                ai = acc_img[d],
                is = image_shape[d],
                ks = sk[d + filter_off],
                st = steps[d],
                hc = counts[d] - 1
            ));
        }
        for d in 0..win_dims {
            body.push_str(&format!("for (long w{d} = lo{d}; w{d} <= hi{d}; w{d}++) {{\n"));
        }
        let mut koff = format!("index % {}", image_shape[rank - 1]);
        let mut w_linear = String::from("0");
        for d in 0..win_dims {
            koff.push_str(&format!(
                " + (x{d} - w{d} * {st}) * {ak}",
                st = steps[d],
                ak = acc_k[d + filter_off]
            ));
            w_linear.push_str(&format!(" + w{d} * {}", acc_counts[d]));
        }
        body.push_str(&format!(
            "for (long f = 0; f < {filters}; f++) {{\n\
             {name} += {par_k}[f * {kernel_elems} + ({koff})] * {par_a}[({w_linear}) * {filters} + f];\n}}\n"
        ));
        for _ in 0..win_dims {
            body.push_str("}\n");
        }
        body.push_str("}\n");
        state.prepend(body);
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (image stride, image dim, kernel extent, step,
        // kernel stride, window-grid stride, window count) per windowed
        // dimension.
        format!(
            "if (index >= num_entriesR) return;\n\
             {t} acc = 0;\n\
             long lo[8]; long hi[8]; long w[8];\n\
             int empty = 0;\n\
             for (int d = 0; d < win_dims; d++) {{\n\
               long x = (index / geometry[7 * d]) % geometry[7 * d + 1];\n\
               long e = geometry[7 * d + 2];\n\
               long st = geometry[7 * d + 3];\n\
               lo[d] = x + 1 > e ? (x + 1 - e + st - 1) / st : 0;\n\
               hi[d] = min(x / st, geometry[7 * d + 6] - 1);\n\
               if (lo[d] > hi[d]) empty = 1;\n\
               w[d] = lo[d];\n\
             }}\n\
             while (!empty) {{\n\
               long koff = index % last_dim;\n\
               long wl = 0;\n\
               for (int d = 0; d < win_dims; d++) {{\n\
                 long x = (index / geometry[7 * d]) % geometry[7 * d + 1];\n\
                 koff += (x - w[d] * geometry[7 * d + 3]) * geometry[7 * d + 4];\n\
                 wl += w[d] * geometry[7 * d + 5];\n\
               }}\n\
               for (long f = 0; f < filters; f++) {{\n\
                 acc += ({t})P0[f * kernel_elems + koff] * ({t})P1[wl * filters + f];\n\
               }}\n\
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
            ", const __global {t0}* P0, long num_entries0, const __global {t1}* P1, long num_entries1, int win_dims, long kernel_elems, long last_dim, long filters, const __global long* geometry",
            t0 = in_types[0].ocl_name(),
            t1 = in_types[1].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        vec![(DataType::F64, vec![DataType::F64, DataType::F64])]
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let kernel = node.predecessor(0);
        let adjoint = node.predecessor(1);
        let steps = conv_steps(node);
        let image_shape = node.shape();
        let rank = image_shape.len();
        let win_dims = rank - 1;
        let sk = kernel.shape();
        let multifilter = sk.len() == rank + 1;
        let filter_off = if multifilter { 1 } else { 0 };
        let acc_img = accumulated_strides(&image_shape);
        let acc_k = accumulated_strides(&sk);
        let counts: Vec<usize> = adjoint.shape()[..win_dims].to_vec();
        let acc_counts = accumulated_strides(&counts);
        let mut geometry = Vec::new();
        for d in 0..win_dims {
            geometry.push(acc_img[d] as i64);
            geometry.push(image_shape[d] as i64);
            geometry.push(sk[d + filter_off] as i64);
            geometry.push(steps[d] as i64);
            geometry.push(acc_k[d + filter_off] as i64);
            geometry.push(acc_counts[d] as i64);
            geometry.push(counts[d] as i64);
        }
        vec![
            KernelArg::Int(win_dims as i32),
            KernelArg::Long(sk[filter_off..].iter().product::<usize>() as i64),
            KernelArg::Long(image_shape[rank - 1] as i64),
            KernelArg::Long(if multifilter { sk[0] } else { 1 } as i64),
            KernelArg::LongVec(geometry),
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
        node.predecessor(0).num_elements().max(1)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

pub struct GradientConvolve2Op;

impl Operator for GradientConvolve2Op {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let steps = conv_steps(node);
        dispatch_chunk!(out, |s| gradient_convolve2_cpu(s, from, node, inputs, &steps));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let image = node.predecessor(0);
        let adjoint = node.predecessor(1);
        let par_img = state.find_or_insert_parameter(&image);
        let par_a = state.find_or_insert_parameter(&adjoint);
        let steps = conv_steps(node);
        let kernel_shape = node.shape();
        let si = image.shape();
        let rank = si.len();
        let win_dims = rank - 1;
        let multifilter = kernel_shape.len() == rank + 1;
        let filter_off = if multifilter { 1 } else { 0 };
        let filters = if multifilter { kernel_shape[0] } else { 1 };
        let acc_img = accumulated_strides(&si);
        let acc_k = accumulated_strides(&kernel_shape);
        let kernel_elems: usize = kernel_shape[filter_off..].iter().product();
        let counts: Vec<usize> = adjoint.shape()[..win_dims].to_vec();
        let acc_counts = accumulated_strides(&counts);
        let windows: usize = counts.iter().product();
        let t = node.data_type().ocl_name();
        let f = if multifilter {
            format!("index / {kernel_elems}")
        } else {
            "0".to_string()
        };
        let mut body = format!(
            "{t} {name} = 0;\n{{\nconst long f = {f};\nconst long k = index % {kernel_elems};\n\
             for (long w = 0; w < {windows}; w++) {{\nlong src = k % {last};\nint skip = 0;\n",
            last = si[rank - 1]
        );
        for d in 0..win_dims {
            body.push_str(&format!(
                "{{\nconst long pos = ((w / {ac}) % {c}) * {st} + (k / {ak}) % {ks};\n\
                 if (pos >= {is}) skip = 1; else src += pos * {ai};\n}}\n",
                ac = acc_counts[d],
                c = counts[d],
                st = steps[d],
                ak = acc_k[d + filter_off],
                ks = kernel_shape[d + filter_off],
                is = si[d],
                ai = acc_img[d]
            ));
        }
        body.push_str(&format!(
            "if (!skip) {name} += {par_img}[src] * {par_a}[w * {filters} + f];\n}}\n}}\n"
        ));
        state.prepend(body);
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (window-grid stride, window count, step, kernel
        // stride, kernel dim, image dim, image stride) per windowed
        // dimension.
        format!(
            "if (index >= num_entriesR) return;\n\
             {t} acc = 0;\n\
             long f = multifilter ? index / kernel_elems : 0;\n\
             long k = index % kernel_elems;\n\
             for (long w = 0; w < windows; w++) {{\n\
               long src = k % last_dim;\n\
               int skip = 0;\n\
               for (int d = 0; d < win_dims; d++) {{\n\
                 long pos = ((w / geometry[7 * d]) % geometry[7 * d + 1]) * geometry[7 * d + 2]\n\
                          + (k / geometry[7 * d + 3]) % geometry[7 * d + 4];\n\
                 if (pos >= geometry[7 * d + 5]) {{ skip = 1; break; }}\n\
                 src += pos * geometry[7 * d + 6];\n\
               }}\n\
               if (!skip) acc += ({t})P0[src] * ({t})P1[w * filters + f];\n\
             }}\n\
             R[index] = acc;\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t0}* P0, long num_entries0, const __global {t1}* P1, long num_entries1, int win_dims, long kernel_elems, long last_dim, int multifilter, long filters, long windows, const __global long* geometry",
            t0 = in_types[0].ocl_name(),
            t1 = in_types[1].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
        types
            .into_iter()
            .map(|t| (DataType::F64, vec![t, DataType::F64]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let image = node.predecessor(0);
        let adjoint = node.predecessor(1);
        let steps = conv_steps(node);
        let kernel_shape = node.shape();
        let si = image.shape();
        let rank = si.len();
        let win_dims = rank - 1;
        let multifilter = kernel_shape.len() == rank + 1;
        let filter_off = if multifilter { 1 } else { 0 };
        let acc_img = accumulated_strides(&si);
        let acc_k = accumulated_strides(&kernel_shape);
        let counts: Vec<usize> = adjoint.shape()[..win_dims].to_vec();
        let acc_counts = accumulated_strides(&counts);
        let mut geometry = Vec::new();
        for d in 0..win_dims {
            geometry.push(acc_counts[d] as i64);
            geometry.push(counts[d] as i64);
            geometry.push(steps[d] as i64);
            geometry.push(acc_k[d + filter_off] as i64);
            geometry.push(kernel_shape[d + filter_off] as i64);
            geometry.push(si[d] as i64);
            geometry.push(acc_img[d] as i64);
        }
        vec![
            KernelArg::Int(win_dims as i32),
            KernelArg::Long(kernel_shape[filter_off..].iter().product::<usize>() as i64),
            KernelArg::Long(si[rank - 1] as i64),
            KernelArg::Int(multifilter as i32),
            KernelArg::Long(if multifilter { kernel_shape[0] } else { 1 } as i64),
            KernelArg::Long(counts.iter().product::<usize>() as i64),
            KernelArg::LongVec(geometry),
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
        node.predecessor(1).num_elements().max(1)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}
