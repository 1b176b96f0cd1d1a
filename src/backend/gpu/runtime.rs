//! The device side of the OpenCL backend: context/queue ownership, buffer
//! upload and download, fused-kernel compilation keyed by the structural
//! cache key, and the two dispatch paths.

use std::collections::HashMap;
use std::sync::Arc;

use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{cache, codegen, eager};
use crate::context::{self, BackendMask};
use crate::data::{DataType, TensorData};
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpCode, OpKind};
use crate::memory::{self, ResultData};
use crate::ops::{operator_for, KernelArg};

/// A buffer resident on the device, typed like its host counterpart.
#[derive(Clone)]
pub enum DeviceBuffer {
    I32(Arc<Buffer<i32>>),
    I64(Arc<Buffer<i64>>),
    F32(Arc<Buffer<f32>>),
    F64(Arc<Buffer<f64>>),
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (t, len) = match self {
            DeviceBuffer::I32(b) => (DataType::I32, b.len()),
            DeviceBuffer::I64(b) => (DataType::I64, b.len()),
            DeviceBuffer::F32(b) => (DataType::F32, b.len()),
            DeviceBuffer::F64(b) => (DataType::F64, b.len()),
        };
        write!(f, "DeviceBuffer({t:?}, {len})")
    }
}

struct GpuContext {
    device: Device,
    context: Context,
    queue: Queue,
    /// Compiled fused programs by structural cache key.
    fused: Mutex<HashMap<String, Program>>,
    /// Compiled eager programs by kernel name.
    eager: Mutex<HashMap<String, Program>>,
}

static GPU: Lazy<Mutex<Option<Arc<GpuContext>>>> = Lazy::new(|| Mutex::new(None));

fn ocl_err(e: ocl::Error) -> FlintError {
    FlintError::OclError(e.to_string())
}

pub fn is_available() -> bool {
    !Platform::list().is_empty()
}

pub fn init_gpu() -> FlintResult<()> {
    let mut slot = GPU.lock();
    if slot.is_some() {
        return Ok(());
    }
    let platform = Platform::list().into_iter().next().ok_or_else(|| {
        FlintError::OclError("no OpenCL platform present".to_string())
    })?;
    let device = Device::first(platform).map_err(ocl_err)?;
    let context = Context::builder()
        .platform(platform)
        .devices(device)
        .build()
        .map_err(ocl_err)?;
    let queue = Queue::new(&context, device, None).map_err(ocl_err)?;
    info!(device = %device.name().unwrap_or_else(|_| "unknown".to_string()), "OpenCL backend up");
    *slot = Some(Arc::new(GpuContext {
        device,
        context,
        queue,
        fused: Mutex::new(HashMap::new()),
        eager: Mutex::new(HashMap::new()),
    }));
    context::CONTEXT.mark_initialized(BackendMask::GPU);
    Ok(())
}

pub fn cleanup_gpu() {
    *GPU.lock() = None;
    context::CONTEXT.mark_uninitialized(BackendMask::GPU);
}

fn gpu() -> FlintResult<Arc<GpuContext>> {
    if let Some(ctx) = GPU.lock().clone() {
        return Ok(ctx);
    }
    init_gpu()?;
    GPU.lock().clone().ok_or_else(|| {
        FlintError::InternalError("GPU context vanished after initialization".to_string())
    })
}

fn alloc(ctx: &GpuContext, dtype: DataType, len: usize) -> FlintResult<DeviceBuffer> {
    macro_rules! build {
        ($t:ty, $variant:ident) => {
            Buffer::<$t>::builder()
                .queue(ctx.queue.clone())
                .len(len)
                .build()
                .map(|b| DeviceBuffer::$variant(Arc::new(b)))
                .map_err(|e| FlintError::OutOfMemory(e.to_string()))
        };
    }
    match dtype {
        DataType::I32 => build!(i32, I32),
        DataType::I64 => build!(i64, I64),
        DataType::F32 => build!(f32, F32),
        DataType::F64 => build!(f64, F64),
    }
}

fn upload(ctx: &GpuContext, data: &TensorData) -> FlintResult<DeviceBuffer> {
    macro_rules! up {
        ($v:expr, $variant:ident) => {
            Buffer::builder()
                .queue(ctx.queue.clone())
                .len($v.len())
                .copy_host_slice($v)
                .build()
                .map(|b| DeviceBuffer::$variant(Arc::new(b)))
                .map_err(|e| FlintError::OutOfMemory(e.to_string()))
        };
    }
    match data {
        TensorData::I32(v) => up!(v, I32),
        TensorData::I64(v) => up!(v, I64),
        TensorData::F32(v) => up!(v, F32),
        TensorData::F64(v) => up!(v, F64),
    }
}

/// Downloads a node's device result into a host buffer.
pub fn download_result(node: &NodeRef) -> FlintResult<TensorData> {
    let device = node.with_result(|r| r.and_then(|r| r.device.clone())).ok_or_else(|| {
        FlintError::InternalError("no device buffer to synchronize".to_string())
    })?;
    macro_rules! down {
        ($b:expr, $variant:ident, $zero:expr) => {{
            let mut host = vec![$zero; $b.len()];
            $b.read(&mut host).enq().map_err(ocl_err)?;
            Ok(TensorData::$variant(host))
        }};
    }
    match device {
        DeviceBuffer::I32(b) => down!(b, I32, 0i32),
        DeviceBuffer::I64(b) => down!(b, I64, 0i64),
        DeviceBuffer::F32(b) => down!(b, F32, 0f32),
        DeviceBuffer::F64(b) => down!(b, F64, 0f64),
    }
}

/// Device residency for a node that already has a result; uploads the
/// host buffer on first use and caches the handle on the result.
fn ensure_on_device(ctx: &GpuContext, node: &NodeRef) -> FlintResult<DeviceBuffer> {
    if let Some(buf) = node.with_result(|r| r.and_then(|r| r.device.clone())) {
        return Ok(buf);
    }
    let host = memory::result_buffer(node)?;
    let buf = upload(ctx, &host)?;
    node.with_result_mut(|r| {
        if let Some(r) = r {
            r.device = Some(buf.clone());
        }
    });
    Ok(buf)
}

enum BoundArg {
    Device(DeviceBuffer),
    Int(i32),
    Long(i64),
    Double(f64),
}

fn bind_extra(ctx: &GpuContext, args: Vec<KernelArg>, keep: &mut Vec<DeviceBuffer>) -> FlintResult<Vec<BoundArg>> {
    let mut bound = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            KernelArg::Int(v) => bound.push(BoundArg::Int(v)),
            KernelArg::Long(v) => bound.push(BoundArg::Long(v)),
            KernelArg::Double(v) => bound.push(BoundArg::Double(v)),
            KernelArg::LongVec(v) => {
                let buf = upload(ctx, &TensorData::I64(v))?;
                keep.push(buf.clone());
                bound.push(BoundArg::Device(buf));
            }
        }
    }
    Ok(bound)
}

/// Detaches an overwritten device buffer from the donor's result. A host
/// copy, if present, still holds the donor's values and stays; otherwise
/// the result is gone and the next read recomputes it.
fn surrender_device_buffer(donor: &NodeRef) {
    donor.with_result_mut(|slot| match slot {
        Some(res) if res.data.is_some() => res.device = None,
        other => *other = None,
    });
}

fn device_refcount(buffer: &DeviceBuffer) -> usize {
    match buffer {
        DeviceBuffer::I32(b) => Arc::strong_count(b),
        DeviceBuffer::I64(b) => Arc::strong_count(b),
        DeviceBuffer::F32(b) => Arc::strong_count(b),
        DeviceBuffer::F64(b) => Arc::strong_count(b),
    }
}

/// Whether `donor`'s device buffer may be overwritten with this dispatch's
/// output: same type and footprint, not storage, unwatched, and nothing
/// outside the current dispatch holds the node or its buffer.
/// `expected_refs` is the reference count a donor with one consumer and no
/// outside handles has at the call site; `buffer_holders` counts the local
/// buffer clones beyond the donor's own result slot.
fn can_overwrite(
    donor: &NodeRef,
    buffer: &DeviceBuffer,
    out_type: DataType,
    num_entries: usize,
    expected_refs: usize,
    buffer_holders: usize,
) -> bool {
    donor.data_type() == out_type
        && donor.num_elements() == num_entries
        && donor.code() != OpCode::Store
        && !donor.has_gradient_watchers()
        && donor.reference_count() == expected_refs
        && device_refcount(buffer) == buffer_holders + 1
}

fn push_arg(builder: &mut ocl::builders::KernelBuilder<'_>, arg: &BoundArg) {
    match arg {
        BoundArg::Device(DeviceBuffer::I32(b)) => builder.arg(b.as_ref()),
        BoundArg::Device(DeviceBuffer::I64(b)) => builder.arg(b.as_ref()),
        BoundArg::Device(DeviceBuffer::F32(b)) => builder.arg(b.as_ref()),
        BoundArg::Device(DeviceBuffer::F64(b)) => builder.arg(b.as_ref()),
        BoundArg::Int(v) => builder.arg(*v),
        BoundArg::Long(v) => builder.arg(*v),
        BoundArg::Double(v) => builder.arg(*v),
    };
}

fn build_and_run(
    ctx: &GpuContext,
    program: &Program,
    name: &str,
    out: &DeviceBuffer,
    num_entries: usize,
    args: &[BoundArg],
) -> FlintResult<()> {
    let mut builder = Kernel::builder();
    builder
        .program(program)
        .name(name)
        .queue(ctx.queue.clone())
        .global_work_size(num_entries);
    match out {
        DeviceBuffer::I32(b) => builder.arg(b.as_ref()),
        DeviceBuffer::I64(b) => builder.arg(b.as_ref()),
        DeviceBuffer::F32(b) => builder.arg(b.as_ref()),
        DeviceBuffer::F64(b) => builder.arg(b.as_ref()),
    };
    builder.arg(num_entries as i64);
    for arg in args {
        push_arg(&mut builder, arg);
    }
    let kernel = builder.build().map_err(ocl_err)?;
    unsafe { kernel.enq().map_err(ocl_err)? };
    ctx.queue.finish().map_err(ocl_err)?;
    Ok(())
}

/// Fuses as much of the subgraph under `node` as possible into one kernel
/// and runs it. Parameter nodes (materialized results and push-parameter
/// operations) are executed first, recursively.
pub fn execute_gpu_lazily(node: &NodeRef) -> FlintResult<()> {
    if node.has_result() {
        return Ok(());
    }
    let ctx = gpu()?;
    let fused = codegen::generate_fused_kernel(node)?;
    for param in &fused.parameters {
        if !param.has_result() {
            execute_gpu_lazily(param)?;
        }
    }
    let (source, newly_generated) = cache::intern(&fused.cache_key, || fused.source.clone());
    {
        let mut programs = ctx.fused.lock();
        if !programs.contains_key(&fused.cache_key) {
            debug!(key = %fused.cache_key, "compiling fused kernel");
            let program = Program::builder()
                .src(source)
                .devices(ctx.device)
                .build(&ctx.context)
                .map_err(|e| FlintError::OclError(format!("kernel compilation failed: {e}")))?;
            programs.insert(fused.cache_key.clone(), program);
        } else if newly_generated {
            debug!(key = %fused.cache_key, "source regenerated for an already compiled kernel");
        }
    }
    let mut buffers = Vec::with_capacity(fused.parameters.len());
    for param in &fused.parameters {
        buffers.push(ensure_on_device(&ctx, param)?);
    }
    // An aligned parameter of matching type and footprint may hand its
    // device buffer over as the output; the donor keeps at most its host
    // copy and otherwise recomputes on the next read. The registry's
    // reuse mask has the final say for direct predecessors of the root.
    let root_mask = operator_for(node.code()).reuses_inputs(node);
    let preds = node.predecessors();
    let donor = fused.parameters.iter().enumerate().position(|(i, param)| {
        let in_preds = preds.iter().filter(|p| p.id() == param.id()).count();
        let mask_ok = preds
            .iter()
            .position(|p| p.id() == param.id())
            .map_or(true, |j| root_mask.get(j).copied().unwrap_or(false));
        fused.aligned_parameters[i]
            && mask_ok
            && can_overwrite(
                param,
                &buffers[i],
                fused.out_type,
                fused.num_entries,
                2 + in_preds,
                1,
            )
    });
    let out = match donor {
        Some(i) => buffers[i].clone(),
        None => alloc(&ctx, fused.out_type, fused.num_entries)?,
    };
    let mut args = Vec::with_capacity(2 * buffers.len());
    for (param, buf) in fused.parameters.iter().zip(&buffers) {
        args.push(BoundArg::Device(buf.clone()));
        args.push(BoundArg::Long(param.num_elements() as i64));
    }
    let programs = ctx.fused.lock();
    let program = programs.get(&fused.cache_key).ok_or_else(|| {
        FlintError::InternalError("compiled kernel disappeared from the cache".to_string())
    })?;
    build_and_run(&ctx, program, "execute_graph", &out, fused.num_entries, &args)?;
    drop(programs);
    if let Some(i) = donor {
        surrender_device_buffer(&fused.parameters[i]);
    }
    drop(buffers);
    node.set_result(ResultData::from_device(out, fused.num_entries));
    Ok(())
}

/// Runs exactly one prebuilt kernel for `node`, materializing its
/// predecessors first (on the device).
pub fn execute_gpu_eagerly(node: &NodeRef) -> FlintResult<()> {
    if node.has_result() {
        return Ok(());
    }
    let ctx = gpu()?;
    if let OpKind::Store { data } = node.kind() {
        node.set_result(ResultData::from_host(data));
        return Ok(());
    }
    let preds = node.predecessors();
    for pred in &preds {
        if !pred.has_result() {
            execute_gpu_eagerly(pred)?;
        }
    }
    let code = node.code();
    let op = operator_for(code);
    let out_type = node.data_type();
    let in_types: Vec<DataType> = preds.iter().map(|p| p.data_type()).collect();
    let name = eager::kernel_name(code, out_type, &in_types);
    {
        let mut programs = ctx.eager.lock();
        if !programs.contains_key(&name) {
            let source = eager::render_kernel(code, out_type, &in_types);
            let program = Program::builder()
                .src(source)
                .devices(ctx.device)
                .build(&ctx.context)
                .map_err(|e| FlintError::OclError(format!("kernel compilation failed: {e}")))?;
            programs.insert(name.clone(), program);
        }
    }
    let n = node.num_elements();
    let mut buffers = Vec::with_capacity(preds.len());
    for pred in &preds {
        buffers.push(ensure_on_device(&ctx, pred)?);
    }
    // The registry's reuse mask names inputs whose buffer the kernel may
    // overwrite; the first one nothing else holds becomes the output.
    let mask = op.reuses_inputs(node);
    let donor = preds.iter().enumerate().position(|(i, pred)| {
        let held = preds.iter().filter(|p| p.id() == pred.id()).count();
        mask.get(i).copied().unwrap_or(false)
            && can_overwrite(pred, &buffers[i], out_type, n, 2 * held, held)
    });
    let out = match donor {
        Some(i) => buffers[i].clone(),
        None => alloc(&ctx, out_type, n)?,
    };
    let mut keep = Vec::new();
    let mut args = Vec::new();
    for (i, pred) in preds.iter().enumerate() {
        args.push(BoundArg::Device(buffers[i].clone()));
        args.push(BoundArg::Long(pred.num_elements() as i64));
        args.extend(bind_extra(&ctx, op.per_input_args(node, i), &mut keep)?);
    }
    args.extend(bind_extra(&ctx, op.extra_args(node), &mut keep)?);
    let programs = ctx.eager.lock();
    let program = programs.get(&name).ok_or_else(|| {
        FlintError::InternalError("compiled kernel disappeared from the cache".to_string())
    })?;
    build_and_run(&ctx, program, &name, &out, n, &args)?;
    drop(programs);
    if let Some(i) = donor {
        surrender_device_buffer(&preds[i]);
    }
    drop(keep);
    drop(buffers);
    node.set_result(ResultData::from_device(out, n));
    Ok(())
}
