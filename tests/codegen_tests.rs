//! The fusion compiler and its caches, exercised at the source level so
//! no device is required: structural keys, compile-once behavior, the
//! fusion frontier at push-parameter operations, and the eager library.

use flint::backend::gpu::{cache, codegen, eager};
use flint::graph::OpCode;
use flint::{DataType, Tensor};

fn chain(shape: &[usize]) -> Tensor {
    let a = Tensor::constant(1.0, shape, DataType::F32).unwrap();
    let b = Tensor::constant(2.0, shape, DataType::F32).unwrap();
    a.add(&b).unwrap().sin().unwrap().mul(&b).unwrap()
}

#[test]
fn identical_structures_share_one_kernel() {
    // An unusual shape keeps this test's cache keys to itself.
    let shape = [13, 7];
    let first = codegen::generate_fused_kernel(chain(&shape).node()).unwrap();
    let second = codegen::generate_fused_kernel(chain(&shape).node()).unwrap();
    assert_eq!(first.cache_key, second.cache_key);
    assert_eq!(first.source, second.source);

    let (_, generated_first) = cache::intern(&first.cache_key, || first.source.clone());
    let before = cache::generation_count();
    let (cached, generated_second) = cache::intern(&second.cache_key, || second.source.clone());
    assert!(!generated_second, "structural repeat must hit the cache");
    assert_eq!(cache::generation_count(), before);
    assert_eq!(cached, first.source);
    let _ = generated_first;
}

#[test]
fn different_structures_get_different_kernels() {
    let shape = [11, 5];
    let a = Tensor::constant(1.0, &shape, DataType::F32).unwrap();
    let b = Tensor::constant(2.0, &shape, DataType::F32).unwrap();
    let sum = a.add(&b).unwrap();
    let product = a.mul(&b).unwrap();
    let k1 = codegen::generate_fused_kernel(sum.node()).unwrap();
    let k2 = codegen::generate_fused_kernel(product.node()).unwrap();
    assert_ne!(k1.cache_key, k2.cache_key);

    // Same structure, different types: also distinct.
    let ai = Tensor::constant(1.0, &shape, DataType::I32).unwrap();
    let bi = Tensor::constant(2.0, &shape, DataType::I32).unwrap();
    let k3 = codegen::generate_fused_kernel(ai.add(&bi).unwrap().node()).unwrap();
    assert_ne!(k1.cache_key, k3.cache_key);
}

#[test]
fn elementwise_chains_fuse_into_one_body() {
    let shape = [4, 4];
    let a = Tensor::from_vec(vec![0.5f32; 16], &shape).unwrap();
    let b = Tensor::from_vec(vec![1.5f32; 16], &shape).unwrap();
    let c = a.add(&b).unwrap().exp().unwrap().neg().unwrap();
    let kernel = codegen::generate_fused_kernel(c.node()).unwrap();
    // Both stores become parameters; nothing in between is materialized.
    assert_eq!(kernel.parameters.len(), 2);
    assert!(kernel.source.contains("exp("));
    assert!(kernel.source.contains("R[index] = v0;"));
    assert_eq!(kernel.out_type, DataType::F32);
    assert_eq!(kernel.num_entries, 16);
}

#[test]
fn push_parameter_operations_cut_the_fusion() {
    let a = Tensor::from_vec(vec![1.0f32; 4], &[2, 2]).unwrap();
    let b = Tensor::from_vec(vec![2.0f32; 4], &[2, 2]).unwrap();
    let m = a.matmul(&b).unwrap();
    let out = m.sin().unwrap();
    let kernel = codegen::generate_fused_kernel(out.node()).unwrap();
    // The matmul is not inlined into the elementwise kernel; it appears
    // as a single input parameter instead.
    assert_eq!(kernel.parameters.len(), 1);
    assert_eq!(kernel.parameters[0].code(), OpCode::MatMul);

    // As the root, the same matmul is emitted inline.
    let root = codegen::generate_fused_kernel(m.node()).unwrap();
    assert_eq!(root.parameters.len(), 2);
    assert!(root.source.contains("for (int i = 0;"));
}

#[test]
fn materialized_nodes_become_parameters() {
    let a = Tensor::from_vec(vec![1.0f32; 4], &[4]).unwrap();
    let b = a.add_scalar(1.0).unwrap();
    b.execute().unwrap();
    let c = b.sqrt().unwrap();
    let kernel = codegen::generate_fused_kernel(c.node()).unwrap();
    // The executed sum is a frontier, not a re-emitted fragment.
    assert_eq!(kernel.parameters.len(), 1);
    assert_eq!(kernel.parameters[0].id(), b.node().id());
}

#[test]
fn shared_operands_are_deduplicated() {
    let a = Tensor::from_vec(vec![1.0f32; 4], &[4]).unwrap();
    let sum = a.add(&a).unwrap();
    let kernel = codegen::generate_fused_kernel(sum.node()).unwrap();
    assert_eq!(kernel.parameters.len(), 1);
    assert!(kernel.source.contains("P0"));
    assert!(!kernel.source.contains("P1"));
}

#[test]
fn broadcast_operands_get_the_index_wrap() {
    let a = Tensor::from_vec(vec![1.0f32; 6], &[2, 3]).unwrap();
    let b = Tensor::from_vec(vec![1.0f32; 3], &[3]).unwrap();
    let kernel = codegen::generate_fused_kernel(a.add(&b).unwrap().node()).unwrap();
    assert!(kernel.source.contains("(index / 1) % 3"));
    assert!(kernel.source.contains("old_index0"));
    // Equal shapes stay unwrapped.
    let same = Tensor::from_vec(vec![1.0f32; 6], &[2, 3]).unwrap();
    let kernel = codegen::generate_fused_kernel(a.add(&same).unwrap().node()).unwrap();
    assert!(!kernel.source.contains("old_index"));
}

#[test]
fn shape_changes_rebind_and_restore_the_index() {
    let a = Tensor::from_vec((0..6).map(|v| v as f32).collect(), &[2, 3]).unwrap();
    let t = a.transpose(&[1, 0]).unwrap().exp().unwrap();
    let kernel = codegen::generate_fused_kernel(t.node()).unwrap();
    let src = &kernel.source;
    let save = src.find("const long old_index0 = index;").expect("save missing");
    let restore = src.find("index = old_index0;").expect("restore missing");
    let load = src.find("P0[index]").expect("parameter load missing");
    assert!(save < load && load < restore, "load must sit inside the rebound region");
}

#[test]
fn alignment_marks_plain_index_loads_only() {
    // Equal shapes everywhere: both stores are read at the global index
    // and either buffer could take the output's place.
    let a = Tensor::from_vec(vec![1.0f32; 6], &[2, 3]).unwrap();
    let b = Tensor::from_vec(vec![2.0f32; 6], &[2, 3]).unwrap();
    let kernel = codegen::generate_fused_kernel(a.add(&b).unwrap().exp().unwrap().node()).unwrap();
    assert_eq!(kernel.aligned_parameters, vec![true, true]);

    // A broadcast operand is read through the index wrap.
    let small = Tensor::from_vec(vec![1.0f32; 3], &[3]).unwrap();
    let kernel = codegen::generate_fused_kernel(a.add(&small).unwrap().node()).unwrap();
    assert_eq!(kernel.aligned_parameters, vec![true, false]);

    // A shape-changing subtree rebinds the index before the load.
    let kernel =
        codegen::generate_fused_kernel(a.transpose(&[1, 0]).unwrap().exp().unwrap().node())
            .unwrap();
    assert_eq!(kernel.aligned_parameters, vec![false]);

    // Push-parameter roots read their inputs at computed offsets.
    let sq = Tensor::from_vec(vec![1.0f32; 4], &[2, 2]).unwrap();
    let kernel = codegen::generate_fused_kernel(sq.matmul(&sq).unwrap().node()).unwrap();
    assert_eq!(kernel.aligned_parameters, vec![false]);
}

#[test]
fn fused_source_declares_every_parameter() {
    let a = Tensor::from_vec(vec![1.0f64; 4], &[4]).unwrap();
    let b = Tensor::from_vec(vec![1i32; 4], &[4]).unwrap();
    let kernel =
        codegen::generate_fused_kernel(a.add(&b.convert(DataType::F64).unwrap()).unwrap().node())
            .unwrap();
    for i in 0..kernel.parameters.len() {
        assert!(kernel.source.contains(&format!("P{i}")));
        assert!(kernel.source.contains(&format!("num_entries_P{i}")));
    }
}

#[test]
fn eager_library_covers_the_operation_set() {
    let library = eager::render_library();
    assert!(!library.is_empty());
    // Binary arithmetic has all sixteen type pairings.
    let adds = library.iter().filter(|(n, _)| n.starts_with("add_")).count();
    assert_eq!(adds, 16);
    // Float-only functions restrict their permutations.
    let sins: Vec<&String> = library
        .iter()
        .filter(|(n, _)| n.starts_with("sin_"))
        .map(|(n, _)| n)
        .collect();
    assert_eq!(sins.len(), 2);
    for (name, source) in &library {
        assert!(source.starts_with("__kernel void"), "{name}");
    }
}

#[test]
fn eager_kernels_carry_the_broadcast_wrap() {
    let src = eager::render_kernel(OpCode::Add, DataType::F32, &[DataType::F32, DataType::F32]);
    assert!(src.contains("inv_broad0"));
    assert!(src.contains("inv_broad1"));
    let src = eager::render_kernel(
        OpCode::MatMul,
        DataType::F64,
        &[DataType::F64, DataType::F64],
    );
    assert!(src.contains("long l, long m, long n"));
}
