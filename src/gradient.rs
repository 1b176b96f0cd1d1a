//! Reverse-mode differentiation. Watched variables are tracked through
//! `gradient_info` sets while a gradient context is active; a backward
//! pass walks the subgraph from the output in reverse topological order,
//! asks every operation for its local gradient and accumulates adjoints.
//! Adjoints are `f64` regardless of the forward data type.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::data::DataType;
use crate::errors::{self, FlintError, FlintResult};
use crate::graph::{NodeId, NodeRef};
use crate::ops::arithmetic::add;
use crate::ops::reduce::reduce_sum;
use crate::ops::reshape::reshape;
use crate::ops::{generate, operator_for};

/// Marks `node` as a differentiation target.
pub fn mark_gradient_variable(node: &NodeRef) {
    node.watch();
}

/// Clears the mark set by [`mark_gradient_variable`].
pub fn unmark_gradient_variable(node: &NodeRef) {
    node.unwatch();
}

/// The derivative graph of `y` with respect to `x`. `x` must be watched
/// and reachable from `y` through nodes built inside a gradient context.
pub fn calculate_gradient(y: &NodeRef, x: &NodeRef) -> FlintResult<NodeRef> {
    calculate_gradients(y, std::slice::from_ref(x)).map(|mut v| v.remove(0))
}

/// Derivatives of `y` with respect to every entry of `xs`, computed in a
/// single backward pass.
pub fn calculate_gradients(y: &NodeRef, xs: &[NodeRef]) -> FlintResult<Vec<NodeRef>> {
    errors::record(calculate_gradients_inner(y, xs))
}

fn calculate_gradients_inner(y: &NodeRef, xs: &[NodeRef]) -> FlintResult<Vec<NodeRef>> {
    let targets: HashSet<NodeId> = xs.iter().map(|x| x.id()).collect();
    for x in xs {
        if !y.tracks(x.id()) {
            return Err(FlintError::IllegalDerive(
                "the output does not depend on the requested variable inside a gradient context"
                    .to_string(),
            ));
        }
    }
    let order = backward_order(y, &targets);
    let mut adjoints: HashMap<NodeId, NodeRef> = HashMap::new();
    adjoints.insert(
        y.id(),
        generate::constant_of(1.0, y.shape(), DataType::F64)?,
    );
    for node in &order {
        let adjoint = match adjoints.get(&node.id()) {
            Some(a) => a.clone(),
            None => continue,
        };
        let op = operator_for(node.code());
        for (i, pred) in node.predecessors().iter().enumerate() {
            if !tracks_any(pred, &targets) {
                continue;
            }
            let contribution = op.local_gradient(node, i, &adjoint)?.ok_or_else(|| {
                FlintError::IllegalDerive(format!(
                    "{:?} has no derivative with respect to operand {i}",
                    node.code()
                ))
            })?;
            let contribution = restore_shape(contribution, pred)?;
            trace!(node = node.id(), pred = pred.id(), "accumulating adjoint");
            match adjoints.remove(&pred.id()) {
                Some(existing) => {
                    adjoints.insert(pred.id(), add(&existing, &contribution)?);
                }
                None => {
                    adjoints.insert(pred.id(), contribution);
                }
            }
        }
    }
    xs.iter()
        .map(|x| {
            adjoints.get(&x.id()).cloned().ok_or_else(|| {
                FlintError::IllegalDerive(
                    "no gradient path reached the requested variable".to_string(),
                )
            })
        })
        .collect()
}

/// Reverse post-order over the nodes between `y` and the targets: every
/// node appears before its predecessors, so adjoints are complete when a
/// node is expanded.
fn backward_order(y: &NodeRef, targets: &HashSet<NodeId>) -> Vec<NodeRef> {
    let mut post = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(y.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            post.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((node.clone(), true));
        for pred in node.predecessors() {
            if tracks_any(&pred, targets) {
                stack.push((pred, false));
            }
        }
    }
    post.reverse();
    post
}

fn tracks_any(node: &NodeRef, targets: &HashSet<NodeId>) -> bool {
    targets.iter().any(|&t| node.tracks(t))
}

/// Sum-reduces broadcast axes so a gradient contribution matches the
/// shape of the predecessor it flows to.
fn restore_shape(g: NodeRef, pred: &NodeRef) -> FlintResult<NodeRef> {
    let target = pred.shape();
    if g.shape() == target {
        return Ok(g);
    }
    let gs = g.shape();
    if gs.len() < target.len() {
        return Err(FlintError::InternalError(
            "gradient contribution lost dimensions".to_string(),
        ));
    }
    let extra = gs.len() - target.len();
    let kind = crate::shape::broadcast_kind(
        &gs,
        &target,
        pred.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
    );
    let suffix = kind != crate::shape::BroadcastKind::Inverse;
    let mut g = g;
    for _ in 0..extra {
        let axis = if suffix { 0 } else { g.rank() - 1 };
        g = reduce_sum(&g, axis)?;
    }
    if g.shape() != target {
        g = reshape(&g, &target)?;
    }
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;
    use crate::ops::arithmetic::mul;

    #[test]
    fn unwatched_variables_are_rejected() {
        let x = new_store(TensorData::F64(vec![2.0]), vec![1]).unwrap();
        let y = mul(&x, &x).unwrap();
        assert!(matches!(
            calculate_gradient(&y, &x),
            Err(FlintError::IllegalDerive(_))
        ));
    }
}
