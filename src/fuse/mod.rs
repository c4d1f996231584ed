pub mod context;
pub mod layout;
pub mod ops;

pub use layout::{fuse_layout, fused_extent, fused_shape, unfuse_layout};

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, error};

use crate::errors::{FuseError, FuseResult};
use crate::ir::{Graph, TensorAttr};
use crate::types::{OpId, TensorId};

use context::{BatchFuseContext, BATCH_AXIS};
use ops::handler_for;

/// Result of the pass: the rewritten graph and the mapping from source
/// graph io tensors to their fused counterparts.
pub struct BatchFuseOutput {
    pub graph: Graph,
    pub io_map: HashMap<TensorId, TensorId>,
}

/// Folds the fake batch of `src` into the spatial axes.
///
/// The source graph is never mutated. `fake_batch == 1` short-circuits
/// to an identity mapping; any other value must be a perfect square so
/// the samples tile a `k × k` grid.
pub fn batch_fuse(src: &Graph, fake_batch: u32) -> FuseResult<BatchFuseOutput> {
    let inputs = src.inputs();
    let outputs = src.outputs();

    if fake_batch == 1 {
        let io_map = inputs.iter().chain(&outputs).map(|&t| (t, t)).collect();
        return Ok(BatchFuseOutput { graph: src.clone(), io_map });
    }

    let k = square_side(fake_batch)?;
    for &t in &inputs {
        let shape = src.tensor(t)?.shape();
        if shape.len() != 4 || shape[BATCH_AXIS] != fake_batch as usize {
            return Err(FuseError::ShapeMismatch {
                expected: vec![fake_batch as usize],
                found: shape.to_vec(),
            });
        }
    }

    let ctx = run_pass(src, fake_batch, k)?;

    let mut io_map = HashMap::new();
    for &t in inputs.iter().chain(&outputs) {
        let t_clone = ctx.get_clone_maped_tensor(t)?;
        io_map.insert(t, ctx.get_maped_tensor(t_clone)?);
    }
    Ok(BatchFuseOutput { graph: ctx.into_fused_graph(), io_map })
}

fn square_side(fake_batch: u32) -> FuseResult<usize> {
    let n = fake_batch as u64;
    let mut k = 1u64;
    while k * k < n {
        k += 1;
    }
    if k * k != n {
        error!(fake_batch, "fake batch is not a perfect square");
        return Err(FuseError::NonSquareFakeBatch(fake_batch));
    }
    Ok(k as usize)
}

/// Runs the three phases and returns the finished context. Split from
/// [`batch_fuse`] so unit tests can inspect the inference maps.
fn run_pass(src: &Graph, fake_batch: u32, k: usize) -> FuseResult<BatchFuseContext<'_>> {
    let mut ctx = BatchFuseContext::new(src, fake_batch, k);
    clone_phase(&mut ctx)?;
    gap_infer_phase(&mut ctx)?;
    fuse_phase(&mut ctx)?;
    Ok(ctx)
}

/// BFS over the source graph, reproducing every operator into the
/// neutral working copy.
fn clone_phase(ctx: &mut BatchFuseContext) -> FuseResult<()> {
    let src = ctx.src();
    let mut queue: VecDeque<TensorId> = VecDeque::new();

    for t in src.inputs() {
        let spec = src.tensor(t)?.spec().clone();
        let id = ctx.clone_graph.create_tensor(spec, None);
        ctx.update_clone_tensor_map(t, id);
        queue.push_back(t);
    }
    for t in src.constants() {
        let (spec, staged) = {
            let tensor = src.tensor(t)?;
            let mut staged = vec![0u8; tensor.byte_size()];
            tensor.copy_out(&mut staged)?;
            (tensor.spec().clone(), staged)
        };
        let id = ctx.clone_graph.create_tensor(spec, Some(staged));
        ctx.update_clone_tensor_map(t, id);
        queue.push_back(t);
    }

    let mut cloned: HashSet<OpId> = HashSet::new();
    while let Some(t) = queue.pop_front() {
        for op_id in ctx.src().consumers(t).to_vec() {
            if cloned.contains(&op_id) {
                continue;
            }
            let op = ctx.src().op(op_id).clone();
            if !ctx.is_ready_for_clone(&op)? {
                continue;
            }
            if ops::touches_quantized(&op, ctx)? {
                return Err(FuseError::UnsupportedOp(op.kind()));
            }
            cloned.insert(op_id);
            let next = handler_for(&op)?.clone_op(&op, ctx)?;
            queue.extend(next);
        }
    }

    stall_check("clone", cloned.len(), ctx.src().ops().len())
}

/// Bidirectional fixed point over the clone graph: FIFO forward wave,
/// with a LIFO backward sub-loop run to quiescence whenever a handler
/// had to enlarge an input gap.
fn gap_infer_phase(ctx: &mut BatchFuseContext) -> FuseResult<()> {
    let mut forward: VecDeque<TensorId> = VecDeque::new();
    let seeds: Vec<TensorId> = ctx
        .clone_graph
        .inputs()
        .into_iter()
        .chain(ctx.clone_graph.constants())
        .collect();
    for t in seeds {
        let (shape, is_const) = {
            let tensor = ctx.clone_graph.tensor(t)?;
            (tensor.shape().to_vec(), tensor.is_constant())
        };
        ctx.update_forward_gap(t, [0, 0]);
        ctx.update_perm_axis(t, ops::identity_perm(shape.len()));
        ctx.update_proportion(t, 1.0);
        let seed_shape = if is_const {
            // Constants are never tiled; they keep their source shape.
            shape
        } else {
            fused_shape(&shape, ctx.k(), [0, 0], Some(BATCH_AXIS))
        };
        ctx.update_gap_infer_shape(t, seed_shape);
        forward.push_back(t);
    }

    let visit_cap = ctx.clone_graph.ops().len() + 1;
    let mut backward: Vec<TensorId> = Vec::new();
    let mut backward_visits: HashMap<TensorId, usize> = HashMap::new();
    let mut resolved: HashSet<OpId> = HashSet::new();

    while let Some(t) = forward.pop_front() {
        for op_id in ctx.clone_graph.consumers(t).to_vec() {
            if resolved.contains(&op_id) {
                continue;
            }
            let op = ctx.clone_graph.op(op_id).clone();
            if !ctx.is_ready_for_gap_infer(&op)? {
                continue;
            }
            let (next, need_backward) = handler_for(&op)?.gap_forward(&op, ctx)?;
            resolved.insert(op_id);
            if !need_backward {
                forward.extend(next.iter().copied());
                continue;
            }

            debug!(?op_id, "gap inference turned backward");
            backward.push(t);
            while let Some(u) = backward.pop() {
                let visits = backward_visits.entry(u).or_insert(0);
                *visits += 1;
                if *visits > visit_cap {
                    error!(?u, "backward gap inference oscillates");
                    return Err(FuseError::GraphStall(format!(
                        "backward gap inference revisited {u:?} more than {visit_cap} times"
                    )));
                }
                let attr = ctx.clone_graph.tensor(u)?.attr();
                let p_id = match ctx.clone_graph.producer(u) {
                    Some(p) if attr != TensorAttr::Input && attr != TensorAttr::Constant => p,
                    // No producer left; this branch of the wave is done.
                    _ => {
                        forward.extend(next.iter().copied());
                        continue;
                    }
                };
                let p = ctx.clone_graph.op(p_id).clone();
                let former = handler_for(&p)?.gap_backward(&p, ctx)?;
                if former.is_empty() {
                    forward.extend(next.iter().copied());
                } else {
                    backward.extend(former);
                }
            }
        }
    }

    stall_check("gap inference", resolved.len(), ctx.clone_graph.ops().len())
}

/// BFS over the clone graph emitting the fused operators.
fn fuse_phase(ctx: &mut BatchFuseContext) -> FuseResult<()> {
    let mut queue: VecDeque<TensorId> = VecDeque::new();
    for t in ctx.clone_graph.inputs() {
        let shape = ctx.get_gap_infer_shape(t)?;
        let spec = ctx.clone_graph.tensor(t)?.spec().with_shape(shape);
        let id = ctx.fuse_graph.create_tensor(spec, None);
        ctx.update_tensor_map(t, id);
        queue.push_back(t);
    }
    for t in ctx.clone_graph.constants() {
        let (spec, staged) = {
            let tensor = ctx.clone_graph.tensor(t)?;
            let mut staged = vec![0u8; tensor.byte_size()];
            tensor.copy_out(&mut staged)?;
            (tensor.spec().clone(), staged)
        };
        let id = ctx.fuse_graph.create_tensor(spec, Some(staged));
        ctx.update_tensor_map(t, id);
        queue.push_back(t);
    }

    while let Some(t) = queue.pop_front() {
        for op_id in ctx.clone_graph.consumers(t).to_vec() {
            if ctx.is_visited(op_id) {
                continue;
            }
            let op = ctx.clone_graph.op(op_id).clone();
            if !ctx.is_ready_for_fuse(&op)? {
                continue;
            }
            ctx.mark_visited(op_id);
            let next = handler_for(&op)?.fuse(&op, ctx)?;
            queue.extend(next);
        }
    }

    stall_check("fuse", ctx.visited_count(), ctx.clone_graph.ops().len())
}

fn stall_check(phase: &str, visited: usize, total: usize) -> FuseResult<()> {
    if visited == total {
        return Ok(());
    }
    error!(phase, visited, total, "phase left operators unvisited");
    Err(FuseError::GraphStall(format!(
        "{phase} phase visited {visited} of {total} operators"
    )))
}
