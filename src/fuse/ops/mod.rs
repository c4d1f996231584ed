pub mod activation;
pub mod concat;
pub mod conv2d;
pub mod elementwise;
pub mod pad;
pub mod pool2d;
pub mod reduce;
pub mod reshape;
pub mod transpose;

use crate::errors::{FuseError, FuseResult};
use crate::fuse::context::{BatchFuseContext, FUSE_AXES};
use crate::fuse::layout::fused_shape;
use crate::ir::{OpKind, OpParams, Operation, ReduceKind};
use crate::types::TensorId;

/// Per-operator contract of the pass: one method per phase.
///
/// Every method receives the operation by value snapshot (ids and
/// parameters) and the shared context; phase drivers own the traversal.
pub trait OpBatchFuse {
    /// Reproduces `op` into the working clone graph and returns the
    /// source-side output tensors for the clone driver to enqueue. The
    /// default is kind-independent.
    fn clone_op(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        let mut ins = Vec::with_capacity(op.inputs().len());
        for &t in op.inputs() {
            ins.push(if t.is_placeholder() {
                t
            } else {
                ctx.get_clone_maped_tensor(t)?
            });
        }
        let mut outs = Vec::with_capacity(op.outputs().len());
        let mut next = Vec::with_capacity(op.outputs().len());
        for &o in op.outputs() {
            let spec = ctx.src().tensor(o)?.spec().clone();
            let id = ctx.clone_graph.create_tensor(spec, None);
            ctx.update_clone_tensor_map(o, id);
            outs.push(id);
            next.push(o);
        }
        ctx.clone_graph
            .create_op(op.kind(), op.params().clone(), ins, outs);
        Ok(next)
    }

    /// Computes output gaps and fused shapes from the inputs'. Returns
    /// the output tensors to continue forward plus `need_backward`,
    /// raised when the operator had to enlarge an input gap beyond its
    /// recorded value.
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)>;

    /// Re-derives input gaps from an enlarged output gap. An empty
    /// result ends the backward wave at this operator.
    fn gap_backward(&self, op: &Operation, ctx: &mut BatchFuseContext)
        -> FuseResult<Vec<TensorId>>;

    /// Emits the fused operator(s) into the output graph and returns the
    /// clone-side output tensors for the fuse driver to enqueue.
    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>>;
}

/// Dispatch table over the closed operator set; the reduce kind selects
/// its concrete sub-handler.
pub fn handler_for(op: &Operation) -> FuseResult<&'static dyn OpBatchFuse> {
    Ok(match op.kind() {
        OpKind::Conv2d => &conv2d::Conv2dBatchFuse,
        OpKind::Pad => &pad::PadBatchFuse,
        OpKind::Relu => &activation::ActivationBatchFuse,
        OpKind::Add => &elementwise::ElementwiseBatchFuse,
        OpKind::Pool2d => &pool2d::Pool2dBatchFuse,
        OpKind::Reduce => match op.params() {
            OpParams::Reduce { kind: ReduceKind::Mean, .. } => &reduce::REDUCE_MEAN,
            OpParams::Reduce { kind: ReduceKind::Max, .. } => &reduce::REDUCE_MAX,
            OpParams::Reduce { kind: ReduceKind::Min, .. } => &reduce::REDUCE_MIN,
            OpParams::Reduce { kind: ReduceKind::Prod, .. } => &reduce::REDUCE_PROD,
            OpParams::Reduce { kind: ReduceKind::Any, .. } => &reduce::REDUCE_ANY,
            OpParams::Reduce { kind: ReduceKind::Sum, .. } => &reduce::REDUCE_SUM,
            _ => return Err(FuseError::UnsupportedOp(OpKind::Reduce)),
        },
        OpKind::Transpose => &transpose::TransposeBatchFuse,
        OpKind::Reshape | OpKind::Reshape2 => &reshape::ReshapeBatchFuse,
        OpKind::Concat => &concat::ConcatBatchFuse,
    })
}

pub(super) fn illegal(msg: impl Into<String>) -> FuseError {
    FuseError::IllegalAxisTransform(msg.into())
}

pub(super) fn wrong_params(op: &Operation) -> FuseError {
    debug_assert!(false, "parameter record does not match kind {:?}", op.kind());
    FuseError::MapMiss(format!("parameter record does not match kind {:?}", op.kind()))
}

/// Inputs that take part in gap inference: neither constants nor
/// placeholder slots.
pub(super) fn real_inputs(op: &Operation, ctx: &BatchFuseContext) -> FuseResult<Vec<TensorId>> {
    let mut out = Vec::with_capacity(op.inputs().len());
    for &t in op.inputs() {
        if t.is_placeholder() || ctx.clone_graph.tensor(t)?.is_constant() {
            continue;
        }
        out.push(t);
    }
    Ok(out)
}

// --- windowed operators (conv, pool) ---------------------------------

/// Geometry of a windowed operator along the fused axes.
pub(super) struct Window {
    pub ksize: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    /// Summed before+after padding per fused axis.
    pub pad: [usize; 2],
}

/// Smallest gap that keeps windows from contaminating a neighbouring
/// tile: the receptive-field overhang `(ksize - 1)·dilation - (stride - 1)`,
/// halved because each tile boundary is shared by two tiles, and never
/// below the padding the operator folds into the gap.
pub(super) fn required_gap(w: &Window, axis: usize) -> usize {
    let span = (w.ksize[axis] - 1) * w.dilation[axis];
    let overhang = span.saturating_sub(w.stride[axis] - 1);
    ((overhang + 1) / 2).max(w.pad[axis])
}

/// Forward gap inference shared by conv and pool: enforce the minimum
/// gap and stride alignment on the input (growing it in place when
/// short, which triggers the backward wave), then derive the output tile
/// pitch `p / s` and its residual gap.
pub(super) fn windowed_gap_forward(
    op: &Operation,
    ctx: &mut BatchFuseContext,
    w: &Window,
) -> FuseResult<(Vec<TensorId>, bool)> {
    let x = op.inputs()[0];
    if ctx.is_unfused(x) {
        return Err(illegal("windowed operator applied to an unfused tensor"));
    }
    let sample = ctx.clone_graph.tensor(x)?.shape().to_vec();
    if sample.len() != 4 {
        return Err(illegal(format!(
            "windowed operator needs a rank-4 input, got rank {}",
            sample.len()
        )));
    }

    let mut gap = ctx.get_forward_gap(x)?;
    let mut grew = false;
    for (i, &axis) in FUSE_AXES.iter().enumerate() {
        let tile = sample[axis];
        let mut g = gap[i].max(required_gap(w, i));
        while (tile + g) % w.stride[i] != 0 {
            g += 1;
        }
        if g > gap[i] {
            gap[i] = g;
            grew = true;
        }
    }
    let batch = ctx.batch_pos(x)?;
    if grew {
        ctx.enlarge_gap(x, &sample, gap, batch);
    }

    let out = op.outputs()[0];
    let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();
    let mut out_gap = [0usize; 2];
    for (i, &axis) in FUSE_AXES.iter().enumerate() {
        let pitch = (sample[axis] + gap[i]) / w.stride[i];
        if pitch < out_sample[axis] {
            return Err(FuseError::ShapeMismatch {
                expected: vec![pitch],
                found: vec![out_sample[axis]],
            });
        }
        out_gap[i] = pitch - out_sample[axis];
    }
    ctx.update_forward_gap(out, out_gap);
    ctx.update_perm_axis(out, ctx.get_perm_axis(x)?);
    ctx.update_gap_infer_shape(out, fused_shape(&out_sample, ctx.k(), out_gap, Some(batch)));
    let wa = FUSE_AXES[0];
    ctx.update_proportion(
        out,
        out_sample[wa] as f32 / (out_sample[wa] + out_gap[0]) as f32,
    );
    Ok((vec![out], grew))
}

/// Backward gap inference shared by conv and pool: the consumer enlarged
/// our output gap, so the input pitch must grow to `s` times the output
/// pitch. Ends the wave when the recorded input gap already suffices.
pub(super) fn windowed_gap_backward(
    op: &Operation,
    ctx: &mut BatchFuseContext,
    w: &Window,
) -> FuseResult<Vec<TensorId>> {
    let x = op.inputs()[0];
    let out = op.outputs()[0];
    let sample = ctx.clone_graph.tensor(x)?.shape().to_vec();
    let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();
    let out_gap = ctx.get_forward_gap(out)?;

    let mut gap = ctx.get_forward_gap(x)?;
    let mut grew = false;
    for (i, &axis) in FUSE_AXES.iter().enumerate() {
        let pitch = (out_sample[axis] + out_gap[i]) * w.stride[i];
        let g = pitch.saturating_sub(sample[axis]);
        if g > gap[i] {
            gap[i] = g;
            grew = true;
        }
    }
    if !grew {
        return Ok(Vec::new());
    }
    let batch = ctx.batch_pos(x)?;
    ctx.enlarge_gap(x, &sample, gap, batch);
    real_inputs(op, ctx)
}

// --- pointwise operators (activation, elementwise) -------------------

/// Forward step for operators that keep geometry untouched. All
/// non-constant inputs must agree on gap and fused shape; constants must
/// be broadcast-compatible along the fused and batch axes.
pub(super) fn pointwise_gap_forward(
    op: &Operation,
    ctx: &mut BatchFuseContext,
) -> FuseResult<(Vec<TensorId>, bool)> {
    let ins = real_inputs(op, ctx)?;
    let first = *ins.first().ok_or_else(|| {
        FuseError::MapMiss(format!("{:?} has no non-constant input", op.kind()))
    })?;

    if ctx.is_unfused(first) {
        for &t in &ins[1..] {
            if !ctx.is_unfused(t) {
                return Err(FuseError::ShapeMismatch {
                    expected: ctx.get_gap_infer_shape(first)?,
                    found: ctx.get_gap_infer_shape(t)?,
                });
            }
        }
        for &o in op.outputs() {
            let shape = ctx.clone_graph.tensor(o)?.shape().to_vec();
            ctx.update_gap_infer_shape(o, shape);
            ctx.propagate_state(first, o)?;
        }
        return Ok((op.outputs().to_vec(), false));
    }

    let gap = ctx.get_forward_gap(first)?;
    let shape = ctx.get_gap_infer_shape(first)?;
    for &t in &ins[1..] {
        if ctx.is_unfused(t)
            || ctx.get_forward_gap(t)? != gap
            || ctx.get_gap_infer_shape(t)? != shape
        {
            return Err(FuseError::ShapeMismatch {
                expected: shape,
                found: ctx.get_gap_infer_shape(t)?,
            });
        }
    }
    let batch = ctx.batch_pos(first)?;
    check_broadcast_constants(op, ctx, batch)?;

    for &o in op.outputs() {
        let out_sample = ctx.clone_graph.tensor(o)?.shape().to_vec();
        ctx.update_gap_infer_shape(o, fused_shape(&out_sample, ctx.k(), gap, Some(batch)));
        ctx.propagate_state(first, o)?;
    }
    Ok((op.outputs().to_vec(), false))
}

/// A constant operand keeps its source shape in the fused graph, so it
/// must broadcast: extent one along both fused axes and the batch axis.
fn check_broadcast_constants(
    op: &Operation,
    ctx: &BatchFuseContext,
    batch: usize,
) -> FuseResult<()> {
    for &t in op.inputs() {
        if t.is_placeholder() {
            continue;
        }
        let tensor = ctx.clone_graph.tensor(t)?;
        if !tensor.is_constant() {
            continue;
        }
        let shape = tensor.shape();
        let broadcastable = if shape.len() == 4 {
            shape[FUSE_AXES[0]] == 1 && shape[FUSE_AXES[1]] == 1 && shape[batch] == 1
        } else {
            shape.iter().product::<usize>() == 1
        };
        if !broadcastable {
            return Err(FuseError::ShapeMismatch {
                expected: vec![1, 1, 1],
                found: shape.to_vec(),
            });
        }
    }
    Ok(())
}

/// Backward step for geometry-preserving operators: inputs inherit the
/// enlarged output gap.
pub(super) fn pointwise_gap_backward(
    op: &Operation,
    ctx: &mut BatchFuseContext,
) -> FuseResult<Vec<TensorId>> {
    let out = op.outputs()[0];
    if ctx.is_unfused(out) {
        return Ok(Vec::new());
    }
    let out_gap = ctx.get_forward_gap(out)?;
    let mut former = Vec::new();
    for t in real_inputs(op, ctx)? {
        let mut gap = ctx.get_forward_gap(t)?;
        let mut grew = false;
        for i in 0..2 {
            if out_gap[i] > gap[i] {
                gap[i] = out_gap[i];
                grew = true;
            }
        }
        if grew {
            let sample = ctx.clone_graph.tensor(t)?.shape().to_vec();
            let batch = ctx.batch_pos(t)?;
            ctx.enlarge_gap(t, &sample, gap, batch);
            former.push(t);
        }
    }
    Ok(former)
}

/// True when any non-constant io tensor of `op` is quantized; the pass
/// does not alter numerics and refuses to fold quantized operators.
pub(super) fn touches_quantized(op: &Operation, ctx: &BatchFuseContext) -> FuseResult<bool> {
    for &t in op.inputs().iter().chain(op.outputs()) {
        if t.is_placeholder() {
            continue;
        }
        if ctx.src().tensor(t)?.spec().quant.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Identity permutation seed for graph inputs and constants.
pub(super) fn identity_perm(rank: usize) -> Vec<usize> {
    (0..rank).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(ksize: usize, stride: usize, dilation: usize) -> Window {
        Window {
            ksize: [ksize; 2],
            stride: [stride; 2],
            dilation: [dilation; 2],
            pad: [0; 2],
        }
    }

    #[test]
    fn required_gap_covers_receptive_overhang() {
        // 3x3 stride-1 conv leaves a 2-pixel overhang shared across the
        // boundary.
        assert_eq!(required_gap(&window(3, 1, 1), 0), 1);
        // 2x2 stride-2 pool tiles exactly; no gap needed.
        assert_eq!(required_gap(&window(2, 2, 1), 0), 0);
        assert_eq!(required_gap(&window(3, 2, 1), 0), 1);
        // Dilation widens the overhang.
        assert_eq!(required_gap(&window(3, 1, 2), 0), 2);
    }

    #[test]
    fn required_gap_never_below_folded_padding() {
        let w = Window { ksize: [3; 2], stride: [1; 2], dilation: [1; 2], pad: [2, 0] };
        assert_eq!(required_gap(&w, 0), 2);
        assert_eq!(required_gap(&w, 1), 1);
    }
}
