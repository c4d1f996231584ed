use crate::errors::{FuseError, FuseResult};
use crate::fuse::context::{BatchFuseContext, FUSE_AXES};
use crate::fuse::layout::fused_shape;
use crate::fuse::ops::{illegal, real_inputs, wrong_params, OpBatchFuse};
use crate::ir::{OpKind, OpParams, Operation};
use crate::types::TensorId;

/// Concatenation along a non-fused, non-batch axis (the channel axis in
/// practice). Every operand must share the same gap and tile geometry;
/// the output simply inherits it.
pub struct ConcatBatchFuse;

fn axis(op: &Operation) -> FuseResult<usize> {
    match op.params() {
        OpParams::Concat { axis } => Ok(*axis),
        _ => Err(wrong_params(op)),
    }
}

impl OpBatchFuse for ConcatBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        let axis = axis(op)?;
        if FUSE_AXES.contains(&axis) {
            return Err(illegal(format!("concat along fused axis {axis}")));
        }

        let ins = real_inputs(op, ctx)?;
        if ins.len() != op.inputs().len() {
            // Re-tiling constant operand data is not implemented.
            return Err(FuseError::UnsupportedOp(OpKind::Concat));
        }
        let first = ins[0];
        let out = op.outputs()[0];
        let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();

        if ins.iter().all(|&t| ctx.is_unfused(t)) {
            ctx.update_gap_infer_shape(out, out_sample);
            ctx.propagate_state(first, out)?;
            return Ok((vec![out], false));
        }
        if ins.iter().any(|&t| ctx.is_unfused(t)) {
            return Err(FuseError::ShapeMismatch {
                expected: ctx.get_gap_infer_shape(first)?,
                found: out_sample,
            });
        }

        let batch = ctx.batch_pos(first)?;
        if axis == batch {
            return Err(illegal("concat along the batch axis of a fused tensor"));
        }
        let gap = ctx.get_forward_gap(first)?;
        let perm = ctx.get_perm_axis(first)?;
        for &t in &ins[1..] {
            if ctx.get_forward_gap(t)? != gap {
                return Err(FuseError::ShapeMismatch {
                    expected: gap.to_vec(),
                    found: ctx.get_forward_gap(t)?.to_vec(),
                });
            }
            if ctx.get_perm_axis(t)? != perm {
                return Err(illegal("concat operands disagree on axis order"));
            }
            let a = ctx.get_gap_infer_shape(first)?;
            let b = ctx.get_gap_infer_shape(t)?;
            let agree = a
                .iter()
                .zip(&b)
                .enumerate()
                .all(|(i, (&da, &db))| i == axis || da == db);
            if !agree {
                return Err(FuseError::ShapeMismatch { expected: a, found: b });
            }
        }

        ctx.update_gap_infer_shape(out, fused_shape(&out_sample, ctx.k(), gap, Some(batch)));
        ctx.propagate_state(first, out)?;
        Ok((vec![out], false))
    }

    fn gap_backward(
        &self,
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

    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        ctx.emit_same_op(op)
    }
}
