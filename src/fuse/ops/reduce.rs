use crate::errors::FuseResult;
use crate::fuse::context::{BatchFuseContext, FUSE_AXES};
use crate::fuse::layout::fused_shape;
use crate::fuse::ops::{identity_perm, illegal, pointwise_gap_backward, wrong_params, OpBatchFuse};
use crate::ir::{OpKind, OpParams, Operation, ReduceKind, TensorAttr};
use crate::types::TensorId;

/// Reduction handler, one instance per reduce sub-kind.
///
/// Reductions away from the fused axes keep the tile geometry and simply
/// shrink the reduced extents. A reduction over a fused axis (or the
/// batch axis) would mix sample pixels with gap garbage, so the tensor is
/// first unfused back to batched form with an explicit reshape and the
/// reduction runs there; the result stays batched for its consumers.
pub struct ReduceBatchFuse {
    kind: ReduceKind,
}

pub static REDUCE_MEAN: ReduceBatchFuse = ReduceBatchFuse { kind: ReduceKind::Mean };
pub static REDUCE_MAX: ReduceBatchFuse = ReduceBatchFuse { kind: ReduceKind::Max };
pub static REDUCE_MIN: ReduceBatchFuse = ReduceBatchFuse { kind: ReduceKind::Min };
pub static REDUCE_PROD: ReduceBatchFuse = ReduceBatchFuse { kind: ReduceKind::Prod };
pub static REDUCE_ANY: ReduceBatchFuse = ReduceBatchFuse { kind: ReduceKind::Any };
pub static REDUCE_SUM: ReduceBatchFuse = ReduceBatchFuse { kind: ReduceKind::Sum };

fn reduce_params(op: &Operation) -> FuseResult<(Vec<usize>, bool)> {
    match op.params() {
        OpParams::Reduce { axes, keep_dims, .. } => Ok((axes.clone(), *keep_dims)),
        _ => Err(wrong_params(op)),
    }
}

/// Whether the reduction leaves the tile grid intact.
fn touches_grid(axes: &[usize], batch: usize) -> bool {
    axes.iter().any(|&a| FUSE_AXES.contains(&a) || a == batch)
}

impl OpBatchFuse for ReduceBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        match op.params() {
            OpParams::Reduce { kind, .. } if *kind == self.kind => {}
            _ => return Err(wrong_params(op)),
        }
        let (axes, keep_dims) = reduce_params(op)?;
        let x = op.inputs()[0];
        let out = op.outputs()[0];
        let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();

        if ctx.is_unfused(x) {
            ctx.update_gap_infer_shape(out, out_sample);
            ctx.propagate_state(x, out)?;
            return Ok((vec![out], false));
        }

        let batch = ctx.batch_pos(x)?;
        if touches_grid(&axes, batch) {
            // Unfused result: batched shape, no gaps, fresh axis order.
            ctx.update_forward_gap(out, [0, 0]);
            ctx.update_gap_infer_shape(out, out_sample.clone());
            ctx.update_perm_axis(out, identity_perm(out_sample.len()));
            ctx.update_proportion(out, 1.0);
            ctx.mark_unfused(out);
            return Ok((vec![out], false));
        }

        if !keep_dims {
            return Err(illegal(
                "reduction without keep_dims would shift the fused axes",
            ));
        }
        let gap = ctx.get_forward_gap(x)?;
        ctx.update_gap_infer_shape(out, fused_shape(&out_sample, ctx.k(), gap, Some(batch)));
        ctx.propagate_state(x, out)?;
        Ok((vec![out], false))
    }

    fn gap_backward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<Vec<TensorId>> {
        let (axes, _) = reduce_params(op)?;
        let x = op.inputs()[0];
        if ctx.is_unfused(x) || touches_grid(&axes, ctx.batch_pos(x)?) {
            return Ok(Vec::new());
        }
        pointwise_gap_backward(op, ctx)
    }

    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        let (axes, _) = reduce_params(op)?;
        let x = op.inputs()[0];

        if !ctx.is_unfused(x) && touches_grid(&axes, ctx.batch_pos(x)?) {
            // Unfuse first: reshape the enlarged tensor back to its
            // batched form, then reduce there.
            let batched = ctx.clone_graph.tensor(x)?.shape().to_vec();
            let x_fused = ctx.get_maped_tensor(x)?;
            let mid_spec = ctx
                .fuse_graph
                .tensor(x_fused)?
                .spec()
                .derived(batched.clone(), TensorAttr::Transient);
            let mid = ctx.fuse_graph.create_tensor(mid_spec, None);
            ctx.fuse_graph.create_op(
                OpKind::Reshape2,
                OpParams::Reshape { target: batched },
                vec![x_fused],
                vec![mid],
            );

            let (outs, next) = ctx.emit_fused_outputs(op)?;
            ctx.fuse_graph
                .create_op(op.kind(), op.params().clone(), vec![mid], outs);
            return Ok(next);
        }

        ctx.emit_same_op(op)
    }
}
