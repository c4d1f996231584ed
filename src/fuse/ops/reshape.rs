use crate::errors::FuseResult;
use crate::fuse::context::{BatchFuseContext, BATCH_AXIS};
use crate::fuse::layout::fused_shape;
use crate::fuse::ops::{illegal, pointwise_gap_backward, wrong_params, OpBatchFuse};
use crate::ir::{OpParams, Operation};
use crate::types::TensorId;

/// Handles both `Reshape` and `Reshape2`. A reshape that splits or
/// merges a fused axis would tear the tile grid apart, so only two forms
/// are legal: a shape-preserving reshape and the trailing squeeze of a
/// unit batch axis. The fused emission rewrites the target to the
/// enlarged extents.
pub struct ReshapeBatchFuse;

fn target(op: &Operation) -> FuseResult<Vec<usize>> {
    match op.params() {
        OpParams::Reshape { target } => Ok(target.clone()),
        _ => Err(wrong_params(op)),
    }
}

impl OpBatchFuse for ReshapeBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        let x = op.inputs()[0];
        let out = op.outputs()[0];
        let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();

        if ctx.is_unfused(x) {
            ctx.update_gap_infer_shape(out, out_sample);
            ctx.propagate_state(x, out)?;
            return Ok((vec![out], false));
        }

        let sample = ctx.clone_graph.tensor(x)?.shape().to_vec();
        let want = target(op)?;
        let batch = ctx.batch_pos(x)?;

        let identity = want == sample;
        let squeeze = batch == BATCH_AXIS
            && sample.len() == 4
            && sample[BATCH_AXIS] == 1
            && want.as_slice() == &sample[..3];
        if !identity && !squeeze {
            return Err(illegal(format!(
                "reshape {sample:?} -> {want:?} splits or merges a fused axis"
            )));
        }

        let gap = ctx.get_forward_gap(x)?;
        let out_batch = if squeeze { None } else { Some(batch) };
        ctx.update_gap_infer_shape(out, fused_shape(&out_sample, ctx.k(), gap, out_batch));
        ctx.propagate_state(x, out)?;
        Ok((vec![out], false))
    }

    fn gap_backward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<Vec<TensorId>> {
        pointwise_gap_backward(op, ctx)
    }

    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        let ins = ctx.map_fused_inputs(op)?;
        let (outs, next) = ctx.emit_fused_outputs(op)?;
        let fused_target = ctx.fuse_graph.tensor(outs[0])?.shape().to_vec();
        ctx.fuse_graph.create_op(
            op.kind(),
            OpParams::Reshape { target: fused_target },
            ins,
            outs,
        );
        Ok(next)
    }
}
