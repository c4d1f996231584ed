use crate::errors::FuseResult;
use crate::fuse::context::{BatchFuseContext, FUSE_AXES};
use crate::fuse::layout::fused_shape;
use crate::fuse::ops::{illegal, wrong_params, OpBatchFuse};
use crate::ir::{OpParams, Operation};
use crate::types::TensorId;

/// Axis permutations are legal as long as they never move a fused axis
/// out of the fused positions (equivalently: never swap channel or batch
/// with W/H). The gap pair travels with the axes, and the composed
/// permutation is recorded so later handlers can still find the batch
/// axis.
pub struct TransposeBatchFuse;

fn perm(op: &Operation) -> FuseResult<Vec<usize>> {
    match op.params() {
        OpParams::Transpose { perm } => Ok(perm.clone()),
        _ => Err(wrong_params(op)),
    }
}

fn swaps_fused(perm: &[usize]) -> bool {
    let a = perm[FUSE_AXES[0]];
    let b = perm[FUSE_AXES[1]];
    !(FUSE_AXES.contains(&a) && FUSE_AXES.contains(&b))
}

/// Reorders the gap pair to follow the permuted fused axes.
fn permute_gap(gap: [usize; 2], perm: &[usize]) -> [usize; 2] {
    if perm[FUSE_AXES[0]] == FUSE_AXES[0] {
        gap
    } else {
        [gap[1], gap[0]]
    }
}

impl OpBatchFuse for TransposeBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        let perm = perm(op)?;
        let x = op.inputs()[0];
        let out = op.outputs()[0];
        let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();

        if ctx.is_unfused(x) {
            ctx.update_gap_infer_shape(out, out_sample);
            ctx.propagate_state(x, out)?;
            return Ok((vec![out], false));
        }

        if perm.len() != 4 || swaps_fused(&perm) {
            return Err(illegal(format!(
                "transpose {perm:?} moves a fused axis out of the spatial positions"
            )));
        }

        let out_gap = permute_gap(ctx.get_forward_gap(x)?, &perm);
        let old = ctx.get_perm_axis(x)?;
        let composed: Vec<usize> = perm.iter().map(|&a| old[a]).collect();
        let batch = composed
            .iter()
            .position(|&a| a == crate::fuse::context::BATCH_AXIS)
            .ok_or_else(|| illegal("transpose lost the batch axis"))?;

        ctx.update_forward_gap(out, out_gap);
        ctx.update_perm_axis(out, composed);
        ctx.update_gap_infer_shape(out, fused_shape(&out_sample, ctx.k(), out_gap, Some(batch)));
        let wa = FUSE_AXES[0];
        ctx.update_proportion(
            out,
            out_sample[wa] as f32 / (out_sample[wa] + out_gap[0]) as f32,
        );
        Ok((vec![out], false))
    }

    fn gap_backward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<Vec<TensorId>> {
        let perm = perm(op)?;
        let x = op.inputs()[0];
        let out = op.outputs()[0];
        if ctx.is_unfused(out) {
            return Ok(Vec::new());
        }
        // The permutation restricted to the fused axes is its own
        // inverse (identity or swap), so the demand maps straight back.
        let needed = permute_gap(ctx.get_forward_gap(out)?, &perm);
        let mut gap = ctx.get_forward_gap(x)?;
        let mut grew = false;
        for i in 0..2 {
            if needed[i] > gap[i] {
                gap[i] = needed[i];
                grew = true;
            }
        }
        if !grew {
            return Ok(Vec::new());
        }
        let sample = ctx.clone_graph.tensor(x)?.shape().to_vec();
        let batch = ctx.batch_pos(x)?;
        ctx.enlarge_gap(x, &sample, gap, batch);
        Ok(vec![x])
    }

    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        ctx.emit_same_op(op)
    }
}
