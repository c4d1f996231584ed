use crate::errors::{FuseError, FuseResult};
use crate::fuse::context::{BatchFuseContext, FUSE_AXES};
use crate::fuse::layout::fused_shape;
use crate::fuse::ops::{illegal, wrong_params, OpBatchFuse};
use crate::ir::{OpParams, Operation};
use crate::types::TensorId;

/// Pads on the fused axes fold into the gaps: the sample tile grows by
/// the pad amount, the inter-tile gap shrinks by the same amount, and
/// the pitch stays put. Only the outer border is padded explicitly
/// during the fuse phase. Pads on other axes pass through unchanged.
pub struct PadBatchFuse;

fn fused_axis_pads(op: &Operation) -> FuseResult<(Vec<usize>, Vec<usize>)> {
    match op.params() {
        OpParams::Pad { front, back } => Ok((front.clone(), back.clone())),
        _ => Err(wrong_params(op)),
    }
}

impl OpBatchFuse for PadBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        let (front, back) = fused_axis_pads(op)?;
        let x = op.inputs()[0];
        let out = op.outputs()[0];
        let out_sample = ctx.clone_graph.tensor(out)?.shape().to_vec();

        if ctx.is_unfused(x) {
            ctx.update_gap_infer_shape(out, out_sample);
            ctx.propagate_state(x, out)?;
            return Ok((vec![out], false));
        }

        let sample = ctx.clone_graph.tensor(x)?.shape().to_vec();
        if sample.len() != 4 {
            return Err(illegal("pad folding needs a rank-4 input"));
        }
        let batch = ctx.batch_pos(x)?;
        if front[batch] != 0 || back[batch] != 0 {
            return Err(illegal("cannot pad the batch axis of a fused tensor"));
        }

        let folded = [
            front[FUSE_AXES[0]] + back[FUSE_AXES[0]],
            front[FUSE_AXES[1]] + back[FUSE_AXES[1]],
        ];
        let mut gap = ctx.get_forward_gap(x)?;
        let mut grew = false;
        for i in 0..2 {
            if folded[i] > gap[i] {
                gap[i] = folded[i];
                grew = true;
            }
        }
        if grew {
            ctx.enlarge_gap(x, &sample, gap, batch);
        }

        // The pitch is untouched: tile + pad pixels on one side, gap
        // minus those pixels on the other.
        let out_gap = [gap[0] - folded[0], gap[1] - folded[1]];
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

    fn gap_backward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<Vec<TensorId>> {
        let (front, back) = fused_axis_pads(op)?;
        let x = op.inputs()[0];
        let out = op.outputs()[0];
        if ctx.is_unfused(out) {
            return Ok(Vec::new());
        }
        let out_gap = ctx.get_forward_gap(out)?;
        let mut gap = ctx.get_forward_gap(x)?;
        let mut grew = false;
        for (i, &axis) in FUSE_AXES.iter().enumerate() {
            let needed = out_gap[i] + front[axis] + back[axis];
            if needed > gap[i] {
                gap[i] = needed;
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
        // Interior borders are already baked into the gaps; re-emitting
        // the source pads on the enlarged tensor pads the outer border.
        let (front, back) = fused_axis_pads(op)?;
        let x_fused = ctx.get_maped_tensor(op.inputs()[0])?;
        let in_shape = ctx.fuse_graph.tensor(x_fused)?.shape().to_vec();
        let padded: Vec<usize> = in_shape
            .iter()
            .enumerate()
            .map(|(i, &d)| d + front[i] + back[i])
            .collect();
        let expected = ctx.get_gap_infer_shape(op.outputs()[0])?;
        if padded != expected {
            return Err(FuseError::ShapeMismatch { expected, found: padded });
        }
        ctx.emit_same_op(op)
    }
}
