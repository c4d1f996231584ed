use crate::errors::FuseResult;
use crate::fuse::context::BatchFuseContext;
use crate::fuse::ops::{
    windowed_gap_backward, windowed_gap_forward, wrong_params, OpBatchFuse, Window,
};
use crate::ir::{OpParams, Operation};
use crate::types::TensorId;

/// The conv itself survives fusion untouched: a single convolution over
/// the enlarged tensor computes every tile in one launch, with its own
/// pad parameters supplying the outer border and the gap strips standing
/// in for the interior borders.
pub struct Conv2dBatchFuse;

fn window(op: &Operation) -> FuseResult<Window> {
    match op.params() {
        OpParams::Conv2d { ksize, stride, dilation, pad } => Ok(Window {
            ksize: *ksize,
            stride: *stride,
            dilation: *dilation,
            pad: [pad[0] + pad[1], pad[2] + pad[3]],
        }),
        _ => Err(wrong_params(op)),
    }
}

impl OpBatchFuse for Conv2dBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        windowed_gap_forward(op, ctx, &window(op)?)
    }

    fn gap_backward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<Vec<TensorId>> {
        windowed_gap_backward(op, ctx, &window(op)?)
    }

    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        ctx.emit_same_op(op)
    }
}
