use crate::errors::FuseResult;
use crate::fuse::context::BatchFuseContext;
use crate::fuse::ops::{
    windowed_gap_backward, windowed_gap_forward, wrong_params, OpBatchFuse, Window,
};
use crate::ir::{OpParams, Operation};
use crate::types::TensorId;

/// Same gap arithmetic as conv2d, with the pool window in place of the
/// kernel.
pub struct Pool2dBatchFuse;

fn window(op: &Operation) -> FuseResult<Window> {
    match op.params() {
        OpParams::Pool2d { ksize, stride, .. } => Ok(Window {
            ksize: *ksize,
            stride: *stride,
            dilation: [1, 1],
            pad: [0, 0],
        }),
        _ => Err(wrong_params(op)),
    }
}

impl OpBatchFuse for Pool2dBatchFuse {
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
