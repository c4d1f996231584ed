use crate::errors::FuseResult;
use crate::fuse::context::BatchFuseContext;
use crate::fuse::ops::{pointwise_gap_backward, pointwise_gap_forward, OpBatchFuse};
use crate::ir::Operation;
use crate::types::TensorId;

/// Pointwise activations (Relu is the representative); gap and shape
/// pass straight through.
pub struct ActivationBatchFuse;

impl OpBatchFuse for ActivationBatchFuse {
    fn gap_forward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<(Vec<TensorId>, bool)> {
        pointwise_gap_forward(op, ctx)
    }

    fn gap_backward(
        &self,
        op: &Operation,
        ctx: &mut BatchFuseContext,
    ) -> FuseResult<Vec<TensorId>> {
        pointwise_gap_backward(op, ctx)
    }

    fn fuse(&self, op: &Operation, ctx: &mut BatchFuseContext) -> FuseResult<Vec<TensorId>> {
        ctx.emit_same_op(op)
    }
}
