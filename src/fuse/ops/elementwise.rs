use crate::errors::FuseResult;
use crate::fuse::context::BatchFuseContext;
use crate::fuse::ops::{pointwise_gap_backward, pointwise_gap_forward, OpBatchFuse};
use crate::ir::Operation;
use crate::types::TensorId;

/// Binary elementwise operators (Add is the representative). All
/// non-constant operands must already share gap and fused geometry;
/// constant operands ride along as broadcasts.
pub struct ElementwiseBatchFuse;

impl OpBatchFuse for ElementwiseBatchFuse {
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
