use serde::{Deserialize, Serialize};

use crate::types::{OpId, TensorId};

/// Closed set of operator kinds the IR knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Conv2d,
    Pad,
    Relu,
    Add,
    Pool2d,
    Reduce,
    Transpose,
    Reshape,
    Reshape2,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Mean,
    Max,
    Min,
    Prod,
    Any,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    Avg,
    Max,
}

/// Per-kind parameter record.
///
/// Spatial pairs are ordered `[W, H]` to match the `[C, W, H, N]` tensor
/// layout; conv pads are `[w_before, w_after, h_before, h_after]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpParams {
    Conv2d {
        ksize: [usize; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
        pad: [usize; 4],
    },
    Pad {
        /// Pixels inserted before each axis, one entry per axis.
        front: Vec<usize>,
        /// Pixels appended after each axis.
        back: Vec<usize>,
    },
    Relu,
    Add,
    Pool2d {
        kind: PoolKind,
        ksize: [usize; 2],
        stride: [usize; 2],
    },
    Reduce {
        kind: ReduceKind,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    Transpose {
        perm: Vec<usize>,
    },
    Reshape {
        target: Vec<usize>,
    },
    Concat {
        axis: usize,
    },
}

/// An IR node: a kind tag, its parameters and ordered io tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    id: OpId,
    kind: OpKind,
    params: OpParams,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Operation {
    pub(crate) fn new(
        id: OpId,
        kind: OpKind,
        params: OpParams,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Self {
        Self { id, kind, params, inputs, outputs }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn params(&self) -> &OpParams {
        &self.params
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }
}
