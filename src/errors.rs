use thiserror::Error;

use crate::ir::OpKind;

#[derive(Error, Debug)]
pub enum FuseError {
    #[error("Operator kind {0:?} is not supported by the batch fuse pass")]
    UnsupportedOp(OpKind),
    #[error("Illegal axis transform: {0}")]
    IllegalAxisTransform(String),
    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    #[error("Fake batch {0} is not a perfect square")]
    NonSquareFakeBatch(u32),
    #[error("Graph stall: {0}")]
    GraphStall(String),
    #[error("Internal map miss: {0}")]
    MapMiss(String),
}

pub type FuseResult<T> = Result<T, FuseError>;
