pub mod builder;
pub mod ops;
pub mod tensor;

pub use builder::GraphBuilder;
pub use ops::{OpKind, OpParams, Operation, PoolKind, ReduceKind};
pub use tensor::{bytes_from_f32, ElemType, Quant, Tensor, TensorAttr, TensorSpec};

use std::collections::HashMap;

use serde::Serialize;

use crate::errors::{FuseError, FuseResult};
use crate::types::{OpId, TensorId};

/// A bipartite tensor/operator graph.
///
/// Tensors and operators live in arenas owned by the graph; cross
/// references go through stable ids, never owning pointers. Consumer and
/// producer indices are maintained eagerly on `create_op`.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    tensors: Vec<Tensor>,
    ops: Vec<Operation>,
    consumers: HashMap<TensorId, Vec<OpId>>,
    producer: HashMap<TensorId, OpId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_tensor(&mut self, spec: TensorSpec, data: Option<Vec<u8>>) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(Tensor::new(id, spec, data));
        id
    }

    pub fn create_op(
        &mut self,
        kind: OpKind,
        params: OpParams,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> OpId {
        let id = OpId(self.ops.len());
        for &t in &inputs {
            if !t.is_placeholder() {
                self.consumers.entry(t).or_default().push(id);
            }
        }
        for &t in &outputs {
            self.producer.insert(t, id);
        }
        self.ops.push(Operation::new(id, kind, params, inputs, outputs));
        id
    }

    pub fn tensor(&self, id: TensorId) -> FuseResult<&Tensor> {
        self.tensors.get(id.0 as usize).ok_or_else(|| {
            debug_assert!(false, "tensor {id:?} not in this graph");
            FuseError::MapMiss(format!("tensor {id:?} not in this graph"))
        })
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.0]
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn inputs(&self) -> Vec<TensorId> {
        self.by_attr(TensorAttr::Input)
    }

    pub fn outputs(&self) -> Vec<TensorId> {
        self.by_attr(TensorAttr::Output)
    }

    pub fn constants(&self) -> Vec<TensorId> {
        self.by_attr(TensorAttr::Constant)
    }

    fn by_attr(&self, attr: TensorAttr) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|t| t.attr() == attr)
            .map(|t| t.id())
            .collect()
    }

    /// Operators reading `t`, in creation order.
    pub fn consumers(&self, t: TensorId) -> &[OpId] {
        self.consumers.get(&t).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn producer(&self, t: TensorId) -> Option<OpId> {
        self.producer.get(&t).copied()
    }

    /// Promotes a transient tensor to a graph output.
    pub fn mark_output(&mut self, t: TensorId) {
        if let Some(tensor) = self.tensors.get_mut(t.0 as usize) {
            tensor.set_attr(TensorAttr::Output);
        }
    }

    /// Debug dump of the arenas as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Dump<'a> {
            tensors: &'a [Tensor],
            ops: &'a [Operation],
        }
        serde_json::to_string_pretty(&Dump { tensors: &self.tensors, ops: &self.ops })
    }
}
