//! Naive reference interpreter over the IR.
//!
//! Exists so the rewritten graphs can be checked for numerical
//! equivalence in-tree; it is not an inference backend. Tensors are
//! `[C, W, H, N]` f32 throughout, conv weights `[Co, Ci, Kw, Kh]`.

use std::collections::HashMap;

use ndarray::{concatenate, Array4, ArrayD, ArrayView4, Axis, Ix4, IxDyn, SliceInfoElem};

use crate::errors::{FuseError, FuseResult};
use crate::ir::{Graph, OpKind, OpParams, Operation, PoolKind, ReduceKind};
use crate::types::TensorId;

pub struct Evaluator<'g> {
    graph: &'g Graph,
}

impl<'g> Evaluator<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Runs the graph on the given input feeds and returns every graph
    /// output. Operators are executed in arena order, which is
    /// topological for graphs built front to back.
    pub fn run(
        &self,
        feeds: &HashMap<TensorId, ArrayD<f32>>,
    ) -> FuseResult<HashMap<TensorId, ArrayD<f32>>> {
        let mut values: HashMap<TensorId, ArrayD<f32>> = HashMap::new();
        for (&t, v) in feeds {
            let expected = self.graph.tensor(t)?.shape();
            if v.shape() != expected {
                return Err(FuseError::ShapeMismatch {
                    expected: expected.to_vec(),
                    found: v.shape().to_vec(),
                });
            }
            values.insert(t, v.clone());
        }
        for t in self.graph.constants() {
            let tensor = self.graph.tensor(t)?;
            let data = tensor.f32_data().ok_or_else(|| {
                FuseError::MapMiss(format!("constant {t:?} has no backing data"))
            })?;
            let arr = ArrayD::from_shape_vec(IxDyn(tensor.shape()), data).map_err(|_| {
                FuseError::ShapeMismatch {
                    expected: tensor.shape().to_vec(),
                    found: vec![tensor.byte_size() / 4],
                }
            })?;
            values.insert(t, arr);
        }

        for op in self.graph.ops() {
            let result = self.apply(op, &values)?;
            values.insert(op.outputs()[0], result);
        }

        let mut outputs = HashMap::new();
        for t in self.graph.outputs() {
            let v = values
                .get(&t)
                .cloned()
                .ok_or_else(|| FuseError::MapMiss(format!("output {t:?} was never produced")))?;
            outputs.insert(t, v);
        }
        Ok(outputs)
    }

    fn apply(
        &self,
        op: &Operation,
        values: &HashMap<TensorId, ArrayD<f32>>,
    ) -> FuseResult<ArrayD<f32>> {
        let arg = |i: usize| -> FuseResult<&ArrayD<f32>> {
            let id = op.inputs()[i];
            values.get(&id).ok_or_else(|| {
                FuseError::GraphStall(format!("operand {id:?} not yet computed"))
            })
        };

        match (op.kind(), op.params()) {
            (OpKind::Conv2d, OpParams::Conv2d { stride, dilation, pad, .. }) => {
                let bias = match op.inputs().get(2) {
                    Some(b) if !b.is_placeholder() => Some(arg(2)?),
                    _ => None,
                };
                conv2d(arg(0)?, arg(1)?, bias, *stride, *dilation, *pad)
            }
            (OpKind::Pool2d, OpParams::Pool2d { kind, ksize, stride }) => {
                pool2d(arg(0)?, *kind, *ksize, *stride)
            }
            (OpKind::Relu, _) => Ok(arg(0)?.mapv(|v| v.max(0.0))),
            (OpKind::Add, _) => add(arg(0)?, arg(1)?),
            (OpKind::Pad, OpParams::Pad { front, back }) => pad(arg(0)?, front, back),
            (OpKind::Reduce, OpParams::Reduce { kind, axes, keep_dims }) => {
                reduce(arg(0)?, *kind, axes, *keep_dims)
            }
            (OpKind::Transpose, OpParams::Transpose { perm }) => {
                Ok(arg(0)?.view().permuted_axes(&perm[..]).to_owned())
            }
            (OpKind::Reshape | OpKind::Reshape2, OpParams::Reshape { target }) => {
                reshape(arg(0)?, target)
            }
            (OpKind::Concat, OpParams::Concat { axis }) => {
                let mut views = Vec::with_capacity(op.inputs().len());
                for i in 0..op.inputs().len() {
                    views.push(arg(i)?.view());
                }
                concatenate(Axis(*axis), &views).map_err(|_| FuseError::ShapeMismatch {
                    expected: views[0].shape().to_vec(),
                    found: vec![],
                })
            }
            _ => Err(FuseError::UnsupportedOp(op.kind())),
        }
    }
}

fn view4(x: &ArrayD<f32>) -> FuseResult<ArrayView4<'_, f32>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| FuseError::ShapeMismatch { expected: vec![4], found: vec![x.ndim()] })
}

fn conv2d(
    x: &ArrayD<f32>,
    weight: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    stride: [usize; 2],
    dilation: [usize; 2],
    pad: [usize; 4],
) -> FuseResult<ArrayD<f32>> {
    let x4 = view4(x)?;
    let w4 = view4(weight)?;
    let (ci, iw, ih, n) = x4.dim();
    let (co, ci_w, kw, kh) = w4.dim();
    if ci != ci_w {
        return Err(FuseError::ShapeMismatch { expected: vec![ci], found: vec![ci_w] });
    }

    let ow = (iw + pad[0] + pad[1] - (kw - 1) * dilation[0] - 1) / stride[0] + 1;
    let oh = (ih + pad[2] + pad[3] - (kh - 1) * dilation[1] - 1) / stride[1] + 1;
    let mut out = Array4::<f32>::zeros((co, ow, oh, n));

    for ni in 0..n {
        for coi in 0..co {
            for wi in 0..ow {
                for hi in 0..oh {
                    let mut sum = bias.map(|b| b[[coi]]).unwrap_or(0.0);
                    for cii in 0..ci {
                        for kwi in 0..kw {
                            for khi in 0..kh {
                                let in_w = (wi * stride[0] + kwi * dilation[0]) as i64
                                    - pad[0] as i64;
                                let in_h = (hi * stride[1] + khi * dilation[1]) as i64
                                    - pad[2] as i64;
                                if in_w >= 0
                                    && in_w < iw as i64
                                    && in_h >= 0
                                    && in_h < ih as i64
                                {
                                    sum += x4[[cii, in_w as usize, in_h as usize, ni]]
                                        * w4[[coi, cii, kwi, khi]];
                                }
                            }
                        }
                    }
                    out[[coi, wi, hi, ni]] = sum;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn pool2d(
    x: &ArrayD<f32>,
    kind: PoolKind,
    ksize: [usize; 2],
    stride: [usize; 2],
) -> FuseResult<ArrayD<f32>> {
    let x4 = view4(x)?;
    let (c, iw, ih, n) = x4.dim();
    let ow = (iw - ksize[0]) / stride[0] + 1;
    let oh = (ih - ksize[1]) / stride[1] + 1;
    let mut out = Array4::<f32>::zeros((c, ow, oh, n));

    for ni in 0..n {
        for ci in 0..c {
            for wi in 0..ow {
                for hi in 0..oh {
                    let mut acc = match kind {
                        PoolKind::Avg => 0.0,
                        PoolKind::Max => f32::NEG_INFINITY,
                    };
                    for kwi in 0..ksize[0] {
                        for khi in 0..ksize[1] {
                            let v = x4[[ci, wi * stride[0] + kwi, hi * stride[1] + khi, ni]];
                            match kind {
                                PoolKind::Avg => acc += v,
                                PoolKind::Max => {
                                    if v > acc {
                                        acc = v;
                                    }
                                }
                            }
                        }
                    }
                    if kind == PoolKind::Avg {
                        acc /= (ksize[0] * ksize[1]) as f32;
                    }
                    out[[ci, wi, hi, ni]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn add(a: &ArrayD<f32>, b: &ArrayD<f32>) -> FuseResult<ArrayD<f32>> {
    if a.shape() == b.shape() {
        return Ok(a + b);
    }
    let bb = b.broadcast(a.raw_dim()).ok_or_else(|| FuseError::ShapeMismatch {
        expected: a.shape().to_vec(),
        found: b.shape().to_vec(),
    })?;
    Ok(a + &bb)
}

fn pad(x: &ArrayD<f32>, front: &[usize], back: &[usize]) -> FuseResult<ArrayD<f32>> {
    if front.len() != x.ndim() || back.len() != x.ndim() {
        return Err(FuseError::ShapeMismatch {
            expected: vec![x.ndim()],
            found: vec![front.len(), back.len()],
        });
    }
    let shape: Vec<usize> = x
        .shape()
        .iter()
        .enumerate()
        .map(|(i, &d)| d + front[i] + back[i])
        .collect();
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    let interior: Vec<SliceInfoElem> = front
        .iter()
        .zip(x.shape())
        .map(|(&f, &d)| SliceInfoElem::Slice {
            start: f as isize,
            end: Some((f + d) as isize),
            step: 1,
        })
        .collect();
    out.slice_mut(interior.as_slice()).assign(x);
    Ok(out)
}

fn reduce(
    x: &ArrayD<f32>,
    kind: ReduceKind,
    axes: &[usize],
    keep_dims: bool,
) -> FuseResult<ArrayD<f32>> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let count: usize = sorted.iter().map(|&a| x.shape()[a]).product();

    let mut acc = x.clone();
    for &a in sorted.iter().rev() {
        let axis = Axis(a);
        acc = match kind {
            ReduceKind::Sum | ReduceKind::Mean => acc.sum_axis(axis),
            ReduceKind::Max => acc.fold_axis(axis, f32::NEG_INFINITY, |m, &v| m.max(v)),
            ReduceKind::Min => acc.fold_axis(axis, f32::INFINITY, |m, &v| m.min(v)),
            ReduceKind::Prod => acc.fold_axis(axis, 1.0, |m, &v| m * v),
            ReduceKind::Any => acc.fold_axis(axis, 0.0, |m, &v| {
                if *m != 0.0 || v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }),
        };
    }
    if kind == ReduceKind::Mean && count > 0 {
        acc.mapv_inplace(|v| v / count as f32);
    }
    if keep_dims {
        for &a in &sorted {
            acc = acc.insert_axis(Axis(a));
        }
    }
    Ok(acc)
}

fn reshape(x: &ArrayD<f32>, target: &[usize]) -> FuseResult<ArrayD<f32>> {
    let flat: Vec<f32> = x.iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(target), flat).map_err(|_| FuseError::ShapeMismatch {
        expected: target.to_vec(),
        found: x.shape().to_vec(),
    })
}
