use crate::ir::{
    bytes_from_f32, Graph, OpKind, OpParams, PoolKind, ReduceKind, TensorAttr, TensorSpec,
};
use crate::types::TensorId;

/// Convenience layer for assembling source graphs.
pub struct GraphBuilder<'a> {
    graph: &'a mut Graph,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(graph: &'a mut Graph) -> Self {
        Self { graph }
    }

    pub fn input(&mut self, shape: &[usize]) -> TensorId {
        self.graph
            .create_tensor(TensorSpec::f32(shape.to_vec(), TensorAttr::Input), None)
    }

    pub fn constant(&mut self, shape: &[usize], values: &[f32]) -> TensorId {
        self.graph.create_tensor(
            TensorSpec::f32(shape.to_vec(), TensorAttr::Constant),
            Some(bytes_from_f32(values)),
        )
    }

    fn transient(&mut self, shape: &[usize]) -> TensorId {
        self.graph
            .create_tensor(TensorSpec::f32(shape.to_vec(), TensorAttr::Transient), None)
    }

    /// `weight` is `[Co, Ci, Kw, Kh]`; pass `TensorId::PLACEHOLDER` for a
    /// missing bias.
    pub fn conv2d(
        &mut self,
        x: TensorId,
        weight: TensorId,
        bias: TensorId,
        stride: [usize; 2],
        dilation: [usize; 2],
        pad: [usize; 4],
    ) -> TensorId {
        let in_shape = self.shape(x);
        let w_shape = self.shape(weight);
        let ksize = [w_shape[2], w_shape[3]];
        let out_shape = vec![
            w_shape[0],
            conv_extent(in_shape[1], ksize[0], stride[0], dilation[0], pad[0] + pad[1]),
            conv_extent(in_shape[2], ksize[1], stride[1], dilation[1], pad[2] + pad[3]),
            in_shape[3],
        ];
        let out = self.transient(&out_shape);
        self.graph.create_op(
            OpKind::Conv2d,
            OpParams::Conv2d { ksize, stride, dilation, pad },
            vec![x, weight, bias],
            vec![out],
        );
        out
    }

    pub fn pool2d(
        &mut self,
        x: TensorId,
        kind: PoolKind,
        ksize: [usize; 2],
        stride: [usize; 2],
    ) -> TensorId {
        let in_shape = self.shape(x);
        let out_shape = vec![
            in_shape[0],
            conv_extent(in_shape[1], ksize[0], stride[0], 1, 0),
            conv_extent(in_shape[2], ksize[1], stride[1], 1, 0),
            in_shape[3],
        ];
        let out = self.transient(&out_shape);
        self.graph.create_op(
            OpKind::Pool2d,
            OpParams::Pool2d { kind, ksize, stride },
            vec![x],
            vec![out],
        );
        out
    }

    pub fn relu(&mut self, x: TensorId) -> TensorId {
        let out = self.transient(&self.shape(x));
        self.graph
            .create_op(OpKind::Relu, OpParams::Relu, vec![x], vec![out]);
        out
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let out = self.transient(&self.shape(a));
        self.graph
            .create_op(OpKind::Add, OpParams::Add, vec![a, b], vec![out]);
        out
    }

    pub fn pad(&mut self, x: TensorId, front: Vec<usize>, back: Vec<usize>) -> TensorId {
        let in_shape = self.shape(x);
        let out_shape: Vec<usize> = in_shape
            .iter()
            .enumerate()
            .map(|(i, &d)| d + front[i] + back[i])
            .collect();
        let out = self.transient(&out_shape);
        self.graph
            .create_op(OpKind::Pad, OpParams::Pad { front, back }, vec![x], vec![out]);
        out
    }

    pub fn reduce(
        &mut self,
        x: TensorId,
        kind: ReduceKind,
        axes: Vec<usize>,
        keep_dims: bool,
    ) -> TensorId {
        let in_shape = self.shape(x);
        let out_shape: Vec<usize> = if keep_dims {
            in_shape
                .iter()
                .enumerate()
                .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
                .collect()
        } else {
            in_shape
                .iter()
                .enumerate()
                .filter(|(i, _)| !axes.contains(i))
                .map(|(_, &d)| d)
                .collect()
        };
        let out = self.transient(&out_shape);
        self.graph.create_op(
            OpKind::Reduce,
            OpParams::Reduce { kind, axes, keep_dims },
            vec![x],
            vec![out],
        );
        out
    }

    pub fn transpose(&mut self, x: TensorId, perm: Vec<usize>) -> TensorId {
        let in_shape = self.shape(x);
        let out_shape: Vec<usize> = perm.iter().map(|&a| in_shape[a]).collect();
        let out = self.transient(&out_shape);
        self.graph.create_op(
            OpKind::Transpose,
            OpParams::Transpose { perm },
            vec![x],
            vec![out],
        );
        out
    }

    pub fn reshape(&mut self, x: TensorId, target: Vec<usize>) -> TensorId {
        let out = self.transient(&target);
        self.graph.create_op(
            OpKind::Reshape,
            OpParams::Reshape { target },
            vec![x],
            vec![out],
        );
        out
    }

    pub fn concat(&mut self, inputs: Vec<TensorId>, axis: usize) -> TensorId {
        let mut out_shape = self.shape(inputs[0]);
        out_shape[axis] = inputs.iter().map(|&t| self.shape(t)[axis]).sum();
        let out = self.transient(&out_shape);
        self.graph
            .create_op(OpKind::Concat, OpParams::Concat { axis }, inputs, vec![out]);
        out
    }

    pub fn output(&mut self, t: TensorId) {
        self.graph.mark_output(t);
    }

    fn shape(&self, t: TensorId) -> Vec<usize> {
        self.graph
            .tensor(t)
            .expect("builder used with a foreign tensor id")
            .shape()
            .to_vec()
    }
}

fn conv_extent(input: usize, ksize: usize, stride: usize, dilation: usize, pad: usize) -> usize {
    (input + pad - (ksize - 1) * dilation - 1) / stride + 1
}
