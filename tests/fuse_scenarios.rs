//! Literal rewrite scenarios: graph shapes and operator lists after the
//! pass, plus the failure cases.

use batch_fuse::ir::{
    Graph, GraphBuilder, OpKind, PoolKind, Quant, ReduceKind, TensorAttr, TensorSpec,
};
use batch_fuse::{batch_fuse, FuseError, TensorId};

fn shape_of(graph: &Graph, t: TensorId) -> Vec<usize> {
    graph.tensor(t).unwrap().shape().to_vec()
}

/// Conv2d(3x3, stride 1, no pad) over `[1, 4, 4, 4]`.
fn minimal_conv() -> (Graph, TensorId, TensorId) {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 4]);
    let w = gb.constant(&[1, 1, 3, 3], &[0.5; 9]);
    let y = gb.conv2d(x, w, TensorId::PLACEHOLDER, [1, 1], [1, 1], [0; 4]);
    gb.output(y);
    (graph, x, y)
}

#[test]
fn minimal_conv_folds_to_nine_by_nine() {
    let (graph, x, y) = minimal_conv();
    let fused = batch_fuse(&graph, 4).unwrap();
    // Four samples tile a 2x2 grid with a one-pixel gap: 4*2 + 1 = 9.
    assert_eq!(shape_of(&fused.graph, fused.io_map[&x]), vec![1, 9, 9, 1]);
    assert_eq!(shape_of(&fused.graph, fused.io_map[&y]), vec![1, 7, 7, 1]);
}

#[test]
fn appended_relu_keeps_conv_geometry() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 4]);
    let w = gb.constant(&[1, 1, 3, 3], &[0.5; 9]);
    let c = gb.conv2d(x, w, TensorId::PLACEHOLDER, [1, 1], [1, 1], [0; 4]);
    let r = gb.relu(c);
    gb.output(r);

    let fused = batch_fuse(&graph, 4).unwrap();
    assert_eq!(shape_of(&fused.graph, fused.io_map[&x]), vec![1, 9, 9, 1]);
    assert_eq!(shape_of(&fused.graph, fused.io_map[&r]), vec![1, 7, 7, 1]);
}

#[test]
fn broadcast_constant_add_rides_along() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[2, 4, 4, 4]);
    let w = gb.constant(&[2, 2, 3, 3], &[0.1; 36]);
    let c = gb.conv2d(x, w, TensorId::PLACEHOLDER, [1, 1], [1, 1], [0; 4]);
    let bias = gb.constant(&[2, 1, 1, 1], &[1.0, -1.0]);
    let y = gb.add(c, bias);
    gb.output(y);

    let fused = batch_fuse(&graph, 4).unwrap();
    assert_eq!(shape_of(&fused.graph, fused.io_map[&y]), vec![2, 7, 7, 1]);
    // The constant keeps its broadcast shape in the fused graph.
    let fused_consts = fused.graph.constants();
    assert!(fused_consts
        .iter()
        .any(|&t| shape_of(&fused.graph, t) == vec![2, 1, 1, 1]));
}

#[test]
fn pool_stride_forces_backward_gap_growth() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 4]);
    let w = gb.constant(&[1, 1, 3, 3], &[0.5; 9]);
    let c = gb.conv2d(x, w, TensorId::PLACEHOLDER, [1, 1], [1, 1], [0; 4]);
    let p = gb.pool2d(c, PoolKind::Avg, [2, 2], [2, 2]);
    gb.output(p);

    let fused = batch_fuse(&graph, 4).unwrap();
    // A gap of 1 would leave the conv output on an odd pitch, so the
    // backward wave grows the graph input gap to 2: 4*2 + 2 = 10.
    assert_eq!(shape_of(&fused.graph, fused.io_map[&x]), vec![1, 10, 10, 1]);
    assert_eq!(shape_of(&fused.graph, fused.io_map[&p]), vec![1, 4, 4, 1]);
}

#[test]
fn concat_along_fused_axis_is_rejected() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 4]);
    let r = gb.relu(x);
    let s = gb.relu(x);
    let y = gb.concat(vec![r, s], 1);
    gb.output(y);

    assert!(matches!(
        batch_fuse(&graph, 4),
        Err(FuseError::IllegalAxisTransform(_))
    ));
}

#[test]
fn reduce_over_fused_axes_unfuses_first() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[2, 4, 4, 4]);
    let y = gb.reduce(x, ReduceKind::Mean, vec![1, 2], true);
    gb.output(y);

    let fused = batch_fuse(&graph, 4).unwrap();
    let ops = fused.graph.ops();
    // The emitted operator list starts with a reshape back to batched
    // form, then the reduction itself.
    assert_eq!(ops[0].kind(), OpKind::Reshape2);
    match ops[0].params() {
        batch_fuse::ir::OpParams::Reshape { target } => {
            assert_eq!(target, &vec![2, 4, 4, 4])
        }
        other => panic!("unexpected params {other:?}"),
    }
    assert_eq!(ops[1].kind(), OpKind::Reduce);
    assert_eq!(shape_of(&fused.graph, fused.io_map[&y]), vec![2, 1, 1, 4]);
}

#[test]
fn io_map_is_total_over_graph_io() {
    let (graph, _, _) = minimal_conv();
    let fused = batch_fuse(&graph, 4).unwrap();
    for t in graph.inputs().into_iter().chain(graph.outputs()) {
        let mapped = fused.io_map[&t];
        assert!(fused.graph.tensor(mapped).is_ok());
    }
}

#[test]
fn operator_kinds_are_preserved() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 6, 6, 4]);
    let w = gb.constant(&[1, 1, 3, 3], &[0.5; 9]);
    let c = gb.conv2d(x, w, TensorId::PLACEHOLDER, [1, 1], [1, 1], [0; 4]);
    let r = gb.relu(c);
    let p = gb.pool2d(r, PoolKind::Max, [2, 2], [2, 2]);
    gb.output(p);

    let fused = batch_fuse(&graph, 4).unwrap();
    let count = |kind: OpKind| fused.graph.ops().iter().filter(|o| o.kind() == kind).count();
    assert_eq!(count(OpKind::Conv2d), 1);
    assert_eq!(count(OpKind::Relu), 1);
    assert_eq!(count(OpKind::Pool2d), 1);
    // Anything else must be auxiliary layout plumbing.
    for op in fused.graph.ops() {
        assert!(matches!(
            op.kind(),
            OpKind::Conv2d
                | OpKind::Relu
                | OpKind::Pool2d
                | OpKind::Pad
                | OpKind::Reshape
                | OpKind::Reshape2
                | OpKind::Transpose
        ));
    }
}

#[test]
fn unit_batch_pass_is_idempotent_on_fused_output() {
    let (graph, _, _) = minimal_conv();
    let fused = batch_fuse(&graph, 4).unwrap();
    let again = batch_fuse(&fused.graph, 1).unwrap();
    assert_eq!(again.graph.ops().len(), fused.graph.ops().len());
    for t in fused.graph.inputs().into_iter().chain(fused.graph.outputs()) {
        assert_eq!(again.io_map[&t], t);
    }
}

#[test]
fn reshape_splitting_fused_axis_is_rejected() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 4]);
    let y = gb.reshape(x, vec![1, 2, 8, 4]);
    gb.output(y);

    assert!(matches!(
        batch_fuse(&graph, 4),
        Err(FuseError::IllegalAxisTransform(_))
    ));
}

#[test]
fn transpose_moving_channel_into_spatial_is_rejected() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 4]);
    let y = gb.transpose(x, vec![1, 0, 2, 3]);
    gb.output(y);

    assert!(matches!(
        batch_fuse(&graph, 4),
        Err(FuseError::IllegalAxisTransform(_))
    ));
}

#[test]
fn quantized_operator_is_rejected() {
    let mut graph = Graph::new();
    let mut spec = TensorSpec::f32(vec![1, 4, 4, 4], TensorAttr::Input);
    spec.quant = Some(Quant { scale: 0.5, zero_point: 3 });
    let x = graph.create_tensor(spec, None);
    let mut gb = GraphBuilder::new(&mut graph);
    let y = gb.relu(x);
    gb.output(y);

    assert!(matches!(
        batch_fuse(&graph, 4),
        Err(FuseError::UnsupportedOp(OpKind::Relu))
    ));
}

#[test]
fn mismatched_elementwise_branches_are_rejected() {
    // The two conv branches see different kernels, so their output gaps
    // disagree and the add must refuse to merge them.
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 8, 8, 4]);
    let w3 = gb.constant(&[1, 1, 3, 3], &[0.5; 9]);
    let w5 = gb.constant(&[1, 1, 5, 5], &[0.5; 25]);
    let a = gb.conv2d(x, w3, TensorId::PLACEHOLDER, [1, 1], [1, 1], [1, 1, 1, 1]);
    let b = gb.conv2d(x, w5, TensorId::PLACEHOLDER, [1, 1], [1, 1], [2, 2, 2, 2]);
    let y = gb.add(a, b);
    gb.output(y);

    assert!(matches!(
        batch_fuse(&graph, 4),
        Err(FuseError::ShapeMismatch { .. })
    ));
}
