//! Reference interpreter checks against hand-computed values, plus IR
//! arena behaviour the pass depends on.

use std::collections::HashMap;

use batch_fuse::exec::Evaluator;
use batch_fuse::ir::{Graph, GraphBuilder, PoolKind, ReduceKind, TensorAttr};
use batch_fuse::TensorId;
use ndarray::{array, ArrayD, IxDyn};

fn run_single(graph: &Graph, x: TensorId, feed: ArrayD<f32>, y: TensorId) -> ArrayD<f32> {
    let mut feeds = HashMap::new();
    feeds.insert(x, feed);
    Evaluator::new(graph).run(&feeds).unwrap().remove(&y).unwrap()
}

#[test]
fn conv2d_matches_hand_computation() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 3, 3, 1]);
    let w = gb.constant(&[1, 1, 2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = gb.constant(&[1], &[0.5]);
    let y = gb.conv2d(x, w, b, [1, 1], [1, 1], [0; 4]);
    gb.output(y);

    // x[w][h] = w * 3 + h, one channel, one sample.
    let feed = ArrayD::from_shape_vec(
        IxDyn(&[1, 3, 3, 1]),
        (0..9).map(|v| v as f32).collect(),
    )
    .unwrap();
    let out = run_single(&graph, x, feed, y);
    // Window at (0,0): 0*1 + 1*2 + 3*3 + 4*4 + 0.5 = 27.5.
    assert_eq!(out[[0, 0, 0, 0]], 27.5);
    assert_eq!(out[[0, 1, 1, 0]], 0.5 + 4.0 + 2.0 * 5.0 + 3.0 * 7.0 + 4.0 * 8.0);
    assert_eq!(out.shape(), &[1, 2, 2, 1]);
}

#[test]
fn pools_select_and_average() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 2, 2, 1]);
    let avg = gb.pool2d(x, PoolKind::Avg, [2, 2], [2, 2]);
    let mx = gb.pool2d(x, PoolKind::Max, [2, 2], [2, 2]);
    gb.output(avg);
    gb.output(mx);

    let feed =
        ArrayD::from_shape_vec(IxDyn(&[1, 2, 2, 1]), vec![1.0, 2.0, 3.0, 8.0]).unwrap();
    let mut feeds = HashMap::new();
    feeds.insert(x, feed);
    let out = Evaluator::new(&graph).run(&feeds).unwrap();
    assert_eq!(out[&avg][[0, 0, 0, 0]], 3.5);
    assert_eq!(out[&mx][[0, 0, 0, 0]], 8.0);
}

#[test]
fn pad_zero_fills_the_border() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 1, 1, 1]);
    let y = gb.pad(x, vec![0, 1, 0, 0], vec![0, 0, 1, 0]);
    gb.output(y);

    let feed = ArrayD::from_shape_vec(IxDyn(&[1, 1, 1, 1]), vec![7.0]).unwrap();
    let out = run_single(&graph, x, feed, y);
    assert_eq!(out.shape(), &[1, 2, 2, 1]);
    assert_eq!(out[[0, 1, 0, 0]], 7.0);
    assert_eq!(out[[0, 0, 0, 0]], 0.0);
    assert_eq!(out[[0, 1, 1, 0]], 0.0);
}

#[test]
fn reductions_cover_all_kinds() {
    let feed = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
    for (kind, expected) in [
        (ReduceKind::Sum, 10.0),
        (ReduceKind::Mean, 2.5),
        (ReduceKind::Max, 4.0),
        (ReduceKind::Min, 1.0),
        (ReduceKind::Prod, 24.0),
        (ReduceKind::Any, 1.0),
    ] {
        let mut graph = Graph::new();
        let mut gb = GraphBuilder::new(&mut graph);
        let x = gb.input(&[2, 2]);
        let y = gb.reduce(x, kind, vec![0, 1], true);
        gb.output(y);
        let out = run_single(&graph, x, feed.clone(), y);
        assert_eq!(out.shape(), &[1, 1]);
        assert_eq!(out[[0, 0]], expected, "{kind:?}");
    }
}

#[test]
fn transpose_reshape_concat_roundtrip() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 2, 3, 1]);
    let t = gb.transpose(x, vec![0, 2, 1, 3]);
    let r = gb.reshape(t, vec![1, 6, 1, 1]);
    let c = gb.concat(vec![r, r], 0);
    gb.output(c);

    let feed = ArrayD::from_shape_vec(
        IxDyn(&[1, 2, 3, 1]),
        (0..6).map(|v| v as f32).collect(),
    )
    .unwrap();
    let out = run_single(&graph, x, feed, c);
    assert_eq!(out.shape(), &[2, 6, 1, 1]);
    // Transposing [1,2,3,1] to [1,3,2,1] interleaves the two W rows.
    assert_eq!(
        out.iter().copied().take(6).collect::<Vec<_>>(),
        vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
    );
}

#[test]
fn relu_and_broadcast_add() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[2, 1, 1, 2]);
    let shift = gb.constant(&[2, 1, 1, 1], &[1.0, -10.0]);
    let s = gb.add(x, shift);
    let y = gb.relu(s);
    gb.output(y);

    let feed =
        ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let out = run_single(&graph, x, feed, y);
    assert_eq!(
        out.iter().copied().collect::<Vec<_>>(),
        vec![2.0, 3.0, 0.0, 0.0]
    );
}

#[test]
fn arena_tracks_consumers_and_producers() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 1]);
    let a = gb.relu(x);
    let b = gb.relu(x);
    let y = gb.add(a, b);
    gb.output(y);

    assert_eq!(graph.consumers(x).len(), 2);
    assert_eq!(graph.consumers(a).len(), 1);
    assert!(graph.producer(x).is_none());
    let add_op = graph.producer(y).unwrap();
    assert_eq!(graph.op(add_op).inputs(), &[a, b]);
    assert_eq!(graph.inputs(), vec![x]);
    assert_eq!(graph.outputs(), vec![y]);
}

#[test]
fn placeholder_inputs_are_invisible_to_the_arena() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 3, 3, 1]);
    let w = gb.constant(&[1, 1, 2, 2], &[1.0; 4]);
    let y = gb.conv2d(x, w, TensorId::PLACEHOLDER, [1, 1], [1, 1], [0; 4]);
    gb.output(y);

    assert!(graph.consumers(TensorId::PLACEHOLDER).is_empty());
    let conv = graph.producer(y).unwrap();
    assert!(graph.op(conv).inputs()[2].is_placeholder());
}

#[test]
fn constant_bytes_stage_out_exactly() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let c = gb.constant(&[2], &[1.5, -2.5]);
    let tensor = graph.tensor(c).unwrap();
    assert_eq!(tensor.attr(), TensorAttr::Constant);
    assert_eq!(tensor.byte_size(), 8);
    let mut staged = vec![0u8; 8];
    tensor.copy_out(&mut staged).unwrap();
    assert_eq!(tensor.data().unwrap(), staged.as_slice());
    assert_eq!(tensor.f32_data().unwrap(), vec![1.5, -2.5]);
}

#[test]
fn graph_dump_lists_every_operator() {
    let mut graph = Graph::new();
    let mut gb = GraphBuilder::new(&mut graph);
    let x = gb.input(&[1, 4, 4, 1]);
    let y = gb.relu(x);
    gb.output(y);
    let dump = graph.to_json().unwrap();
    assert!(dump.contains("Relu"));
    assert!(dump.contains("Input"));
}
