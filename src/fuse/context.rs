use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::errors::{FuseError, FuseResult};
use crate::ir::{Graph, Operation};
use crate::types::{Gap, OpId, TensorId};

/// Axis policy: tensors are laid out `[C, W, H, N]`.
pub const CHANNEL_AXIS: usize = 0;
pub const FUSE_AXES: [usize; 2] = [1, 2];
pub const BATCH_AXIS: usize = 3;

/// Per-invocation working state of the pass.
///
/// Owns the clone and fuse graphs plus every per-tensor map; handlers
/// borrow it for the duration of one phase callback. All maps are keyed
/// by tensor id within the graph the phase walks (source ids during
/// clone, clone ids afterwards).
pub struct BatchFuseContext<'g> {
    src: &'g Graph,
    pub(crate) clone_graph: Graph,
    pub(crate) fuse_graph: Graph,
    fake_batch: u32,
    k: usize,

    tensor_map: HashMap<TensorId, TensorId>,
    clone_tensor_map: HashMap<TensorId, TensorId>,
    gap_infer_shape: HashMap<TensorId, Vec<usize>>,
    forward_gap: HashMap<TensorId, Gap>,
    proportion: HashMap<TensorId, f32>,
    perm_axis_map: HashMap<TensorId, Vec<usize>>,
    /// Tensors a fused-axis reduce has returned to batched form.
    unfused: HashSet<TensorId>,
    visited: HashSet<OpId>,
}

impl<'g> BatchFuseContext<'g> {
    pub fn new(src: &'g Graph, fake_batch: u32, k: usize) -> Self {
        Self {
            src,
            clone_graph: Graph::new(),
            fuse_graph: Graph::new(),
            fake_batch,
            k,
            tensor_map: HashMap::new(),
            clone_tensor_map: HashMap::new(),
            gap_infer_shape: HashMap::new(),
            forward_gap: HashMap::new(),
            proportion: HashMap::new(),
            perm_axis_map: HashMap::new(),
            unfused: HashSet::new(),
            visited: HashSet::new(),
        }
    }

    pub fn src(&self) -> &'g Graph {
        self.src
    }

    pub fn fake_batch(&self) -> u32 {
        self.fake_batch
    }

    /// Side length of the tile grid (`fake_batch = k²`).
    pub fn k(&self) -> usize {
        self.k
    }

    /// Consumes the context, releasing the finished fused graph; the
    /// clone graph and every map are dropped here.
    pub fn into_fused_graph(self) -> Graph {
        self.fuse_graph
    }

    // --- fuse-phase visit bookkeeping

    pub fn mark_visited(&mut self, op: OpId) {
        if !self.visited.insert(op) {
            warn!(?op, "operation already marked as visited");
        }
    }

    pub fn is_visited(&self, op: OpId) -> bool {
        self.visited.contains(&op)
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    // --- readiness

    /// Ready iff every non-constant, non-placeholder input is present in
    /// the phase's map. `op` belongs to the source graph.
    pub fn is_ready_for_clone(&self, op: &Operation) -> FuseResult<bool> {
        self.inputs_present(op, self.src, |ctx, t| ctx.clone_tensor_map.contains_key(&t))
    }

    /// `op` belongs to the clone graph.
    pub fn is_ready_for_gap_infer(&self, op: &Operation) -> FuseResult<bool> {
        self.inputs_present(op, &self.clone_graph, |ctx, t| {
            ctx.gap_infer_shape.contains_key(&t)
        })
    }

    /// `op` belongs to the clone graph.
    pub fn is_ready_for_fuse(&self, op: &Operation) -> FuseResult<bool> {
        self.inputs_present(op, &self.clone_graph, |ctx, t| ctx.tensor_map.contains_key(&t))
    }

    fn inputs_present(
        &self,
        op: &Operation,
        graph: &Graph,
        present: impl Fn(&Self, TensorId) -> bool,
    ) -> FuseResult<bool> {
        for &t in op.inputs() {
            if t.is_placeholder() {
                continue;
            }
            if graph.tensor(t)?.is_constant() {
                continue;
            }
            if !present(self, t) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // --- map maintenance

    pub fn update_tensor_map(&mut self, t_clone: TensorId, t_fused: TensorId) {
        self.tensor_map.insert(t_clone, t_fused);
    }

    pub fn update_clone_tensor_map(&mut self, t_src: TensorId, t_clone: TensorId) {
        self.clone_tensor_map.insert(t_src, t_clone);
    }

    /// Gaps only ever grow over the life of an inference run.
    pub fn update_forward_gap(&mut self, t: TensorId, gap: Gap) {
        if let Some(old) = self.forward_gap.get(&t) {
            debug_assert!(
                gap[0] >= old[0] && gap[1] >= old[1],
                "gap of {t:?} shrank from {old:?} to {gap:?}"
            );
        }
        self.forward_gap.insert(t, gap);
    }

    pub fn update_gap_infer_shape(&mut self, t: TensorId, shape: Vec<usize>) {
        self.gap_infer_shape.insert(t, shape);
    }

    pub fn update_proportion(&mut self, t: TensorId, proportion: f32) {
        self.proportion.insert(t, proportion);
    }

    pub fn update_perm_axis(&mut self, t: TensorId, perm: Vec<usize>) {
        self.perm_axis_map.insert(t, perm);
    }

    /// Rewrites the recorded geometry of `t` after its gap grew: gap,
    /// fused shape and valid-pixel proportion move together.
    pub fn enlarge_gap(&mut self, t: TensorId, sample: &[usize], gap: Gap, batch: usize) {
        self.update_forward_gap(t, gap);
        self.update_gap_infer_shape(
            t,
            crate::fuse::layout::fused_shape(sample, self.k, gap, Some(batch)),
        );
        let wa = FUSE_AXES[0];
        self.update_proportion(t, sample[wa] as f32 / (sample[wa] + gap[0]) as f32);
    }

    pub fn mark_unfused(&mut self, t: TensorId) {
        self.unfused.insert(t);
    }

    pub fn is_unfused(&self, t: TensorId) -> bool {
        self.unfused.contains(&t)
    }

    // --- map lookup; a miss is an internal invariant breach

    pub fn get_maped_tensor(&self, t_clone: TensorId) -> FuseResult<TensorId> {
        Self::require(self.tensor_map.get(&t_clone).copied(), "tensor map", t_clone)
    }

    pub fn get_clone_maped_tensor(&self, t_src: TensorId) -> FuseResult<TensorId> {
        Self::require(
            self.clone_tensor_map.get(&t_src).copied(),
            "clone tensor map",
            t_src,
        )
    }

    pub fn get_forward_gap(&self, t: TensorId) -> FuseResult<Gap> {
        Self::require(self.forward_gap.get(&t).copied(), "forward gap map", t)
    }

    pub fn get_gap_infer_shape(&self, t: TensorId) -> FuseResult<Vec<usize>> {
        Self::require(self.gap_infer_shape.get(&t).cloned(), "gap infer shape map", t)
    }

    pub fn get_proportion(&self, t: TensorId) -> FuseResult<f32> {
        Self::require(self.proportion.get(&t).copied(), "proportion map", t)
    }

    pub fn get_perm_axis(&self, t: TensorId) -> FuseResult<Vec<usize>> {
        Self::require(self.perm_axis_map.get(&t).cloned(), "permute axis map", t)
    }

    fn require<T>(found: Option<T>, map: &str, t: TensorId) -> FuseResult<T> {
        found.ok_or_else(|| {
            debug_assert!(false, "tensor {t:?} has not been inserted in {map}");
            tracing::error!(?t, map, "tensor has not been inserted in map");
            FuseError::MapMiss(format!("tensor {t:?} has not been inserted in {map}"))
        })
    }

    /// Position the source batch axis currently occupies for `t`, after
    /// any transposes seen on its path.
    pub fn batch_pos(&self, t: TensorId) -> FuseResult<usize> {
        let perm = self.get_perm_axis(t)?;
        perm.iter()
            .position(|&a| a == BATCH_AXIS)
            .ok_or_else(|| FuseError::MapMiss(format!("batch axis lost for {t:?}")))
    }

    /// Copies gap inference state from `from` to `to` unchanged; the
    /// shared path of every pointwise operator.
    pub fn propagate_state(&mut self, from: TensorId, to: TensorId) -> FuseResult<()> {
        let gap = self.get_forward_gap(from)?;
        let perm = self.get_perm_axis(from)?;
        let prop = self.get_proportion(from)?;
        self.update_forward_gap(to, gap);
        self.update_perm_axis(to, perm);
        self.update_proportion(to, prop);
        if self.is_unfused(from) {
            self.mark_unfused(to);
        }
        Ok(())
    }

    // --- fuse-phase emission helpers

    /// Translates `op`'s inputs through the tensor map, keeping
    /// placeholder slots as they are.
    pub fn map_fused_inputs(&self, op: &Operation) -> FuseResult<Vec<TensorId>> {
        let mut ins = Vec::with_capacity(op.inputs().len());
        for &t in op.inputs() {
            ins.push(if t.is_placeholder() { t } else { self.get_maped_tensor(t)? });
        }
        Ok(ins)
    }

    /// Creates fused counterparts for `op`'s outputs, sized to their
    /// inferred shapes, and records them in the tensor map. Returns
    /// `(fused_outputs, clone_outputs)`.
    pub fn emit_fused_outputs(
        &mut self,
        op: &Operation,
    ) -> FuseResult<(Vec<TensorId>, Vec<TensorId>)> {
        let mut fused = Vec::with_capacity(op.outputs().len());
        let mut next = Vec::with_capacity(op.outputs().len());
        for &o in op.outputs() {
            let shape = self.get_gap_infer_shape(o)?;
            let spec = self.clone_graph.tensor(o)?.spec().with_shape(shape);
            let id = self.fuse_graph.create_tensor(spec, None);
            self.update_tensor_map(o, id);
            fused.push(id);
            next.push(o);
        }
        Ok((fused, next))
    }

    /// Re-emits `op` unchanged onto the fused tensors; the common case
    /// for operators whose fused form is the operator itself applied to
    /// the enlarged tensor.
    pub fn emit_same_op(&mut self, op: &Operation) -> FuseResult<Vec<TensorId>> {
        let ins = self.map_fused_inputs(op)?;
        let (outs, next) = self.emit_fused_outputs(op)?;
        self.fuse_graph
            .create_op(op.kind(), op.params().clone(), ins, outs);
        Ok(next)
    }
}
