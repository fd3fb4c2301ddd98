use log::{debug, info};
use rayon::prelude::*;

use stoat_core::{Buffer, Device, Error, Result, Shape};
use stoat_nn::{Graph, LayerKind, Loss, Metric, Optimizer};

use crate::compserv::ComputeService;

mod step;

// Net — The network executor
//
// A Net owns a layer graph definition plus one replica of it per device in
// its compute service. Each training step walks a fixed state machine:
//
//   Idle → forward → Forwarded → compute_loss → LossComputed
//        → backward → Backwarded → sync_grads → GradientsReady
//        → update → Idle
//
// Out-of-order calls are errors, never silent corruption. Within a step,
// replicas run their traversals in parallel on the service's thread pool;
// a replica's traversal itself is single-threaded. The only hard barriers
// are the joins at the end of each parallel phase and the gradient merge
// in sync_grads.
//
// Replica 0 is authoritative: gradients are merged into it, the optimizer
// mutates its parameters, and update() broadcasts the result so every
// replica starts the next step bit-identical.

/// How sync_grads combines replica gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GradPolicy {
    /// Sum across replicas (gradients stay batch-sums; the optimizer
    /// divides by the batch size).
    #[default]
    Sum,
    /// Divide the sum by the number of active replicas.
    Average,
}

/// Phase of the current training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Idle,
    Forwarded,
    LossComputed,
    Backwarded,
    GradientsReady,
}

/// A layer graph bound to losses, metrics, an optimizer, and a set of
/// data-parallel replicas.
pub struct Net {
    graph: Graph,
    replicas: Vec<Graph>,
    fwd_order: Vec<usize>,
    bwd_order: Vec<usize>,
    losses: Vec<Box<dyn Loss>>,
    metrics: Vec<Box<dyn Metric>>,
    optimizer: Option<Box<dyn Optimizer>>,
    policy: GradPolicy,
    pool: Option<rayon::ThreadPool>,
    /// Samples assigned to each replica for the current batch.
    shares: Vec<usize>,
    /// Batch each replica is currently sized for.
    replica_batches: Vec<usize>,
    batch: usize,
    phase: StepPhase,
    pub(crate) loss_totals: Vec<f64>,
    pub(crate) metric_totals: Vec<f64>,
    pub(crate) seen_samples: usize,
}

impl Net {
    /// Wrap a graph. The graph's registered inputs and marked outputs
    /// define the network interface; `build` validates them.
    pub fn new(graph: Graph) -> Self {
        Net {
            graph,
            replicas: Vec::new(),
            fwd_order: Vec::new(),
            bwd_order: Vec::new(),
            losses: Vec::new(),
            metrics: Vec::new(),
            optimizer: None,
            policy: GradPolicy::Sum,
            pool: None,
            shares: Vec::new(),
            replica_batches: Vec::new(),
            batch: 0,
            phase: StepPhase::Idle,
            loss_totals: Vec::new(),
            metric_totals: Vec::new(),
            seen_samples: 0,
        }
    }

    /// Validate the graph, compute traversal orders, replicate onto the
    /// service's devices, and set up the optimizer.
    pub fn build(
        &mut self,
        mut optimizer: Box<dyn Optimizer>,
        losses: Vec<Box<dyn Loss>>,
        metrics: Vec<Box<dyn Metric>>,
        service: &ComputeService,
        policy: GradPolicy,
    ) -> Result<()> {
        if !self.replicas.is_empty() {
            return Err(Error::GraphValidation("network already built".to_string()));
        }
        if self.graph.inputs().is_empty() {
            return Err(Error::GraphValidation("graph has no inputs".to_string()));
        }
        if self.graph.outputs().is_empty() {
            return Err(Error::GraphValidation("graph has no outputs".to_string()));
        }
        if losses.len() != self.graph.outputs().len() {
            return Err(Error::GraphValidation(format!(
                "{} losses for {} outputs",
                losses.len(),
                self.graph.outputs().len()
            )));
        }
        if metrics.len() != self.graph.outputs().len() {
            return Err(Error::GraphValidation(format!(
                "{} metrics for {} outputs",
                metrics.len(),
                self.graph.outputs().len()
            )));
        }

        let (fwd, bwd) = self.traversal_orders()?;
        self.fwd_order = fwd;
        self.bwd_order = bwd;

        let n = service.replica_count();
        let mut replicas = Vec::with_capacity(n);
        for &device in service.device_list() {
            replicas.push(self.graph.clone_to(device)?);
        }
        optimizer.setup(&replicas[0].params())?;
        self.optimizer = Some(optimizer);
        self.replicas = replicas;
        self.replica_batches = vec![0; n];
        self.shares = vec![0; n];
        self.losses = losses;
        self.metrics = metrics;
        self.policy = policy;
        self.loss_totals = vec![0.0; self.graph.outputs().len()];
        self.metric_totals = vec![0.0; self.graph.outputs().len()];
        self.pool = Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(service.threads())
                .build()
                .map_err(|e| Error::msg(format!("thread pool: {}", e)))?,
        );

        info!(
            "built net: {} layers, {} replicas, {} trainable buffers",
            self.fwd_order.len(),
            n,
            self.graph.params().len()
        );
        Ok(())
    }

    /// Forward topological order (ancestors of the outputs, ascending) and
    /// its reverse, after checking that every output is fed by registered
    /// inputs.
    fn traversal_orders(&self) -> Result<(Vec<usize>, Vec<usize>)> {
        // Ancestor closure of the outputs, walking parent lists. Arena
        // indices are already topological (parents precede children), so
        // the ascending order of the closure is a forward order.
        let mut in_closure = vec![false; self.graph.len()];
        let mut stack: Vec<usize> = self.graph.outputs().to_vec();
        while let Some(idx) = stack.pop() {
            if in_closure[idx] {
                continue;
            }
            in_closure[idx] = true;
            stack.extend_from_slice(&self.graph.node(idx).parents);
        }

        // Every source in the closure must be a registered input, and
        // every output must be reachable from at least one input.
        let mut from_inputs = vec![false; self.graph.len()];
        let mut stack: Vec<usize> = self.graph.inputs().to_vec();
        while let Some(idx) = stack.pop() {
            if from_inputs[idx] {
                continue;
            }
            from_inputs[idx] = true;
            stack.extend_from_slice(&self.graph.node(idx).children);
        }
        for idx in 0..self.graph.len() {
            if !in_closure[idx] {
                continue;
            }
            let node = self.graph.node(idx);
            if matches!(node.kind, LayerKind::Input) && !self.graph.inputs().contains(&idx) {
                return Err(Error::GraphValidation(format!(
                    "layer '{}' is an unregistered data source",
                    node.name
                )));
            }
        }
        for &out in self.graph.outputs() {
            if !from_inputs[out] {
                return Err(Error::GraphValidation(format!(
                    "output '{}' is not reachable from the inputs",
                    self.graph.node(out).name
                )));
            }
        }

        let fwd: Vec<usize> = (0..self.graph.len()).filter(|&i| in_closure[i]).collect();
        let bwd: Vec<usize> = fwd.iter().rev().copied().collect();
        Ok((fwd, bwd))
    }

    fn check_built(&self) -> Result<()> {
        if self.replicas.is_empty() {
            return Err(Error::msg("network is not built"));
        }
        Ok(())
    }

    fn expect_phase(&self, want: StepPhase, op: &str) -> Result<()> {
        if self.phase != want {
            return Err(Error::msg(format!(
                "{} called in {:?} phase (expected {:?})",
                op, self.phase, want
            )));
        }
        Ok(())
    }

    /// Assign batch rows to replicas: as even as possible, remainder to
    /// the first replicas.
    fn split_batch(&mut self, batch: usize) {
        let n = self.replicas.len();
        let base = batch / n;
        let rem = batch % n;
        for r in 0..n {
            self.shares[r] = base + usize::from(r < rem);
        }
        self.batch = batch;
        debug!("batch {} split as {:?}", batch, self.shares);
    }

    /// Rows `offset..offset + rows` of a batch-major buffer, as a fresh
    /// host buffer.
    fn slice_rows(src: &Buffer, offset: usize, rows: usize) -> Result<Buffer> {
        let dims = src.dims();
        if dims.is_empty() {
            return Err(Error::msg("batch buffers need a leading batch dimension"));
        }
        let feat = src.len() / dims[0];
        let mut out_dims = dims.to_vec();
        out_dims[0] = rows;
        let v = src.to_vec();
        Buffer::from_slice(
            &v[offset * feat..(offset + rows) * feat],
            Shape::new(out_dims),
            Device::Cpu,
        )
    }

    /// Run each replica's forward traversal over its share of the batch.
    ///
    /// `batch_inputs` carries one buffer per registered input, all with
    /// the same leading batch dimension. A failing replica aborts the
    /// whole step; partial results are discarded by returning to Idle.
    pub fn forward(&mut self, batch_inputs: &[Buffer]) -> Result<()> {
        self.check_built()?;
        self.expect_phase(StepPhase::Idle, "forward")?;
        let input_ids = self.graph.inputs().to_vec();
        if batch_inputs.len() != input_ids.len() {
            return Err(Error::msg(format!(
                "{} input buffers for {} input layers",
                batch_inputs.len(),
                input_ids.len()
            )));
        }
        let batch = batch_inputs
            .first()
            .map(|b| b.dims().first().copied().unwrap_or(0))
            .unwrap_or(0);
        if batch == 0 {
            return Err(Error::msg("batch size must be at least 1"));
        }
        for (k, x) in batch_inputs.iter().enumerate() {
            let expect = self.graph.node(input_ids[k]).output.dims();
            if x.dims().len() != expect.len() || x.dims()[1..] != expect[1..] {
                return Err(Error::ShapeMismatch {
                    expected: self.graph.node(input_ids[k]).output.shape().clone(),
                    got: x.shape().clone(),
                });
            }
            if x.dims()[0] != batch {
                return Err(Error::msg(
                    "input buffers disagree on the batch dimension",
                ));
            }
        }

        self.split_batch(batch);

        // Resize and feed each active replica its slice.
        let mut offset = 0;
        for r in 0..self.replicas.len() {
            let share = self.shares[r];
            if share == 0 {
                continue;
            }
            if self.replica_batches[r] != share {
                self.replicas[r].resize(share)?;
                self.replica_batches[r] = share;
            }
            for (k, x) in batch_inputs.iter().enumerate() {
                let sub = Self::slice_rows(x, offset, share)?;
                self.replicas[r]
                    .node(input_ids[k])
                    .output
                    .copy_from(&sub)?;
            }
            offset += share;
        }

        self.run_replicas(|g, order| g.forward_pass(order), true)?;
        self.phase = StepPhase::Forwarded;
        Ok(())
    }

    /// Run a traversal on every active replica in parallel. On any
    /// failure the step is abandoned and the phase returns to Idle.
    fn run_replicas(
        &mut self,
        f: impl Fn(&mut Graph, &[usize]) -> Result<()> + Sync,
        forward: bool,
    ) -> Result<()> {
        let order = if forward {
            self.fwd_order.clone()
        } else {
            self.bwd_order.clone()
        };
        let shares = self.shares.clone();
        let pool = self.pool.as_ref().ok_or_else(|| Error::msg("network is not built"))?;
        let replicas = &mut self.replicas;
        let results: Vec<(usize, Result<()>)> = pool.install(|| {
            replicas
                .par_iter_mut()
                .enumerate()
                .map(|(r, g)| {
                    if shares[r] == 0 {
                        (r, Ok(()))
                    } else {
                        (r, f(g, &order))
                    }
                })
                .collect()
        });
        for (r, res) in results {
            if let Err(e) = res {
                self.phase = StepPhase::Idle;
                return Err(Error::ReplicaFailure {
                    replica: r,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Evaluate each output's loss on the current activations and add the
    /// batch totals to the running sums. Returns this batch's per-output
    /// loss totals.
    pub fn compute_loss(&mut self, targets: &[Buffer]) -> Result<Vec<f32>> {
        self.expect_phase(StepPhase::Forwarded, "compute_loss")?;
        let batch_totals = self.apply_targets(targets, |net, out_idx, target, output| {
            net.losses[out_idx].value(target, output)
        })?;
        for (o, v) in batch_totals.iter().enumerate() {
            self.loss_totals[o] += f64::from(*v);
        }
        self.seen_samples += self.batch;
        self.phase = StepPhase::LossComputed;
        Ok(batch_totals)
    }

    /// Per replica and output, evaluate `f` on (target slice, output
    /// buffer) and sum per output. Any failure aborts the step.
    fn apply_targets(
        &mut self,
        targets: &[Buffer],
        f: impl Fn(&Self, usize, &Buffer, &Buffer) -> Result<f32>,
    ) -> Result<Vec<f32>> {
        let output_ids = self.graph.outputs().to_vec();
        if targets.len() != output_ids.len() {
            return Err(Error::msg(format!(
                "{} target buffers for {} outputs",
                targets.len(),
                output_ids.len()
            )));
        }
        let mut totals = vec![0.0f32; output_ids.len()];
        let mut offset = 0;
        for r in 0..self.replicas.len() {
            let share = self.shares[r];
            if share == 0 {
                continue;
            }
            for (o, &out_id) in output_ids.iter().enumerate() {
                let target = Self::slice_rows(&targets[o], offset, share)?;
                let output = self.replicas[r].node(out_id).output.clone();
                match f(self, o, &target, &output) {
                    Ok(v) => totals[o] += v,
                    Err(e) => {
                        self.phase = StepPhase::Idle;
                        return Err(Error::ReplicaFailure {
                            replica: r,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            offset += share;
        }
        Ok(totals)
    }

    /// Seed output deltas from the losses and run the reverse traversal
    /// on every replica. Deltas and parameter gradients are zeroed first;
    /// gradients accumulate within this sweep only.
    pub fn backward(&mut self, targets: &[Buffer]) -> Result<()> {
        self.expect_phase(StepPhase::LossComputed, "backward")?;
        let output_ids = self.graph.outputs().to_vec();
        if targets.len() != output_ids.len() {
            return Err(Error::msg(format!(
                "{} target buffers for {} outputs",
                targets.len(),
                output_ids.len()
            )));
        }

        for g in &self.replicas {
            g.reset_grads()?;
        }

        let mut offset = 0;
        for r in 0..self.replicas.len() {
            let share = self.shares[r];
            if share == 0 {
                continue;
            }
            for (o, &out_id) in output_ids.iter().enumerate() {
                let target = Self::slice_rows(&targets[o], offset, share)?;
                let node = self.replicas[r].node(out_id);
                if let Err(e) = self.losses[o].delta(&target, &node.output, &node.delta) {
                    self.phase = StepPhase::Idle;
                    return Err(Error::ReplicaFailure {
                        replica: r,
                        reason: e.to_string(),
                    });
                }
            }
            offset += share;
        }

        self.run_replicas(|g, order| g.backward_pass(order), false)?;
        self.phase = StepPhase::Backwarded;
        Ok(())
    }

    /// Merge every trainable parameter's gradient across replicas into
    /// replica 0. This is the step's hard barrier: each target buffer is
    /// write-locked only for the duration of its own merge.
    pub fn sync_grads(&mut self) -> Result<()> {
        self.expect_phase(StepPhase::Backwarded, "sync_grads")?;
        let targets = self.replicas[0].grads();
        for replica in self.replicas.iter().skip(1) {
            let grads = replica.grads();
            for (t, g) in targets.iter().zip(&grads) {
                // Inactive replicas contribute zeros; adding them is a
                // no-op but keeps the merge uniform.
                t.axpy(1.0, g)?;
            }
        }
        if self.policy == GradPolicy::Average {
            let active = self.shares.iter().filter(|&&s| s > 0).count().max(1);
            for t in &targets {
                t.scale(1.0 / active as f32)?;
            }
        }
        self.phase = StepPhase::GradientsReady;
        Ok(())
    }

    /// Let the optimizer consume replica 0's gradients, then broadcast
    /// the updated parameters so every replica is bit-identical again.
    pub fn update(&mut self) -> Result<()> {
        self.expect_phase(StepPhase::GradientsReady, "update")?;
        let params = self.replicas[0].params();
        let grads = self.replicas[0].grads();
        let opt = self
            .optimizer
            .as_mut()
            .ok_or_else(|| Error::msg("network is not built"))?;
        opt.apply_gradients(&params, &grads, self.batch)?;
        for replica in self.replicas.iter().skip(1) {
            let dst = replica.params();
            for (d, s) in dst.iter().zip(&params) {
                d.copy_from(s)?;
            }
        }
        self.phase = StepPhase::Idle;
        Ok(())
    }

    // Introspection

    /// The graph definition this net was built from.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The authoritative parameter handles (replica 0 once built).
    pub fn params(&self) -> Vec<Buffer> {
        if self.replicas.is_empty() {
            self.graph.params()
        } else {
            self.replicas[0].params()
        }
    }

    /// Parameter handles of a specific replica (for consistency checks).
    pub fn replica_params(&self, r: usize) -> Vec<Buffer> {
        self.replicas[r].params()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Batch shares assigned by the most recent forward.
    pub fn batch_shares(&self) -> &[usize] {
        &self.shares
    }

    /// Forward traversal order (for instrumentation and tests).
    pub fn forward_order(&self) -> &[usize] {
        &self.fwd_order
    }

    /// Zero the running loss/metric totals.
    pub fn reset_loss(&mut self) {
        for v in &mut self.loss_totals {
            *v = 0.0;
        }
        for v in &mut self.metric_totals {
            *v = 0.0;
        }
        self.seen_samples = 0;
    }

    /// Per-output average loss over the samples seen since the last
    /// `reset_loss`.
    pub fn get_loss_values(&self) -> Vec<f32> {
        let n = self.seen_samples.max(1) as f64;
        self.loss_totals.iter().map(|&t| (t / n) as f32).collect()
    }

    /// Per-output average metric over the samples seen since the last
    /// `reset_loss`.
    pub fn get_metric_values(&self) -> Vec<f32> {
        let n = self.seen_samples.max(1) as f64;
        self.metric_totals.iter().map(|&t| (t / n) as f32).collect()
    }
}
