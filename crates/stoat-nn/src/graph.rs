use stoat_core::{delta_reduce, reduce, Buffer, Device, Error, Result, Shape};

use crate::layer::{infer_output_shape, AffineState, LayerKind, ReduceState};
use crate::namegen::NameAllocator;

// Layer graph
//
// Nodes live in an index-addressed arena; parents and children are index
// lists, not owning pointers. A node can only name parents that already
// exist, so arena order is a valid topological order by construction and
// cycles are unrepresentable.
//
// Node contract:
//   forward      reads parent outputs, writes this node's output —
//                idempotent, no hidden state outside the node
//   backward     reads this node's delta and *accumulates* into parent
//                deltas and parameter gradients (a parent can feed several
//                children, so accumulation is +=, never =)
//   reset_grads  zeroes deltas and parameter gradients; must precede each
//                backward sweep
//
// Buffers are allocated on the node's device. The kernels here are host
// kernels: a graph cloned onto an accelerator device allocates fine but
// fails with DeviceMismatch the moment a kernel runs, which the executor
// surfaces as a replica failure.

/// One layer instance in the graph arena.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub device: Device,
    pub kind: LayerKind,
    /// Activation written by `forward` (or by the executor, for inputs).
    pub output: Buffer,
    /// Gradient with respect to `output`; always shaped like `output`.
    pub delta: Buffer,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
}

/// Index-addressed layer graph.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    names: NameAllocator,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // Construction

    fn push_node(
        &mut self,
        kind: LayerKind,
        shape: Shape,
        parents: Vec<usize>,
        device: Device,
    ) -> Result<usize> {
        for &p in &parents {
            if p >= self.nodes.len() {
                return Err(Error::GraphValidation(format!(
                    "parent index {} does not exist yet",
                    p
                )));
            }
        }
        let idx = self.nodes.len();
        let name = self.names.next(kind.kind_name());
        let output = Buffer::zeros(shape.clone(), device)?;
        let delta = Buffer::zeros(shape, device)?;
        for &p in &parents {
            self.nodes[p].children.push(idx);
        }
        self.nodes.push(Node {
            name,
            device,
            kind,
            output,
            delta,
            parents,
            children: Vec::new(),
        });
        Ok(idx)
    }

    /// Add a data-source node. The shape's leading dimension is the batch.
    pub fn input(&mut self, shape: impl Into<Shape>, device: Device) -> Result<usize> {
        let shape = shape.into();
        if shape.rank() == 0 {
            return Err(Error::GraphValidation(
                "input shape needs a leading batch dimension".to_string(),
            ));
        }
        let idx = self.push_node(LayerKind::Input, shape, Vec::new(), device)?;
        self.inputs.push(idx);
        Ok(idx)
    }

    /// Add an n-ary element-wise sum of the given parents.
    pub fn add(&mut self, parents: &[usize]) -> Result<usize> {
        let shapes = self.parent_shapes(parents)?;
        let refs: Vec<&Shape> = shapes.iter().collect();
        let kind = LayerKind::Add;
        let shape = infer_output_shape(&kind, &refs)?;
        let device = self.nodes[parents[0]].device;
        self.push_node(kind, shape, parents.to_vec(), device)
    }

    /// Add a trainable element-wise affine layer over one parent.
    pub fn affine(&mut self, parent: usize) -> Result<usize> {
        let shapes = self.parent_shapes(&[parent])?;
        let dims = shapes[0].dims();
        if dims.is_empty() {
            return Err(Error::GraphValidation(
                "affine parent needs a leading batch dimension".to_string(),
            ));
        }
        let sample_shape = Shape::new(dims[1..].to_vec());
        let device = self.nodes[parent].device;
        let kind = LayerKind::Affine(AffineState::new(sample_shape, device)?);
        let refs: Vec<&Shape> = shapes.iter().collect();
        let shape = infer_output_shape(&kind, &refs)?;
        self.push_node(kind, shape, vec![parent], device)
    }

    /// Add an axis-reduction layer over one parent.
    pub fn reduce(
        &mut self,
        parent: usize,
        kind: stoat_core::ReduceKind,
        axes: &[usize],
        keepdims: bool,
    ) -> Result<usize> {
        let shapes = self.parent_shapes(&[parent])?;
        let refs: Vec<&Shape> = shapes.iter().collect();
        let kind = LayerKind::Reduce(ReduceState::new(kind, axes.to_vec(), keepdims));
        let shape = infer_output_shape(&kind, &refs)?;
        let device = self.nodes[parent].device;
        self.push_node(kind, shape, vec![parent], device)
    }

    /// Mark a node as a network output.
    pub fn mark_output(&mut self, idx: usize) -> Result<()> {
        if idx >= self.nodes.len() {
            return Err(Error::GraphValidation(format!(
                "output index {} does not exist",
                idx
            )));
        }
        self.outputs.push(idx);
        Ok(())
    }

    fn parent_shapes(&self, parents: &[usize]) -> Result<Vec<Shape>> {
        let mut shapes = Vec::with_capacity(parents.len());
        for &p in parents {
            let node = self.nodes.get(p).ok_or_else(|| {
                Error::GraphValidation(format!("parent index {} does not exist yet", p))
            })?;
            shapes.push(node.output.shape().clone());
        }
        Ok(shapes)
    }

    // Accessors

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    /// Trainable parameter handles, in node order (w then b per layer).
    pub fn params(&self) -> Vec<Buffer> {
        self.nodes
            .iter()
            .flat_map(|n| match &n.kind {
                LayerKind::Affine(st) => vec![st.w.clone(), st.b.clone()],
                _ => Vec::new(),
            })
            .collect()
    }

    /// Gradient handles, in the same order as [`Graph::params`].
    pub fn grads(&self) -> Vec<Buffer> {
        self.nodes
            .iter()
            .flat_map(|n| match &n.kind {
                LayerKind::Affine(st) => vec![st.gw.clone(), st.gb.clone()],
                _ => Vec::new(),
            })
            .collect()
    }

    // Execution

    /// Zero every delta and every parameter gradient. Must run before each
    /// backward sweep; gradients accumulate within a sweep only.
    pub fn reset_grads(&self) -> Result<()> {
        for n in &self.nodes {
            n.delta.fill(0.0)?;
            if let LayerKind::Affine(st) = &n.kind {
                st.gw.fill(0.0)?;
                st.gb.fill(0.0)?;
            }
        }
        Ok(())
    }

    /// Run one node's forward computation.
    pub fn forward_node(&mut self, idx: usize) -> Result<()> {
        let parent_outputs: Vec<Buffer> = self.nodes[idx]
            .parents
            .iter()
            .map(|&p| self.nodes[p].output.clone())
            .collect();
        let node = &mut self.nodes[idx];
        match &mut node.kind {
            LayerKind::Input => Ok(()),
            LayerKind::Add => {
                node.output.fill(0.0)?;
                for x in &parent_outputs {
                    node.output.axpy(1.0, x)?;
                }
                Ok(())
            }
            LayerKind::Affine(st) => affine_forward(&parent_outputs[0], st, &node.output),
            LayerKind::Reduce(st) => {
                let x = &parent_outputs[0];
                let desc = st.cache.descriptor(x.shape(), &st.axes, st.keepdims)?;
                let r = reduce(x, &desc, st.kind)?;
                node.output.copy_from(&r.output)?;
                st.desc = Some(desc);
                st.origins = r.origins;
                Ok(())
            }
        }
    }

    /// Run one node's backward computation, accumulating into parent
    /// deltas and parameter gradients.
    pub fn backward_node(&mut self, idx: usize) -> Result<()> {
        let delta = self.nodes[idx].delta.clone();
        let parent_outputs: Vec<Buffer> = self.nodes[idx]
            .parents
            .iter()
            .map(|&p| self.nodes[p].output.clone())
            .collect();
        let parent_deltas: Vec<Buffer> = self.nodes[idx]
            .parents
            .iter()
            .map(|&p| self.nodes[p].delta.clone())
            .collect();
        let node = &self.nodes[idx];
        match &node.kind {
            LayerKind::Input => Ok(()),
            LayerKind::Add => {
                for pd in &parent_deltas {
                    pd.axpy(1.0, &delta)?;
                }
                Ok(())
            }
            LayerKind::Affine(st) => {
                affine_backward(&delta, &parent_outputs[0], st, &parent_deltas[0])
            }
            LayerKind::Reduce(st) => {
                let desc = st
                    .desc
                    .as_ref()
                    .ok_or_else(|| Error::msg("reduce backward before any forward"))?;
                let scattered = delta_reduce(&delta, desc, st.kind, st.origins.as_deref())?;
                parent_deltas[0].axpy(1.0, &scattered)
            }
        }
    }

    /// Forward sweep over the given node order.
    pub fn forward_pass(&mut self, order: &[usize]) -> Result<()> {
        for &idx in order {
            self.forward_node(idx)?;
        }
        Ok(())
    }

    /// Backward sweep over the given node order (callers pass the reverse
    /// of the forward order).
    pub fn backward_pass(&mut self, order: &[usize]) -> Result<()> {
        for &idx in order {
            self.backward_node(idx)?;
        }
        Ok(())
    }

    // Reshaping and replication

    /// Rebuild every node's output and delta with a new leading batch
    /// dimension. Parameters are untouched (they are per-sample).
    pub fn resize(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(Error::msg("batch size must be at least 1"));
        }
        for idx in 0..self.nodes.len() {
            let new_shape = match &self.nodes[idx].kind {
                LayerKind::Input => {
                    let mut dims = self.nodes[idx].output.dims().to_vec();
                    dims[0] = batch;
                    Shape::new(dims)
                }
                _ => {
                    let parents = self.nodes[idx].parents.clone();
                    let shapes = self.parent_shapes(&parents)?;
                    let refs: Vec<&Shape> = shapes.iter().collect();
                    infer_output_shape(&self.nodes[idx].kind, &refs)?
                }
            };
            if &new_shape != self.nodes[idx].output.shape() {
                let device = self.nodes[idx].device;
                self.nodes[idx].output = Buffer::zeros(new_shape.clone(), device)?;
                self.nodes[idx].delta = Buffer::zeros(new_shape, device)?;
            }
        }
        Ok(())
    }

    /// Replicate this graph onto another device: same topology and layer
    /// configuration, parameter *values* copied over, activations and
    /// gradients fresh.
    pub fn clone_to(&self, device: Device) -> Result<Graph> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for n in &self.nodes {
            let kind = match &n.kind {
                LayerKind::Input => LayerKind::Input,
                LayerKind::Add => LayerKind::Add,
                LayerKind::Affine(st) => LayerKind::Affine(st.clone_to(device)?),
                LayerKind::Reduce(st) => LayerKind::Reduce(st.clone_config()),
            };
            nodes.push(Node {
                name: n.name.clone(),
                device,
                kind,
                output: Buffer::zeros(n.output.shape().clone(), device)?,
                delta: Buffer::zeros(n.delta.shape().clone(), device)?,
                parents: n.parents.clone(),
                children: n.children.clone(),
            });
        }
        Ok(Graph {
            nodes,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            names: self.names.clone(),
        })
    }
}

fn affine_forward(x: &Buffer, st: &AffineState, out: &Buffer) -> Result<()> {
    let feat = st.w.len();
    let xs = x.host_read()?;
    let w = st.w.host_read()?;
    let b = st.b.host_read()?;
    let mut o = out.host_write()?;
    for i in 0..o.len() {
        let f = i % feat;
        o[i] = w[f] * xs[i] + b[f];
    }
    Ok(())
}

fn affine_backward(
    delta: &Buffer,
    x: &Buffer,
    st: &AffineState,
    parent_delta: &Buffer,
) -> Result<()> {
    let feat = st.w.len();
    {
        let d = delta.host_read()?;
        let xs = x.host_read()?;
        let mut gw = st.gw.host_write()?;
        let mut gb = st.gb.host_write()?;
        for i in 0..d.len() {
            let f = i % feat;
            gw[f] += d[i] * xs[i];
            gb[f] += d[i];
        }
    }
    let d = delta.host_read()?;
    let w = st.w.host_read()?;
    let mut pd = parent_delta.host_write()?;
    for i in 0..d.len() {
        pd[i] += d[i] * w[i % feat];
    }
    Ok(())
}
