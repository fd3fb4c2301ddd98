use std::sync::Arc;

use stoat_core::{Buffer, Device, Error, ReduceCache, ReduceDescriptor, ReduceKind, Result, Shape};

// Layer kinds
//
// Layers are a closed tagged enum instead of a trait-object hierarchy: the
// executor dispatches with a match, layer state lives inline in the graph
// arena, and adding a kind means extending one enum and two match arms
// (shape inference here, forward/backward in the graph). The catalog is
// deliberately small — one source, one n-ary combiner, one trainable
// layer, and the reduction layer that drives the reduction engine — but
// each exercises a distinct part of the node contract.

/// The computation a graph node performs.
#[derive(Debug)]
pub enum LayerKind {
    /// Data source; its output is written by the executor, not computed.
    Input,
    /// N-ary element-wise sum of all parents.
    Add,
    /// Trainable element-wise `w ⊙ x + b`, parameters shaped like one
    /// sample (every dimension after the leading batch dimension).
    Affine(AffineState),
    /// Axis reduction of the single parent; caches its index descriptor
    /// and, for max/min, the winning origins, across steps.
    Reduce(ReduceState),
}

impl LayerKind {
    /// Short kind string used for generated layer names.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LayerKind::Input => "input",
            LayerKind::Add => "add",
            LayerKind::Affine(_) => "affine",
            LayerKind::Reduce(_) => "reduce",
        }
    }

    /// Whether this kind carries trainable parameters.
    pub fn is_trainable(&self) -> bool {
        matches!(self, LayerKind::Affine(_))
    }
}

/// Parameters and gradient accumulators of an affine layer.
#[derive(Debug)]
pub struct AffineState {
    pub w: Buffer,
    pub b: Buffer,
    pub gw: Buffer,
    pub gb: Buffer,
}

impl AffineState {
    /// Fresh state for a layer whose output has `sample_shape` per sample.
    /// Weights start at one and biases at zero, so an untrained layer is
    /// the identity.
    pub fn new(sample_shape: Shape, device: Device) -> Result<Self> {
        Ok(AffineState {
            w: Buffer::ones(sample_shape.clone(), device)?,
            b: Buffer::zeros(sample_shape.clone(), device)?,
            gw: Buffer::zeros(sample_shape.clone(), device)?,
            gb: Buffer::zeros(sample_shape, device)?,
        })
    }

    /// Copy of this state on another device: parameter values travel,
    /// gradient accumulators start fresh.
    pub fn clone_to(&self, device: Device) -> Result<Self> {
        let w = Buffer::from_slice(&self.w.to_vec(), self.w.shape().clone(), device)?;
        let b = Buffer::from_slice(&self.b.to_vec(), self.b.shape().clone(), device)?;
        let gw = Buffer::zeros(self.w.shape().clone(), device)?;
        let gb = Buffer::zeros(self.b.shape().clone(), device)?;
        Ok(AffineState { w, b, gw, gb })
    }
}

/// Configuration and cached addressing state of a reduction layer.
#[derive(Debug)]
pub struct ReduceState {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
    /// Descriptor cache; survives batch resizes (each source shape gets
    /// its own entry).
    pub cache: ReduceCache,
    /// Descriptor used by the most recent forward.
    pub desc: Option<Arc<ReduceDescriptor>>,
    /// Winning source indices from the most recent forward (max/min).
    pub origins: Option<Vec<usize>>,
}

impl ReduceState {
    pub fn new(kind: ReduceKind, axes: Vec<usize>, keepdims: bool) -> Self {
        ReduceState {
            kind,
            axes,
            keepdims,
            cache: ReduceCache::new(),
            desc: None,
            origins: None,
        }
    }

    /// Same configuration, fresh caches.
    pub fn clone_config(&self) -> Self {
        ReduceState::new(self.kind, self.axes.clone(), self.keepdims)
    }
}

/// Infer a node's output shape from its parents' output shapes.
pub fn infer_output_shape(kind: &LayerKind, parent_shapes: &[&Shape]) -> Result<Shape> {
    match kind {
        LayerKind::Input => Err(Error::msg("input layers carry their own shape")),
        LayerKind::Add => {
            let first = parent_shapes
                .first()
                .ok_or_else(|| Error::msg("add layer needs at least one parent"))?;
            for s in &parent_shapes[1..] {
                if s != first {
                    return Err(Error::ShapeMismatch {
                        expected: (*first).clone(),
                        got: (*s).clone(),
                    });
                }
            }
            Ok((*first).clone())
        }
        LayerKind::Affine(_) => {
            if parent_shapes.len() != 1 {
                return Err(Error::msg("affine layer needs exactly one parent"));
            }
            Ok(parent_shapes[0].clone())
        }
        LayerKind::Reduce(state) => {
            if parent_shapes.len() != 1 {
                return Err(Error::msg("reduce layer needs exactly one parent"));
            }
            let desc =
                ReduceDescriptor::new(parent_shapes[0].clone(), &state.axes, state.keepdims)?;
            Ok(desc.output_shape().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_shape_inference() {
        let a = Shape::from((2, 3));
        let b = Shape::from((2, 3));
        let out = infer_output_shape(&LayerKind::Add, &[&a, &b]).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
        let c = Shape::from((3, 2));
        assert!(infer_output_shape(&LayerKind::Add, &[&a, &c]).is_err());
    }

    #[test]
    fn test_reduce_shape_inference() {
        let kind = LayerKind::Reduce(ReduceState::new(ReduceKind::Mean, vec![1], false));
        let src = Shape::from((8, 4, 5));
        let out = infer_output_shape(&kind, &[&src]).unwrap();
        assert_eq!(out.dims(), &[8, 5]);
    }

    #[test]
    fn test_affine_identity_init() {
        let st = AffineState::new(Shape::from((4,)), Device::Cpu).unwrap();
        assert_eq!(st.w.to_vec(), vec![1.0; 4]);
        assert_eq!(st.b.to_vec(), vec![0.0; 4]);
    }
}
