use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Axis reduction engine
//
// Reducing over a set of axes partitions the source elements into groups,
// one group per output element. The expensive part is not the arithmetic
// but the addressing: which source linear indices feed which output
// element. A ReduceDescriptor precomputes exactly that partition once per
// (shape, axes, keepdims) and is reused across forward *and* backward:
//
//   reduce(input, desc, kind)        — fold each group into one output value
//   delta_reduce(grad, desc, kind)   — scatter output gradients back into
//                                       the source shape through the same
//                                       groups
//
// Group index lists are built in ascending source order. That ordering is
// load-bearing: max/min record the *first* winning index on ties, so the
// tie-break is deterministic and the backward scatter is exactly one-hot
// per group.

/// The folding function applied to each reduction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Sum,
    Mean,
    Prod,
    Max,
    Min,
    /// Offset of the maximum within its group.
    ArgMax,
    /// Offset of the minimum within its group.
    ArgMin,
    Var { unbiased: bool },
    Std { unbiased: bool },
    /// Most frequent value (first encountered on ties).
    Mode,
    Median,
    /// 1.0 iff every element of the group is nonzero.
    All,
    /// 1.0 iff any element of the group is nonzero.
    Any,
    /// L2 norm of the group.
    Norm,
}

impl ReduceKind {
    /// Whether `reduce` records winning source indices for this kind.
    pub fn tracks_origins(&self) -> bool {
        matches!(
            self,
            ReduceKind::Max | ReduceKind::Min | ReduceKind::ArgMax | ReduceKind::ArgMin
        )
    }

    /// Whether `delta_reduce` can scatter gradients for this kind.
    pub fn is_differentiable(&self) -> bool {
        matches!(
            self,
            ReduceKind::Sum | ReduceKind::Mean | ReduceKind::Max | ReduceKind::Min
        )
    }
}

/// Precomputed index map for a reduction over a fixed source shape.
///
/// `groups[j]` lists the source linear indices feeding output element `j`,
/// in ascending order. Building is O(source elements); applying the
/// descriptor re-checks the input shape so a stale descriptor can never
/// misaddress a reshaped buffer.
#[derive(Debug, Clone)]
pub struct ReduceDescriptor {
    source_shape: Shape,
    axes: Vec<usize>,
    keepdims: bool,
    output_shape: Shape,
    groups: Vec<Vec<usize>>,
}

impl ReduceDescriptor {
    /// Build the descriptor for reducing `source_shape` over `axes`.
    ///
    /// An empty axis set yields an identity descriptor (one singleton group
    /// per element). Reducing every axis without `keepdims` yields shape
    /// `[1]`.
    pub fn new(source_shape: Shape, axes: &[usize], keepdims: bool) -> Result<Self> {
        let ndim = source_shape.rank();
        let mut seen = vec![false; ndim];
        for &a in axes {
            if a >= ndim {
                return Err(Error::AxisOutOfRange { axis: a, ndim });
            }
            if seen[a] {
                return Err(Error::InvalidAxis { axis: a });
            }
            seen[a] = true;
        }
        let mut sorted_axes = axes.to_vec();
        sorted_axes.sort_unstable();

        let dims = source_shape.dims();

        // Output shape: reduced dims become 1 (keepdims) or disappear.
        let mut out_dims = Vec::with_capacity(ndim);
        for (d, &size) in dims.iter().enumerate() {
            if seen[d] {
                if keepdims {
                    out_dims.push(1);
                }
            } else {
                out_dims.push(size);
            }
        }
        if out_dims.is_empty() {
            out_dims.push(1);
        }
        let output_shape = Shape::new(out_dims);

        // Per source dimension, the stride of that coordinate in the
        // *output* linear index; 0 for reduced dimensions.
        let out_strides = output_shape.stride_contiguous();
        let mut out_map = vec![0usize; ndim];
        let mut out_d = 0;
        for d in 0..ndim {
            if seen[d] {
                if keepdims {
                    out_d += 1;
                }
            } else {
                out_map[d] = out_strides[out_d];
                out_d += 1;
            }
        }

        let src_strides = source_shape.stride_contiguous();
        let n = source_shape.elem_count();
        let out_count = output_shape.elem_count();
        let group_size = if out_count == 0 { 0 } else { n / out_count };
        let mut groups: Vec<Vec<usize>> =
            (0..out_count).map(|_| Vec::with_capacity(group_size)).collect();

        // Ascending walk over the source; ascending push order per group is
        // what makes the max/min tie-break deterministic.
        for i in 0..n {
            let mut out_idx = 0;
            for d in 0..ndim {
                let coord = (i / src_strides[d]) % dims[d];
                out_idx += coord * out_map[d];
            }
            groups[out_idx].push(i);
        }

        Ok(ReduceDescriptor {
            source_shape,
            axes: sorted_axes,
            keepdims,
            output_shape,
            groups,
        })
    }

    pub fn source_shape(&self) -> &Shape {
        &self.source_shape
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    pub fn keepdims(&self) -> bool {
        self.keepdims
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// Number of source elements per output element.
    pub fn group_size(&self) -> usize {
        self.groups.first().map(|g| g.len()).unwrap_or(0)
    }

    fn check_source(&self, input: &Buffer) -> Result<()> {
        if input.shape() != &self.source_shape {
            return Err(Error::ShapeMismatch {
                expected: self.source_shape.clone(),
                got: input.shape().clone(),
            });
        }
        Ok(())
    }

    fn check_output(&self, grad: &Buffer) -> Result<()> {
        if grad.shape() != &self.output_shape {
            return Err(Error::ShapeMismatch {
                expected: self.output_shape.clone(),
                got: grad.shape().clone(),
            });
        }
        Ok(())
    }
}

/// Result of applying a reduction.
pub struct Reduction {
    /// The reduced buffer, shaped like the descriptor's output shape.
    pub output: Buffer,
    /// For max/min/arg kinds: per output element, the winning source linear
    /// index (first in ascending order on ties). `None` for other kinds.
    pub origins: Option<Vec<usize>>,
}

/// Groups-count threshold above which the fold goes data-parallel.
const PAR_GROUPS: usize = 256;

/// Fold one group. Returns the output value and, for origin-tracking
/// kinds, the winning source linear index.
fn fold_group(data: &[f32], group: &[usize], kind: ReduceKind) -> (f32, Option<usize>) {
    match kind {
        ReduceKind::Sum => (group.iter().map(|&i| data[i]).sum(), None),
        ReduceKind::Mean => {
            let s: f32 = group.iter().map(|&i| data[i]).sum();
            (s / group.len() as f32, None)
        }
        ReduceKind::Prod => (group.iter().map(|&i| data[i]).product(), None),
        ReduceKind::Max | ReduceKind::ArgMax => {
            let mut best = group[0];
            let mut best_off = 0usize;
            for (off, &i) in group.iter().enumerate().skip(1) {
                if data[i] > data[best] {
                    best = i;
                    best_off = off;
                }
            }
            let v = if kind == ReduceKind::Max {
                data[best]
            } else {
                best_off as f32
            };
            (v, Some(best))
        }
        ReduceKind::Min | ReduceKind::ArgMin => {
            let mut best = group[0];
            let mut best_off = 0usize;
            for (off, &i) in group.iter().enumerate().skip(1) {
                if data[i] < data[best] {
                    best = i;
                    best_off = off;
                }
            }
            let v = if kind == ReduceKind::Min {
                data[best]
            } else {
                best_off as f32
            };
            (v, Some(best))
        }
        ReduceKind::Var { unbiased } => (variance(data, group, unbiased), None),
        ReduceKind::Std { unbiased } => (variance(data, group, unbiased).sqrt(), None),
        ReduceKind::Mode => {
            // Count by bit pattern so NaN/-0.0 quirks stay out of hashing;
            // first encountered wins ties.
            let mut counts: HashMap<u32, usize> = HashMap::new();
            for &i in group {
                *counts.entry(data[i].to_bits()).or_insert(0) += 1;
            }
            let mut best_bits = data[group[0]].to_bits();
            let mut best_count = 0usize;
            for &i in group {
                let bits = data[i].to_bits();
                let c = counts[&bits];
                if c > best_count {
                    best_count = c;
                    best_bits = bits;
                }
            }
            (f32::from_bits(best_bits), None)
        }
        ReduceKind::Median => {
            let mut vals: Vec<f32> = group.iter().map(|&i| data[i]).collect();
            vals.sort_by(|a, b| a.total_cmp(b));
            let mid = vals.len() / 2;
            let v = if vals.len() % 2 == 1 {
                vals[mid]
            } else {
                (vals[mid - 1] + vals[mid]) / 2.0
            };
            (v, None)
        }
        ReduceKind::All => {
            let v = group.iter().all(|&i| data[i] != 0.0);
            (if v { 1.0 } else { 0.0 }, None)
        }
        ReduceKind::Any => {
            let v = group.iter().any(|&i| data[i] != 0.0);
            (if v { 1.0 } else { 0.0 }, None)
        }
        ReduceKind::Norm => {
            let s: f32 = group.iter().map(|&i| data[i] * data[i]).sum();
            (s.sqrt(), None)
        }
    }
}

fn variance(data: &[f32], group: &[usize], unbiased: bool) -> f32 {
    let n = group.len() as f32;
    let mean: f32 = group.iter().map(|&i| data[i]).sum::<f32>() / n;
    let ss: f32 = group.iter().map(|&i| (data[i] - mean) * (data[i] - mean)).sum();
    let denom = if unbiased { n - 1.0 } else { n };
    ss / denom
}

/// Reduce `input` through a prebuilt descriptor.
pub fn reduce(input: &Buffer, desc: &ReduceDescriptor, kind: ReduceKind) -> Result<Reduction> {
    desc.check_source(input)?;
    if let ReduceKind::Var { unbiased: true } | ReduceKind::Std { unbiased: true } = kind {
        if desc.group_size() < 2 {
            return Err(Error::DegenerateReduction {
                group_size: desc.group_size(),
            });
        }
    }
    let data = input.host_read()?;
    let folded: Vec<(f32, Option<usize>)> = if desc.groups().len() >= PAR_GROUPS {
        desc.groups()
            .par_iter()
            .map(|g| fold_group(&data, g, kind))
            .collect()
    } else {
        desc.groups()
            .iter()
            .map(|g| fold_group(&data, g, kind))
            .collect()
    };
    drop(data);

    let values: Vec<f32> = folded.iter().map(|&(v, _)| v).collect();
    let output = Buffer::from_slice(&values, desc.output_shape().clone(), input.device())?;
    let origins = if kind.tracks_origins() {
        Some(folded.iter().map(|&(_, o)| o.unwrap_or(0)).collect())
    } else {
        None
    };
    Ok(Reduction { output, origins })
}

/// Scatter output gradients back into the source shape.
///
/// Sum broadcasts each output gradient over its whole group; Mean divides
/// by the group size first (gradient mass is conserved either way). Max
/// and Min route the whole gradient to the recorded winning index, making
/// the scatter one-hot per group. Other kinds are not differentiable
/// through this engine.
pub fn delta_reduce(
    out_grad: &Buffer,
    desc: &ReduceDescriptor,
    kind: ReduceKind,
    origins: Option<&[usize]>,
) -> Result<Buffer> {
    desc.check_output(out_grad)?;
    if !kind.is_differentiable() {
        return Err(Error::msg(format!(
            "reduction kind {:?} has no gradient scatter",
            kind
        )));
    }
    let grad = out_grad.host_read()?;
    let source = Buffer::zeros(desc.source_shape().clone(), out_grad.device())?;
    {
        let mut src = source.host_write()?;
        match kind {
            ReduceKind::Sum => {
                for (j, group) in desc.groups().iter().enumerate() {
                    for &i in group {
                        src[i] += grad[j];
                    }
                }
            }
            ReduceKind::Mean => {
                for (j, group) in desc.groups().iter().enumerate() {
                    let share = grad[j] / group.len() as f32;
                    for &i in group {
                        src[i] += share;
                    }
                }
            }
            ReduceKind::Max | ReduceKind::Min => {
                let origins = origins.ok_or_else(|| {
                    Error::msg("max/min gradient scatter needs the recorded origins")
                })?;
                if origins.len() != desc.groups().len() {
                    return Err(Error::msg(format!(
                        "origins length {} does not match {} output elements",
                        origins.len(),
                        desc.groups().len()
                    )));
                }
                for (j, &i) in origins.iter().enumerate() {
                    src[i] += grad[j];
                }
            }
            _ => unreachable!(),
        }
    }
    Ok(source)
}

/// Cache of descriptors keyed by `(dims, sorted axes, keepdims)`.
///
/// Repeated reductions over the same shape reuse the index map; building
/// it again would dominate small reductions.
#[derive(Debug, Default)]
pub struct ReduceCache {
    entries: HashMap<(Vec<usize>, Vec<usize>, bool), Arc<ReduceDescriptor>>,
}

impl ReduceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or build the descriptor for this reduction.
    pub fn descriptor(
        &mut self,
        source_shape: &Shape,
        axes: &[usize],
        keepdims: bool,
    ) -> Result<Arc<ReduceDescriptor>> {
        let mut sorted_axes = axes.to_vec();
        sorted_axes.sort_unstable();
        let key = (source_shape.dims().to_vec(), sorted_axes, keepdims);
        if let Some(d) = self.entries.get(&key) {
            return Ok(Arc::clone(d));
        }
        let desc = Arc::new(ReduceDescriptor::new(source_shape.clone(), axes, keepdims)?);
        self.entries.insert(key, Arc::clone(&desc));
        Ok(desc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn cpu(data: &[f32], shape: impl Into<Shape>) -> Buffer {
        Buffer::from_slice(data, shape, Device::Cpu).unwrap()
    }

    #[test]
    fn test_axis_validation() {
        let shape = Shape::from((2, 3));
        assert!(matches!(
            ReduceDescriptor::new(shape.clone(), &[0, 0], false),
            Err(Error::InvalidAxis { axis: 0 })
        ));
        assert!(matches!(
            ReduceDescriptor::new(shape, &[2], false),
            Err(Error::AxisOutOfRange { axis: 2, ndim: 2 })
        ));
    }

    #[test]
    fn test_output_shapes() {
        let d = ReduceDescriptor::new(Shape::from((4, 2, 3, 7)), &[1, 3], false).unwrap();
        assert_eq!(d.output_shape().dims(), &[4, 3]);
        let d = ReduceDescriptor::new(Shape::from((4, 2, 3, 7)), &[1, 3], true).unwrap();
        assert_eq!(d.output_shape().dims(), &[4, 1, 3, 1]);
        // Reducing everything collapses to [1].
        let d = ReduceDescriptor::new(Shape::from((2, 3)), &[0, 1], false).unwrap();
        assert_eq!(d.output_shape().dims(), &[1]);
    }

    #[test]
    fn test_empty_axes_is_identity() {
        let x = cpu(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let d = ReduceDescriptor::new(x.shape().clone(), &[], false).unwrap();
        assert_eq!(d.output_shape().dims(), &[2, 2]);
        let r = reduce(&x, &d, ReduceKind::Sum).unwrap();
        assert_eq!(r.output.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_sum_matches_manual_loop() {
        // [2, 3] summed over axis 0 → [3]; over axis 1 → [2].
        let x = cpu(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let d0 = ReduceDescriptor::new(x.shape().clone(), &[0], false).unwrap();
        let r0 = reduce(&x, &d0, ReduceKind::Sum).unwrap();
        assert_eq!(r0.output.to_vec(), vec![5.0, 7.0, 9.0]);
        let d1 = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        let r1 = reduce(&x, &d1, ReduceKind::Sum).unwrap();
        assert_eq!(r1.output.to_vec(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_mean_4d_scenario() {
        // Shape [4, 2, 3, 7], axes {1, 3}, keepdims=false → [4, 3] with
        // groups of 14. Fill with the source linear index and check one
        // output element against a hand computation.
        let n = 4 * 2 * 3 * 7;
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let x = cpu(&data, (4, 2, 3, 7));
        let d = ReduceDescriptor::new(x.shape().clone(), &[1, 3], false).unwrap();
        assert_eq!(d.group_size(), 14);
        let r = reduce(&x, &d, ReduceKind::Mean).unwrap();
        assert_eq!(r.output.dims(), &[4, 3]);

        // Output [a, c] averages source elements [a, b, c, k] over b, k.
        let strides = x.shape().stride_contiguous();
        for a in 0..4 {
            for c in 0..3 {
                let mut sum = 0.0;
                for b in 0..2 {
                    for k in 0..7 {
                        sum += data[a * strides[0] + b * strides[1] + c * strides[2] + k];
                    }
                }
                let want = sum / 14.0;
                let got = r.output.get(&[a, c]).unwrap();
                assert!((got - want).abs() < 1e-4, "[{a},{c}]: {got} vs {want}");
            }
        }
    }

    #[test]
    fn test_max_tie_break_is_first_index() {
        // All ones: every element ties, the winner must be the group's
        // lowest source linear index.
        let x = Buffer::ones((4, 2, 3), Device::Cpu).unwrap();
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], true).unwrap();
        assert_eq!(d.output_shape().dims(), &[4, 1, 3]);
        let r = reduce(&x, &d, ReduceKind::Max).unwrap();
        let origins = r.origins.unwrap();
        for (j, group) in d.groups().iter().enumerate() {
            assert_eq!(origins[j], group[0]);
        }
    }

    #[test]
    fn test_argmax_is_group_offset() {
        // [2, 3]: per row, argmax over axis 1 in group-offset terms.
        let x = cpu(&[1.0, 9.0, 2.0, 7.0, 3.0, 5.0], (2, 3));
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        let r = reduce(&x, &d, ReduceKind::ArgMax).unwrap();
        assert_eq!(r.output.to_vec(), vec![1.0, 0.0]);
        assert_eq!(r.origins.unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_prod_min() {
        let x = cpu(&[2.0, 3.0, 4.0, 5.0], (2, 2));
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        let p = reduce(&x, &d, ReduceKind::Prod).unwrap();
        assert_eq!(p.output.to_vec(), vec![6.0, 20.0]);
        let m = reduce(&x, &d, ReduceKind::Min).unwrap();
        assert_eq!(m.output.to_vec(), vec![2.0, 4.0]);
        assert_eq!(m.origins.unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_var_std() {
        let x = cpu(&[1.0, 2.0, 3.0, 4.0], (4,));
        let d = ReduceDescriptor::new(x.shape().clone(), &[0], false).unwrap();
        let v = reduce(&x, &d, ReduceKind::Var { unbiased: true }).unwrap();
        assert!((v.output.to_vec()[0] - 5.0 / 3.0).abs() < 1e-5);
        let v = reduce(&x, &d, ReduceKind::Var { unbiased: false }).unwrap();
        assert!((v.output.to_vec()[0] - 1.25).abs() < 1e-5);
        let s = reduce(&x, &d, ReduceKind::Std { unbiased: false }).unwrap();
        assert!((s.output.to_vec()[0] - 1.25f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_degenerate_unbiased_variance() {
        // Axis of size 1: groups of one element, N-1 estimator undefined.
        let x = cpu(&[1.0, 2.0, 3.0], (3, 1));
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        assert!(matches!(
            reduce(&x, &d, ReduceKind::Var { unbiased: true }),
            Err(Error::DegenerateReduction { group_size: 1 })
        ));
        // The biased estimator is still fine.
        assert!(reduce(&x, &d, ReduceKind::Var { unbiased: false }).is_ok());
    }

    #[test]
    fn test_mode_median_all_any_norm() {
        let x = cpu(&[1.0, 2.0, 2.0, 3.0, 3.0, 4.0], (6,));
        let d = ReduceDescriptor::new(x.shape().clone(), &[0], false).unwrap();
        // 2.0 and 3.0 both appear twice; 2.0 was encountered first.
        let m = reduce(&x, &d, ReduceKind::Mode).unwrap();
        assert_eq!(m.output.to_vec(), vec![2.0]);
        // Even group: average of the two middles (2.0, 3.0).
        let med = reduce(&x, &d, ReduceKind::Median).unwrap();
        assert!((med.output.to_vec()[0] - 2.5).abs() < 1e-5);

        let y = cpu(&[1.0, 0.0, 2.0], (3,));
        let dy = ReduceDescriptor::new(y.shape().clone(), &[0], false).unwrap();
        assert_eq!(reduce(&y, &dy, ReduceKind::All).unwrap().output.to_vec(), vec![0.0]);
        assert_eq!(reduce(&y, &dy, ReduceKind::Any).unwrap().output.to_vec(), vec![1.0]);

        let z = cpu(&[3.0, 4.0], (2,));
        let dz = ReduceDescriptor::new(z.shape().clone(), &[0], false).unwrap();
        assert!((reduce(&z, &dz, ReduceKind::Norm).unwrap().output.to_vec()[0] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_delta_sum_broadcasts_and_conserves() {
        let x = cpu(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        let g = cpu(&[10.0, 20.0], (2,));
        let dx = delta_reduce(&g, &d, ReduceKind::Sum, None).unwrap();
        assert_eq!(dx.to_vec(), vec![10.0, 10.0, 10.0, 20.0, 20.0, 20.0]);
        // Mass: each output gradient appears group_size times.
        assert!((dx.sum_all().unwrap() - 3.0 * 30.0).abs() < 1e-4);
    }

    #[test]
    fn test_delta_mean_conserves_mass() {
        let x = Buffer::zeros((2, 3), Device::Cpu).unwrap();
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        let g = cpu(&[9.0, 6.0], (2,));
        let dx = delta_reduce(&g, &d, ReduceKind::Mean, None).unwrap();
        assert_eq!(dx.to_vec(), vec![3.0, 3.0, 3.0, 2.0, 2.0, 2.0]);
        assert!((dx.sum_all().unwrap() - 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_delta_max_is_one_hot() {
        let x = cpu(&[1.0, 9.0, 2.0, 7.0, 3.0, 5.0], (2, 3));
        let d = ReduceDescriptor::new(x.shape().clone(), &[1], false).unwrap();
        let r = reduce(&x, &d, ReduceKind::Max).unwrap();
        let g = cpu(&[1.0, 1.0], (2,));
        let dx = delta_reduce(&g, &d, ReduceKind::Max, r.origins.as_deref()).unwrap();
        assert_eq!(dx.to_vec(), vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        // Exactly one nonzero per group.
        for group in d.groups() {
            let hot: usize = group
                .iter()
                .filter(|&&i| dx.to_vec()[i] != 0.0)
                .count();
            assert_eq!(hot, 1);
        }
    }

    #[test]
    fn test_delta_rejects_non_differentiable_kinds() {
        let d = ReduceDescriptor::new(Shape::from((2, 3)), &[1], false).unwrap();
        let g = cpu(&[1.0, 1.0], (2,));
        assert!(delta_reduce(&g, &d, ReduceKind::ArgMax, Some(&[0, 3])).is_err());
        assert!(delta_reduce(&g, &d, ReduceKind::Median, None).is_err());
        // Max without origins cannot scatter.
        assert!(delta_reduce(&g, &d, ReduceKind::Max, None).is_err());
    }

    #[test]
    fn test_stale_descriptor_rejected() {
        let d = ReduceDescriptor::new(Shape::from((2, 3)), &[1], false).unwrap();
        let wrong = Buffer::zeros((3, 2), Device::Cpu).unwrap();
        assert!(matches!(
            reduce(&wrong, &d, ReduceKind::Sum),
            Err(Error::ShapeMismatch { .. })
        ));
        let wrong_grad = Buffer::zeros((3,), Device::Cpu).unwrap();
        assert!(matches!(
            delta_reduce(&wrong_grad, &d, ReduceKind::Sum, None),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_cache_reuses_descriptor() {
        let mut cache = ReduceCache::new();
        let shape = Shape::from((4, 2, 3));
        let a = cache.descriptor(&shape, &[1, 2], false).unwrap();
        // Axis order does not matter for the key.
        let b = cache.descriptor(&shape, &[2, 1], false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        let c = cache.descriptor(&shape, &[1, 2], true).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }
}
