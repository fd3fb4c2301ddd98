use stoat_core::{reduce, Buffer, Error, ReduceDescriptor, ReduceKind, Result};

// Metrics
//
// Metrics follow the same batch-sum convention as losses: `value` returns
// the metric summed over the batch and the executor averages by samples
// seen.

/// A non-differentiable evaluation measure.
pub trait Metric: Send + Sync {
    /// Short name used in summaries and logs.
    fn name(&self) -> &str;

    /// Metric summed over the batch.
    fn value(&self, target: &Buffer, output: &Buffer) -> Result<f32>;
}

/// Number of samples whose predicted class (argmax over the last axis)
/// matches the target's.
///
/// Expects rank >= 2 with classes on the last axis; targets are one-hot
/// (or any encoding whose argmax is the true class).
#[derive(Debug, Default, Clone, Copy)]
pub struct CategoricalAccuracy;

impl Metric for CategoricalAccuracy {
    fn name(&self) -> &str {
        "categorical_accuracy"
    }

    fn value(&self, target: &Buffer, output: &Buffer) -> Result<f32> {
        if output.shape() != target.shape() {
            return Err(Error::ShapeMismatch {
                expected: output.shape().clone(),
                got: target.shape().clone(),
            });
        }
        let rank = output.rank();
        if rank < 2 {
            return Err(Error::msg(
                "categorical accuracy needs [batch, ..., classes] buffers",
            ));
        }
        let desc = ReduceDescriptor::new(output.shape().clone(), &[rank - 1], false)?;
        let predicted = reduce(output, &desc, ReduceKind::ArgMax)?;
        let truth = reduce(target, &desc, ReduceKind::ArgMax)?;
        let p = predicted.output.to_vec();
        let t = truth.output.to_vec();
        let correct = p.iter().zip(t.iter()).filter(|(a, b)| a == b).count();
        Ok(correct as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Device;

    #[test]
    fn test_accuracy_counts_matches() {
        // Three samples, three classes; two predictions agree.
        let t = Buffer::from_slice(
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            (3, 3),
            Device::Cpu,
        )
        .unwrap();
        let o = Buffer::from_slice(
            &[0.9, 0.1, 0.0, 0.2, 0.3, 0.5, 0.1, 0.2, 0.7],
            (3, 3),
            Device::Cpu,
        )
        .unwrap();
        let v = CategoricalAccuracy.value(&t, &o).unwrap();
        assert!((v - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_accuracy_rejects_vectors() {
        let t = Buffer::zeros((3,), Device::Cpu).unwrap();
        let o = Buffer::zeros((3,), Device::Cpu).unwrap();
        assert!(CategoricalAccuracy.value(&t, &o).is_err());
    }
}
