use stoat_core::{Buffer, Error, Result};

use crate::metrics::Metric;

// Loss functions
//
// A loss contributes two things to a training step: a scalar value for
// reporting and a delta written into the output node to seed the backward
// sweep. Values follow the batch-sum convention: `value` returns the loss
// summed over the samples in the batch, and the executor divides its
// running totals by the number of samples seen. That keeps totals
// mergeable across replicas and batches of uneven size.

/// A differentiable training objective.
pub trait Loss: Send + Sync {
    /// Short name used in summaries and logs.
    fn name(&self) -> &str;

    /// Loss summed over the batch.
    fn value(&self, target: &Buffer, output: &Buffer) -> Result<f32>;

    /// Write the gradient of the loss with respect to `output` into
    /// `delta_out` (same shape as `output`).
    fn delta(&self, target: &Buffer, output: &Buffer, delta_out: &Buffer) -> Result<()>;
}

fn features_per_sample(output: &Buffer) -> Result<usize> {
    let dims = output.dims();
    if dims.is_empty() {
        return Err(Error::msg("loss needs a leading batch dimension"));
    }
    Ok(output.len() / dims[0])
}

/// Mean squared error, averaged over each sample's features and summed
/// over the batch: `sum_s mean_f (output - target)^2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn name(&self) -> &str {
        "mse"
    }

    fn value(&self, target: &Buffer, output: &Buffer) -> Result<f32> {
        let feat = features_per_sample(output)?;
        let diff = output.sub(target)?;
        let sq_sum = diff.map(|x| x * x)?.sum_all()?;
        Ok(sq_sum / feat as f32)
    }

    fn delta(&self, target: &Buffer, output: &Buffer, delta_out: &Buffer) -> Result<()> {
        // d/d_output of mean_f (o - t)^2 is 2 (o - t) / features.
        let feat = features_per_sample(output)?;
        let diff = output.sub(target)?;
        diff.scale(2.0 / feat as f32)?;
        delta_out.copy_from(&diff)
    }
}

impl Metric for MeanSquaredError {
    fn name(&self) -> &str {
        "mse"
    }

    fn value(&self, target: &Buffer, output: &Buffer) -> Result<f32> {
        Loss::value(self, target, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Device;

    fn buf(data: &[f32], shape: (usize, usize)) -> Buffer {
        Buffer::from_slice(data, shape, Device::Cpu).unwrap()
    }

    #[test]
    fn test_mse_value() {
        // Two samples, two features; per-sample MSEs are 0.25 and 1.0.
        let t = buf(&[0.0, 0.0, 0.0, 0.0], (2, 2));
        let o = buf(&[0.5, 0.5, 1.0, 1.0], (2, 2));
        let v = Loss::value(&MeanSquaredError, &t, &o).unwrap();
        assert!((v - 1.25).abs() < 1e-5);
    }

    #[test]
    fn test_mse_delta() {
        let t = buf(&[0.0, 0.0], (1, 2));
        let o = buf(&[1.0, 3.0], (1, 2));
        let d = Buffer::zeros((1, 2), Device::Cpu).unwrap();
        MeanSquaredError.delta(&t, &o, &d).unwrap();
        // 2 (o - t) / 2 features.
        assert_eq!(d.to_vec(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_mse_shape_mismatch() {
        let t = buf(&[0.0, 0.0], (1, 2));
        let o = Buffer::zeros((2, 2), Device::Cpu).unwrap();
        assert!(Loss::value(&MeanSquaredError, &t, &o).is_err());
    }
}
