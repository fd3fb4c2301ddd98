use stoat_core::{Buffer, Error, Result};

// Optimizers
//
// An optimizer owns per-parameter state (velocity, moments) and consumes
// gradients after they have been synchronized. `apply_gradients` receives
// the batch size so gradient-averaging stays the optimizer's convention,
// not the executor's: accumulated gradients come in as sums, and the
// optimizer divides by `batch` itself.

/// Interface every optimizer implements.
pub trait Optimizer: Send {
    /// Allocate per-parameter state for this parameter set. Must be called
    /// before the first `apply_gradients`.
    fn setup(&mut self, params: &[Buffer]) -> Result<()>;

    /// Consume gradients (summed over `batch` samples) and update the
    /// parameters in place.
    fn apply_gradients(&mut self, params: &[Buffer], grads: &[Buffer], batch: usize) -> Result<()>;

    /// Fresh optimizer with the same configuration and no state; each
    /// training context gets its own clone and calls `setup` itself.
    fn clone_boxed(&self) -> Box<dyn Optimizer>;
}

/// Stochastic gradient descent with classical momentum and L2 weight
/// decay:
///
/// ```text
/// v <- momentum * v - lr * (g / batch + weight_decay * w)
/// w <- w + v
/// ```
#[derive(Debug)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<Buffer>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Sgd {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity: Vec::new(),
        }
    }

    pub fn momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn setup(&mut self, params: &[Buffer]) -> Result<()> {
        self.velocity = params
            .iter()
            .map(|p| Buffer::zeros(p.shape().clone(), p.device()))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn apply_gradients(&mut self, params: &[Buffer], grads: &[Buffer], batch: usize) -> Result<()> {
        if self.velocity.len() != params.len() {
            return Err(Error::msg(
                "optimizer not set up for this parameter set",
            ));
        }
        if grads.len() != params.len() {
            return Err(Error::msg(format!(
                "got {} gradients for {} parameters",
                grads.len(),
                params.len()
            )));
        }
        if batch == 0 {
            return Err(Error::msg("batch size must be at least 1"));
        }
        for ((w, g), v) in params.iter().zip(grads).zip(&self.velocity) {
            let step = g.dup()?;
            step.scale(1.0 / batch as f32)?;
            if self.weight_decay != 0.0 {
                step.axpy(self.weight_decay, w)?;
            }
            v.scale(self.momentum)?;
            v.axpy(-self.lr, &step)?;
            w.axpy(1.0, v)?;
        }
        Ok(())
    }

    fn clone_boxed(&self) -> Box<dyn Optimizer> {
        Box::new(Sgd {
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            velocity: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Device;

    fn param(v: f32) -> Buffer {
        Buffer::full((2,), v, Device::Cpu).unwrap()
    }

    #[test]
    fn test_plain_sgd_step() {
        let w = param(1.0);
        let g = param(0.5);
        let mut opt = Sgd::new(0.1);
        opt.setup(&[w.clone()]).unwrap();
        opt.apply_gradients(&[w.clone()], &[g], 1).unwrap();
        for x in w.to_vec() {
            assert!((x - 0.95).abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_averaging() {
        // Gradient summed over 4 samples; the step divides by the batch.
        let w = param(1.0);
        let g = param(4.0);
        let mut opt = Sgd::new(0.1);
        opt.setup(&[w.clone()]).unwrap();
        opt.apply_gradients(&[w.clone()], &[g], 4).unwrap();
        for x in w.to_vec() {
            assert!((x - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn test_momentum_accumulates() {
        let w = param(0.0);
        let g = param(1.0);
        let mut opt = Sgd::new(0.1).momentum(0.5);
        opt.setup(&[w.clone()]).unwrap();
        // v1 = -0.1, w = -0.1; v2 = 0.5*-0.1 - 0.1 = -0.15, w = -0.25.
        opt.apply_gradients(&[w.clone()], &[g.clone()], 1).unwrap();
        opt.apply_gradients(&[w.clone()], &[g], 1).unwrap();
        for x in w.to_vec() {
            assert!((x + 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_weight_decay_pulls_toward_zero() {
        let w = param(1.0);
        let g = param(0.0);
        let mut opt = Sgd::new(0.1).weight_decay(0.1);
        opt.setup(&[w.clone()]).unwrap();
        opt.apply_gradients(&[w.clone()], &[g], 1).unwrap();
        for x in w.to_vec() {
            assert!((x - 0.99).abs() < 1e-6);
        }
    }

    #[test]
    fn test_apply_before_setup_fails() {
        let w = param(1.0);
        let g = param(1.0);
        let mut opt = Sgd::new(0.1);
        assert!(opt.apply_gradients(&[w], &[g], 1).is_err());
    }

    #[test]
    fn test_clone_starts_stateless() {
        let w = param(1.0);
        let mut opt = Sgd::new(0.1).momentum(0.9);
        opt.setup(&[w.clone()]).unwrap();
        let mut fresh = opt.clone_boxed();
        // The clone has no velocity until its own setup.
        assert!(fresh
            .apply_gradients(&[w.clone()], &[w.clone()], 1)
            .is_err());
        fresh.setup(&[w.clone()]).unwrap();
        assert!(fresh.apply_gradients(&[w.clone()], &[w], 1).is_ok());
    }
}
