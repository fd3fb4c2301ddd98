use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{Error, Result};

// Element-wise operator contract
//
// Every element-wise operation in the workspace goes through three
// combinators: `map` (new buffer), `apply` (in-place), and `zip`
// (two operands, new buffer) plus the in-place `zip_apply`. The named
// operators below are thin wrappers; a wider operator catalog would plug in
// here the same way.
//
// Contract, enforced eagerly before any element is touched:
//   - operands must live on the host (accelerator kernels are a backend
//     concern, not ours) — otherwise DeviceMismatch;
//   - binary operands must have *exactly* equal shapes — no implicit
//     broadcasting, otherwise ShapeMismatch.
//
// Buffers past PAR_THRESHOLD elements run their kernels on the rayon pool;
// below it the sequential loop wins.

/// Element count above which element-wise kernels go data-parallel.
const PAR_THRESHOLD: usize = 16 * 1024;

fn check_host(b: &Buffer) -> Result<()> {
    if !b.device().is_cpu() {
        return Err(Error::DeviceMismatch {
            expected: Device::Cpu,
            got: b.device(),
        });
    }
    Ok(())
}

fn check_same_shape(a: &Buffer, b: &Buffer) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    Ok(())
}

impl Buffer {
    /// Apply `f` to every element, producing a new buffer.
    pub fn map(&self, f: impl Fn(f32) -> f32 + Sync) -> Result<Buffer> {
        check_host(self)?;
        let data = self.host_read()?;
        let out: Vec<f32> = if data.len() >= PAR_THRESHOLD {
            data.par_iter().map(|&x| f(x)).collect()
        } else {
            data.iter().map(|&x| f(x)).collect()
        };
        drop(data);
        Buffer::from_slice(&out, self.shape().clone(), self.device())
    }

    /// Apply `f` to every element in place.
    pub fn apply(&self, f: impl Fn(f32) -> f32 + Sync) -> Result<()> {
        check_host(self)?;
        let mut data = self.host_write()?;
        if data.len() >= PAR_THRESHOLD {
            data.par_iter_mut().for_each(|x| *x = f(*x));
        } else {
            data.iter_mut().for_each(|x| *x = f(*x));
        }
        Ok(())
    }

    /// Combine two buffers element by element into a new buffer.
    pub fn zip(&self, other: &Buffer, f: impl Fn(f32, f32) -> f32 + Sync) -> Result<Buffer> {
        check_host(self)?;
        check_host(other)?;
        check_same_shape(self, other)?;
        let a = self.host_read()?;
        let b = other.host_read()?;
        let out: Vec<f32> = if a.len() >= PAR_THRESHOLD {
            a.par_iter().zip(b.par_iter()).map(|(&x, &y)| f(x, y)).collect()
        } else {
            a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
        };
        drop(a);
        drop(b);
        Buffer::from_slice(&out, self.shape().clone(), self.device())
    }

    /// Combine another buffer into this one in place:
    /// `self[i] = f(self[i], other[i])`.
    pub fn zip_apply(&self, other: &Buffer, f: impl Fn(f32, f32) -> f32 + Sync) -> Result<()> {
        check_host(self)?;
        check_host(other)?;
        check_same_shape(self, other)?;
        if self.shares_storage(other) {
            // Same storage: read the value before writing it back.
            let mut data = self.host_write()?;
            data.iter_mut().for_each(|x| *x = f(*x, *x));
            return Ok(());
        }
        let b = other.host_read()?;
        let mut a = self.host_write()?;
        if a.len() >= PAR_THRESHOLD {
            a.par_iter_mut().zip(b.par_iter()).for_each(|(x, &y)| *x = f(*x, y));
        } else {
            a.iter_mut().zip(b.iter()).for_each(|(x, &y)| *x = f(*x, y));
        }
        Ok(())
    }

    // Named operators

    /// Element-wise sum, producing a new buffer.
    pub fn add(&self, other: &Buffer) -> Result<Buffer> {
        self.zip(other, |x, y| x + y)
    }

    /// Element-wise difference, producing a new buffer.
    pub fn sub(&self, other: &Buffer) -> Result<Buffer> {
        self.zip(other, |x, y| x - y)
    }

    /// Element-wise product, producing a new buffer.
    pub fn mul(&self, other: &Buffer) -> Result<Buffer> {
        self.zip(other, |x, y| x * y)
    }

    /// Overwrite every element with a constant.
    pub fn fill(&self, value: f32) -> Result<()> {
        self.apply(|_| value)
    }

    /// Multiply every element by a scalar, in place.
    pub fn scale(&self, alpha: f32) -> Result<()> {
        self.apply(|x| x * alpha)
    }

    /// `self += alpha * other` — the gradient-accumulation primitive.
    pub fn axpy(&self, alpha: f32, other: &Buffer) -> Result<()> {
        self.zip_apply(other, move |y, x| y + alpha * x)
    }

    /// Sum of all elements (host-gated).
    pub fn sum_all(&self) -> Result<f32> {
        check_host(self)?;
        let data = self.host_read()?;
        Ok(data.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(data: &[f32]) -> Buffer {
        Buffer::from_slice(data, data.len(), Device::Cpu).unwrap()
    }

    #[test]
    fn test_add_sub_mul() {
        let a = buf(&[1.0, 2.0, 3.0]);
        let b = buf(&[10.0, 20.0, 30.0]);
        assert_eq!(a.add(&b).unwrap().to_vec(), vec![11.0, 22.0, 33.0]);
        assert_eq!(b.sub(&a).unwrap().to_vec(), vec![9.0, 18.0, 27.0]);
        assert_eq!(a.mul(&b).unwrap().to_vec(), vec![10.0, 40.0, 90.0]);
    }

    #[test]
    fn test_shape_mismatch_fails_fast() {
        let a = Buffer::zeros((2, 3), Device::Cpu).unwrap();
        let b = Buffer::zeros((3, 2), Device::Cpu).unwrap();
        assert!(matches!(a.add(&b), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_device_mismatch_fails_fast() {
        let a = Buffer::zeros((2, 2), Device::Cpu).unwrap();
        let g = Buffer::zeros((2, 2), Device::Gpu(0)).unwrap();
        assert!(matches!(a.add(&g), Err(Error::DeviceMismatch { .. })));
        assert!(matches!(g.fill(1.0), Err(Error::DeviceMismatch { .. })));
    }

    #[test]
    fn test_fill_scale_axpy() {
        let a = buf(&[1.0, 2.0, 3.0]);
        a.scale(2.0).unwrap();
        assert_eq!(a.to_vec(), vec![2.0, 4.0, 6.0]);
        let g = buf(&[1.0, 1.0, 1.0]);
        a.axpy(0.5, &g).unwrap();
        assert_eq!(a.to_vec(), vec![2.5, 4.5, 6.5]);
        a.fill(0.0).unwrap();
        assert_eq!(a.to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_map_does_not_alias() {
        let a = buf(&[1.0, 4.0, 9.0]);
        let r = a.map(|x| x.sqrt()).unwrap();
        assert_eq!(r.to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(a.to_vec(), vec![1.0, 4.0, 9.0]);
        assert!(!a.shares_storage(&r));
    }

    #[test]
    fn test_zip_apply_aliasing() {
        let a = buf(&[1.0, 2.0]);
        let same = a.clone();
        a.zip_apply(&same, |x, y| x + y).unwrap();
        assert_eq!(a.to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_sum_all() {
        let a = buf(&[1.0, 2.0, 3.0, 4.0]);
        assert!((a.sum_all().unwrap() - 10.0).abs() < 1e-5);
    }
}
