use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Buffer — The device-resident data structure
//
// A Buffer is an n-dimensional array of f32 tagged with a device residency.
// It is the substrate every layer output, delta, and parameter is made of:
//
//   1. Storage lives behind Arc<RwLock<Vec<f32>>> — cloning a Buffer is
//      cheap (handle semantics) and clones share the same storage.
//   2. Residency is a tag, not a pointer type. Host kernels check it and
//      refuse accelerator-resident buffers with DeviceMismatch; moving a
//      buffer between devices is an explicit, atomic whole-buffer copy.
//   3. Views share storage with a different shape; everything else that
//      looks like a copy *is* a copy (`dup`, `copy_from`, `to_vec`).
//
// MEMORY MODEL:
//
//   Multiple handles can read concurrently through the RwLock; a writer
//   (in-place op, gradient merge) takes the write lock for the duration of
//   its kernel only. There is no per-element locking.

/// An n-dimensional array of f32 resident on a specific device.
///
/// Clones share storage; deep copies are explicit via [`Buffer::dup`].
#[derive(Clone)]
pub struct Buffer {
    device: Device,
    shape: Shape,
    stride: Vec<usize>,
    data: Arc<RwLock<Vec<f32>>>,
    view: bool,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Buffer(shape={}, device={}, view={})",
            self.shape, self.device, self.view
        )
    }
}

impl Buffer {
    fn alloc(shape: Shape, device: Device, data: Vec<f32>) -> Result<Self> {
        if !device.is_valid() {
            return Err(Error::Allocation {
                device,
                reason: "device id out of range".to_string(),
            });
        }
        if shape.elem_count() == 0 {
            return Err(Error::Allocation {
                device,
                reason: format!("zero-sized shape {}", shape),
            });
        }
        let stride = shape.stride_contiguous();
        Ok(Buffer {
            device,
            shape,
            stride,
            data: Arc::new(RwLock::new(data)),
            view: false,
        })
    }

    // Factories

    /// Uninitialized buffer (zero-filled; "empty" means no defined contents).
    pub fn empty(shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        Self::alloc(shape, device, vec![0.0; n])
    }

    /// Buffer filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        Self::alloc(shape, device, vec![0.0; n])
    }

    /// Buffer filled with ones.
    pub fn ones(shape: impl Into<Shape>, device: Device) -> Result<Self> {
        Self::full(shape, 1.0, device)
    }

    /// Buffer filled with a constant value.
    pub fn full(shape: impl Into<Shape>, value: f32, device: Device) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        Self::alloc(shape, device, vec![value; n])
    }

    /// Buffer initialized from a slice. The slice length must match the
    /// shape's element count.
    pub fn from_slice(data: &[f32], shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        if data.len() != n {
            return Err(Error::ElementCountMismatch {
                shape,
                expected: n,
                got: data.len(),
            });
        }
        Self::alloc(shape, device, data.to_vec())
    }

    /// Buffer with elements drawn uniformly from `[0, 1)`.
    pub fn randu(shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
        Self::alloc(shape, device, data)
    }

    /// Buffer with elements drawn from a normal distribution.
    pub fn randn(
        shape: impl Into<Shape>,
        mean: f32,
        std: f32,
        device: Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        let normal = Normal::new(mean, std)
            .map_err(|e| Error::msg(format!("invalid normal distribution: {}", e)))?;
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..n).map(|_| normal.sample(&mut rng)).collect();
        Self::alloc(shape, device, data)
    }

    // Accessors

    /// The shape of this buffer.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The dimensions as a slice (shortcut for shape().dims()).
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.elem_count()
    }

    /// Never true: zero-sized buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The device this buffer is resident on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// The row-major strides of this buffer.
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    /// Whether this buffer is a view over another buffer's storage.
    pub fn is_view(&self) -> bool {
        self.view
    }

    /// Whether two handles share the same underlying storage.
    pub fn shares_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    // Host access
    //
    // Guards are handed out only for CPU-resident buffers. Accelerator
    // residency means host code must not dereference the storage; it has
    // to move or copy the buffer explicitly first.

    /// Read access to the underlying storage. Fails with `DeviceMismatch`
    /// unless the buffer is CPU-resident.
    pub fn host_read(&self) -> Result<RwLockReadGuard<'_, Vec<f32>>> {
        if !self.device.is_cpu() {
            return Err(Error::DeviceMismatch {
                expected: Device::Cpu,
                got: self.device,
            });
        }
        Ok(self.data.read().expect("buffer lock poisoned"))
    }

    /// Write access to the underlying storage. Fails with `DeviceMismatch`
    /// unless the buffer is CPU-resident.
    pub fn host_write(&self) -> Result<RwLockWriteGuard<'_, Vec<f32>>> {
        if !self.device.is_cpu() {
            return Err(Error::DeviceMismatch {
                expected: Device::Cpu,
                got: self.device,
            });
        }
        Ok(self.data.write().expect("buffer lock poisoned"))
    }

    /// Read one element at a multi-dimensional index (host-gated).
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let flat = self.flat_index(index)?;
        let data = self.host_read()?;
        Ok(data[flat])
    }

    /// Write one element at a multi-dimensional index (host-gated).
    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        let flat = self.flat_index(index)?;
        let mut data = self.host_write()?;
        data[flat] = value;
        Ok(())
    }

    /// Flat storage index for a multi-dimensional index:
    /// `sum(index[i] * stride[i])`.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            crate::bail!(
                "index has {} dimensions, buffer has {}",
                index.len(),
                self.rank()
            );
        }
        let mut flat = 0usize;
        for (d, &i) in index.iter().enumerate() {
            if i >= self.shape.dims()[d] {
                return Err(Error::AxisOutOfRange {
                    axis: i,
                    ndim: self.shape.dims()[d],
                });
            }
            flat += i * self.stride[d];
        }
        Ok(flat)
    }

    /// Iterator over flat storage indices in logical (row-major) order.
    ///
    /// This is the stable iteration interface for external collaborators
    /// (serializers, bindings) that must walk a buffer without assuming
    /// anything about its layout.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self.shape.dims(), &self.stride)
    }

    // Residency

    /// Move this buffer to another device.
    ///
    /// The transition is atomic: the whole storage is copied and retagged
    /// in one step, the old residency is replaced rather than merged, and
    /// the handle ends up with fresh storage. Views taken before a move
    /// keep the old storage and residency. Moving to the same device is a
    /// no-op.
    pub fn move_to(&mut self, device: Device) -> Result<()> {
        if !device.is_valid() {
            return Err(Error::Allocation {
                device,
                reason: "device id out of range".to_string(),
            });
        }
        if device == self.device {
            return Ok(());
        }
        let copied = self.data.read().expect("buffer lock poisoned").clone();
        self.data = Arc::new(RwLock::new(copied));
        self.device = device;
        self.view = false;
        Ok(())
    }

    /// Deep copy: same shape, same device, fresh storage.
    pub fn dup(&self) -> Result<Buffer> {
        let data = self.data.read().expect("buffer lock poisoned").clone();
        let mut out = Self::alloc(self.shape.clone(), self.device, data)?;
        out.stride = self.stride.clone();
        Ok(out)
    }

    /// Reinterpret this buffer under a new shape without copying.
    ///
    /// Legal iff the element counts match. The result shares storage with
    /// `self` and is flagged as a view.
    pub fn view(&self, new_shape: impl Into<Shape>) -> Result<Buffer> {
        let new_shape = new_shape.into();
        if new_shape.elem_count() != self.len() {
            let got = new_shape.elem_count();
            return Err(Error::ElementCountMismatch {
                shape: new_shape,
                expected: self.len(),
                got,
            });
        }
        let stride = new_shape.stride_contiguous();
        Ok(Buffer {
            device: self.device,
            shape: new_shape,
            stride,
            data: Arc::clone(&self.data),
            view: true,
        })
    }

    /// Copy another buffer's contents into this one. Shapes must match
    /// exactly; residency may differ (this *is* the explicit cross-device
    /// copy, and the parameter-broadcast primitive).
    pub fn copy_from(&self, other: &Buffer) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if self.shares_storage(other) {
            return Ok(());
        }
        let src = other.data.read().expect("buffer lock poisoned");
        let mut dst = self.data.write().expect("buffer lock poisoned");
        dst.copy_from_slice(&src);
        Ok(())
    }

    /// Copy the contents out into a plain vector, in logical order.
    /// Works regardless of residency: this is an explicit copy across the
    /// device boundary, intended for I/O and checkpointing collaborators.
    pub fn to_vec(&self) -> Vec<f32> {
        let data = self.data.read().expect("buffer lock poisoned");
        self.strided_indices().map(|i| data[i]).collect()
    }
}

/// Iterator that yields flat storage indices for each logical element,
/// rightmost dimension fastest.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(dims: &[usize], strides: &[usize]) -> Self {
        StridedIter {
            current: vec![0; dims.len()],
            dims: dims.to_vec(),
            strides: strides.to_vec(),
            remaining: dims.iter().product(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = 0;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factories() {
        let z = Buffer::zeros((2, 3), Device::Cpu).unwrap();
        assert_eq!(z.to_vec(), vec![0.0; 6]);
        let o = Buffer::ones((2, 3), Device::Cpu).unwrap();
        assert_eq!(o.to_vec(), vec![1.0; 6]);
        let f = Buffer::full((2,), 3.5, Device::Cpu).unwrap();
        assert_eq!(f.to_vec(), vec![3.5, 3.5]);
    }

    #[test]
    fn test_allocation_failures() {
        // Zero-sized shape.
        assert!(matches!(
            Buffer::zeros(vec![4, 0, 3], Device::Cpu),
            Err(Error::Allocation { .. })
        ));
        // Invalid device id.
        assert!(matches!(
            Buffer::zeros((2, 2), Device::Gpu(8)),
            Err(Error::Allocation { .. })
        ));
    }

    #[test]
    fn test_from_slice_count_check() {
        assert!(Buffer::from_slice(&[1.0, 2.0, 3.0], (2, 2), Device::Cpu).is_err());
        let b = Buffer::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), Device::Cpu).unwrap();
        assert_eq!(b.get(&[1, 0]).unwrap(), 3.0);
    }

    #[test]
    fn test_clone_shares_storage_dup_does_not() {
        let a = Buffer::zeros((2, 2), Device::Cpu).unwrap();
        let b = a.clone();
        assert!(a.shares_storage(&b));
        b.set(&[0, 0], 9.0).unwrap();
        assert_eq!(a.get(&[0, 0]).unwrap(), 9.0);

        let c = a.dup().unwrap();
        assert!(!a.shares_storage(&c));
        c.set(&[0, 0], 1.0).unwrap();
        assert_eq!(a.get(&[0, 0]).unwrap(), 9.0);
    }

    #[test]
    fn test_view_shares_storage() {
        let a = Buffer::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), Device::Cpu).unwrap();
        let v = a.view((3, 2)).unwrap();
        assert!(v.is_view());
        assert!(a.shares_storage(&v));
        assert_eq!(v.get(&[2, 1]).unwrap(), 6.0);
        // Element count must match.
        assert!(a.view((4, 2)).is_err());
    }

    #[test]
    fn test_residency_gating() {
        let g = Buffer::zeros((2, 2), Device::Gpu(0)).unwrap();
        assert!(matches!(
            g.host_read(),
            Err(Error::DeviceMismatch { .. })
        ));
        assert!(g.get(&[0, 0]).is_err());
        // to_vec is the explicit crossing and still works.
        assert_eq!(g.to_vec(), vec![0.0; 4]);
    }

    #[test]
    fn test_move_to_is_atomic_copy() {
        let mut a = Buffer::from_slice(&[1.0, 2.0], (2,), Device::Cpu).unwrap();
        let old_handle = a.clone();
        a.move_to(Device::Gpu(1)).unwrap();
        assert_eq!(a.device(), Device::Gpu(1));
        // The pre-move handle keeps the old residency and storage.
        assert_eq!(old_handle.device(), Device::Cpu);
        assert!(!a.shares_storage(&old_handle));
        assert_eq!(a.to_vec(), vec![1.0, 2.0]);
        // Same-device move is a no-op.
        let before = a.clone();
        a.move_to(Device::Gpu(1)).unwrap();
        assert!(a.shares_storage(&before));
    }

    #[test]
    fn test_copy_from() {
        let a = Buffer::zeros((2, 2), Device::Cpu).unwrap();
        let b = Buffer::full((2, 2), 7.0, Device::Cpu).unwrap();
        a.copy_from(&b).unwrap();
        assert_eq!(a.to_vec(), vec![7.0; 4]);
        let c = Buffer::zeros((3, 3), Device::Cpu).unwrap();
        assert!(matches!(
            a.copy_from(&c),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_strided_indices_contiguous() {
        let a = Buffer::zeros((2, 3), Device::Cpu).unwrap();
        let idx: Vec<usize> = a.strided_indices().collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_randu_range() {
        let r = Buffer::randu((100,), Device::Cpu).unwrap();
        for v in r.to_vec() {
            assert!((0.0..1.0).contains(&v));
        }
    }
}
