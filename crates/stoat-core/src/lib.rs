//! # stoat-core
//!
//! Device-resident buffers and the axis reduction engine for Stoat.
//!
//! This crate provides:
//! - [`Buffer`] — strided n-dimensional f32 array tagged with a device
//! - [`Shape`] — n-dimensional shape and row-major strides
//! - [`Device`] — residency model (CPU, GPU 0..8, FPGA 0..8)
//! - element-wise combinators (`map`/`apply`/`zip`) and named operators
//! - [`ReduceDescriptor`] / [`reduce`] / [`delta_reduce`] — axis reductions
//!   with reusable index maps and gradient scatter

pub mod buffer;
pub mod device;
pub mod error;
pub mod ops;
pub mod reduce;
pub mod shape;

pub use buffer::{Buffer, StridedIter};
pub use device::{Device, MAX_ACCELERATORS};
pub use error::{Error, Result};
pub use reduce::{delta_reduce, reduce, ReduceCache, ReduceDescriptor, ReduceKind, Reduction};
pub use shape::Shape;
