//! # Stoat
//!
//! A training substrate for layer-graph neural networks: device-resident
//! buffers, an axis reduction engine with gradient scatter, a layer-graph
//! arena, and a data-parallel network executor.
//!
//! This is the top-level facade crate.
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `stoat-core` | Buffer, Shape, Device, element-wise ops, reductions |
//! | `stoat-nn` | Layer graph, losses, metrics, optimizers |
//! | `stoat` | ComputeService, Net executor, data-parallel replicas |
//!
//! ## Usage
//!
//! ```ignore
//! use stoat::{ComputeService, GradPolicy, Net};
//! use stoat::nn::{Graph, MeanSquaredError, CategoricalAccuracy, Sgd};
//! use stoat::{Buffer, Device};
//!
//! let mut g = Graph::new();
//! let x = g.input((8, 4), Device::Cpu)?;
//! let a = g.affine(x)?;
//! g.mark_output(a)?;
//!
//! let mut net = Net::new(g);
//! net.build(
//!     Box::new(Sgd::new(0.01)),
//!     vec![Box::new(MeanSquaredError)],
//!     vec![Box::new(MeanSquaredError)],
//!     &ComputeService::local_cpu(2),
//!     GradPolicy::Sum,
//! )?;
//! net.fit(&[inputs], &[targets], 8, 10)?;
//! ```

pub mod compserv;
pub mod net;

pub use compserv::{ComputeService, MAX_WORKERS};
pub use net::{GradPolicy, Net};

/// Re-export core types.
pub use stoat_core::{
    delta_reduce, reduce, Buffer, Device, Error, ReduceCache, ReduceDescriptor, ReduceKind,
    Reduction, Result, Shape,
};

/// Re-export the layer graph and training primitives.
pub mod nn {
    pub use stoat_nn::*;
}
