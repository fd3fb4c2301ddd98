//! # stoat-nn
//!
//! The layer graph and training primitives for Stoat.
//!
//! This crate provides:
//! - [`Graph`] / [`Node`] / [`LayerKind`] — the index-addressed layer arena
//!   with the forward/backward node contract
//! - [`NameAllocator`] — per-kind layer naming scoped to a build session
//! - [`Loss`] / [`Metric`] traits with [`MeanSquaredError`] and
//!   [`CategoricalAccuracy`]
//! - [`Optimizer`] trait with reference [`Sgd`]

pub mod graph;
pub mod layer;
pub mod loss;
pub mod metrics;
pub mod namegen;
pub mod optim;

pub use graph::{Graph, Node};
pub use layer::{AffineState, LayerKind, ReduceState};
pub use loss::{Loss, MeanSquaredError};
pub use metrics::{CategoricalAccuracy, Metric};
pub use namegen::NameAllocator;
pub use optim::{Optimizer, Sgd};
