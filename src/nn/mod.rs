//! The per-species energy network: subnets, shared parameters, training, and the estimator built on them.

pub mod global_nn;
pub mod training_data;
pub mod training;
pub mod estimator;
