//! The descriptor stages: species grouping of the raw coefficients and their rotation-invariant symmetrization.

pub mod basis;
pub mod grouper;
pub mod layout;
pub mod symmetrizer;
