//! MLCF
//!
//! MLCF (machine-learned correcting functional) is an energy correction learnt from the per-atom
//! projections of the electron density on a species-dependent basis. The raw coefficients are grouped
//! by system and species, made rotation-invariant by a symmetrizer, and fed to one feed-forward network
//! per species whose atomic outputs are summed into the system energy. Every stage carries its analytic
//! adjoint, so that the gradient of the energy w.r.t. the raw coefficients is available to the engine.

pub mod common;
pub mod descriptor;
pub mod external;
pub mod io;
pub mod matrix;
pub mod nn;
pub mod pipeline;
