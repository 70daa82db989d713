//! Constants and error types shared by all the modules.

pub mod constants;
pub mod error;
