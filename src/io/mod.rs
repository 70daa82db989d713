//! Parameter files and model directories.

pub mod input;
pub mod output;
