//! Interfaces to the electronic-structure engines consuming the functional.

pub mod engine;
