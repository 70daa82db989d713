//! About the error information when an operation cannot be carried out.

use std::path::PathBuf;
use thiserror::Error;





/// All the fatal errors raised by the descriptor pipeline and the energy network
#[derive(Debug, Error)]
pub enum NxcError
{
    /// Inconsistent species/system counts, missing basis metadata, mismatched checkpoint topology, invalid stage layout
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Gradient requested without a matching forward call, or network used before it is built
    #[error("State error: {0}")]
    State(String),

    /// Non-finite values which would otherwise corrupt a checkpoint
    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io
    {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, NxcError>;





/// Non-fatal numerical problem met during training, handed back to the caller
#[derive(Clone, Debug, PartialEq)]
pub enum NumericalWarning
{
    /// The total loss became NaN or infinite at the given step
    NonFiniteLoss { step: usize, loss: f64 },

    /// The validation loss grew by more than the divergence factor since the previous checkpoint line
    Divergence { step: usize, previous: f64, current: f64 },
}





impl NumericalWarning
{
    pub fn message(&self) -> String
    {
        match self
        {
            NumericalWarning::NonFiniteLoss { step, loss } => format!("non-finite loss {} at step {}, training stopped", loss, step),
            NumericalWarning::Divergence { step, previous, current } => format!("validation loss increased from {:.6e} to {:.6e} at step {}", previous, current, step),
        }
    }
}





/// Error for a system count that does not match the per-system species list
pub fn error_system_count(n_data: usize, n_species: usize) -> NxcError
{
    NxcError::Configuration(format!("number of systems in the data ({}) and the length of the per-system species list ({}) are incompatible", n_data, n_species))
}

/// Error for a species which has not been declared in the basis
pub fn error_unknown_species(species: &str) -> NxcError
{
    NxcError::Configuration(format!("species '{}' is not declared in the basis", species))
}

/// Error for an array whose shape differs from the expected one
pub fn error_shape(variable: &str, expected: &[usize], found: &[usize]) -> NxcError
{
    NxcError::Configuration(format!("'{}' should have shape {:?}, but has shape {:?}", variable, expected, found))
}

/// Error for a gradient request that has no matching forward call
pub fn error_missing_forward(stage: &str) -> NxcError
{
    NxcError::State(format!("gradient of stage '{}' requested without a matching forward call", stage))
}

/// Error for a network used before it has been built or restored
pub fn error_network_not_built() -> NxcError
{
    NxcError::State(String::from("the energy network has not been built yet, fit the estimator or attach a checkpoint first"))
}

/// Error for file creating, opening, reading, and writing
pub fn error_file(path: impl Into<PathBuf>, source: std::io::Error) -> NxcError
{
    NxcError::Io { path: path.into(), source }
}
