//! Contains the default numbers and static lookup tables.
use crate::descriptor::symmetrizer::SymmetrizerKind;
use phf::phf_map;





// Default seed for the train/test partition of the subnet datasets
pub const DEFAULT_SPLIT_SEED: u64 = 42;

// Adam optimizer
pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.999;
pub const ADAM_EPS: f64 = 0.00000001;

// Number of progress lines printed during training
pub const N_PROGRESS_LINES: usize = 10;

// A validation loss growing by more than this factor between two progress lines is reported as divergence
pub const DIVERGENCE_FACTOR: f64 = 1000.0;

// Estimator defaults
pub const DEFAULT_N_NODES: usize = 8;
pub const DEFAULT_N_LAYERS: usize = 3;
pub const DEFAULT_ALPHA: f64 = 0.01;
pub const DEFAULT_MAX_STEPS: usize = 20001;
pub const DEFAULT_TEST_SIZE: f64 = 0.2;
pub const DEFAULT_VALID_SIZE: f64 = 0.2;

// Hidden weights are drawn from a unit normal truncated at this many standard deviations
pub const TRUNCATION: f64 = 2.0;

// Version of the binary network checkpoint
pub const CHECKPOINT_VERSION: u32 = 1;

// File names inside a saved model directory
pub const PIPELINE_FILE: &str = "pipeline.yaml";
pub const NETWORK_FILE: &str = "network.ckpt";





// 'STR_TO_SYMMETRIZER' is a static structure of type 'phf::Map', initialized by macro 'phf_map'
static STR_TO_SYMMETRIZER: phf::Map<&'static str, SymmetrizerKind> = phf_map!
{
    "casimir" => SymmetrizerKind::Casimir,
};

/// Look up the symmetrizer by its (case-insensitive) name
pub fn symmetrizer_from_str(name: &str) -> Option<SymmetrizerKind>
{
    STR_TO_SYMMETRIZER.get(name.to_lowercase().as_str()).copied()
}
