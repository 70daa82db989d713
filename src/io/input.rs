//! About the input files.
use crate::common::constants::*;
use crate::common::error::*;
use crate::descriptor::basis::{Basis, Species};
use crate::descriptor::grouper::SpeciesGrouper;
use crate::descriptor::symmetrizer::{Symmetrizer, SymmetrizerKind};
use crate::io::output::{read_text, write_text};
use crate::nn::estimator::NetworkEstimator;
use crate::nn::global_nn::Activation;
use crate::nn::training::{RegularizationCoefficients, RegularizationPolicy};
use crate::pipeline::{NamedStep, Pipeline};
use crate::pipeline::stage::Step;
use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};





/// The structure containing the parameters of the symmetrizer
///
/// # Fields
/// ```text
/// symmetrizer_type: name of the invariant construction (e.g. "casimir")
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymmetrizerPara
{
    pub symmetrizer_type: String,
}





/// The structure containing the architecture of the species networks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPara
{
    pub n_nodes: usize,
    pub n_layers: usize,
    pub activation: Activation,
}





/// The structure containing the parameters of the training
///
/// # Fields
/// ```text
/// alpha: the learning rate of Adam
/// max_steps: the number of training steps
/// b: the L2 regularization coefficients, with optional per-species values
/// regularization: the form of the L2 penalty
/// test_size: fraction of the samples held out as test set
/// valid_size: fraction of the remaining samples used for validation
/// random_seed: seed of the weight initialization
/// loss_table: file receiving the training progress
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingPara
{
    pub alpha: f64,
    pub max_steps: usize,
    pub b: RegularizationCoefficients,
    pub regularization: RegularizationPolicy,
    pub test_size: f64,
    pub valid_size: f64,
    pub random_seed: Option<u64>,
    pub loss_table: Option<PathBuf>,
}





/// The structure containing all the parameters of a model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Para
{
    // Radial and angular counts of every species
    pub basis: Basis,

    // Invariant construction
    pub symmetrizer: SymmetrizerPara,

    // Species networks
    pub network: NetworkPara,

    // Training parameters
    pub training: TrainingPara,
}





impl Para
{
    pub fn new() -> Self
    {
        Para
        {
            basis: Basis::new(),

            symmetrizer: SymmetrizerPara
            {
                symmetrizer_type: String::from("casimir"),
            },

            network: NetworkPara
            {
                n_nodes: DEFAULT_N_NODES,
                n_layers: DEFAULT_N_LAYERS,
                activation: Activation::Sigmoid,
            },

            training: TrainingPara
            {
                alpha: DEFAULT_ALPHA,
                max_steps: DEFAULT_MAX_STEPS,
                b: RegularizationCoefficients::default(),
                regularization: RegularizationPolicy::default(),
                test_size: DEFAULT_TEST_SIZE,
                valid_size: DEFAULT_VALID_SIZE,
                random_seed: None,
                loss_table: None,
            },
        }
    }

    /// Read the parameters from a YAML file, the missing entries taking their default values
    pub fn from_yaml_file(path: &Path) -> Result<Self>
    {
        Ok(serde_yaml::from_str(&read_text(path)?)?)
    }

    pub fn to_yaml_file(&self, path: &Path) -> Result<()>
    {
        write_text(path, &serde_yaml::to_string(self)?)
    }

    pub fn symmetrizer_kind(&self) -> Result<SymmetrizerKind>
    {
        SymmetrizerKind::from_name(&self.symmetrizer.symmetrizer_type)
    }

    /// An unfitted estimator with these hyperparameters
    pub fn estimator(&self) -> NetworkEstimator
    {
        let mut estimator: NetworkEstimator = NetworkEstimator::new(self.network.n_nodes, self.network.n_layers, self.training.b.clone());
        estimator.activation = self.network.activation;
        estimator.alpha = self.training.alpha;
        estimator.max_steps = self.training.max_steps;
        estimator.regularization = self.training.regularization;
        estimator.test_size = self.training.test_size;
        estimator.valid_size = self.training.valid_size;
        estimator.random_seed = self.training.random_seed;
        estimator.loss_table = self.training.loss_table.clone();
        estimator
    }

    /// The full pipeline (grouper, symmetrizer, estimator) for systems made of 'sys_species'
    pub fn pipeline(&self, sys_species: Vec<Vec<Species>>) -> Result<Pipeline>
    {
        if self.basis.is_empty()
        {
            return Err(NxcError::Configuration(String::from("the basis does not declare any species")));
        }
        let kind: SymmetrizerKind = self.symmetrizer_kind()?;
        Pipeline::new(self.basis.clone(), kind, vec![
            NamedStep::new("grouper", Step::Grouper(SpeciesGrouper::new(self.basis.clone(), sys_species)?)),
            NamedStep::new("symmetrizer", Step::Symmetrizer(Symmetrizer::new(kind, self.basis.clone()))),
            NamedStep::new("estimator", Step::Estimator(self.estimator())),
        ])
    }
}

impl Default for Para
{
    fn default() -> Self
    {
        Para::new()
    }
}

impl Default for SymmetrizerPara
{
    fn default() -> Self
    {
        Para::new().symmetrizer
    }
}

impl Default for NetworkPara
{
    fn default() -> Self
    {
        Para::new().network
    }
}

impl Default for TrainingPara
{
    fn default() -> Self
    {
        Para::new().training
    }
}
