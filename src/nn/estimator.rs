//! The energy network behind an estimator interface: building, fitting, prediction, gradients, and scores
use crate::common::constants::{DEFAULT_ALPHA, DEFAULT_MAX_STEPS, DEFAULT_N_LAYERS, DEFAULT_N_NODES, DEFAULT_TEST_SIZE, DEFAULT_VALID_SIZE};
use crate::common::error::*;
use crate::descriptor::basis::{GroupedBatch, SystemFeatures, n_samples};
use crate::nn::global_nn::{Activation, EnergyNetwork};
use crate::nn::training::{RegularizationCoefficients, RegularizationPolicy, TrainingOptions, TrainingReport};
use crate::nn::training_data::{Dataset, Subnet};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use log::info;
use ndarray::{Array1, Array3, Axis, s};
use serde::{Serialize, Deserialize};





/// Error metric of 'score'
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric
{
    Mae,
    Rmse,
}

impl Metric
{
    pub fn from_name(name: &str) -> Result<Self>
    {
        match name.to_lowercase().as_str()
        {
            "mae" => Ok(Metric::Mae),
            "rmse" => Ok(Metric::Rmse),
            _ => Err(NxcError::Configuration(format!("metric '{}' unknown or not implemented", name))),
        }
    }

    fn apply(&self, deviation: &Array1<f64>) -> f64
    {
        match self
        {
            Metric::Mae => deviation.mapv(f64::abs).mean().unwrap_or(0.0),
            Metric::Rmse => deviation.mapv(|x| x * x).mean().unwrap_or(0.0).sqrt(),
        }
    }
}





/// Statistics of the deviations (prediction - target)
///
/// # Fields
/// ```text
/// mean_deviation: the mean deviation
/// rmse: the standard deviation of the deviations
/// mae: the mean absolute deviation about the mean deviation
/// max: the largest absolute deviation about the mean deviation
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationStatistics
{
    pub mean_deviation: f64,
    pub rmse: f64,
    pub mae: f64,
    pub max: f64,
}

impl EvaluationStatistics
{
    pub fn from_deviations(deviation: &Array1<f64>) -> Self
    {
        let mean_deviation: f64 = deviation.mean().unwrap_or(0.0);
        let centered: Array1<f64> = deviation.mapv(|x| (x - mean_deviation).abs());
        EvaluationStatistics
        {
            mean_deviation,
            rmse: deviation.std(0.0),
            mae: centered.mean().unwrap_or(0.0),
            max: centered.iter().copied().fold(0.0, f64::max),
        }
    }
}





/// Estimator wrapping the energy network
///
/// # Fields
/// ```text
/// n_nodes, n_layers: the width and the depth of the hidden layers
/// b: the L2 regularization coefficients
/// alpha: the learning rate
/// max_steps: the number of training steps
/// test_size: fraction of every system's samples held out as test set
/// valid_size: fraction of the remaining samples used for validation
/// random_seed: seed of the weight initialization
/// activation: the hidden-layer activation
/// regularization: the form of the L2 penalty
/// multipliers: per-system loss weights
/// loss_table: optional file receiving the training progress
/// path: checkpoint restored into the network when it is built
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkEstimator
{
    pub n_nodes: usize,
    pub n_layers: usize,
    pub b: RegularizationCoefficients,
    pub alpha: f64,
    pub max_steps: usize,
    pub test_size: f64,
    pub valid_size: f64,
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub regularization: RegularizationPolicy,
    #[serde(default)]
    pub multipliers: Option<Vec<f64>>,
    #[serde(default)]
    pub loss_table: Option<PathBuf>,
    #[serde(skip)]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    network: Option<EnergyNetwork>,
}

impl Default for NetworkEstimator
{
    fn default() -> Self
    {
        NetworkEstimator::new(DEFAULT_N_NODES, DEFAULT_N_LAYERS, RegularizationCoefficients::default())
    }
}





impl NetworkEstimator
{
    pub fn new(n_nodes: usize, n_layers: usize, b: RegularizationCoefficients) -> Self
    {
        NetworkEstimator
        {
            n_nodes,
            n_layers,
            b,
            alpha: DEFAULT_ALPHA,
            max_steps: DEFAULT_MAX_STEPS,
            test_size: DEFAULT_TEST_SIZE,
            valid_size: DEFAULT_VALID_SIZE,
            random_seed: None,
            activation: Activation::default(),
            regularization: RegularizationPolicy::default(),
            multipliers: None,
            loss_table: None,
            path: None,
            network: None,
        }
    }

    pub fn network(&self) -> Option<&EnergyNetwork>
    {
        self.network.as_ref()
    }

    /// Attach a checkpoint, which replaces the current network at its next use
    pub fn set_checkpoint(&mut self, path: PathBuf)
    {
        self.path = Some(path);
        self.network = None;
    }

    pub fn training_options(&self) -> TrainingOptions
    {
        TrainingOptions
        {
            learning_rate: self.alpha,
            max_steps: self.max_steps,
            regularization: self.b.clone(),
            policy: self.regularization,
            train_valid_split: 1.0 - self.valid_size,
            random_seed: self.random_seed,
            multipliers: self.multipliers.clone(),
            loss_table: self.loss_table.clone(),
        }
    }





    /// Build one subnet per atom (copy) of every species of every system, each system forming one additive group
    ///
    /// The attached checkpoint, if any, is restored into the new network.
    pub fn build_network(&mut self, batch: &GroupedBatch) -> Result<()>
    {
        self.build(batch, self.test_size)
    }

    fn build(&mut self, batch: &GroupedBatch, test_size: f64) -> Result<()>
    {
        if batch.features.len() != batch.targets.len()
        {
            return Err(error_system_count(batch.features.len(), batch.targets.len()));
        }

        let mut subnets: Vec<Vec<Subnet>> = Vec::with_capacity(batch.n_systems());
        for (feat, targets) in batch.features.iter().zip(batch.targets.iter())
        {
            let mut nets: Vec<Subnet> = Vec::new();
            for (species, x) in feat.iter()
            {
                if x.shape()[0] != targets.len()
                {
                    return Err(error_shape(&format!("features of species '{}'", species), &[targets.len(), x.shape()[1], x.shape()[2]], x.shape()));
                }
                for copy in 0..x.shape()[1]
                {
                    let mut subnet: Subnet = Subnet::new(species.clone(), self.n_nodes, self.n_layers, self.activation);
                    subnet.add_dataset(Dataset::new(species.clone(), x.slice(s![.., copy..copy+1, ..]).to_owned()), targets, test_size)?;
                    nets.push(subnet);
                }
            }
            subnets.push(nets);
        }

        let mut network: EnergyNetwork = EnergyNetwork::new(subnets, self.random_seed)?;
        if let Some(path) = &self.path
        {
            network.restore_checkpoint(path)?;
        }
        self.network = Some(network);
        Ok(())
    }

    /// Build and train the network
    pub fn fit(&mut self, batch: &GroupedBatch) -> Result<TrainingReport>
    {
        self.build_network(batch)?;
        let options: TrainingOptions = self.training_options();
        let network: &mut EnergyNetwork = self.network.as_mut().ok_or_else(error_network_not_built)?;
        let report: TrainingReport = network.train(&options)?;
        info!("training finished after {} steps with {} warnings", report.steps, report.warnings.len());
        Ok(report)
    }

    /// The current network, built from the attached checkpoint on first use
    fn ready_network(&mut self, features: &[SystemFeatures]) -> Result<&EnergyNetwork>
    {
        if self.network.is_none()
        {
            if self.path.is_none()
            {
                return Err(error_network_not_built())
            }
            self.build(&GroupedBatch::from_features(features.to_vec()), 0.0)?;
        }
        self.network.as_ref().ok_or_else(error_network_not_built)
    }





    /// Energies of every sample of every system: the sum of the atomic contributions of all species
    pub fn predict(&mut self, features: &[SystemFeatures]) -> Result<Vec<Array1<f64>>>
    {
        let counts: Vec<usize> = features.iter().map(n_samples).collect();
        self.energies(features, &counts)
    }

    /// Energies of the systems of a batch, one per target, so that a system without atoms gets zero energies
    pub fn predict_batch(&mut self, batch: &GroupedBatch) -> Result<Vec<Array1<f64>>>
    {
        if batch.features.len() != batch.targets.len()
        {
            return Err(error_system_count(batch.features.len(), batch.targets.len()));
        }
        let counts: Vec<usize> = batch.targets.iter().map(|target| target.len()).collect();
        self.energies(&batch.features, &counts)
    }

    fn energies(&mut self, features: &[SystemFeatures], counts: &[usize]) -> Result<Vec<Array1<f64>>>
    {
        let network: &EnergyNetwork = self.ready_network(features)?;
        let mut energies: Vec<Array1<f64>> = Vec::with_capacity(features.len());
        for (feat, &n) in features.iter().zip(counts.iter())
        {
            let mut energy: Array1<f64> = Array1::zeros(n);
            for (species, x) in feat.iter()
            {
                if x.shape()[0] != n
                {
                    return Err(error_shape(&format!("features of species '{}'", species), &[n, x.shape()[1], x.shape()[2]], x.shape()));
                }
                for copy in 0..x.shape()[1]
                {
                    energy += &network.predict(species, x.index_axis(Axis(1), copy))?;
                }
            }
            energies.push(energy);
        }
        Ok(energies)
    }

    /// dE/d(features), with the shapes of the features
    pub fn get_gradient(&mut self, features: &[SystemFeatures]) -> Result<Vec<SystemFeatures>>
    {
        let network: &EnergyNetwork = self.ready_network(features)?;
        let mut gradients: Vec<SystemFeatures> = Vec::with_capacity(features.len());
        for feat in features.iter()
        {
            let mut gradient: SystemFeatures = BTreeMap::new();
            for (species, x) in feat.iter()
            {
                let mut grad: Array3<f64> = Array3::zeros(x.raw_dim());
                for copy in 0..x.shape()[1]
                {
                    grad.index_axis_mut(Axis(1), copy).assign(&network.get_gradient(species, x.index_axis(Axis(1), copy))?);
                }
                gradient.insert(species.clone(), grad);
            }
            gradients.push(gradient);
        }
        Ok(gradients)
    }

    fn deviations(&mut self, batch: &GroupedBatch) -> Result<Vec<Array1<f64>>>
    {
        let predictions: Vec<Array1<f64>> = self.predict_batch(batch)?;
        let mut deviations: Vec<Array1<f64>> = Vec::with_capacity(predictions.len());
        for (prediction, target) in predictions.into_iter().zip(batch.targets.iter())
        {
            if prediction.len() != target.len()
            {
                return Err(error_shape("targets", &[prediction.len()], target.shape()));
            }
            deviations.push(prediction - target);
        }
        Ok(deviations)
    }

    /// Mean over the systems of the metric of (prediction - target)
    pub fn score(&mut self, batch: &GroupedBatch, metric: Metric) -> Result<f64>
    {
        let scores: Array1<f64> = self.deviations(batch)?.iter().map(|dev| metric.apply(dev)).collect();
        Ok(scores.mean().unwrap_or(0.0))
    }

    /// Statistics of the deviations of all the samples of all the systems
    pub fn evaluate(&mut self, batch: &GroupedBatch) -> Result<EvaluationStatistics>
    {
        let all: Array1<f64> = self.deviations(batch)?.iter().flat_map(|dev| dev.iter().copied()).collect();
        Ok(EvaluationStatistics::from_deviations(&all))
    }

    /// Save the network parameters and optimizer state
    pub fn save_checkpoint(&self, path: &Path) -> Result<()>
    {
        self.network.as_ref().ok_or_else(error_network_not_built)?.save_checkpoint(path)
    }
}
