//! Training of the energy network: the loss of the additive groups, the L2 regularization, and the Adam loop
use crate::common::constants::{DEFAULT_ALPHA, DEFAULT_MAX_STEPS, DEFAULT_SPLIT_SEED, DIVERGENCE_FACTOR, N_PROGRESS_LINES};
use crate::common::error::*;
use crate::descriptor::basis::Species;
use crate::nn::global_nn::{EnergyNetwork, ForwardCache, GlobalAdam, GlobalGrads, GlobalNN};
use crate::nn::training_data::{Subnet, split_indices};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use log::{info, warn};
use ndarray::{Array1, Array3, Axis};
use serde::{Serialize, Deserialize};





/// Per-species regularization coefficients, with a fallback for the species not listed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegularizationCoefficients
{
    #[serde(default)]
    pub default: f64,
    #[serde(default)]
    pub per_species: BTreeMap<Species, f64>,
}





impl RegularizationCoefficients
{
    /// The same coefficient for every species
    pub fn uniform(b: f64) -> Self
    {
        RegularizationCoefficients { default: b, per_species: BTreeMap::new() }
    }

    pub fn with_species(mut self, species: &str, b: f64) -> Self
    {
        self.per_species.insert(Species::new(species), b);
        self
    }

    pub fn get(&self, species: &Species) -> f64
    {
        self.per_species.get(species).copied().unwrap_or(self.default)
    }
}





/// How the L2 penalty of the hidden weight matrices is formed
///
/// # Fields
/// ```text
/// half_norm: use 1/2 ||W||^2 instead of ||W||^2
/// scale_by_layer_width: divide the penalty of a layer by its width
/// per_subnet: count the penalty of a species once per subnet (i.e. per atom) instead of once per species
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationPolicy
{
    pub half_norm: bool,
    pub scale_by_layer_width: bool,
    pub per_subnet: bool,
}

impl Default for RegularizationPolicy
{
    fn default() -> Self
    {
        RegularizationPolicy { half_norm: true, scale_by_layer_width: true, per_subnet: true }
    }
}





/// Options of one training run
///
/// # Fields
/// ```text
/// learning_rate: the Adam step size
/// max_steps: the number of full-batch optimization steps
/// regularization: the per-species L2 coefficients
/// policy: the form of the L2 penalty
/// train_valid_split: fraction of the training partition used for the updates, in (0, 1]. With 1.0 there is no shuffle and the validation set is the training set
/// random_seed: seed of the weight initialization, used when the network is built
/// multipliers: weight of the loss of every additive group (1.0 each if None)
/// loss_table: optional file receiving the progress lines
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingOptions
{
    pub learning_rate: f64,
    pub max_steps: usize,
    pub regularization: RegularizationCoefficients,
    pub policy: RegularizationPolicy,
    pub train_valid_split: f64,
    pub random_seed: Option<u64>,
    pub multipliers: Option<Vec<f64>>,
    pub loss_table: Option<PathBuf>,
}

impl Default for TrainingOptions
{
    fn default() -> Self
    {
        TrainingOptions
        {
            learning_rate: DEFAULT_ALPHA,
            max_steps: DEFAULT_MAX_STEPS,
            regularization: RegularizationCoefficients::default(),
            policy: RegularizationPolicy::default(),
            train_valid_split: 0.8,
            random_seed: None,
            multipliers: None,
            loss_table: None,
        }
    }
}





/// One progress line: root of the group losses on the training and validation sets
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressLine
{
    pub step: usize,
    pub training_rmse: Vec<f64>,
    pub training_total: f64,
    pub validation_rmse: Vec<f64>,
    pub validation_total: f64,
    pub l2_loss: f64,
}

/// Result of a training run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingReport
{
    pub steps: usize,
    pub progress: Vec<ProgressLine>,
    pub warnings: Vec<NumericalWarning>,
}

impl TrainingReport
{
    pub fn last_progress(&self) -> Option<&ProgressLine>
    {
        self.progress.last()
    }
}





/// The inputs of all the subnets of one additive group, and the shared targets
#[derive(Clone, Debug)]
struct GroupData
{
    inputs: Vec<(Species, Array3<f64>)>,
    targets: Array1<f64>,
}

impl GroupData
{
    fn select(group: &[Subnet], indices: &[usize]) -> Self
    {
        GroupData
        {
            inputs: group.iter().map(|subnet| (subnet.species.clone(), subnet.x_train.select(Axis(0), indices))).collect(),
            targets: group[0].y_train.select(Axis(0), indices),
        }
    }
}

/// Split the training partition of a group into (training, validation) data, with the same indices for every subnet
fn partition_group(group: &[Subnet], train_valid_split: f64) -> Result<(GroupData, GroupData)>
{
    let n: usize = match group.first()
    {
        Some(subnet) => subnet.n_train(),
        None => return Err(NxcError::Configuration(String::from("an additive group has no subnet"))),
    };
    if let Some(subnet) = group.iter().find(|subnet| subnet.n_train() != n)
    {
        return Err(NxcError::Configuration(format!("subnets of one additive group have {} and {} training samples", n, subnet.n_train())));
    }

    if train_valid_split == 1.0
    {
        let all: Vec<usize> = (0..n).collect();
        let data: GroupData = GroupData::select(group, &all);
        return Ok((data.clone(), data))
    }
    let (train, valid): (Vec<usize>, Vec<usize>) = split_indices(n, 1.0 - train_valid_split, DEFAULT_SPLIT_SEED, true)?;
    Ok((GroupData::select(group, &train), GroupData::select(group, &valid)))
}





/// Combined prediction of an additive group
fn group_prediction(params: &GlobalNN, data: &GroupData) -> Result<Array1<f64>>
{
    let mut prediction: Array1<f64> = Array1::zeros(data.targets.len());
    for (species, x) in data.inputs.iter()
    {
        let net = params.get(species)?;
        for copy in 0..x.shape()[1]
        {
            prediction += &net.predict(x.index_axis(Axis(1), copy))?;
        }
    }
    Ok(prediction)
}

fn mean_squared_error(prediction: &Array1<f64>, targets: &Array1<f64>) -> f64
{
    (prediction - targets).mapv(|r| r * r).mean().unwrap_or(0.0)
}

/// Mean squared error of a group, accumulating multiplier * d(mse)/d(parameters) into 'grads'
fn accumulate_group_gradient(params: &GlobalNN, data: &GroupData, multiplier: f64, grads: &mut GlobalGrads) -> Result<f64>
{
    let mut prediction: Array1<f64> = Array1::zeros(data.targets.len());
    let mut caches: Vec<(&Species, ForwardCache)> = Vec::new();
    for (species, x) in data.inputs.iter()
    {
        let net = params.get(species)?;
        for copy in 0..x.shape()[1]
        {
            let cache: ForwardCache = net.forward(x.index_axis(Axis(1), copy))?;
            prediction += &cache.output;
            caches.push((species, cache));
        }
    }

    let n: f64 = data.targets.len().max(1) as f64;
    let residual: Array1<f64> = prediction - &data.targets;
    let mse: f64 = residual.mapv(|r| r * r).sum() / n;
    let d_prediction: Array1<f64> = residual * (2.0 * multiplier / n);
    for (species, cache) in caches.iter()
    {
        let (species_grads, _) = params.get(species)?.backward(cache, d_prediction.view());
        grads.get_mut(*species).ok_or_else(|| NxcError::State(format!("no gradient allocated for species '{}'", species)))?.add_assign(&species_grads);
    }
    Ok(mse)
}





/// How many times the penalty of each species is counted
fn penalty_counts(subnets: &[Vec<Subnet>], policy: &RegularizationPolicy) -> BTreeMap<Species, f64>
{
    let mut counts: BTreeMap<Species, f64> = BTreeMap::new();
    for subnet in subnets.iter().flatten()
    {
        let count: &mut f64 = counts.entry(subnet.species.clone()).or_insert(0.0);
        *count = if policy.per_subnet { *count + 1.0 } else { 1.0 };
    }
    counts
}

/// L2 penalty of the hidden weight matrices, adding its gradient into 'grads' if given
fn l2_penalty(params: &GlobalNN, counts: &BTreeMap<Species, f64>, coefficients: &RegularizationCoefficients, policy: &RegularizationPolicy, mut grads: Option<&mut GlobalGrads>) -> Result<f64>
{
    let norm_factor: f64 = if policy.half_norm { 0.5 } else { 1.0 };
    let mut penalty: f64 = 0.0;
    for (species, count) in counts.iter()
    {
        let b: f64 = coefficients.get(species);
        if b == 0.0
        {
            continue
        }
        let net = params.get(species)?;
        for k in 0..net.n_hidden()
        {
            let w = &net.weights[k];
            let scale: f64 = if policy.scale_by_layer_width { 1.0 / w.ncols() as f64 } else { 1.0 };
            let factor: f64 = count * b * norm_factor * scale;
            penalty += factor * w.mapv(|x| x * x).sum();
            if let Some(grads) = grads.as_mut()
            {
                let species_grads = grads.get_mut(species).ok_or_else(|| NxcError::State(format!("no gradient allocated for species '{}'", species)))?;
                species_grads.weights[k].scaled_add(2.0 * factor, w);
            }
        }
    }
    Ok(penalty)
}





impl EnergyNetwork
{
    /// Train the network on the training partitions of its subnets
    ///
    /// # Parameters
    /// ```text
    /// options: the learning rate, number of steps, regularization, split, and loss multipliers
    /// report: the progress lines and the non-fatal numerical warnings
    /// ```
    pub fn train(&mut self, options: &TrainingOptions) -> Result<TrainingReport>
    {
        if !(options.train_valid_split > 0.0 && options.train_valid_split <= 1.0)
        {
            return Err(NxcError::Configuration(format!("train_valid_split should be in (0, 1], but it is {}", options.train_valid_split)));
        }
        let multipliers: Vec<f64> = match &options.multipliers
        {
            Some(m) if m.len() == self.subnets.len() => m.clone(),
            Some(m) => return Err(NxcError::Configuration(format!("{} loss multipliers for {} additive groups", m.len(), self.subnets.len()))),
            None => vec![1.0; self.subnets.len()],
        };
        info!("multipliers: {:?}", multipliers);



        // Data partition, the same for the subnets of a group
        let mut training_data: Vec<GroupData> = Vec::with_capacity(self.subnets.len());
        let mut validation_data: Vec<GroupData> = Vec::with_capacity(self.subnets.len());
        for group in self.subnets.iter()
        {
            let (train, valid): (GroupData, GroupData) = partition_group(group, options.train_valid_split)?;
            training_data.push(train);
            validation_data.push(valid);
        }
        let counts: BTreeMap<Species, f64> = penalty_counts(&self.subnets, &options.policy);



        // A restored optimizer keeps its moments
        let mut adam: GlobalAdam = match self.adam.take()
        {
            Some(mut adam) =>
            {
                adam.learning_rate = options.learning_rate;
                adam
            },
            None => GlobalAdam::new(&self.params, options.learning_rate),
        };

        // Specify the loss table file and output the header into it
        let mut loss_table: Option<(PathBuf, File)> = match &options.loss_table
        {
            Some(path) =>
            {
                let mut file: File = File::create(path).map_err(|err| error_file(path, err))?;
                file.write_all(b"  step          training_total        validation_total                 l2_loss\n").map_err(|err| error_file(path, err))?;
                Some((path.clone(), file))
            },
            None => None,
        };



        // Train the network iteratively
        let print_step: usize = (options.max_steps / N_PROGRESS_LINES).max(1);
        let mut report: TrainingReport = TrainingReport::default();
        for step in 0..options.max_steps
        {
            let mut grads: GlobalGrads = self.params.zero_grads();
            let mut cost: f64 = 0.0;
            for (data, multiplier) in training_data.iter().zip(multipliers.iter())
            {
                cost += multiplier * accumulate_group_gradient(&self.params, data, *multiplier, &mut grads)?;
            }
            cost += l2_penalty(&self.params, &counts, &options.regularization, &options.policy, Some(&mut grads))?;

            // Stop before a non-finite update reaches the parameters
            if !cost.is_finite()
            {
                let warning: NumericalWarning = NumericalWarning::NonFiniteLoss { step, loss: cost };
                warn!("{}", warning.message());
                report.warnings.push(warning);
                break
            }
            adam.update(&mut self.params, &grads)?;
            report.steps += 1;

            if (step % print_step) == 0
            {
                let line: ProgressLine = self.progress_line(step, &training_data, &validation_data, &multipliers, &counts, options)?;
                info!("step {}: training loss {:?} (total {:.8}), validation loss {:?} (total {:.8}), L2 loss {:.8}",
                    step, line.training_rmse, line.training_total, line.validation_rmse, line.validation_total, line.l2_loss);
                if let Some((path, file)) = loss_table.as_mut()
                {
                    file.write_all(format!("{:6} {:23.8} {:23.8} {:23.8}\n", step, line.training_total, line.validation_total, line.l2_loss).as_bytes())
                        .map_err(|err| error_file(path.as_path(), err))?;
                }
                if let Some(previous) = report.progress.last()
                {
                    if previous.validation_total > 0.0 && line.validation_total > DIVERGENCE_FACTOR * previous.validation_total
                    {
                        let warning: NumericalWarning = NumericalWarning::Divergence { step, previous: previous.validation_total, current: line.validation_total };
                        warn!("{}", warning.message());
                        report.warnings.push(warning);
                    }
                }
                report.progress.push(line);
            }
        }

        self.adam = Some(adam);
        Ok(report)
    }

    fn progress_line(&self, step: usize, training_data: &[GroupData], validation_data: &[GroupData], multipliers: &[f64], counts: &BTreeMap<Species, f64>, options: &TrainingOptions) -> Result<ProgressLine>
    {
        let mut training_mse: Vec<f64> = Vec::with_capacity(training_data.len());
        for data in training_data.iter()
        {
            training_mse.push(mean_squared_error(&group_prediction(&self.params, data)?, &data.targets));
        }
        let mut validation_mse: Vec<f64> = Vec::with_capacity(validation_data.len());
        for data in validation_data.iter()
        {
            validation_mse.push(mean_squared_error(&group_prediction(&self.params, data)?, &data.targets));
        }
        let weighted = |mse: &[f64]| -> f64 { mse.iter().zip(multipliers.iter()).map(|(e, m)| e * m).sum::<f64>().sqrt() };

        Ok(ProgressLine
        {
            step,
            training_total: weighted(&training_mse),
            training_rmse: training_mse.iter().map(|e| e.sqrt()).collect(),
            validation_total: weighted(&validation_mse),
            validation_rmse: validation_mse.iter().map(|e| e.sqrt()).collect(),
            l2_loss: l2_penalty(&self.params, counts, &options.regularization, &options.policy, None)?,
        })
    }
}





#[cfg(test)]
mod tests
{
    use super::*;
    use crate::nn::global_nn::Activation;
    use crate::nn::training_data::Dataset;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};
    use tempfile::tempdir;

    /// One group of an "A" and a "B" atom plus a second group of two "A" atoms
    fn network(seed: u64) -> EnergyNetwork
    {
        let subnet = |species: &str, data: Array3<f64>, targets: &Array1<f64>| -> Subnet
        {
            let mut subnet = Subnet::new(Species::new(species), 3, 2, Activation::Sigmoid);
            subnet.add_dataset(Dataset::new(Species::new(species), data), targets, 0.0).unwrap();
            subnet
        };
        let x: Array3<f64> = Array::from_shape_fn((6, 1, 2), |(i, _, k)| ((i + 1) as f64 * 0.3 + k as f64 * 0.1).sin());
        let y1: Array1<f64> = Array::from_shape_fn(6, |i| 0.5 + 0.1 * i as f64);
        let y2: Array1<f64> = Array::from_shape_fn(6, |i| -0.2 * i as f64);
        let group1 = vec![subnet("A", x.clone(), &y1), subnet("B", x.mapv(|v| v * v), &y1)];
        let group2 = vec![subnet("A", x.mapv(|v| v + 1.0), &y2), subnet("A", x.mapv(|v| -v), &y2)];
        EnergyNetwork::new(vec![group1, group2], Some(seed)).unwrap()
    }

    fn total_loss(network: &EnergyNetwork, multipliers: &[f64], options: &TrainingOptions) -> f64
    {
        let counts = penalty_counts(&network.subnets, &options.policy);
        let mut loss: f64 = l2_penalty(&network.params, &counts, &options.regularization, &options.policy, None).unwrap();
        for (group, m) in network.subnets.iter().zip(multipliers.iter())
        {
            let (data, _) = partition_group(group, 1.0).unwrap();
            loss += m * mean_squared_error(&group_prediction(&network.params, &data).unwrap(), &data.targets);
        }
        loss
    }

    #[test]
    fn loss_gradient_matches_finite_differences()
    {
        let network = network(1);
        let options = TrainingOptions { regularization: RegularizationCoefficients::uniform(0.3).with_species("B", 0.7), ..TrainingOptions::default() };
        let multipliers = [1.0, 2.5];

        let counts = penalty_counts(&network.subnets, &options.policy);
        let mut grads = network.params.zero_grads();
        for (group, m) in network.subnets.iter().zip(multipliers.iter())
        {
            let (data, _) = partition_group(group, 1.0).unwrap();
            accumulate_group_gradient(&network.params, &data, *m, &mut grads).unwrap();
        }
        l2_penalty(&network.params, &counts, &options.regularization, &options.policy, Some(&mut grads)).unwrap();

        let eps: f64 = 1e-6;
        for (species, species_grads) in grads.iter()
        {
            for k in 0..species_grads.weights.len()
            {
                for ((i, j), analytic) in species_grads.weights[k].indexed_iter()
                {
                    let mut plus = network.clone();
                    let mut minus = network.clone();
                    plus.params.nets.get_mut(species).unwrap().weights[k][[i, j]] += eps;
                    minus.params.nets.get_mut(species).unwrap().weights[k][[i, j]] -= eps;
                    let numeric: f64 = (total_loss(&plus, &multipliers, &options) - total_loss(&minus, &multipliers, &options)) / (2.0 * eps);
                    assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn l2_penalty_counts_hidden_layers_per_subnet()
    {
        let network = network(2);
        let coefficients = RegularizationCoefficients::uniform(0.5);
        let policy = RegularizationPolicy::default();
        let counts = penalty_counts(&network.subnets, &policy);
        assert_eq!(counts[&Species::new("A")], 3.0);
        assert_eq!(counts[&Species::new("B")], 1.0);

        let mut expected: f64 = 0.0;
        for (species, count) in counts.iter()
        {
            let net = &network.params.nets[species];
            for k in 0..2
            {
                expected += count * 0.5 * 0.5 * net.weights[k].mapv(|x| x * x).sum() / 3.0;
            }
        }
        let penalty = l2_penalty(&network.params, &counts, &coefficients, &policy, None).unwrap();
        assert_abs_diff_eq!(penalty, expected, epsilon = 1e-12);

        let once = RegularizationPolicy { per_subnet: false, half_norm: false, scale_by_layer_width: false };
        let counts_once = penalty_counts(&network.subnets, &once);
        assert_eq!(counts_once[&Species::new("A")], 1.0);
        assert!(l2_penalty(&network.params, &counts_once, &coefficients, &once, None).unwrap() > 0.0);
    }

    #[test]
    fn training_reduces_the_loss_and_is_deterministic()
    {
        let options = TrainingOptions { learning_rate: 0.02, max_steps: 200, train_valid_split: 1.0, ..TrainingOptions::default() };
        let mut first = network(3);
        let before: f64 = total_loss(&first, &[1.0, 1.0], &options);
        let report = first.train(&options).unwrap();
        assert_eq!(report.steps, 200);
        assert_eq!(report.progress.len(), N_PROGRESS_LINES);
        assert!(report.warnings.is_empty());
        assert!(total_loss(&first, &[1.0, 1.0], &options) < before);

        let mut second = network(3);
        second.train(&options).unwrap();
        assert_eq!(first.params, second.params);
    }

    #[test]
    fn full_split_validates_on_the_training_set()
    {
        let options = TrainingOptions { max_steps: 3, train_valid_split: 1.0, ..TrainingOptions::default() };
        let report = network(4).train(&options).unwrap();
        for line in report.progress.iter()
        {
            assert_eq!(line.training_total, line.validation_total);
        }

        let options = TrainingOptions { max_steps: 3, train_valid_split: 0.5, ..TrainingOptions::default() };
        let report = network(4).train(&options).unwrap();
        assert_ne!(report.progress[0].training_total, report.progress[0].validation_total);
    }

    #[test]
    fn non_finite_loss_stops_training_with_a_warning()
    {
        let mut network = network(5);
        network.params.nets.get_mut(&Species::new("B")).unwrap().weights[0][[0, 0]] = f64::NAN;
        let report = network.train(&TrainingOptions { max_steps: 10, ..TrainingOptions::default() }).unwrap();
        assert_eq!(report.steps, 0);
        assert!(matches!(report.warnings[0], NumericalWarning::NonFiniteLoss { step: 0, .. }));
    }

    #[test]
    fn invalid_options_are_configuration_errors()
    {
        let bad_multipliers = TrainingOptions { max_steps: 1, multipliers: Some(vec![1.0]), ..TrainingOptions::default() };
        assert!(matches!(network(6).train(&bad_multipliers), Err(NxcError::Configuration(_))));
        let bad_split = TrainingOptions { max_steps: 1, train_valid_split: 0.0, ..TrainingOptions::default() };
        assert!(matches!(network(6).train(&bad_split), Err(NxcError::Configuration(_))));
    }

    #[test]
    fn progress_is_written_to_the_loss_table()
    {
        let dir = tempdir().unwrap();
        let path = dir.path().join("training.out");
        let options = TrainingOptions { max_steps: 20, train_valid_split: 1.0, loss_table: Some(path.clone()), ..TrainingOptions::default() };
        network(7).train(&options).unwrap();
        let table: String = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 1 + N_PROGRESS_LINES);
        assert!(lines[0].contains("validation_total"));
        assert!(lines[2].trim_start().starts_with('2'));
    }

    #[test]
    fn per_species_coefficients_fall_back_to_the_default()
    {
        let b = RegularizationCoefficients::uniform(0.1).with_species("O", 0.4);
        assert_eq!(b.get(&Species::new("O")), 0.4);
        assert_eq!(b.get(&Species::new("H")), 0.1);
        assert_eq!(array![b.get(&Species::new("C"))], array![0.1]);
    }
}
