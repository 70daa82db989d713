//! Initialization, evaluation, optimization, saving, and loading of the per-species neural networks
use crate::common::constants::{ADAM_BETA1, ADAM_BETA2, ADAM_EPS, CHECKPOINT_VERSION, TRUNCATION};
use crate::common::error::*;
use crate::descriptor::basis::Species;
use crate::matrix::truncated_normal;
use crate::nn::training_data::Subnet;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use log::debug;
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Dimension, Zip};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand_distr::Normal;
use serde::{Serialize, Deserialize};





/// Nonlinearity of the hidden layers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation
{
    /// Logistic sigmoid 1 / (1 + exp(-x))
    #[default]
    Sigmoid,
    Tanh,
}





impl Activation
{
    pub fn name(&self) -> &'static str
    {
        match self
        {
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
        }
    }

    pub fn from_name(name: &str) -> Result<Self>
    {
        match name.to_lowercase().as_str()
        {
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(NxcError::Configuration(format!("unknown activation '{}'", name))),
        }
    }

    fn apply(&self, z: Array2<f64>) -> Array2<f64>
    {
        match self
        {
            Activation::Sigmoid => z.mapv_into(|x| 1.0 / (1.0 + (-x).exp())),
            Activation::Tanh => z.mapv_into(f64::tanh),
        }
    }

    /// Derivative expressed through the activation output 'a'
    fn derivative(&self, a: &Array2<f64>) -> Array2<f64>
    {
        match self
        {
            Activation::Sigmoid => a.mapv(|y| y * (1.0 - y)),
            Activation::Tanh => a.mapv(|y| 1.0 - y * y),
        }
    }
}





/// The layer outputs of a forward pass, kept for the backward pass
///
/// # Fields
/// ```text
/// layers: the input followed by the output of every hidden layer, (n_rows, width)
/// output: the network output, one value per row
/// ```
#[derive(Clone, Debug)]
pub struct ForwardCache
{
    pub layers: Vec<Array2<f64>>,
    pub output: Array1<f64>,
}





/// The parameter block shared by all the atoms of one species
///
/// # Fields
/// ```text
/// weights: W1, ..., Wn+1 where Wk has shape (input width, output width) and Wn+1 is the linear output layer
/// biases: b1, ..., bn+1
/// activations: the activation of each hidden layer (n entries)
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SpeciesNet
{
    pub weights: Vec<Array2<f64>>,
    pub biases: Vec<Array1<f64>>,
    pub activations: Vec<Activation>,
}





impl SpeciesNet
{
    /// Build a randomly initialized network
    ///
    /// # Parameters
    /// ```text
    /// n_features: the length of the input descriptor
    /// layers: the widths of the hidden layers
    /// activations: the activations of the hidden layers
    /// mean: the initial output bias
    /// std: the standard deviation of the output weights. Hidden weights follow a unit normal truncated at TRUNCATION, hidden biases are zero
    /// rng: the random number generator
    /// ```
    pub fn new<R: Rng + ?Sized>(n_features: usize, layers: &[usize], activations: &[Activation], mean: f64, std: f64, rng: &mut R) -> Result<Self>
    {
        if layers.len() != activations.len()
        {
            return Err(NxcError::Configuration(format!("{} hidden layers but {} activations", layers.len(), activations.len())));
        }

        let mut weights: Vec<Array2<f64>> = Vec::with_capacity(layers.len() + 1);
        let mut biases: Vec<Array1<f64>> = Vec::with_capacity(layers.len() + 1);
        let mut n_in: usize = n_features;
        for &width in layers.iter()
        {
            weights.push(truncated_normal((n_in, width), 1.0, TRUNCATION, rng));
            biases.push(Array1::zeros(width));
            n_in = width;
        }

        let output_dist: Normal<f64> = Normal::new(0.0, std.abs())
            .map_err(|err| NxcError::Numerical(format!("cannot initialize the output layer with standard deviation {}: {}", std, err)))?;
        weights.push(Array2::random_using((n_in, 1), output_dist, rng));
        biases.push(Array1::from_elem(1, mean));

        Ok(SpeciesNet { weights, biases, activations: activations.to_vec() })
    }

    pub fn n_hidden(&self) -> usize
    {
        self.activations.len()
    }

    pub fn n_features(&self) -> usize
    {
        self.weights.first().map(|w| w.nrows()).unwrap_or(0)
    }

    pub fn layer_shapes(&self) -> Vec<(usize, usize)>
    {
        self.weights.iter().map(|w| w.dim()).collect()
    }

    /// Widths of the hidden layers
    pub fn hidden_widths(&self) -> Vec<usize>
    {
        self.weights[..self.n_hidden()].iter().map(|w| w.ncols()).collect()
    }

    fn check_input(&self, x: &ArrayView2<f64>) -> Result<()>
    {
        if x.ncols() != self.n_features()
        {
            return Err(error_shape("network input", &[x.nrows(), self.n_features()], x.shape()));
        }
        Ok(())
    }





    /// Evaluate the network on every row of 'x' (n_rows, n_features), keeping the layer outputs
    pub fn forward(&self, x: ArrayView2<f64>) -> Result<ForwardCache>
    {
        self.check_input(&x)?;
        let n_hidden: usize = self.n_hidden();
        let mut layers: Vec<Array2<f64>> = Vec::with_capacity(n_hidden + 1);
        layers.push(x.to_owned());
        for k in 0..n_hidden
        {
            let z: Array2<f64> = layers[k].dot(&self.weights[k]) + &self.biases[k];
            layers.push(self.activations[k].apply(z));
        }
        let output: Array2<f64> = layers[n_hidden].dot(&self.weights[n_hidden]) + &self.biases[n_hidden];
        Ok(ForwardCache { layers, output: output.column(0).to_owned() })
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>>
    {
        Ok(self.forward(x)?.output)
    }





    /// Chain rule through the network
    ///
    /// # Parameters
    /// ```text
    /// cache: the forward pass
    /// d_output: dLoss/d(output), one value per row
    /// grads: dLoss/d(parameters), summed over the rows
    /// d_input: dLoss/d(input), (n_rows, n_features)
    /// ```
    pub fn backward(&self, cache: &ForwardCache, d_output: ArrayView1<f64>) -> (SpeciesGrads, Array2<f64>)
    {
        let n_hidden: usize = self.n_hidden();
        let mut grads: SpeciesGrads = SpeciesGrads::zeros_like(self);
        let mut delta: Array2<f64> = d_output.to_owned().insert_axis(Axis(1));
        for k in (0..=n_hidden).rev()
        {
            if k < n_hidden
            {
                delta = delta * self.activations[k].derivative(&cache.layers[k + 1]);
            }
            grads.weights[k] = cache.layers[k].t().dot(&delta);
            grads.biases[k] = delta.sum_axis(Axis(0));
            delta = delta.dot(&self.weights[k].t());
        }
        (grads, delta)
    }

    /// d(output)/d(input) for every row of 'x'
    pub fn input_gradient(&self, x: ArrayView2<f64>) -> Result<Array2<f64>>
    {
        let cache: ForwardCache = self.forward(x)?;
        let ones: Array1<f64> = Array1::ones(cache.output.len());
        Ok(self.backward(&cache, ones.view()).1)
    }

    /// The first non-finite parameter, if any
    fn non_finite_parameter(&self) -> Option<String>
    {
        for k in 0..self.weights.len()
        {
            if self.weights[k].iter().any(|x| !x.is_finite())
            {
                return Some(format!("W{}", k + 1))
            }
            if self.biases[k].iter().any(|x| !x.is_finite())
            {
                return Some(format!("b{}", k + 1))
            }
        }
        None
    }
}





/// Gradients (or Adam moments) with the layout of a SpeciesNet
#[derive(Clone, Debug, PartialEq)]
pub struct SpeciesGrads
{
    pub weights: Vec<Array2<f64>>,
    pub biases: Vec<Array1<f64>>,
}





impl SpeciesGrads
{
    pub fn zeros_like(net: &SpeciesNet) -> Self
    {
        SpeciesGrads
        {
            weights: net.weights.iter().map(|w| Array2::zeros(w.raw_dim())).collect(),
            biases: net.biases.iter().map(|b| Array1::zeros(b.raw_dim())).collect(),
        }
    }

    pub fn add_assign(&mut self, other: &SpeciesGrads)
    {
        for (a, b) in self.weights.iter_mut().zip(other.weights.iter())
        {
            *a += b;
        }
        for (a, b) in self.biases.iter_mut().zip(other.biases.iter())
        {
            *a += b;
        }
    }

    fn shapes_match(&self, net: &SpeciesNet) -> bool
    {
        (self.weights.len() == net.weights.len())
            && self.weights.iter().zip(net.weights.iter()).all(|(a, b)| a.dim() == b.dim())
            && self.biases.iter().zip(net.biases.iter()).all(|(a, b)| a.dim() == b.dim())
    }
}





pub type GlobalGrads = BTreeMap<Species, SpeciesGrads>;





/// The parameter store: one SpeciesNet per species, addressed as "{species}/W{k}" and "{species}/b{k}"
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalNN
{
    pub nets: BTreeMap<Species, SpeciesNet>,
}





impl GlobalNN
{
    pub fn new() -> Self
    {
        GlobalNN { nets: BTreeMap::new() }
    }

    pub fn get(&self, species: &Species) -> Result<&SpeciesNet>
    {
        self.nets.get(species).ok_or_else(|| NxcError::Configuration(format!("no network parameters for species '{}'", species)))
    }

    pub fn contains(&self, species: &Species) -> bool
    {
        self.nets.contains_key(species)
    }

    /// Names of all the parameter tensors
    pub fn parameter_names(&self) -> Vec<String>
    {
        let mut names: Vec<String> = Vec::new();
        for (species, net) in self.nets.iter()
        {
            for k in 1..=net.weights.len()
            {
                names.push(format!("{}/W{}", species, k));
                names.push(format!("{}/b{}", species, k));
            }
        }
        names
    }

    /// Allocate zero gradients for all the species networks
    pub fn zero_grads(&self) -> GlobalGrads
    {
        self.nets.iter().map(|(species, net)| (species.clone(), SpeciesGrads::zeros_like(net))).collect()
    }

    /// Numerical error naming the first non-finite parameter
    pub fn check_finite(&self) -> Result<()>
    {
        for (species, net) in self.nets.iter()
        {
            if let Some(name) = net.non_finite_parameter()
            {
                return Err(NxcError::Numerical(format!("parameter '{}/{}' is not finite", species, name)));
            }
        }
        Ok(())
    }
}





/// The Adam optimizer for the whole parameter store
///
/// # Fields
/// ```text
/// learning_rate: the step size
/// step: the number of updates done so far
/// m, v: the first and second moment estimates of every species
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalAdam
{
    pub learning_rate: f64,
    pub step: u64,
    m: GlobalGrads,
    v: GlobalGrads,
}





impl GlobalAdam
{
    pub fn new(global_nn: &GlobalNN, learning_rate: f64) -> Self
    {
        GlobalAdam { learning_rate, step: 0, m: global_nn.zero_grads(), v: global_nn.zero_grads() }
    }

    /// Update all the parameters of the store using the input gradients
    pub fn update(&mut self, global_nn: &mut GlobalNN, grads: &GlobalGrads) -> Result<()>
    {
        self.step += 1;
        let t: i32 = self.step.min(i32::MAX as u64) as i32;
        let correction1: f64 = 1.0 - ADAM_BETA1.powi(t);
        let correction2: f64 = 1.0 - ADAM_BETA2.powi(t);
        let lr: f64 = self.learning_rate;

        for (species, grad) in grads.iter()
        {
            let net: &mut SpeciesNet = global_nn.nets.get_mut(species)
                .ok_or_else(|| NxcError::State(format!("gradient for species '{}' which has no parameters", species)))?;
            let m: &mut SpeciesGrads = self.m.entry(species.clone()).or_insert_with(|| SpeciesGrads::zeros_like(net));
            let v: &mut SpeciesGrads = self.v.entry(species.clone()).or_insert_with(|| SpeciesGrads::zeros_like(net));
            for k in 0..net.weights.len()
            {
                adam_step(&mut net.weights[k], &grad.weights[k], &mut m.weights[k], &mut v.weights[k], lr, correction1, correction2);
                adam_step(&mut net.biases[k], &grad.biases[k], &mut m.biases[k], &mut v.biases[k], lr, correction1, correction2);
            }
        }
        Ok(())
    }
}

fn adam_step<D: Dimension>(param: &mut Array<f64, D>, grad: &Array<f64, D>, m: &mut Array<f64, D>, v: &mut Array<f64, D>, lr: f64, correction1: f64, correction2: f64)
{
    Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v|
    {
        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
        *p -= lr * (*m / correction1) / ((*v / correction2).sqrt() + ADAM_EPS);
    });
}





// The binary checkpoint: every tensor is stored by name with its shape.
// The derive expands to savefile's own two-parameter results, so the crate alias stays out of this module.
mod records
{
    use savefile_derive::Savefile;

    #[derive(Debug, Savefile)]
    pub(super) struct TensorRecord
    {
        pub(super) name: String,
        pub(super) shape: Vec<u64>,
        pub(super) data: Vec<f64>,
    }

    #[derive(Debug, Savefile)]
    pub(super) struct SpeciesRecord
    {
        pub(super) species: String,
        pub(super) activations: Vec<String>,
        pub(super) params: Vec<TensorRecord>,
        pub(super) adam_m: Vec<TensorRecord>,
        pub(super) adam_v: Vec<TensorRecord>,
    }

    #[derive(Debug, Savefile)]
    pub(super) struct NetworkCheckpoint
    {
        pub(super) species: Vec<SpeciesRecord>,
        pub(super) has_adam: bool,
        pub(super) adam_step: u64,
        pub(super) learning_rate: f64,
    }
}

use self::records::{NetworkCheckpoint, SpeciesRecord, TensorRecord};





fn tensor_records(species: &Species, block: &SpeciesGrads) -> Vec<TensorRecord>
{
    let mut records: Vec<TensorRecord> = Vec::with_capacity(2 * block.weights.len());
    for (k, (w, b)) in block.weights.iter().zip(block.biases.iter()).enumerate()
    {
        records.push(TensorRecord { name: format!("{}/W{}", species, k + 1), shape: w.shape().iter().map(|x| *x as u64).collect(), data: w.iter().copied().collect() });
        records.push(TensorRecord { name: format!("{}/b{}", species, k + 1), shape: b.shape().iter().map(|x| *x as u64).collect(), data: b.iter().copied().collect() });
    }
    records
}

/// Decode "{species}/W{k}", "{species}/b{k}" records into a parameter-shaped block
fn block_from_records(species: &str, records: Vec<TensorRecord>) -> Result<SpeciesGrads>
{
    if records.len() % 2 != 0
    {
        return Err(NxcError::Checkpoint(format!("species '{}' has an odd number of tensors", species)));
    }
    let n_layers: usize = records.len() / 2;
    let mut weights: Vec<Array2<f64>> = Vec::with_capacity(n_layers);
    let mut biases: Vec<Array1<f64>> = Vec::with_capacity(n_layers);
    for (i, record) in records.into_iter().enumerate()
    {
        let (kind, k): (&str, usize) = if i % 2 == 0 { ("W", i / 2 + 1) } else { ("b", i / 2 + 1) };
        let name: String = format!("{}/{}{}", species, kind, k);
        if record.name != name
        {
            return Err(NxcError::Checkpoint(format!("expected tensor '{}', found '{}'", name, record.name)));
        }
        let shape: Vec<usize> = record.shape.iter().map(|x| *x as usize).collect();
        let malformed = |err: ndarray::ShapeError| NxcError::Checkpoint(format!("tensor '{}' with shape {:?}: {}", name, shape, err));
        match (kind, shape.as_slice())
        {
            ("W", &[rows, cols]) => weights.push(Array2::from_shape_vec((rows, cols), record.data).map_err(malformed)?),
            ("b", &[len]) => biases.push(Array1::from_shape_vec(len, record.data).map_err(malformed)?),
            _ => return Err(NxcError::Checkpoint(format!("tensor '{}' has invalid rank {}", name, shape.len()))),
        }
    }

    // Consecutive layers must chain
    for k in 0..n_layers
    {
        let chained: bool = (k == 0) || (weights[k - 1].ncols() == weights[k].nrows());
        if !chained || (biases[k].len() != weights[k].ncols())
        {
            return Err(NxcError::Checkpoint(format!("layer {} of species '{}' does not chain with its neighbours", k + 1, species)));
        }
    }
    Ok(SpeciesGrads { weights, biases })
}





/// The whole energy network: the subnet topology (outer list of additive groups) and the shared parameter store
///
/// # Fields
/// ```text
/// subnets: the independent training tasks, each an additive group of subnets
/// params: one parameter block per species
/// adam: the optimizer state, present after training or after restoring a trained checkpoint
/// ```
#[derive(Clone, Debug)]
pub struct EnergyNetwork
{
    pub subnets: Vec<Vec<Subnet>>,
    pub params: GlobalNN,
    pub adam: Option<GlobalAdam>,
}





impl EnergyNetwork
{
    /// Construct the parameter store for the subnets; the first subnet of a species initializes its block, the others share it
    ///
    /// # Parameters
    /// ```text
    /// subnets: the additive groups
    /// random_seed: seed of the weight initialization (entropy if None)
    /// ```
    pub fn new(subnets: Vec<Vec<Subnet>>, random_seed: Option<u64>) -> Result<Self>
    {
        let mut rng: StdRng = match random_seed
        {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut params: GlobalNN = GlobalNN::new();
        for group in subnets.iter()
        {
            let n_atoms: f64 = group.iter().map(|subnet| subnet.n_copies).sum::<usize>().max(1) as f64;
            for subnet in group.iter()
            {
                match params.nets.get(&subnet.species)
                {
                    Some(net) =>
                    {
                        if (net.n_features() != subnet.n_features) || (net.hidden_widths() != subnet.layers) || (net.activations != subnet.activations)
                        {
                            return Err(NxcError::Configuration(format!("subnets of species '{}' disagree on their input length or layers", subnet.species)));
                        }
                    },
                    None =>
                    {
                        let net: SpeciesNet = SpeciesNet::new(subnet.n_features, &subnet.layers, &subnet.activations, subnet.target_mean / n_atoms, subnet.target_std / n_atoms, &mut rng)?;
                        debug!("initialized network of species '{}' with layer shapes {:?}", subnet.species, net.layer_shapes());
                        params.nets.insert(subnet.species.clone(), net);
                    },
                }
            }
        }

        Ok(EnergyNetwork { subnets, params, adam: None })
    }

    /// The species used by the subnet topology
    pub fn topology_species(&self) -> BTreeSet<Species>
    {
        self.subnets.iter().flatten().map(|subnet| subnet.species.clone()).collect()
    }

    /// Atomic energies of species 'species' for every row of 'x'
    pub fn predict(&self, species: &Species, x: ArrayView2<f64>) -> Result<Array1<f64>>
    {
        self.params.get(species)?.predict(x)
    }

    /// Gradient of the atomic energy w.r.t. the descriptor for every row of 'x'
    pub fn get_gradient(&self, species: &Species, x: ArrayView2<f64>) -> Result<Array2<f64>>
    {
        self.params.get(species)?.input_gradient(x)
    }





    /// Save the parameters and the optimizer state into a binary checkpoint
    pub fn save_checkpoint(&self, path: &Path) -> Result<()>
    {
        self.params.check_finite()?;

        let mut species: Vec<SpeciesRecord> = Vec::with_capacity(self.params.nets.len());
        for (name, net) in self.params.nets.iter()
        {
            let params: SpeciesGrads = SpeciesGrads { weights: net.weights.clone(), biases: net.biases.clone() };
            let (adam_m, adam_v): (Vec<TensorRecord>, Vec<TensorRecord>) = match &self.adam
            {
                Some(adam) => match (adam.m.get(name), adam.v.get(name))
                {
                    (Some(m), Some(v)) => (tensor_records(name, m), tensor_records(name, v)),
                    _ => (Vec::new(), Vec::new()),
                },
                None => (Vec::new(), Vec::new()),
            };
            species.push
            (
                SpeciesRecord
                {
                    species: name.as_str().to_string(),
                    activations: net.activations.iter().map(|a| a.name().to_string()).collect(),
                    params: tensor_records(name, &params),
                    adam_m,
                    adam_v,
                }
            );
        }

        let checkpoint: NetworkCheckpoint = NetworkCheckpoint
        {
            species,
            has_adam: self.adam.is_some(),
            adam_step: self.adam.as_ref().map(|adam| adam.step).unwrap_or(0),
            learning_rate: self.adam.as_ref().map(|adam| adam.learning_rate).unwrap_or(0.0),
        };
        savefile::save_file(path, CHECKPOINT_VERSION, &checkpoint)
            .map_err(|err| NxcError::Checkpoint(format!("cannot write '{}': {:?}", path.display(), err)))?;
        debug!("saved network checkpoint '{}'", path.display());
        Ok(())
    }





    /// Restore the parameters (and the optimizer state) from a binary checkpoint
    ///
    /// Every species of the topology must be present with identical layer shapes and activations; extra species are loaded as well.
    pub fn restore_checkpoint(&mut self, path: &Path) -> Result<()>
    {
        let checkpoint: NetworkCheckpoint = savefile::load_file(path, CHECKPOINT_VERSION)
            .map_err(|err| NxcError::Checkpoint(format!("cannot read '{}': {:?}", path.display(), err)))?;

        let mut restored: GlobalNN = GlobalNN::new();
        let mut m: GlobalGrads = BTreeMap::new();
        let mut v: GlobalGrads = BTreeMap::new();
        for record in checkpoint.species.into_iter()
        {
            let block: SpeciesGrads = block_from_records(&record.species, record.params)?;
            let activations: Vec<Activation> = record.activations.iter().map(|a| Activation::from_name(a)).collect::<Result<Vec<Activation>>>()?;
            if (block.weights.is_empty()) || (activations.len() + 1 != block.weights.len())
            {
                return Err(NxcError::Checkpoint(format!("species '{}' has {} layers but {} activations", record.species, block.weights.len(), activations.len())));
            }
            let net: SpeciesNet = SpeciesNet { weights: block.weights, biases: block.biases, activations };
            let species: Species = Species::new(&record.species);
            if checkpoint.has_adam && !record.adam_m.is_empty()
            {
                let species_m: SpeciesGrads = block_from_records(&record.species, record.adam_m)?;
                let species_v: SpeciesGrads = block_from_records(&record.species, record.adam_v)?;
                if !species_m.shapes_match(&net) || !species_v.shapes_match(&net)
                {
                    return Err(NxcError::Checkpoint(format!("optimizer state of species '{}' does not match its parameters", species)));
                }
                m.insert(species.clone(), species_m);
                v.insert(species.clone(), species_v);
            }
            restored.nets.insert(species, net);
        }

        // The topology must be reproduced exactly
        for (species, net) in self.params.nets.iter()
        {
            let other: &SpeciesNet = restored.nets.get(species)
                .ok_or_else(|| NxcError::Configuration(format!("checkpoint '{}' has no network for species '{}'", path.display(), species)))?;
            if (other.layer_shapes() != net.layer_shapes()) || (other.activations != net.activations)
            {
                return Err(NxcError::Configuration(format!("checkpoint '{}': network of species '{}' has layers {:?} ({:?}), expected {:?} ({:?})",
                    path.display(), species, other.layer_shapes(), other.activations, net.layer_shapes(), net.activations)));
            }
        }

        self.adam = if checkpoint.has_adam
        {
            Some(GlobalAdam { learning_rate: checkpoint.learning_rate, step: checkpoint.adam_step, m, v })
        }
        else
        {
            None
        };
        self.params = restored;
        debug!("restored network checkpoint '{}'", path.display());
        Ok(())
    }
}





#[cfg(test)]
mod tests
{
    use super::*;
    use crate::nn::training_data::Dataset;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use tempfile::tempdir;

    fn net(seed: u64) -> SpeciesNet
    {
        let mut rng = StdRng::seed_from_u64(seed);
        SpeciesNet::new(3, &[4, 5], &[Activation::Sigmoid, Activation::Tanh], 0.5, 0.3, &mut rng).unwrap()
    }

    fn network(species: &[&str], n_nodes: usize, seed: u64) -> EnergyNetwork
    {
        let targets: Array1<f64> = array![1.0, 2.0, 3.0];
        let group: Vec<Subnet> = species.iter().map(|s|
        {
            let mut subnet = Subnet::new(Species::new(s), n_nodes, 2, Activation::Sigmoid);
            subnet.add_dataset(Dataset::new(Species::new(s), Array3::ones((3, 1, 2))), &targets, 0.0).unwrap();
            subnet
        }).collect();
        EnergyNetwork::new(vec![group], Some(seed)).unwrap()
    }

    #[test]
    fn layer_shapes_and_initial_output_layer()
    {
        let net = net(1);
        assert_eq!(net.layer_shapes(), vec![(3, 4), (4, 5), (5, 1)]);
        assert_eq!(net.biases[2], array![0.5]);
        assert!(net.biases[0].iter().all(|b| *b == 0.0));
        assert!(net.weights[0].iter().all(|w| w.abs() <= TRUNCATION));
    }

    #[test]
    fn parameter_and_input_gradients_match_finite_differences()
    {
        let net = net(2);
        let x: Array2<f64> = array![[0.1, -0.4, 0.7], [1.2, 0.3, -0.5]];
        let weights: Array1<f64> = array![0.7, -1.3];
        let loss = |n: &SpeciesNet, x: &Array2<f64>| -> f64 { (n.predict(x.view()).unwrap() * &weights).sum() };

        let cache = net.forward(x.view()).unwrap();
        let (grads, d_input) = net.backward(&cache, weights.view());
        let eps: f64 = 1e-6;

        for k in 0..net.weights.len()
        {
            for ((i, j), analytic) in grads.weights[k].indexed_iter()
            {
                let mut plus = net.clone();
                let mut minus = net.clone();
                plus.weights[k][[i, j]] += eps;
                minus.weights[k][[i, j]] -= eps;
                let numeric: f64 = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
                assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
            }
            for (i, analytic) in grads.biases[k].indexed_iter()
            {
                let mut plus = net.clone();
                let mut minus = net.clone();
                plus.biases[k][i] += eps;
                minus.biases[k][i] -= eps;
                let numeric: f64 = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
                assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
            }
        }

        for ((i, j), analytic) in d_input.indexed_iter()
        {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[[i, j]] += eps;
            minus[[i, j]] -= eps;
            let numeric: f64 = (loss(&net, &plus) - loss(&net, &minus)) / (2.0 * eps);
            assert_abs_diff_eq!(*analytic, numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn wrong_input_width_is_rejected()
    {
        assert!(matches!(net(3).predict(Array2::zeros((2, 4)).view()), Err(NxcError::Configuration(_))));
    }

    #[test]
    fn adam_moves_against_the_gradient()
    {
        let mut store = GlobalNN::new();
        store.nets.insert(Species::new("H"), net(4));
        let before = store.clone();
        let mut grads = store.zero_grads();
        grads.get_mut(&Species::new("H")).unwrap().biases[2][0] = 2.0;

        let mut adam = GlobalAdam::new(&store, 0.01);
        adam.update(&mut store, &grads).unwrap();
        let h = Species::new("H");
        assert_abs_diff_eq!(store.nets[&h].biases[2][0], before.nets[&h].biases[2][0] - 0.01, epsilon = 1e-6);
        assert_eq!(store.nets[&h].weights[0], before.nets[&h].weights[0]);
        assert_eq!(adam.step, 1);
    }

    #[test]
    fn parameter_names_follow_species_and_layer()
    {
        let network = network(&["H"], 4, 1);
        assert_eq!(network.params.parameter_names(), vec!["H/W1", "H/b1", "H/W2", "H/b2", "H/W3", "H/b3"]);
    }

    #[test]
    fn species_blocks_are_shared_within_a_group()
    {
        let network = network(&["H", "H", "O"], 4, 1);
        assert_eq!(network.params.nets.len(), 2);
        // mean 2 and std of [1, 2, 3] divided by the 3 atoms of the group
        assert_abs_diff_eq!(network.params.nets[&Species::new("H")].biases[2][0], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn checkpoint_round_trip_restores_parameters_and_optimizer()
    {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.ckpt");

        let mut trained = network(&["H", "O"], 4, 1);
        let mut adam = GlobalAdam::new(&trained.params, 0.05);
        let mut grads = trained.params.zero_grads();
        grads.get_mut(&Species::new("O")).unwrap().weights[0].fill(0.3);
        adam.update(&mut trained.params, &grads).unwrap();
        trained.adam = Some(adam);
        trained.save_checkpoint(&path).unwrap();

        let mut fresh = network(&["H", "O"], 4, 99);
        assert_ne!(fresh.params, trained.params);
        fresh.restore_checkpoint(&path).unwrap();
        assert_eq!(fresh.params, trained.params);
        assert_eq!(fresh.adam, trained.adam);
    }

    #[test]
    fn checkpoint_with_a_different_topology_is_rejected()
    {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.ckpt");
        network(&["H"], 4, 1).save_checkpoint(&path).unwrap();

        let mut wider = network(&["H"], 6, 1);
        assert!(matches!(wider.restore_checkpoint(&path), Err(NxcError::Configuration(_))));
        let mut other_species = network(&["O"], 4, 1);
        assert!(matches!(other_species.restore_checkpoint(&path), Err(NxcError::Configuration(_))));
        // A subset of the checkpoint species is fine
        let mut two = network(&["H", "O"], 4, 1);
        two.save_checkpoint(&path).unwrap();
        let mut subset = network(&["O"], 4, 5);
        subset.restore_checkpoint(&path).unwrap();
        assert!(subset.params.contains(&Species::new("H")));
    }

    #[test]
    fn non_finite_parameters_are_not_saved()
    {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.ckpt");
        let mut network = network(&["H"], 4, 1);
        network.params.nets.get_mut(&Species::new("H")).unwrap().weights[1][[0, 0]] = f64::NAN;
        assert!(matches!(network.save_checkpoint(&path), Err(NxcError::Numerical(_))));
        assert!(!path.exists());
    }
}
