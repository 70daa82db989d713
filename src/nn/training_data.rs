//! A subnetwork bound to one (species, dataset) pair, and the data partitions used in training
use crate::common::constants::DEFAULT_SPLIT_SEED;
use crate::common::error::*;
use crate::descriptor::basis::Species;
use crate::nn::global_nn::Activation;
use ndarray::{Array1, Array3, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::seq::SliceRandom;





/// The descriptors of one species in one system: (n_samples, n_copies, n_features)
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset
{
    pub species: Species,
    pub data: Array3<f64>,
}





impl Dataset
{
    pub fn new(species: Species, data: Array3<f64>) -> Self
    {
        Dataset { species, data }
    }
}





/// Split 'n' sample indices into (kept, held-out) parts, the held-out part containing ceil(held_out_fraction * n) samples
///
/// # Parameters
/// ```text
/// n: the number of samples
/// held_out_fraction: fraction of the samples in the held-out part, in [0, 1)
/// seed: seed of the shuffle. The same (n, fraction, seed) always gives the same partition, which keeps the subnets of an additive group aligned
/// shuffle: if false, the held-out part is the tail of the samples
/// ```
pub fn split_indices(n: usize, held_out_fraction: f64, seed: u64, shuffle: bool) -> Result<(Vec<usize>, Vec<usize>)>
{
    if !(0.0..1.0).contains(&held_out_fraction)
    {
        return Err(NxcError::Configuration(format!("the held-out fraction should be in [0, 1), but it is {}", held_out_fraction)));
    }
    let n_held_out: usize = (held_out_fraction * n as f64).ceil() as usize;
    if n_held_out >= n && n > 0
    {
        return Err(NxcError::Configuration(format!("holding out {} of {} samples leaves no sample for training", n_held_out, n)));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    if shuffle
    {
        let mut rng: StdRng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
    }
    let held_out: Vec<usize> = indices.split_off(n - n_held_out);
    Ok((indices, held_out))
}





/// One feed-forward subnetwork, evaluated on the descriptors of one atom (copy) of one species
///
/// # Fields
/// ```text
/// species: the species, which selects the shared parameter block
/// layers: the widths of the hidden layers
/// activations: the activation of every hidden layer
/// n_copies: the number of descriptor copies summed by this subnet
/// n_features: the length of the input descriptor
/// x_train, y_train: the training partition (n_train, n_copies, n_features) and its targets
/// x_test, y_test: the held-out test partition and its targets
/// target_mean, target_std: statistics of all the targets given to 'add_dataset', used for initialization
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Subnet
{
    pub species: Species,
    pub layers: Vec<usize>,
    pub activations: Vec<Activation>,
    pub n_copies: usize,
    pub n_features: usize,
    pub x_train: Array3<f64>,
    pub y_train: Array1<f64>,
    pub x_test: Array3<f64>,
    pub y_test: Array1<f64>,
    pub target_mean: f64,
    pub target_std: f64,
}





impl Subnet
{
    /// An empty subnet with 'n_layers' hidden layers of 'n_nodes' units
    pub fn new(species: Species, n_nodes: usize, n_layers: usize, activation: Activation) -> Self
    {
        Subnet
        {
            species,
            layers: vec![n_nodes; n_layers],
            activations: vec![activation; n_layers],
            n_copies: 0,
            n_features: 0,
            x_train: Array3::zeros((0, 0, 0)),
            y_train: Array1::zeros(0),
            x_test: Array3::zeros((0, 0, 0)),
            y_test: Array1::zeros(0),
            target_mean: 0.0,
            target_std: 1.0,
        }
    }





    /// Attach a dataset, holding out 'test_size' of the samples as the test partition
    ///
    /// # Parameters
    /// ```text
    /// dataset: the descriptors, whose species must be the subnet's species
    /// targets: one target per sample
    /// test_size: the held-out fraction. 0 keeps every sample for training, and the test partition is a copy of it
    /// ```
    pub fn add_dataset(&mut self, dataset: Dataset, targets: &Array1<f64>, test_size: f64) -> Result<()>
    {
        if dataset.species != self.species
        {
            return Err(NxcError::Configuration(format!("dataset species '{}' does not match subnet species '{}'", dataset.species, self.species)));
        }
        let (n_samples, n_copies, n_features): (usize, usize, usize) = dataset.data.dim();
        if n_samples == 0
        {
            return Err(NxcError::Configuration(format!("dataset of species '{}' has no samples", dataset.species)));
        }
        if n_samples != targets.len()
        {
            return Err(error_shape("targets", &[n_samples], targets.shape()));
        }
        if (self.n_copies != 0) && (self.n_copies != n_copies)
        {
            return Err(NxcError::Configuration(format!("new dataset has {} copies, the subnet {}", n_copies, self.n_copies)));
        }

        self.n_copies = n_copies;
        self.n_features = n_features;
        self.target_mean = targets.mean().unwrap_or(0.0);
        self.target_std = targets.std(0.0);

        if test_size == 0.0
        {
            self.x_train = dataset.data;
            self.y_train = targets.clone();
            self.x_test = self.x_train.clone();
            self.y_test = self.y_train.clone();
        }
        else
        {
            let (train, test): (Vec<usize>, Vec<usize>) = split_indices(n_samples, test_size, DEFAULT_SPLIT_SEED, true)?;
            self.x_train = dataset.data.select(Axis(0), &train);
            self.y_train = targets.select(Axis(0), &train);
            self.x_test = dataset.data.select(Axis(0), &test);
            self.y_test = targets.select(Axis(0), &test);
        }
        Ok(())
    }

    pub fn n_train(&self) -> usize
    {
        self.y_train.len()
    }
}
