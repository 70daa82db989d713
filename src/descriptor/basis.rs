//! Species labels, the per-species basis metadata, and the species-grouped containers built on them
use crate::common::error::*;
use std::collections::BTreeMap;
use std::fmt;
use ndarray::{Array1, Array3};
use serde::{Serialize, Deserialize};





/// Label of a chemical species (e.g. "H", "O"). The valid labels are the ones declared by the Basis.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Species(pub String);

impl Species
{
    pub fn new(label: &str) -> Self
    {
        Species(label.to_string())
    }

    pub fn as_str(&self) -> &str
    {
        &self.0
    }
}

impl fmt::Display for Species
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Species
{
    fn from(label: &str) -> Self
    {
        Species::new(label)
    }
}





/// Basis metadata of one species
///
/// # Fields
/// ```text
/// n: the number of radial functions
/// l: the number of angular channels (not the maximum angular momentum, e.g. l = 1 means s only)
/// r_o: the cutoff radius of the radial functions
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeciesBasis
{
    pub n: usize,
    pub l: usize,
    #[serde(default)]
    pub r_o: f64,
}





impl SpeciesBasis
{
    pub fn new(n: usize, l: usize, r_o: f64) -> Self
    {
        SpeciesBasis { n, l, r_o }
    }

    /// Length of a raw coefficient vector: n * sum(2l+1) over the angular channels
    pub fn feature_len(&self) -> usize
    {
        self.n * (0..self.l).map(|l| 2 * l + 1).sum::<usize>()
    }

    /// Length of the invariant descriptor: one scalar per (radial, angular) pair
    pub fn invariant_len(&self) -> usize
    {
        self.n * self.l
    }

    /// The (n, l) blocks of a raw coefficient vector in storage order, as (n, l, start, length)
    pub fn blocks(&self) -> Vec<(usize, usize, usize, usize)>
    {
        let mut blocks: Vec<(usize, usize, usize, usize)> = Vec::with_capacity(self.invariant_len());
        let mut start: usize = 0;
        for n in 0..self.n
        {
            for l in 0..self.l
            {
                blocks.push((n, l, start, 2 * l + 1));
                start += 2 * l + 1;
            }
        }
        blocks
    }
}





/// Basis metadata of all the species, which also defines the set of valid species
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Basis
{
    species: BTreeMap<Species, SpeciesBasis>,
}





impl Basis
{
    pub fn new() -> Self
    {
        Basis { species: BTreeMap::new() }
    }

    /// Add (or replace) the basis of a species
    pub fn with_species(mut self, species: &str, n: usize, l: usize, r_o: f64) -> Self
    {
        self.species.insert(Species::new(species), SpeciesBasis::new(n, l, r_o));
        self
    }

    pub fn get(&self, species: &Species) -> Result<&SpeciesBasis>
    {
        self.species.get(species).ok_or_else(|| error_unknown_species(species.as_str()))
    }

    pub fn contains(&self, species: &Species) -> bool
    {
        self.species.contains_key(species)
    }

    pub fn species(&self) -> impl Iterator<Item = &Species>
    {
        self.species.keys()
    }

    pub fn is_empty(&self) -> bool
    {
        self.species.is_empty()
    }

    /// Check that every species of 'other' is declared here with the same radial and angular counts
    pub fn check_compatible(&self, other: &Basis) -> Result<()>
    {
        for (species, basis) in other.species.iter()
        {
            let own: &SpeciesBasis = self.get(species)?;
            if (own.n != basis.n) || (own.l != basis.l)
            {
                return Err(NxcError::Configuration(format!("basis of species '{}' is inconsistent: (n = {}, l = {}) vs (n = {}, l = {})", species, own.n, own.l, basis.n, basis.l)));
            }
        }
        Ok(())
    }
}





/// Features of one system: for each species an array of shape (n_samples, n_copies, feature_len)
pub type SystemFeatures = BTreeMap<Species, Array3<f64>>;





/// The grouped representation consumed by the symmetrizer and the network
///
/// # Fields
/// ```text
/// features: per system, the species-keyed features
/// targets: per system, one target value per sample
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct GroupedBatch
{
    pub features: Vec<SystemFeatures>,
    pub targets: Vec<Array1<f64>>,
}





impl GroupedBatch
{
    /// Build a batch whose targets are zero, e.g. for prediction and gradient propagation
    pub fn from_features(features: Vec<SystemFeatures>) -> Self
    {
        let targets: Vec<Array1<f64>> = features.iter().map(|feat| Array1::zeros(n_samples(feat))).collect();
        GroupedBatch { features, targets }
    }

    pub fn n_systems(&self) -> usize
    {
        self.features.len()
    }
}





/// Number of samples of a system (length of axis 0, shared by all the species)
pub fn n_samples(feat: &SystemFeatures) -> usize
{
    feat.values().next().map(|x| x.shape()[0]).unwrap_or(0)
}

/// Check that two lists of system features have the same systems, species, and shapes
pub fn check_same_layout(expected: &[SystemFeatures], found: &[SystemFeatures], stage: &str) -> Result<()>
{
    if expected.len() != found.len()
    {
        return Err(NxcError::State(format!("stage '{}': gradient has {} systems, but the forward call had {}", stage, found.len(), expected.len())));
    }
    for (sys, (exp, fnd)) in expected.iter().zip(found.iter()).enumerate()
    {
        if exp.len() != fnd.len()
        {
            return Err(NxcError::State(format!("stage '{}': system {} has {} species in the gradient, but {} in the forward call", stage, sys, fnd.len(), exp.len())));
        }
        for (species, x) in exp.iter()
        {
            match fnd.get(species)
            {
                Some(y) if y.shape() == x.shape() => (),
                Some(y) => return Err(NxcError::State(format!("stage '{}': system {} species '{}' has gradient shape {:?}, but forward shape {:?}", stage, sys, species, y.shape(), x.shape()))),
                None => return Err(NxcError::State(format!("stage '{}': system {} species '{}' is missing in the gradient", stage, sys, species))),
            }
        }
    }
    Ok(())
}
