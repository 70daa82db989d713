//! Rotation-invariant descriptors built from the raw (n, l, m) coefficients, and their chain-rule adjoint
use crate::common::constants::symmetrizer_from_str;
use crate::common::error::*;
use crate::descriptor::basis::{Basis, SpeciesBasis, SystemFeatures, check_same_layout};
use std::collections::BTreeMap;
use ndarray::{Array3, Axis, s};
use serde::{Serialize, Deserialize};





/// The closed family of invariant constructions. Each variant provides a forward map and its adjoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymmetrizerKind
{
    /// Squared norm of every (2l+1) block of magnetic components
    Casimir,
}





impl SymmetrizerKind
{
    /// Resolve a symmetrizer from its configuration name (e.g. "casimir")
    pub fn from_name(name: &str) -> Result<Self>
    {
        symmetrizer_from_str(name).ok_or_else(|| NxcError::Configuration(format!("unknown symmetrizer type '{}'", name)))
    }

    /// Length of the invariant vector of one atom
    pub fn invariant_len(&self, basis: &SpeciesBasis) -> usize
    {
        match self
        {
            SymmetrizerKind::Casimir => basis.invariant_len(),
        }
    }

    /// Invariants of raw coefficients of shape (n_samples, n_copies, feature_len)
    pub fn invariants(&self, raw: &Array3<f64>, basis: &SpeciesBasis) -> Array3<f64>
    {
        match self
        {
            SymmetrizerKind::Casimir => casimir_invariants(raw, basis),
        }
    }

    /// dE/d(raw) from dE/d(invariant) and the raw coefficients of the forward call
    pub fn chain_rule(&self, d_invariant: &Array3<f64>, raw: &Array3<f64>, basis: &SpeciesBasis) -> Array3<f64>
    {
        match self
        {
            SymmetrizerKind::Casimir => casimir_gradient(d_invariant, raw, basis),
        }
    }
}





/// Casimir invariants: inv[n,l] = sum_m raw[n,l,m]^2
fn casimir_invariants(raw: &Array3<f64>, basis: &SpeciesBasis) -> Array3<f64>
{
    let (n_samples, n_copies, _) = raw.dim();
    let blocks: Vec<(usize, usize, usize, usize)> = basis.blocks();
    let mut casimirs: Array3<f64> = Array3::zeros((n_samples, n_copies, blocks.len()));
    for (k, &(_, _, start, len)) in blocks.iter().enumerate()
    {
        let block = raw.slice(s![.., .., start..start+len]);
        casimirs.slice_mut(s![.., .., k]).assign(&block.mapv(|c| c * c).sum_axis(Axis(2)));
    }
    casimirs
}

/// d_raw[n,l,m] = 2 raw[n,l,m] d_inv[n,l], the scalar gradient broadcast over the magnetic block
fn casimir_gradient(d_invariant: &Array3<f64>, raw: &Array3<f64>, basis: &SpeciesBasis) -> Array3<f64>
{
    let mut grad: Array3<f64> = Array3::zeros(raw.raw_dim());
    for (k, &(_, _, start, len)) in basis.blocks().iter().enumerate()
    {
        let d_k = d_invariant.slice(s![.., .., k]);
        for m in start..start+len
        {
            let value = &raw.slice(s![.., .., m]) * &d_k * 2.0;
            grad.slice_mut(s![.., .., m]).assign(&value);
        }
    }
    grad
}





/// The raw coefficients of a forward call, needed (and consumed) by the matching adjoint call
#[derive(Debug)]
pub struct SymmetrizerContext
{
    raw: Vec<SystemFeatures>,
}





/// Maps raw per-atom coefficients to rotation-invariant descriptors
///
/// # Fields
/// ```text
/// kind: the invariant construction
/// basis: radial and angular counts of every species
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Symmetrizer
{
    #[serde(rename = "symmetrizer_type")]
    pub kind: SymmetrizerKind,
    pub basis: Basis,
}





impl Symmetrizer
{
    pub fn new(kind: SymmetrizerKind, basis: Basis) -> Self
    {
        Symmetrizer { kind, basis }
    }

    /// Check the species and the feature length of every array against the basis
    fn check_input(&self, raw: &[SystemFeatures]) -> Result<()>
    {
        for (sys, feat) in raw.iter().enumerate()
        {
            for (species, x) in feat.iter()
            {
                let feature_len: usize = self.basis.get(species)?.feature_len();
                if x.shape()[2] != feature_len
                {
                    return Err(error_shape(&format!("raw coefficients of species '{}' in system {}", species, sys), &[x.shape()[0], x.shape()[1], feature_len], x.shape()));
                }
            }
        }
        Ok(())
    }





    /// Symmetrize the raw coefficients
    ///
    /// # Parameters
    /// ```text
    /// raw: per system, raw coefficients (n_samples, n_copies, feature_len) per species
    /// invariants: per system, invariants (n_samples, n_copies, invariant_len) per species
    /// context: the raw coefficients, to be handed to 'adjoint'
    /// ```
    pub fn symmetrize(&self, raw: Vec<SystemFeatures>) -> Result<(Vec<SystemFeatures>, SymmetrizerContext)>
    {
        self.check_input(&raw)?;
        let mut invariants: Vec<SystemFeatures> = Vec::with_capacity(raw.len());
        for feat in raw.iter()
        {
            let mut sym: SystemFeatures = BTreeMap::new();
            for (species, x) in feat.iter()
            {
                sym.insert(species.clone(), self.kind.invariants(x, self.basis.get(species)?));
            }
            invariants.push(sym);
        }
        Ok((invariants, SymmetrizerContext { raw }))
    }





    /// Chain rule from dE/d(invariant) to dE/d(raw), consuming the context of the forward call
    ///
    /// # Parameters
    /// ```text
    /// d_invariants: per system, dE/d(invariant) with exactly the shapes returned by 'symmetrize'
    /// context: the context returned by the matching 'symmetrize' call
    /// d_raw: per system, dE/d(raw) with the shapes of the raw coefficients
    /// ```
    pub fn adjoint(&self, d_invariants: Vec<SystemFeatures>, context: SymmetrizerContext) -> Result<Vec<SystemFeatures>>
    {
        let raw: Vec<SystemFeatures> = context.raw;

        // The gradient must have the layout of the forward output
        let mut expected: Vec<SystemFeatures> = Vec::with_capacity(raw.len());
        for feat in raw.iter()
        {
            let mut shapes: SystemFeatures = BTreeMap::new();
            for (species, x) in feat.iter()
            {
                let len: usize = self.kind.invariant_len(self.basis.get(species)?);
                shapes.insert(species.clone(), Array3::zeros((x.shape()[0], x.shape()[1], len)));
            }
            expected.push(shapes);
        }
        check_same_layout(&expected, &d_invariants, "symmetrizer")?;

        let mut d_raw: Vec<SystemFeatures> = Vec::with_capacity(raw.len());
        for (feat, d_feat) in raw.iter().zip(d_invariants.iter())
        {
            let mut grad: SystemFeatures = BTreeMap::new();
            for (species, x) in feat.iter()
            {
                grad.insert(species.clone(), self.kind.chain_rule(&d_feat[species], x, self.basis.get(species)?));
            }
            d_raw.push(grad);
        }
        Ok(d_raw)
    }
}
