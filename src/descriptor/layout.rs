//! Labels of the flattened raw coefficients, to inspect or build coefficient rows by (n, l, m)
use crate::common::error::*;
use crate::descriptor::basis::{Basis, Species, SpeciesBasis};
use std::collections::BTreeMap;
use std::fmt;
use ndarray::{Array1, ArrayView1};





/// Label of one raw coefficient: radial index, angular momentum, and magnetic number in [-l, l]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoefficientLabel
{
    pub n: usize,
    pub l: usize,
    pub m: i64,
}

impl fmt::Display for CoefficientLabel
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{},{},{}", self.n, self.l, self.m)
    }
}





/// Map between the flat storage positions of a species' coefficients and their labels
#[derive(Clone, Debug)]
pub struct CoefficientLayout
{
    species: Species,
    labels: Vec<CoefficientLabel>,
}





impl CoefficientLayout
{
    pub fn new(species: &Species, basis: &SpeciesBasis) -> Self
    {
        let mut labels: Vec<CoefficientLabel> = Vec::with_capacity(basis.feature_len());
        for (n, l, _, _) in basis.blocks()
        {
            for m in -(l as i64)..=(l as i64)
            {
                labels.push(CoefficientLabel { n, l, m });
            }
        }
        CoefficientLayout { species: species.clone(), labels }
    }

    /// Layouts of all the species of a basis
    pub fn from_basis(basis: &Basis) -> Result<BTreeMap<Species, CoefficientLayout>>
    {
        let mut layouts: BTreeMap<Species, CoefficientLayout> = BTreeMap::new();
        for species in basis.species()
        {
            layouts.insert(species.clone(), CoefficientLayout::new(species, basis.get(species)?));
        }
        Ok(layouts)
    }

    /// Labels in storage order
    pub fn labels(&self) -> &[CoefficientLabel]
    {
        &self.labels
    }

    pub fn position(&self, label: &CoefficientLabel) -> Option<usize>
    {
        self.labels.iter().position(|x| x == label)
    }

    /// Label every coefficient of one atom
    pub fn to_labeled(&self, coefficients: ArrayView1<f64>) -> Result<BTreeMap<CoefficientLabel, f64>>
    {
        if coefficients.len() != self.labels.len()
        {
            return Err(error_shape(&format!("coefficients of species '{}'", self.species), &[self.labels.len()], coefficients.shape()));
        }
        Ok(self.labels.iter().copied().zip(coefficients.iter().copied()).collect())
    }

    /// Build the coefficient vector of one atom; missing labels are zero
    pub fn from_labeled(&self, labeled: &BTreeMap<CoefficientLabel, f64>) -> Result<Array1<f64>>
    {
        let mut coefficients: Array1<f64> = Array1::zeros(self.labels.len());
        for (label, value) in labeled.iter()
        {
            let idx: usize = self.position(label)
                .ok_or_else(|| NxcError::Configuration(format!("coefficient '{}' does not exist in the basis of species '{}'", label, self.species)))?;
            coefficients[idx] = *value;
        }
        Ok(coefficients)
    }
}
