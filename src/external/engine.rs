//! The energy/gradient surface offered to electronic-structure engines.
use crate::common::error::*;
use crate::descriptor::basis::{Species, SpeciesBasis};
use crate::descriptor::grouper::{flat_row, SpeciesGrouper};
use crate::descriptor::symmetrizer::Symmetrizer;
use crate::pipeline::{load_pipeline, NamedStep, Pipeline};
use crate::pipeline::stage::{StageData, Step};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use std::path::Path;





/// A machine-learned energy functional of the per-atom descriptors of one system
pub trait Functional
{
    /// The energy of the system
    fn get_energy(&mut self, descriptors: &[Array1<f64>]) -> Result<f64>;
    /// The energy of the system and its gradient w.r.t. every atomic descriptor
    fn get_energy_gradient(&mut self, descriptors: &[Array1<f64>]) -> Result<(f64, Vec<Array1<f64>>)>;
}





/// Evaluates a fitted model on the raw coefficients of one system, the atoms being in the order of the engine
///
/// # Fields
/// ```text
/// species: the species of every atom, in engine order
/// feature_len: the raw coefficient count of every atom, in engine order
/// pipeline: grouper, symmetrizer, and the fitted estimator
/// ```
pub struct NxcAdapter
{
    species: Vec<Species>,
    feature_len: Vec<usize>,
    pipeline: Pipeline,
}





impl NxcAdapter
{
    /// Wrap a fitted model, replacing its front stages by a grouper of a single system of 'species'
    /// and the symmetrizer of the model
    pub fn new(model: &Pipeline, species: Vec<Species>) -> Result<Self>
    {
        if species.is_empty()
        {
            return Err(NxcError::Configuration(String::from("the engine system has no atoms")));
        }
        let feature_len: Vec<usize> = species.iter()
            .map(|sp| model.basis.get(sp).map(SpeciesBasis::feature_len))
            .collect::<Result<Vec<usize>>>()?;

        let grouper: SpeciesGrouper = SpeciesGrouper::new(model.basis.clone(), vec![species.clone()])?;
        let symmetrizer: Symmetrizer = Symmetrizer::new(model.symmetrizer_kind, model.basis.clone());
        let estimator_only: Pipeline = model.start_at(model.steps().len() - 1)?;
        let pipeline: Pipeline = estimator_only.with_front(vec![
            NamedStep::new("grouper", Step::Grouper(grouper)),
            NamedStep::new("symmetrizer", Step::Symmetrizer(symmetrizer)),
        ])?;
        debug!("engine adapter for {} atoms built", species.len());
        Ok(NxcAdapter { species, feature_len, pipeline })
    }

    /// Load the model saved in 'dir' for a system of 'species'
    pub fn load(dir: &Path, species: Vec<Species>) -> Result<Self>
    {
        NxcAdapter::new(&load_pipeline(dir)?, species)
    }

    pub fn species(&self) -> &[Species]
    {
        &self.species
    }

    /// The single flat row of the descriptors, with a zero target
    fn flat_input(&self, descriptors: &[Array1<f64>]) -> Result<Array2<f64>>
    {
        if descriptors.len() != self.species.len()
        {
            return Err(NxcError::Configuration(format!("{} atomic descriptors were given for a system of {} atoms", descriptors.len(), self.species.len())));
        }
        for (atom, (x, len)) in descriptors.iter().zip(self.feature_len.iter()).enumerate()
        {
            if x.len() != *len
            {
                return Err(error_shape(&format!("descriptor of atom {} ({})", atom, self.species[atom]), &[*len], &[x.len()]));
            }
        }
        let views: Vec<ArrayView1<f64>> = descriptors.iter().map(|x| x.view()).collect();
        let width: usize = self.feature_len.iter().sum::<usize>() + 2;
        Ok(flat_row(0, &views, width, 0.0)?.insert_axis(Axis(0)))
    }
}





impl Functional for NxcAdapter
{
    fn get_energy(&mut self, descriptors: &[Array1<f64>]) -> Result<f64>
    {
        let flat: Array2<f64> = self.flat_input(descriptors)?;
        let energies: Vec<Array1<f64>> = self.pipeline.predict(StageData::Flat(flat))?;
        energies.first().and_then(|e| e.get(0).copied())
            .ok_or_else(|| NxcError::State(String::from("the model returned no energy")))
    }

    fn get_energy_gradient(&mut self, descriptors: &[Array1<f64>]) -> Result<(f64, Vec<Array1<f64>>)>
    {
        let energy: f64 = self.get_energy(descriptors)?;
        let flat: Array2<f64> = self.flat_input(descriptors)?;
        let gradient: Array2<f64> = self.pipeline.get_gradient(StageData::Flat(flat))?.into_flat("engine")?;

        let mut atomic: Vec<Array1<f64>> = Vec::with_capacity(self.species.len());
        let mut idx: usize = 1;
        for len in self.feature_len.iter()
        {
            atomic.push(gradient.slice(s![0, idx..idx+len]).to_owned());
            idx += len;
        }
        Ok((energy, atomic))
    }
}
