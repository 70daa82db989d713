//! Conversion between the flat per-atom coefficient matrix and the species-grouped representation
use crate::common::error::*;
use crate::descriptor::basis::{Basis, Species, SystemFeatures, GroupedBatch};
use std::collections::BTreeMap;
use ndarray::{Array1, Array2, Array3, ArrayView1, s};
use serde::{Serialize, Deserialize};





/// Groups the rows of a matrix with columns [system_index, feature_1, ..., feature_N, target]
/// by system and, inside every system, by species.
///
/// # Fields
/// ```text
/// basis: the basis metadata, defining the feature length of every species
/// sys_species: per system, the species of its atoms in the order the features are concatenated
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeciesGrouper
{
    pub basis: Basis,
    pub sys_species: Vec<Vec<Species>>,
}





/// The row layout of a grouped matrix, consumed by the matching 'adjoint' call
#[derive(Clone, Debug, PartialEq)]
pub struct GrouperContext
{
    n_rows: usize,
    n_cols: usize,
    system_rows: Vec<Vec<usize>>,
}





impl SpeciesGrouper
{
    /// Construct a new grouper, checking that every species of every system is declared in the basis
    pub fn new(basis: Basis, sys_species: Vec<Vec<Species>>) -> Result<Self>
    {
        for this_species in sys_species.iter()
        {
            for species in this_species.iter()
            {
                basis.get(species)?;
            }
        }
        Ok(SpeciesGrouper { basis, sys_species })
    }

    /// Number of feature columns needed by a system
    fn system_vec_len(&self, sys: usize) -> Result<usize>
    {
        let mut len: usize = 0;
        for species in self.sys_species[sys].iter()
        {
            len += self.basis.get(species)?.feature_len();
        }
        Ok(len)
    }





    /// Transform from the flat to the grouped representation
    ///
    /// # Parameters
    /// ```text
    /// flat: one row per observation, column 0 is the system index, the last column is the target
    /// batch: the output features (n_samples, n_copies, feature_len) per species and targets per system
    /// ```
    pub fn group(&self, flat: &Array2<f64>) -> Result<GroupedBatch>
    {
        Ok(self.group_with_context(flat)?.0)
    }

    /// Same as 'group', also returning the row layout of the input needed by 'adjoint'
    pub fn group_with_context(&self, flat: &Array2<f64>) -> Result<(GroupedBatch, GrouperContext)>
    {
        let ncols: usize = flat.ncols();
        if ncols < 2
        {
            return Err(NxcError::Configuration(format!("the flat matrix needs at least a system column and a target column, but has {} columns", ncols)));
        }

        // The first column gives the system index of every row
        let mut system: Vec<usize> = Vec::with_capacity(flat.nrows());
        for (row, &value) in flat.column(0).iter().enumerate()
        {
            if !value.is_finite() || value < 0.0 || value.fract() != 0.0
            {
                return Err(NxcError::Configuration(format!("row {} has the invalid system index {}", row, value)));
            }
            system.push(value as usize);
        }
        let n_sys: usize = system.iter().max().map(|max| max + 1).unwrap_or(0);
        if n_sys != self.sys_species.len()
        {
            return Err(error_system_count(n_sys, self.sys_species.len()));
        }

        let mut features: Vec<SystemFeatures> = Vec::with_capacity(n_sys);
        let mut targets: Vec<Array1<f64>> = Vec::with_capacity(n_sys);
        let mut system_rows: Vec<Vec<usize>> = Vec::with_capacity(n_sys);
        for this_sys in 0..n_sys
        {
            let rows: Vec<usize> = (0..flat.nrows()).filter(|&i| system[i] == this_sys).collect();
            let vec_len: usize = self.system_vec_len(this_sys)?;
            if vec_len + 2 > ncols
            {
                return Err(NxcError::Configuration(format!("system {} needs {} feature columns, but the flat matrix only has {}", this_sys, vec_len, ncols - 2)));
            }

            // Count the atoms of every species, then fill the copy axis with a running counter
            let mut n_copies: BTreeMap<&Species, usize> = BTreeMap::new();
            for species in self.sys_species[this_sys].iter()
            {
                *n_copies.entry(species).or_insert(0) += 1;
            }
            let mut feat_dict: SystemFeatures = BTreeMap::new();
            for (species, &n) in n_copies.iter()
            {
                let len: usize = self.basis.get(species)?.feature_len();
                feat_dict.insert((*species).clone(), Array3::zeros((rows.len(), n, len)));
            }

            let mut spec_loc: BTreeMap<&Species, usize> = BTreeMap::new();
            let mut idx: usize = 1;
            for species in self.sys_species[this_sys].iter()
            {
                let len: usize = self.basis.get(species)?.feature_len();
                let copy: &mut usize = spec_loc.entry(species).or_insert(0);
                let block: &mut Array3<f64> = feat_dict.get_mut(species).ok_or_else(|| error_unknown_species(species.as_str()))?;
                for (i, &row) in rows.iter().enumerate()
                {
                    block.slice_mut(s![i, *copy, ..]).assign(&flat.slice(s![row, idx..idx+len]));
                }
                *copy += 1;
                idx += len;
            }

            features.push(feat_dict);
            targets.push(rows.iter().map(|&row| flat[[row, ncols-1]]).collect());
            system_rows.push(rows);
        }

        log::debug!("grouped {} rows into {} systems", flat.nrows(), n_sys);
        Ok((GroupedBatch { features, targets }, GrouperContext { n_rows: flat.nrows(), n_cols: ncols, system_rows }))
    }





    /// Transform from the grouped to the flat representation, the exact inverse of 'group'
    ///
    /// # Parameters
    /// ```text
    /// batch: features and targets per system
    /// flat: the output matrix, width = the widest system + 2, shorter systems are padded with zeros
    /// ```
    pub fn ungroup(&self, batch: &GroupedBatch) -> Result<Array2<f64>>
    {
        if (batch.features.len() != batch.targets.len()) || (batch.features.len() != self.sys_species.len())
        {
            return Err(NxcError::Configuration(format!("number of systems inconsistent: {} feature sets, {} target sets, {} species lists", batch.features.len(), batch.targets.len(), self.sys_species.len())));
        }

        let total_length: usize = batch.targets.iter().map(|tar| tar.len()).sum();
        let max_vec_len: usize = batch.features.iter()
            .map(|feat| feat.values().map(|x| x.shape()[1] * x.shape()[2]).sum::<usize>())
            .max()
            .unwrap_or(0);
        let mut flat: Array2<f64> = Array2::zeros((total_length, max_vec_len + 2));

        let mut sys_loc: usize = 0;
        for (sys, (feat, tar)) in batch.features.iter().zip(batch.targets.iter()).enumerate()
        {
            let this_len: usize = tar.len();
            flat.slice_mut(s![sys_loc..sys_loc+this_len, 0]).fill(sys as f64);

            let mut spec_loc: BTreeMap<&Species, usize> = BTreeMap::new();
            let mut idx: usize = 1;
            for species in self.sys_species[sys].iter()
            {
                let block: &Array3<f64> = feat.get(species).ok_or_else(|| NxcError::Configuration(format!("system {} has no features for species '{}'", sys, species)))?;
                let copy: &mut usize = spec_loc.entry(species).or_insert(0);
                if block.shape()[0] != this_len
                {
                    return Err(error_shape(&format!("features of species '{}' in system {}", species, sys), &[this_len, block.shape()[1], block.shape()[2]], block.shape()));
                }
                if *copy >= block.shape()[1]
                {
                    return Err(NxcError::Configuration(format!("system {} lists more atoms of species '{}' than its features contain ({})", sys, species, block.shape()[1])));
                }
                let len: usize = block.shape()[2];
                flat.slice_mut(s![sys_loc..sys_loc+this_len, idx..idx+len]).assign(&block.slice(s![.., *copy, ..]));
                *copy += 1;
                idx += len;
            }

            // Every copy must have been placed, otherwise the round trip is not exact
            for (species, block) in feat.iter()
            {
                if spec_loc.get(species).copied().unwrap_or(0) != block.shape()[1]
                {
                    return Err(NxcError::Configuration(format!("system {} has {} copies of species '{}', but its species list places {}", sys, block.shape()[1], species, spec_loc.get(species).copied().unwrap_or(0))));
                }
            }

            flat.slice_mut(s![sys_loc..sys_loc+this_len, max_vec_len+1]).assign(tar);
            sys_loc += this_len;
        }

        Ok(flat)
    }





    /// Gradient of the grouping: scatter per-species gradients back into the flat layout (targets are zero)
    pub fn ungroup_gradient(&self, features: Vec<SystemFeatures>) -> Result<Array2<f64>>
    {
        self.ungroup(&GroupedBatch::from_features(features))
    }

    /// Gradient of the grouping in the row order and width of the matching 'group_with_context' input
    pub fn adjoint(&self, features: Vec<SystemFeatures>, context: GrouperContext) -> Result<Array2<f64>>
    {
        if features.len() != context.system_rows.len()
        {
            return Err(NxcError::State(format!("stage 'grouper': gradient has {} systems, but the forward call had {}", features.len(), context.system_rows.len())));
        }
        for (sys, (feat, rows)) in features.iter().zip(context.system_rows.iter()).enumerate()
        {
            if feat.values().any(|x| x.shape()[0] != rows.len())
            {
                return Err(NxcError::State(format!("stage 'grouper': gradient of system {} does not have the {} samples of the forward call", sys, rows.len())));
            }
        }

        // The sample counts come from the forward call, since a system without atoms has no feature array to carry them
        let targets: Vec<Array1<f64>> = context.system_rows.iter().map(|rows| Array1::zeros(rows.len())).collect();
        let packed: Array2<f64> = self.ungroup(&GroupedBatch { features, targets })?;
        if packed.nrows() != context.n_rows
        {
            return Err(NxcError::State(format!("stage 'grouper': gradient has {} rows, but the forward call had {}", packed.nrows(), context.n_rows)));
        }
        let width: usize = packed.ncols().min(context.n_cols) - 1;
        let mut gradient: Array2<f64> = Array2::zeros((context.n_rows, context.n_cols));
        let mut loc: usize = 0;
        for rows in context.system_rows.iter()
        {
            for &row in rows.iter()
            {
                gradient.slice_mut(s![row, 1..width]).assign(&packed.slice(s![loc, 1..width]));
                loc += 1;
            }
        }
        Ok(gradient)
    }
}





/// Build the flat row of one observation of a system from its per-atom vectors (in species-sequence order)
pub fn flat_row(system_index: usize, atoms: &[ArrayView1<f64>], width: usize, target: f64) -> Result<Array1<f64>>
{
    let needed: usize = atoms.iter().map(|x| x.len()).sum::<usize>() + 2;
    if needed > width
    {
        return Err(NxcError::Configuration(format!("the flat row needs at least {} columns, but only {} were requested", needed, width)));
    }
    let mut row: Array1<f64> = Array1::zeros(width);
    row[0] = system_index as f64;
    let mut idx: usize = 1;
    for atom in atoms.iter()
    {
        row.slice_mut(s![idx..idx+atom.len()]).assign(atom);
        idx += atom.len();
    }
    row[width-1] = target;
    Ok(row)
}





#[cfg(test)]
mod tests
{
    use super::*;
    use ndarray::{array, Axis};
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand::rngs::StdRng;
    use proptest::prelude::*;

    fn basis() -> Basis
    {
        Basis::new().with_species("H", 2, 1, 1.0).with_species("O", 1, 2, 1.5)
    }

    fn species(list: &str) -> Vec<Species>
    {
        list.split_whitespace().map(Species::new).collect()
    }

    #[test]
    fn group_stacks_atoms_of_the_same_species()
    {
        // System 0: H O H, H has 2 features, O has 4
        let grouper = SpeciesGrouper::new(basis(), vec![species("H O H")]).unwrap();
        let flat = array![
            [0.0, 1.0, 2.0, 10.0, 11.0, 12.0, 13.0, 3.0, 4.0, -1.0],
            [0.0, 5.0, 6.0, 14.0, 15.0, 16.0, 17.0, 7.0, 8.0, -2.0],
        ];
        let batch = grouper.group(&flat).unwrap();
        assert_eq!(batch.n_systems(), 1);
        let h = &batch.features[0][&Species::new("H")];
        let o = &batch.features[0][&Species::new("O")];
        assert_eq!(h.shape(), &[2, 2, 2]);
        assert_eq!(o.shape(), &[2, 1, 4]);
        assert_eq!(h.slice(s![1, 1, ..]), array![7.0, 8.0]);
        assert_eq!(o.index_axis(Axis(1), 0).row(0), array![10.0, 11.0, 12.0, 13.0]);
        assert_eq!(batch.targets[0], array![-1.0, -2.0]);

        assert_eq!(grouper.ungroup(&batch).unwrap(), flat);
    }

    #[test]
    fn system_count_mismatch_is_a_configuration_error()
    {
        let grouper = SpeciesGrouper::new(basis(), vec![species("H"), species("H")]).unwrap();
        let flat = array![[0.0, 1.0, 2.0, 0.5]];
        assert!(matches!(grouper.group(&flat), Err(NxcError::Configuration(_))));

        let flat = array![[0.0, 1.0, 2.0, 0.5], [2.0, 1.0, 2.0, 0.5]];
        assert!(matches!(grouper.group(&flat), Err(NxcError::Configuration(_))));
    }

    #[test]
    fn invalid_rows_are_rejected()
    {
        let grouper = SpeciesGrouper::new(basis(), vec![species("H O")]).unwrap();
        let too_narrow = array![[0.0, 1.0, 2.0, 0.5]];
        assert!(grouper.group(&too_narrow).is_err());

        let grouper = SpeciesGrouper::new(basis(), vec![species("H")]).unwrap();
        let fractional = array![[0.5, 1.0, 2.0, 0.5]];
        assert!(grouper.group(&fractional).is_err());

        assert!(SpeciesGrouper::new(basis(), vec![species("H C")]).is_err());
    }

    #[test]
    fn gradient_has_zero_targets()
    {
        let grouper = SpeciesGrouper::new(basis(), vec![species("H H")]).unwrap();
        let flat = array![[0.0, 1.0, 2.0, 3.0, 4.0, 9.0]];
        let batch = grouper.group(&flat).unwrap();
        let grad = grouper.ungroup_gradient(batch.features).unwrap();
        assert_eq!(grad, array![[0.0, 1.0, 2.0, 3.0, 4.0, 0.0]]);
    }

    #[test]
    fn adjoint_follows_the_input_rows_and_width()
    {
        // Interleaved systems and one spare padding column
        let grouper = SpeciesGrouper::new(basis(), vec![species("H"), species("H H")]).unwrap();
        let flat = array![
            [1.0, 1.0, 2.0, 3.0, 4.0, 0.0, 0.5],
            [0.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.7],
            [1.0, 7.0, 8.0, 9.0, 1.0, 0.0, 0.9],
        ];
        let (batch, context) = grouper.group_with_context(&flat).unwrap();
        let grad = grouper.adjoint(batch.features, context).unwrap();
        assert_eq!(grad, array![
            [0.0, 1.0, 2.0, 3.0, 4.0, 0.0, 0.0],
            [0.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 7.0, 8.0, 9.0, 1.0, 0.0, 0.0],
        ]);
    }

    #[test]
    fn adjoint_keeps_the_rows_of_a_system_without_atoms()
    {
        let grouper = SpeciesGrouper::new(basis(), vec![species("H"), vec![]]).unwrap();
        let flat = array![
            [1.0, 0.0, 0.0, 0.3],
            [0.0, 5.0, 6.0, 0.7],
            [1.0, 0.0, 0.0, 0.9],
        ];
        let (batch, context) = grouper.group_with_context(&flat).unwrap();
        assert!(batch.features[1].is_empty());
        assert_eq!(batch.targets[1], array![0.3, 0.9]);

        let grad = grouper.adjoint(batch.features, context).unwrap();
        assert_eq!(grad, array![
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 5.0, 6.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
        ]);
    }

    #[test]
    fn adjoint_with_other_samples_is_a_state_error()
    {
        let grouper = SpeciesGrouper::new(basis(), vec![species("H")]).unwrap();
        let (_, context) = grouper.group_with_context(&array![[0.0, 1.0, 2.0, 0.5]]).unwrap();
        let other = grouper.group(&array![[0.0, 1.0, 2.0, 0.5], [0.0, 3.0, 4.0, 0.5]]).unwrap();
        assert!(matches!(grouper.adjoint(other.features, context), Err(NxcError::State(_))));
    }

    #[test]
    fn flat_row_places_atoms_in_order()
    {
        let a = array![1.0, 2.0];
        let b = array![3.0, 4.0, 5.0, 6.0];
        let row = flat_row(3, &[a.view(), b.view()], 8, 0.25).unwrap();
        assert_eq!(row, array![3.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.25]);
        assert!(flat_row(0, &[a.view(), b.view()], 7, 0.0).is_err());
    }

    // Random systems made of H and O atoms, rows ordered by system, padded to the widest system
    fn random_flat(seed: u64, n_sys: usize) -> (Vec<Vec<Species>>, Array2<f64>)
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let basis = basis();
        let mut sys_species: Vec<Vec<Species>> = Vec::new();
        for _ in 0..n_sys
        {
            let n_atoms: usize = rng.gen_range(1..5);
            sys_species.push((0..n_atoms).map(|_| if rng.gen_bool(0.5) { Species::new("H") } else { Species::new("O") }).collect());
        }
        let width: usize = sys_species.iter()
            .map(|list| list.iter().map(|sp| basis.get(sp).unwrap().feature_len()).sum::<usize>())
            .max()
            .unwrap() + 2;

        let mut rows: Vec<Array1<f64>> = Vec::new();
        for (sys, list) in sys_species.iter().enumerate()
        {
            let n_samples: usize = rng.gen_range(1..4);
            for _ in 0..n_samples
            {
                let atoms: Vec<Array1<f64>> = list.iter()
                    .map(|sp| (0..basis.get(sp).unwrap().feature_len()).map(|_| rng.gen_range(-1.0..1.0)).collect())
                    .collect();
                let views: Vec<ArrayView1<f64>> = atoms.iter().map(|x| x.view()).collect();
                rows.push(flat_row(sys, &views, width, rng.gen_range(-5.0..5.0)).unwrap());
            }
        }
        let mut flat: Array2<f64> = Array2::zeros((rows.len(), width));
        for (i, row) in rows.iter().enumerate()
        {
            flat.row_mut(i).assign(row);
        }
        (sys_species, flat)
    }

    proptest!
    {
        #[test]
        fn ungroup_inverts_group(seed in any::<u64>(), n_sys in 1usize..5)
        {
            let (sys_species, flat) = random_flat(seed, n_sys);
            let grouper = SpeciesGrouper::new(basis(), sys_species).unwrap();
            let batch = grouper.group(&flat).unwrap();
            prop_assert_eq!(grouper.ungroup(&batch).unwrap(), flat);
        }
    }
}
