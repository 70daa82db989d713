//! The ordered stage sequence: forward evaluation through grouping, symmetrization and the network,
//! and the reverse evaluation of the energy gradient w.r.t. the raw coefficients.
pub mod stage;

use crate::common::constants::{PIPELINE_FILE, NETWORK_FILE};
use crate::common::error::*;
use crate::descriptor::basis::{Basis, GroupedBatch, SystemFeatures};
use crate::descriptor::symmetrizer::SymmetrizerKind;
use crate::io::output::{create_model_dir, read_text, write_text};
use crate::nn::estimator::{EvaluationStatistics, Metric, NetworkEstimator};
use crate::nn::training::TrainingReport;
use self::stage::{DataKind, ForwardContext, StageData, Step, Transformer};
use log::debug;
use ndarray::Array1;
use serde::{Serialize, Deserialize};
use std::path::Path;





/// A stage and the name it is addressed by
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedStep
{
    pub name: String,
    pub step: Step,
}

impl NamedStep
{
    pub fn new(name: &str, step: Step) -> Self
    {
        NamedStep { name: name.to_string(), step }
    }
}





/// The descriptor-to-energy pipeline
///
/// # Fields
/// ```text
/// basis: the basis metadata every stage has to agree with
/// symmetrizer_kind: the invariant construction of the model, kept when the symmetrizer stage is dropped
/// steps: the stages, the estimator being the last one
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pipeline
{
    pub basis: Basis,
    pub symmetrizer_kind: SymmetrizerKind,
    steps: Vec<NamedStep>,
}





impl Pipeline
{
    /// Construct a pipeline, checking the layout of its stages
    pub fn new(basis: Basis, symmetrizer_kind: SymmetrizerKind, steps: Vec<NamedStep>) -> Result<Self>
    {
        let pipeline: Pipeline = Pipeline { basis, symmetrizer_kind, steps };
        pipeline.validate_steps()?;
        Ok(pipeline)
    }

    /// The stages are non-empty, end with the only estimator, chain their data kinds, and agree with the basis
    fn validate_steps(&self) -> Result<()>
    {
        let last: &NamedStep = self.steps.last().ok_or_else(|| NxcError::Configuration(String::from("a pipeline needs at least one stage")))?;
        if !last.step.is_estimator()
        {
            return Err(NxcError::Configuration(format!("the last stage '{}' must be the estimator", last.name)));
        }
        if let Some(early) = self.front().iter().find(|named| named.step.is_estimator())
        {
            return Err(NxcError::Configuration(format!("stage '{}' is an estimator, which is only allowed as the last stage", early.name)));
        }

        for pair in self.steps.windows(2)
        {
            if pair[0].step.output_kind() != pair[1].step.input_kind()
            {
                return Err(NxcError::Configuration(format!("stage '{}' produces {:?} data, but stage '{}' expects {:?} data", pair[0].name, pair[0].step.output_kind(), pair[1].name, pair[1].step.input_kind())));
            }
        }

        for named in self.steps.iter()
        {
            match &named.step
            {
                Step::Grouper(grouper) => self.basis.check_compatible(&grouper.basis)?,
                Step::Symmetrizer(symmetrizer) =>
                {
                    self.basis.check_compatible(&symmetrizer.basis)?;
                    if symmetrizer.kind != self.symmetrizer_kind
                    {
                        return Err(NxcError::Configuration(format!("stage '{}' uses the {:?} symmetrizer, but the pipeline declares {:?}", named.name, symmetrizer.kind, self.symmetrizer_kind)));
                    }
                },
                Step::Estimator(_) => (),
            }
        }
        Ok(())
    }

    pub fn steps(&self) -> &[NamedStep]
    {
        &self.steps
    }

    /// The stages in front of the estimator
    fn front(&self) -> &[NamedStep]
    {
        &self.steps[..self.steps.len().saturating_sub(1)]
    }

    /// Kind of the data expected by the first stage
    pub fn input_kind(&self) -> DataKind
    {
        self.steps.first().map(|named| named.step.input_kind()).unwrap_or(DataKind::Grouped)
    }

    pub fn estimator(&self) -> Result<&NetworkEstimator>
    {
        match self.steps.last().map(|named| &named.step)
        {
            Some(Step::Estimator(estimator)) => Ok(estimator),
            _ => Err(NxcError::Configuration(String::from("the pipeline has no estimator"))),
        }
    }

    pub fn estimator_mut(&mut self) -> Result<&mut NetworkEstimator>
    {
        match self.steps.last_mut().map(|named| &mut named.step)
        {
            Some(Step::Estimator(estimator)) => Ok(estimator),
            _ => Err(NxcError::Configuration(String::from("the pipeline has no estimator"))),
        }
    }





    /// Apply every stage but the estimator, keeping the forward contexts in stage order
    fn forward(&self, data: StageData) -> Result<(GroupedBatch, Vec<ForwardContext>)>
    {
        let mut data: StageData = data;
        let mut contexts: Vec<ForwardContext> = Vec::with_capacity(self.front().len());
        for named in self.front().iter()
        {
            debug!("forward through stage '{}'", named.name);
            let (output, context) = named.step.transform(data)?;
            data = output;
            contexts.push(context);
        }
        Ok((data.into_grouped("estimator")?, contexts))
    }

    /// The input of the estimator
    pub fn transform(&self, data: StageData) -> Result<GroupedBatch>
    {
        Ok(self.forward(data)?.0)
    }

    /// Transform the data and train the estimator on it
    pub fn fit(&mut self, data: StageData) -> Result<TrainingReport>
    {
        let batch: GroupedBatch = self.transform(data)?;
        self.estimator_mut()?.fit(&batch)
    }

    /// Energies of every sample of every system
    pub fn predict(&mut self, data: StageData) -> Result<Vec<Array1<f64>>>
    {
        let batch: GroupedBatch = self.transform(data)?;
        self.estimator_mut()?.predict_batch(&batch)
    }

    pub fn score(&mut self, data: StageData, metric: Metric) -> Result<f64>
    {
        let batch: GroupedBatch = self.transform(data)?;
        self.estimator_mut()?.score(&batch, metric)
    }

    pub fn evaluate(&mut self, data: StageData) -> Result<EvaluationStatistics>
    {
        let batch: GroupedBatch = self.transform(data)?;
        self.estimator_mut()?.evaluate(&batch)
    }

    /// dE/d(input) with the shape of the input of the first stage
    ///
    /// The data goes forward through every stage but the estimator, then the estimator gradient
    /// goes backward through those stages in reverse order, each one consuming its own forward context.
    pub fn get_gradient(&mut self, data: StageData) -> Result<StageData>
    {
        let (batch, contexts) = self.forward(data)?;
        let d_features: Vec<SystemFeatures> = self.estimator_mut()?.get_gradient(&batch.features)?;

        let mut gradient: StageData = StageData::Grouped(GroupedBatch::from_features(d_features));
        for (named, context) in self.front().iter().rev().zip(contexts.into_iter().rev())
        {
            debug!("backward through stage '{}'", named.name);
            gradient = named.step.get_gradient(gradient, context)?;
        }
        Ok(gradient)
    }





    /// The pipeline starting at stage 'idx', with the same basis and symmetrizer metadata
    pub fn start_at(&self, idx: usize) -> Result<Pipeline>
    {
        if idx >= self.steps.len()
        {
            return Err(NxcError::Configuration(format!("cannot start at stage {} of a pipeline with {} stages", idx, self.steps.len())));
        }
        Pipeline::new(self.basis.clone(), self.symmetrizer_kind, self.steps[idx..].to_vec())
    }

    /// The pipeline with 'front' prepended to its stages
    pub fn with_front(&self, front: Vec<NamedStep>) -> Result<Pipeline>
    {
        let mut steps: Vec<NamedStep> = front;
        steps.extend(self.steps.iter().cloned());
        Pipeline::new(self.basis.clone(), self.symmetrizer_kind, steps)
    }





    /// Save the stage configuration (YAML) and the network checkpoint into the directory 'dir'
    ///
    /// # Parameters
    /// ```text
    /// dir: the model directory
    /// override_existing: replace 'dir' if it already exists
    /// ```
    pub fn save(&self, dir: &Path, override_existing: bool) -> Result<()>
    {
        let estimator: &NetworkEstimator = self.estimator()?;
        if estimator.network().is_none()
        {
            return Err(error_network_not_built());
        }
        create_model_dir(dir, override_existing)?;
        write_text(&dir.join(PIPELINE_FILE), &serde_yaml::to_string(self)?)?;
        estimator.save_checkpoint(&dir.join(NETWORK_FILE))
    }
}





/// Load a pipeline saved by 'Pipeline::save', the network being restored from the checkpoint at its first use
pub fn load_pipeline(dir: &Path) -> Result<Pipeline>
{
    let mut pipeline: Pipeline = serde_yaml::from_str(&read_text(&dir.join(PIPELINE_FILE))?)?;
    pipeline.validate_steps()?;
    pipeline.estimator_mut()?.set_checkpoint(dir.join(NETWORK_FILE));
    Ok(pipeline)
}





#[cfg(test)]
mod tests
{
    use super::*;
    use crate::descriptor::basis::Species;
    use crate::descriptor::grouper::SpeciesGrouper;
    use crate::descriptor::symmetrizer::Symmetrizer;
    use crate::nn::training::RegularizationCoefficients;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use tempfile::tempdir;

    fn basis() -> Basis
    {
        Basis::new().with_species("H", 2, 1, 1.0)
    }

    fn estimator() -> NetworkEstimator
    {
        let mut estimator: NetworkEstimator = NetworkEstimator::new(4, 2, RegularizationCoefficients::uniform(1e-3));
        estimator.alpha = 1e-3;
        estimator.max_steps = 5;
        estimator.test_size = 0.0;
        estimator.valid_size = 0.0;
        estimator.random_seed = Some(7);
        estimator
    }

    fn full_pipeline() -> Pipeline
    {
        let grouper: SpeciesGrouper = SpeciesGrouper::new(basis(), vec![vec![Species::new("H"), Species::new("H")]]).unwrap();
        Pipeline::new(basis(), SymmetrizerKind::Casimir, vec![
            NamedStep::new("grouper", Step::Grouper(grouper)),
            NamedStep::new("symmetrizer", Step::Symmetrizer(Symmetrizer::new(SymmetrizerKind::Casimir, basis()))),
            NamedStep::new("estimator", Step::Estimator(estimator())),
        ]).unwrap()
    }

    fn flat() -> Array2<f64>
    {
        array![
            [0.0, 1.0, 0.0, 0.0, 1.0, 1.0],
            [0.0, 0.5, 0.2, 0.3, 0.9, 0.8],
            [0.0, 0.1, 0.7, 0.6, 0.4, 1.2],
        ]
    }

    #[test]
    fn invalid_layouts_are_rejected()
    {
        let grouper = NamedStep::new("grouper", Step::Grouper(SpeciesGrouper::new(basis(), vec![vec![Species::new("H")]]).unwrap()));
        let symmetrizer = NamedStep::new("symmetrizer", Step::Symmetrizer(Symmetrizer::new(SymmetrizerKind::Casimir, basis())));
        let est = NamedStep::new("estimator", Step::Estimator(estimator()));

        let layouts: Vec<Vec<NamedStep>> = vec![
            vec![],
            vec![grouper.clone(), symmetrizer.clone()],
            vec![est.clone(), symmetrizer.clone(), est.clone()],
            vec![symmetrizer.clone(), grouper.clone(), est.clone()],
        ];
        for steps in layouts.into_iter()
        {
            assert!(matches!(Pipeline::new(basis(), SymmetrizerKind::Casimir, steps), Err(NxcError::Configuration(_))));
        }

        // Stage basis inconsistent with the pipeline basis
        let other: Basis = Basis::new().with_species("H", 3, 1, 1.0);
        let symmetrizer = NamedStep::new("symmetrizer", Step::Symmetrizer(Symmetrizer::new(SymmetrizerKind::Casimir, other)));
        assert!(matches!(Pipeline::new(basis(), SymmetrizerKind::Casimir, vec![grouper, symmetrizer, est]), Err(NxcError::Configuration(_))));
    }

    #[test]
    fn predict_before_fit_is_a_state_error()
    {
        let mut pipeline: Pipeline = full_pipeline();
        assert!(matches!(pipeline.predict(StageData::Flat(flat())), Err(NxcError::State(_))));
        assert!(matches!(pipeline.get_gradient(StageData::Flat(flat())), Err(NxcError::State(_))));
        assert!(matches!(pipeline.save(tempdir().unwrap().path(), true), Err(NxcError::State(_))));
    }

    #[test]
    fn gradient_matches_finite_differences()
    {
        let mut pipeline: Pipeline = full_pipeline();
        pipeline.fit(StageData::Flat(flat())).unwrap();

        let x: Array2<f64> = flat();
        let gradient: Array2<f64> = pipeline.get_gradient(StageData::Flat(x.clone())).unwrap().into_flat("test").unwrap();
        assert_eq!(gradient.shape(), x.shape());

        let h: f64 = 1e-6;
        for row in 0..x.nrows()
        {
            // the target column carries no gradient
            assert_eq!(gradient[[row, x.ncols() - 1]], 0.0);
            for col in 1..x.ncols() - 1
            {
                let mut plus: Array2<f64> = x.clone();
                plus[[row, col]] += h;
                let mut minus: Array2<f64> = x.clone();
                minus[[row, col]] -= h;
                let e_plus: f64 = pipeline.predict(StageData::Flat(plus)).unwrap()[0][row];
                let e_minus: f64 = pipeline.predict(StageData::Flat(minus)).unwrap()[0][row];
                assert_abs_diff_eq!(gradient[[row, col]], (e_plus - e_minus) / (2.0 * h), epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn system_without_atoms_keeps_its_samples()
    {
        let mut fitted: Pipeline = full_pipeline();
        fitted.fit(StageData::Flat(flat())).unwrap();
        let expected: Vec<Array1<f64>> = fitted.predict(StageData::Flat(flat())).unwrap();
        let expected_gradient: Array2<f64> = fitted.get_gradient(StageData::Flat(flat())).unwrap().into_flat("test").unwrap();

        // System 1 has no atoms, its rows interleaved with those of system 0
        let grouper: SpeciesGrouper = SpeciesGrouper::new(basis(), vec![vec![Species::new("H"), Species::new("H")], vec![]]).unwrap();
        let mut pipeline: Pipeline = fitted.start_at(2).unwrap().with_front(vec![
            NamedStep::new("grouper", Step::Grouper(grouper)),
            NamedStep::new("symmetrizer", Step::Symmetrizer(Symmetrizer::new(SymmetrizerKind::Casimir, basis()))),
        ]).unwrap();
        let x: Array2<f64> = array![
            [0.0, 1.0, 0.0, 0.0, 1.0, 1.0],
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.4],
            [0.0, 0.5, 0.2, 0.3, 0.9, 0.8],
            [1.0, 0.0, 0.0, 0.0, 0.0, -0.2],
            [0.0, 0.1, 0.7, 0.6, 0.4, 1.2],
        ];

        let energies: Vec<Array1<f64>> = pipeline.predict(StageData::Flat(x.clone())).unwrap();
        assert_eq!(energies.len(), 2);
        assert_abs_diff_eq!(energies[0], expected[0], epsilon = 1e-12);
        assert_eq!(energies[1], Array1::<f64>::zeros(2));

        let gradient: Array2<f64> = pipeline.get_gradient(StageData::Flat(x.clone())).unwrap().into_flat("test").unwrap();
        assert_eq!(gradient.shape(), x.shape());
        assert_eq!(gradient.row(1), Array1::<f64>::zeros(6));
        assert_eq!(gradient.row(3), Array1::<f64>::zeros(6));
        for (row, fitted_row) in [(0, 0), (2, 1), (4, 2)]
        {
            assert_abs_diff_eq!(gradient.row(row), expected_gradient.row(fitted_row), epsilon = 1e-12);
        }
    }

    #[test]
    fn truncated_pipeline_keeps_metadata_and_predictions()
    {
        let mut pipeline: Pipeline = full_pipeline();
        pipeline.fit(StageData::Flat(flat())).unwrap();
        let expected: Vec<Array1<f64>> = pipeline.predict(StageData::Flat(flat())).unwrap();

        let front: Pipeline = full_pipeline();
        let mut tail: Pipeline = pipeline.start_at(2).unwrap();
        assert_eq!(tail.basis, pipeline.basis);
        assert_eq!(tail.symmetrizer_kind, SymmetrizerKind::Casimir);
        assert_eq!(tail.input_kind(), DataKind::Grouped);

        let invariants: GroupedBatch = front.transform(StageData::Flat(flat())).unwrap();
        let predicted: Vec<Array1<f64>> = tail.predict(StageData::Grouped(invariants)).unwrap();
        assert_abs_diff_eq!(predicted[0], expected[0], epsilon = 1e-12);

        let mut rebuilt: Pipeline = tail.with_front(front.steps()[..2].to_vec()).unwrap();
        assert_abs_diff_eq!(rebuilt.predict(StageData::Flat(flat())).unwrap()[0], expected[0], epsilon = 1e-12);

        assert!(matches!(pipeline.start_at(3), Err(NxcError::Configuration(_))));
    }

    #[test]
    fn saved_pipeline_predicts_the_same()
    {
        let root = tempdir().unwrap();
        let dir = root.path().join("model");
        let mut pipeline: Pipeline = full_pipeline();
        pipeline.fit(StageData::Flat(flat())).unwrap();
        pipeline.save(&dir, false).unwrap();
        assert!(dir.join(PIPELINE_FILE).exists());
        assert!(dir.join(NETWORK_FILE).exists());
        assert!(matches!(pipeline.save(&dir, false), Err(NxcError::Configuration(_))));
        pipeline.save(&dir, true).unwrap();

        let mut loaded: Pipeline = load_pipeline(&dir).unwrap();
        assert_eq!(loaded.steps().len(), 3);
        let expected: Vec<Array1<f64>> = pipeline.predict(StageData::Flat(flat())).unwrap();
        let found: Vec<Array1<f64>> = loaded.predict(StageData::Flat(flat())).unwrap();
        assert_abs_diff_eq!(found[0], expected[0], epsilon = 1e-12);
    }
}
