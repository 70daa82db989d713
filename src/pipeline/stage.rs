//! The stages of a pipeline: the data they exchange, their forward contexts, and the transformer contract
use crate::common::error::*;
use crate::descriptor::basis::GroupedBatch;
use crate::descriptor::grouper::{GrouperContext, SpeciesGrouper};
use crate::descriptor::symmetrizer::{Symmetrizer, SymmetrizerContext};
use crate::nn::estimator::NetworkEstimator;
use ndarray::Array2;
use serde::{Serialize, Deserialize};





/// Kind of the data consumed or produced by a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind
{
    /// Rows of [system_index, features..., target]
    Flat,
    /// Per-system, per-species features and per-system targets
    Grouped,
}

/// Data flowing between stages, forward (values) or backward (gradients, whose targets are zero)
#[derive(Clone, Debug, PartialEq)]
pub enum StageData
{
    Flat(Array2<f64>),
    Grouped(GroupedBatch),
}





impl StageData
{
    pub fn kind(&self) -> DataKind
    {
        match self
        {
            StageData::Flat(_) => DataKind::Flat,
            StageData::Grouped(_) => DataKind::Grouped,
        }
    }

    pub fn into_flat(self, stage: &str) -> Result<Array2<f64>>
    {
        match self
        {
            StageData::Flat(flat) => Ok(flat),
            StageData::Grouped(_) => Err(NxcError::Configuration(format!("stage '{}' expects flat data, got grouped data", stage))),
        }
    }

    pub fn into_grouped(self, stage: &str) -> Result<GroupedBatch>
    {
        match self
        {
            StageData::Grouped(batch) => Ok(batch),
            StageData::Flat(_) => Err(NxcError::Configuration(format!("stage '{}' expects grouped data, got flat data", stage))),
        }
    }
}





/// What a forward call hands to the matching backward call
#[derive(Debug)]
pub enum ForwardContext
{
    Empty,
    Grouper(GrouperContext),
    Symmetrizer(SymmetrizerContext),
}





/// A differentiable stage: a forward transform and its chain-rule adjoint
pub trait Transformer
{
    fn name(&self) -> &'static str;
    fn input_kind(&self) -> DataKind;
    fn output_kind(&self) -> DataKind;
    fn transform(&self, data: StageData) -> Result<(StageData, ForwardContext)>;
    fn get_gradient(&self, d_output: StageData, context: ForwardContext) -> Result<StageData>;
}





impl Transformer for SpeciesGrouper
{
    fn name(&self) -> &'static str
    {
        "grouper"
    }

    fn input_kind(&self) -> DataKind
    {
        DataKind::Flat
    }

    fn output_kind(&self) -> DataKind
    {
        DataKind::Grouped
    }

    fn transform(&self, data: StageData) -> Result<(StageData, ForwardContext)>
    {
        let (batch, context): (GroupedBatch, GrouperContext) = self.group_with_context(&data.into_flat(self.name())?)?;
        Ok((StageData::Grouped(batch), ForwardContext::Grouper(context)))
    }

    fn get_gradient(&self, d_output: StageData, context: ForwardContext) -> Result<StageData>
    {
        match context
        {
            ForwardContext::Grouper(context) => Ok(StageData::Flat(self.adjoint(d_output.into_grouped(self.name())?.features, context)?)),
            _ => Err(error_missing_forward(self.name())),
        }
    }
}





impl Transformer for Symmetrizer
{
    fn name(&self) -> &'static str
    {
        "symmetrizer"
    }

    fn input_kind(&self) -> DataKind
    {
        DataKind::Grouped
    }

    fn output_kind(&self) -> DataKind
    {
        DataKind::Grouped
    }

    fn transform(&self, data: StageData) -> Result<(StageData, ForwardContext)>
    {
        let batch: GroupedBatch = data.into_grouped(self.name())?;
        let (features, context) = self.symmetrize(batch.features)?;
        Ok((StageData::Grouped(GroupedBatch { features, targets: batch.targets }), ForwardContext::Symmetrizer(context)))
    }

    fn get_gradient(&self, d_output: StageData, context: ForwardContext) -> Result<StageData>
    {
        match context
        {
            ForwardContext::Symmetrizer(context) =>
            {
                let d_raw = self.adjoint(d_output.into_grouped(self.name())?.features, context)?;
                Ok(StageData::Grouped(GroupedBatch::from_features(d_raw)))
            },
            _ => Err(error_missing_forward(self.name())),
        }
    }
}





/// The closed set of pipeline stages
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step
{
    Grouper(SpeciesGrouper),
    Symmetrizer(Symmetrizer),
    Estimator(NetworkEstimator),
}





impl Step
{
    pub fn is_estimator(&self) -> bool
    {
        matches!(self, Step::Estimator(_))
    }
}





impl Transformer for Step
{
    fn name(&self) -> &'static str
    {
        match self
        {
            Step::Grouper(grouper) => grouper.name(),
            Step::Symmetrizer(symmetrizer) => symmetrizer.name(),
            Step::Estimator(_) => "estimator",
        }
    }

    fn input_kind(&self) -> DataKind
    {
        match self
        {
            Step::Grouper(grouper) => grouper.input_kind(),
            Step::Symmetrizer(symmetrizer) => symmetrizer.input_kind(),
            Step::Estimator(_) => DataKind::Grouped,
        }
    }

    fn output_kind(&self) -> DataKind
    {
        match self
        {
            Step::Grouper(grouper) => grouper.output_kind(),
            Step::Symmetrizer(symmetrizer) => symmetrizer.output_kind(),
            Step::Estimator(_) => DataKind::Grouped,
        }
    }

    fn transform(&self, data: StageData) -> Result<(StageData, ForwardContext)>
    {
        match self
        {
            Step::Grouper(grouper) => grouper.transform(data),
            Step::Symmetrizer(symmetrizer) => symmetrizer.transform(data),
            Step::Estimator(_) => Err(NxcError::Configuration(String::from("the estimator is the final stage and does not transform data"))),
        }
    }

    fn get_gradient(&self, d_output: StageData, context: ForwardContext) -> Result<StageData>
    {
        match self
        {
            Step::Grouper(grouper) => grouper.get_gradient(d_output, context),
            Step::Symmetrizer(symmetrizer) => symmetrizer.get_gradient(d_output, context),
            Step::Estimator(_) => Err(NxcError::Configuration(String::from("the estimator gradient is taken w.r.t. its input by the pipeline"))),
        }
    }
}
