use serde::{Deserialize, Serialize};

use crate::config::ExpansionLimits;
use crate::error::ExpansionError;
use crate::pipeline::{Catalog, DatasetRef, PipelineNode, PipelineRef, PipelineSpec, StepDef};
use crate::run::{Experiment, ExperimentId, Run, Variant};

/// A user's experiment submission: datasets crossed with pipelines.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentRequest {
    pub name: String,
    pub datasets: Vec<DatasetRef>,
    pub pipelines: Vec<PipelineRef>,
}

/// Result of a successful expansion: the immutable experiment record plus
/// one queued run per (dataset, pipeline) pair.
#[derive(Clone, Debug)]
pub struct ExpandedExperiment {
    pub experiment: Experiment,
    pub runs: Vec<Run>,
}

/// Expands experiment requests into concrete runs.
///
/// Expansion is pure and fail-fast: any invalid reference, incompatible
/// shape or unresolvable generator aborts the whole request with a single
/// [`ExpansionError`] and no runs are produced. Calling it twice with the
/// same input yields the same variant ordering, which is what makes
/// "variant i/N" displays and restart resume reproducible.
#[derive(Clone, Copy, Debug)]
pub struct WorkExpander {
    limits: ExpansionLimits,
}

impl Default for WorkExpander {
    fn default() -> Self {
        Self::new(ExpansionLimits::default())
    }
}

impl WorkExpander {
    pub fn new(limits: ExpansionLimits) -> Self {
        Self { limits }
    }

    /// Expand a request into an experiment and its run list.
    ///
    /// Safe to call repeatedly as a dry-run preflight; nothing is persisted
    /// here.
    pub fn expand(
        &self,
        request: &ExperimentRequest,
        catalog: &dyn Catalog,
    ) -> Result<ExpandedExperiment, ExpansionError> {
        if request.datasets.is_empty() {
            return Err(ExpansionError::InvalidRequest(
                "experiment references no datasets".into(),
            ));
        }
        if request.pipelines.is_empty() {
            return Err(ExpansionError::InvalidRequest(
                "experiment references no pipelines".into(),
            ));
        }

        let experiment = Experiment {
            id: ExperimentId::new(),
            name: request.name.clone(),
            datasets: request.datasets.clone(),
            pipelines: request.pipelines.clone(),
            created_at: chrono::Utc::now(),
        };

        let mut runs = Vec::with_capacity(request.datasets.len() * request.pipelines.len());
        let mut total_folds = 0usize;

        for dataset in &request.datasets {
            let shape = catalog.dataset_shape(dataset)?;
            for pipeline in &request.pipelines {
                let spec = catalog.pipeline(pipeline)?;
                check_compatibility(dataset, &spec, &shape)?;

                let chains =
                    expand_node(&spec.root, &spec.reference, self.limits.max_variants_per_run)?;

                total_folds += chains.len() * spec.folds;
                if total_folds > self.limits.max_total_folds {
                    return Err(ExpansionError::LimitExceeded(format!(
                        "experiment totals more than {} folds",
                        self.limits.max_total_folds
                    )));
                }

                let variant_count = chains.len();
                let variants = chains
                    .into_iter()
                    .enumerate()
                    .map(|(index, steps)| Variant::new(index, variant_count, steps, spec.folds))
                    .collect();

                runs.push(Run::new(
                    experiment.id,
                    dataset.clone(),
                    pipeline.clone(),
                    variants,
                ));
            }
        }

        Ok(ExpandedExperiment { experiment, runs })
    }
}

fn check_compatibility(
    dataset: &DatasetRef,
    spec: &PipelineSpec,
    shape: &crate::pipeline::DatasetShape,
) -> Result<(), ExpansionError> {
    for column in &spec.required_columns {
        if !shape.has_column(column) {
            return Err(ExpansionError::IncompatibleShape {
                pipeline: spec.reference.to_string(),
                dataset: dataset.to_string(),
                reason: format!("missing required column {column}"),
            });
        }
    }
    if spec.folds == 0 {
        return Err(ExpansionError::UnresolvableGenerator {
            pipeline: spec.reference.to_string(),
            reason: "fold count is zero".into(),
        });
    }
    if shape.rows < spec.folds as u64 {
        return Err(ExpansionError::IncompatibleShape {
            pipeline: spec.reference.to_string(),
            dataset: dataset.to_string(),
            reason: format!(
                "{} rows cannot be split into {} folds",
                shape.rows, spec.folds
            ),
        });
    }
    Ok(())
}

/// Recursively expand a pipeline node into every concrete step chain it
/// denotes, in deterministic order.
///
/// Each returned chain is one variant's step sequence. Order: children are
/// visited in declaration order, sweep values in listed order, and product
/// combination keeps the left operand as the slower-varying axis.
///
/// The variant limit is enforced on every intermediate result, so stacked
/// generators bail out early instead of materializing a combinatorial chain
/// set first.
fn expand_node(
    node: &PipelineNode,
    pipeline: &PipelineRef,
    max_variants: usize,
) -> Result<Vec<Vec<StepDef>>, ExpansionError> {
    match node {
        PipelineNode::Step(step) => Ok(vec![vec![step.clone()]]),

        PipelineNode::Sequence { children } => {
            if children.is_empty() {
                return Err(ExpansionError::UnresolvableGenerator {
                    pipeline: pipeline.to_string(),
                    reason: "empty sequence".into(),
                });
            }
            let mut chains: Vec<Vec<StepDef>> = vec![Vec::new()];
            for child in children {
                let child_chains = expand_node(child, pipeline, max_variants)?;
                chains = product(chains, child_chains, pipeline, max_variants)?;
            }
            Ok(chains)
        }

        PipelineNode::Alternatives { children } => {
            if children.is_empty() {
                return Err(ExpansionError::UnresolvableGenerator {
                    pipeline: pipeline.to_string(),
                    reason: "alternatives node has no choices".into(),
                });
            }
            let mut chains = Vec::new();
            for child in children {
                chains.extend(expand_node(child, pipeline, max_variants)?);
                if chains.len() > max_variants {
                    return Err(variant_limit(pipeline, max_variants));
                }
            }
            Ok(chains)
        }

        PipelineNode::Sweep {
            step,
            param,
            values,
        } => {
            if values.is_empty() {
                return Err(ExpansionError::UnresolvableGenerator {
                    pipeline: pipeline.to_string(),
                    reason: format!("sweep over {param} has no values"),
                });
            }
            if values.len() > max_variants {
                return Err(variant_limit(pipeline, max_variants));
            }
            Ok(values
                .iter()
                .map(|value| {
                    let mut concrete = step.clone();
                    concrete.params.insert(param.clone(), value.clone());
                    vec![concrete]
                })
                .collect())
        }

        PipelineNode::Branch { arms, merge } => {
            if arms.is_empty() {
                return Err(ExpansionError::UnresolvableGenerator {
                    pipeline: pipeline.to_string(),
                    reason: "branch node has no arms".into(),
                });
            }
            let mut chains: Vec<Vec<StepDef>> = vec![Vec::new()];
            for arm in arms {
                let arm_chains = expand_node(arm, pipeline, max_variants)?;
                chains = product(chains, arm_chains, pipeline, max_variants)?;
            }
            for chain in &mut chains {
                chain.push(merge.clone());
            }
            Ok(chains)
        }
    }
}

/// Cartesian product of two chain sets, concatenating step sequences.
///
/// Rejects a product that would exceed the variant limit (or overflow)
/// before allocating anything.
fn product(
    left: Vec<Vec<StepDef>>,
    right: Vec<Vec<StepDef>>,
    pipeline: &PipelineRef,
    max_variants: usize,
) -> Result<Vec<Vec<StepDef>>, ExpansionError> {
    let count = left
        .len()
        .checked_mul(right.len())
        .filter(|&count| count <= max_variants)
        .ok_or_else(|| variant_limit(pipeline, max_variants))?;
    let mut out = Vec::with_capacity(count);
    for l in &left {
        for r in &right {
            let mut chain = l.clone();
            chain.extend(r.iter().cloned());
            out.push(chain);
        }
    }
    Ok(out)
}

fn variant_limit(pipeline: &PipelineRef, max_variants: usize) -> ExpansionError {
    ExpansionError::LimitExceeded(format!(
        "pipeline {pipeline} expands into more than {max_variants} variants"
    ))
}
