use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ExpansionError;

/// Reference to a dataset by name.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DatasetRef(String);

impl DatasetRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DatasetRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DatasetRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reference to a pipeline definition by name.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PipelineRef(String);

impl PipelineRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PipelineRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PipelineRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PipelineRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A concrete step parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// A single concrete pipeline step: an operator name plus parameter values.
///
/// The engine never interprets steps; they are sequenced, reported on and
/// handed to the operator executor as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl StepDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Pipeline definition tree.
///
/// Generator nodes (`Alternatives`, `Sweep`, `Branch`) multiply into
/// variants at expansion time; the other nodes shape the concrete step
/// chain. Expansion order is deterministic: children are visited in
/// declaration order and sweep values in listed order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "kebab-case")]
pub enum PipelineNode {
    /// Leaf step with fixed parameters.
    Step(StepDef),
    /// Sequential group; children contribute steps in order.
    Sequence { children: Vec<PipelineNode> },
    /// Alternative-choice generator: exactly one child per variant.
    Alternatives { children: Vec<PipelineNode> },
    /// Parameter-range generator: one variant of `step` per value of `param`.
    Sweep {
        step: StepDef,
        param: String,
        values: Vec<ParamValue>,
    },
    /// Branch-with-merge: all arms execute, then the merge step joins them.
    ///
    /// Variant-wise this is the cartesian product of the arms' expansions;
    /// the concrete chain concatenates arm steps in arm order and appends
    /// the merge step.
    Branch {
        arms: Vec<PipelineNode>,
        merge: StepDef,
    },
}

/// A named pipeline definition as stored in the catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub reference: PipelineRef,
    /// Cross-validation fold count applied to every variant.
    pub folds: usize,
    /// Columns the pipeline requires the dataset to provide.
    #[serde(default)]
    pub required_columns: Vec<String>,
    pub root: PipelineNode,
}

/// Shape information for a dataset, as reported by the storage layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetShape {
    pub rows: u64,
    pub columns: Vec<String>,
}

impl DatasetShape {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// Read-only resolution of datasets and pipelines by reference.
///
/// The storage layer behind this trait is out of scope for the engine;
/// lookups are synchronous and a missing entry surfaces as an
/// expansion-time failure.
pub trait Catalog: Send + Sync {
    fn dataset_shape(&self, dataset: &DatasetRef) -> Result<DatasetShape, ExpansionError>;
    fn pipeline(&self, pipeline: &PipelineRef) -> Result<PipelineSpec, ExpansionError>;
}

/// Map-backed catalog, the default for embedding and tests.
///
/// Populated at wiring time and read-only afterwards, so lookups take no
/// lock. Share it as an `Arc<dyn Catalog>` once registration is done.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    datasets: HashMap<DatasetRef, DatasetShape>,
    pipelines: HashMap<PipelineRef, PipelineSpec>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_dataset(&mut self, dataset: DatasetRef, shape: DatasetShape) {
        self.datasets.insert(dataset, shape);
    }

    pub fn register_pipeline(&mut self, spec: PipelineSpec) {
        self.pipelines.insert(spec.reference.clone(), spec);
    }

    /// Builder-style registration for wiring catalogs up front.
    pub fn with_dataset(mut self, dataset: impl Into<DatasetRef>, shape: DatasetShape) -> Self {
        self.datasets.insert(dataset.into(), shape);
        self
    }

    pub fn with_pipeline(mut self, spec: PipelineSpec) -> Self {
        self.pipelines.insert(spec.reference.clone(), spec);
        self
    }
}

impl Catalog for InMemoryCatalog {
    fn dataset_shape(&self, dataset: &DatasetRef) -> Result<DatasetShape, ExpansionError> {
        self.datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| ExpansionError::DatasetNotFound(dataset.to_string()))
    }

    fn pipeline(&self, pipeline: &PipelineRef) -> Result<PipelineSpec, ExpansionError> {
        self.pipelines
            .get(pipeline)
            .cloned()
            .ok_or_else(|| ExpansionError::PipelineNotFound(pipeline.to_string()))
    }
}

/// Shared catalog handle as threaded through the engine.
pub type CatalogHandle = Arc<dyn Catalog>;
