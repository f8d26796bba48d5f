pub mod context;
pub mod derived;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod reconciler;
pub mod relations;
pub mod retry;
pub mod source;
pub mod store;

pub use context::{FormatterContext, MappingTables};
pub use derived::DerivedMetricCalculator;
pub use error::{FormatterError, Result};
pub use models::{store_key, Category, Diagnostic, PropertySpec, Timescale};
pub use normalizer::{CategoryNormalizer, NormalizerRegistry};
pub use pipeline::{PipelineOptions, ScenarioProcessor, ScenarioReport, ScenarioStage};
pub use reconciler::{AnnualPolicy, PartitionReconciler, Reconciled};
pub use relations::RelationTables;
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper};
pub use source::{PartitionWriter, ResultSource, ZipPartition};
pub use store::CanonicalStore;
