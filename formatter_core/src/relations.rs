use crate::error::Result;
use crate::models::Diagnostic;
use crate::source::ResultSource;
use log::{info, warn};
use polars::prelude::*;

/// Object relations read from the first partition of a scenario.
///
/// Every table is optional: a relation the results do not declare is
/// `None` and the merges that depend on it are skipped.
#[derive(Debug, Clone, Default)]
pub struct RelationTables {
    /// `gen_name` → `region`
    pub region_generators: Option<DataFrame>,
    /// `gen_name` → `zone`
    pub zone_generators: Option<DataFrame>,
    /// `gen_name` → `tech`
    pub generator_category: Option<DataFrame>,
    /// `storage_resource` → `gen_name`, head and tail storages combined
    pub generator_storage: Option<DataFrame>,
    pub regions: Option<DataFrame>,
    pub zones: Option<DataFrame>,
    pub lines: Option<DataFrame>,
}

impl RelationTables {
    pub fn load(source: &dyn ResultSource, diagnostics: &mut Vec<Diagnostic>) -> Result<Self> {
        let mut missing = |relation: &str| {
            warn!("{} not included in {}; dependent merges skipped", relation, source.name());
            diagnostics.push(Diagnostic::MissingRelation {
                relation: relation.to_string(),
            });
        };

        let region_generators = match non_empty(source.relation("region_generators")?) {
            Some(df) => Some(membership(df, "region_generators", "gen_name", "region")?),
            None => {
                missing("region_generators");
                None
            }
        };

        let zone_generators = match non_empty(source.relation("zone_generators")?) {
            Some(df) => Some(membership(df, "zone_generators", "gen_name", "zone")?),
            None => {
                missing("zone_generators");
                None
            }
        };

        let generator_category = match non_empty(source.objects("generator")?) {
            Some(df) => {
                let df = df
                    .lazy()
                    .select([
                        col("name").cast(DataType::Utf8).alias("gen_name"),
                        col("category").cast(DataType::Utf8).alias("tech"),
                    ])
                    .collect()?;
                Some(first_seen(df, "gen_name", "generator objects")?)
            }
            None => {
                missing("generator objects");
                None
            }
        };

        let head = non_empty(source.relation("generator_headstorage")?);
        let tail = non_empty(source.relation("generator_tailstorage")?);
        let generator_storage = match (head, tail) {
            (Some(head), Some(tail)) => Some(storage_membership(head.vstack(&tail)?)?),
            (Some(one), None) | (None, Some(one)) => Some(storage_membership(one)?),
            (None, None) => {
                missing("generator_headstorage/generator_tailstorage");
                None
            }
        };

        let regions = non_empty(source.objects("region")?).map(object_listing).transpose()?;
        let zones = non_empty(source.objects("zone")?).map(object_listing).transpose()?;
        let lines = non_empty(source.objects("line")?).map(object_listing).transpose()?;

        info!(
            "Loaded relations from {}: regions={} zones={} storage={}",
            source.name(),
            region_generators.is_some(),
            zone_generators.is_some(),
            generator_storage.is_some()
        );

        Ok(Self {
            region_generators,
            zone_generators,
            generator_category,
            generator_storage,
            regions,
            zones,
            lines,
        })
    }
}

/// Convert a `parent`/`child` table into `child_as` → `parent_as`,
/// keeping the first parent listed for each child.
pub fn membership(df: DataFrame, relation: &str, child_as: &str, parent_as: &str) -> PolarsResult<DataFrame> {
    let df = df
        .lazy()
        .select([
            col("child").cast(DataType::Utf8).alias(child_as),
            col("parent").cast(DataType::Utf8).alias(parent_as),
        ])
        .collect()?;
    first_seen(df, child_as, relation)
}

/// Reduce `df` to one row per `key`, first occurrence wins.
pub fn first_seen(df: DataFrame, key: &str, relation: &str) -> PolarsResult<DataFrame> {
    let distinct = df.unique_stable(None, UniqueKeepStrategy::First, None)?;
    let deduped = distinct.unique_stable(Some(&[key.to_string()]), UniqueKeepStrategy::First, None)?;

    let dropped = distinct.height() - deduped.height();
    if dropped > 0 {
        warn!(
            "{}: {} rows assign a {} that already has a parent; keeping the first one listed",
            relation, dropped, key
        );
    }
    Ok(deduped)
}

// A storage can sit at the head of one generator and the tail of another,
// so only exact duplicate pairs are removed here.
fn storage_membership(df: DataFrame) -> PolarsResult<DataFrame> {
    df.lazy()
        .select([
            col("child").cast(DataType::Utf8).alias("storage_resource"),
            col("parent").cast(DataType::Utf8).alias("gen_name"),
        ])
        .collect()?
        .unique_stable(None, UniqueKeepStrategy::First, None)
}

fn object_listing(df: DataFrame) -> PolarsResult<DataFrame> {
    df.lazy()
        .select([
            col("name").cast(DataType::Utf8),
            col("category").cast(DataType::Utf8),
        ])
        .collect()
}

fn non_empty(df: Option<DataFrame>) -> Option<DataFrame> {
    df.filter(|df| df.height() > 0)
}
