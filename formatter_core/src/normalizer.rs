//! Per-category transforms from raw result tables to canonical long form.
//!
//! Every normalizer follows the same skeleton: flatten the raw table,
//! rename identity columns, drop metadata columns, merge relation
//! columns, then group by the key columns (timestamp first) and sum the
//! value. The group-sum collapses rows duplicated by merges and folds
//! bands into a single value per key.

use crate::context::FormatterContext;
use crate::error::{FormatterError, Result};
use crate::models::{Category, TIMESTAMP, VALUE};
use log::debug;
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap};

/// Normalization capability of one object category.
pub trait CategoryNormalizer {
    fn category(&self) -> Category;

    fn normalize(&self, raw: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame>;
}

/// Category → normalizer lookup built once at startup.
pub struct NormalizerRegistry {
    normalizers: HashMap<Category, Box<dyn CategoryNormalizer>>,
}

impl NormalizerRegistry {
    pub fn empty() -> Self {
        Self {
            normalizers: HashMap::new(),
        }
    }

    /// Registry covering every [`Category`].
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RegionNormalizer));
        registry.register(Box::new(GeneratorNormalizer));
        registry.register(Box::new(StorageNormalizer));
        registry.register(Box::new(ReserveNormalizer));
        registry.register(Box::new(ReserveGeneratorsNormalizer));
        for layout in FIXED_LAYOUTS {
            registry.register(Box::new(FixedKeyNormalizer(layout)));
        }
        registry
    }

    pub fn register(&mut self, normalizer: Box<dyn CategoryNormalizer>) {
        self.normalizers.insert(normalizer.category(), normalizer);
    }

    pub fn get(&self, category: Category) -> Option<&dyn CategoryNormalizer> {
        self.normalizers.get(&category).map(|n| n.as_ref())
    }

    pub fn normalize(&self, category: Category, raw: DataFrame, ctx: &FormatterContext) -> Result<DataFrame> {
        let normalizer = self
            .get(category)
            .ok_or_else(|| FormatterError::MissingNormalizer(category.to_string()))?;

        if raw.height() == 0 {
            debug!("Empty raw table for {}", category);
            return Ok(DataFrame::default());
        }
        Ok(normalizer.normalize(raw, ctx)?)
    }
}

/// Column layout of categories whose keys need no relation merges.
struct FixedLayout {
    category: Category,
    renames: &'static [(&'static str, &'static str)],
    keys: &'static [&'static str],
}

const FIXED_LAYOUTS: [FixedLayout; 7] = [
    FixedLayout {
        category: Category::Zone,
        renames: &[("name", "zone")],
        keys: &["zone"],
    },
    FixedLayout {
        category: Category::Line,
        renames: &[("name", "line_name")],
        keys: &["line_name"],
    },
    FixedLayout {
        category: Category::Interface,
        renames: &[("category", "region_region"), ("name", "line_name")],
        keys: &["region_region", "line_name"],
    },
    FixedLayout {
        category: Category::Fuel,
        renames: &[("name", "fuel_type")],
        keys: &["fuel_type"],
    },
    FixedLayout {
        category: Category::Constraint,
        renames: &[("category", "constraint_category"), ("name", "constraint")],
        keys: &["constraint_category", "constraint"],
    },
    FixedLayout {
        category: Category::Emission,
        renames: &[("name", "emission_type")],
        keys: &["emission_type"],
    },
    FixedLayout {
        category: Category::RegionRegions,
        renames: &[],
        keys: &["parent", "child"],
    },
];

struct FixedKeyNormalizer(FixedLayout);

impl CategoryNormalizer for FixedKeyNormalizer {
    fn category(&self) -> Category {
        self.0.category
    }

    fn normalize(&self, raw: DataFrame, _ctx: &FormatterContext) -> PolarsResult<DataFrame> {
        let mut df = flatten(raw)?;
        rename_present(&mut df, self.0.renames)?;
        let keys = fixed_keys(&df, self.0.keys);
        group_sum(df, &keys)
    }
}

pub struct RegionNormalizer;

impl CategoryNormalizer for RegionNormalizer {
    fn category(&self) -> Category {
        Category::Region
    }

    fn normalize(&self, raw: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame> {
        let mut df = flatten(raw)?;
        rename_present(&mut df, &[("name", "region")])?;
        let df = drop_present(df, &["band", "property", "category"])?;
        let df = merge(df, ctx.mappings.region_mapping.as_ref(), "region")?;
        let keys = leading_keys(&df, &["region"]);
        group_sum(df, &keys)
    }
}

pub struct GeneratorNormalizer;

impl CategoryNormalizer for GeneratorNormalizer {
    fn category(&self) -> Category {
        Category::Generator
    }

    fn normalize(&self, raw: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame> {
        let mut df = drop_present(flatten(raw)?, &["band", "property"])?;
        rename_present(&mut df, &[("category", "tech"), ("name", "gen_name")])?;
        let mut df = merge_geography(df, ctx)?;
        rename_technologies(&mut df, ctx)?;
        let keys = leading_keys(&df, &["tech", "gen_name"]);
        group_sum(df, &keys)
    }
}

pub struct StorageNormalizer;

impl CategoryNormalizer for StorageNormalizer {
    fn category(&self) -> Category {
        Category::Storage
    }

    fn normalize(&self, raw: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame> {
        let mut df = drop_present(flatten(raw)?, &["band", "property", "category"])?;
        rename_present(&mut df, &[("name", "storage_resource")])?;
        let df = merge(df, ctx.relations.generator_storage.as_ref(), "storage_resource")?;
        let df = merge_geography(df, ctx)?;
        let keys = leading_keys(&df, &["storage_resource", "gen_name"]);
        group_sum(df, &keys)
    }
}

pub struct ReserveNormalizer;

impl CategoryNormalizer for ReserveNormalizer {
    fn category(&self) -> Category {
        Category::Reserve
    }

    fn normalize(&self, raw: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame> {
        let mut df = drop_present(flatten(raw)?, &["band", "property", "category"])?;
        rename_present(&mut df, &[("name", "parent")])?;

        match ctx.mappings.reserve_region_type.as_ref() {
            Some(reserves) => {
                let df = merge(df, Some(reserves), "parent")?;
                let keys = fixed_keys(&df, &["reserve_region", "reserve_type"]);
                group_sum(df, &keys)
            }
            None => {
                let keys = fixed_keys(&df, &["parent"]);
                group_sum(df, &keys)
            }
        }
    }
}

pub struct ReserveGeneratorsNormalizer;

impl CategoryNormalizer for ReserveGeneratorsNormalizer {
    fn category(&self) -> Category {
        Category::ReserveGenerators
    }

    fn normalize(&self, raw: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame> {
        let mut df = drop_present(flatten(raw)?, &["band", "property", "category"])?;
        rename_present(&mut df, &[("child", "gen_name")])?;
        let df = merge(df, ctx.relations.generator_category.as_ref(), "gen_name")?;
        let mut df = merge(df, ctx.mappings.reserve_region_type.as_ref(), "parent")?;
        rename_technologies(&mut df, ctx)?;

        let keys = if has_column(&df, "reserve_region") {
            fixed_keys(&df, &["tech", "reserve_region", "reserve_type"])
        } else {
            fixed_keys(&df, &["tech", "parent"])
        };
        group_sum(df, &keys)
    }
}

/// Technologies present in a normalized generator table.
pub fn technologies(df: &DataFrame) -> PolarsResult<BTreeSet<String>> {
    if !has_column(df, "tech") {
        return Ok(BTreeSet::new());
    }
    Ok(df
        .column("tech")?
        .utf8()?
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect())
}

/// Key columns of a canonical table, in order.
pub fn key_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .filter(|name| *name != VALUE)
        .map(str::to_string)
        .collect()
}

pub(crate) fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| *c == name)
}

// Identity columns become strings so relation merges compare like types.
fn flatten(raw: DataFrame) -> PolarsResult<DataFrame> {
    let columns: Vec<Expr> = raw
        .get_column_names()
        .into_iter()
        .map(|name| match name {
            TIMESTAMP => col(name),
            VALUE => col(name).cast(DataType::Float64),
            _ => col(name).cast(DataType::Utf8),
        })
        .collect();
    raw.lazy().select(columns).collect()
}

fn rename_present(df: &mut DataFrame, renames: &[(&str, &str)]) -> PolarsResult<()> {
    for (from, to) in renames {
        if has_column(df, from) {
            df.rename(from, to)?;
        }
    }
    Ok(())
}

fn drop_present(mut df: DataFrame, columns: &[&str]) -> PolarsResult<DataFrame> {
    for name in columns {
        if has_column(&df, name) {
            df.drop_in_place(name)?;
        }
    }
    Ok(df)
}

/// Left-merge `relation` on `on`. Skipped when the relation is absent or
/// the table has no `on` column.
fn merge(df: DataFrame, relation: Option<&DataFrame>, on: &str) -> PolarsResult<DataFrame> {
    match relation {
        Some(relation) if has_column(&df, on) => df.left_join(relation, [on], [on]),
        _ => Ok(df),
    }
}

// region, zone, then the custom aggregation columns keyed on region
fn merge_geography(df: DataFrame, ctx: &FormatterContext) -> PolarsResult<DataFrame> {
    let df = merge(df, ctx.relations.region_generators.as_ref(), "gen_name")?;
    let df = merge(df, ctx.relations.zone_generators.as_ref(), "gen_name")?;
    merge(df, ctx.mappings.region_mapping.as_ref(), "region")
}

fn rename_technologies(df: &mut DataFrame, ctx: &FormatterContext) -> PolarsResult<()> {
    if !has_column(df, "tech") {
        return Ok(());
    }
    let renamed: Vec<Option<String>> = df
        .column("tech")?
        .utf8()?
        .into_iter()
        .map(|tech| tech.map(|t| ctx.mappings.rename_technology(t).to_string()))
        .collect();
    df.with_column(Series::new("tech", renamed))?;
    Ok(())
}

/// `timestamp`, then `leading` in order, then every other non-value
/// column in table order.
fn leading_keys(df: &DataFrame, leading: &[&str]) -> Vec<String> {
    let mut keys = fixed_keys(df, leading);
    for name in df.get_column_names() {
        if name != VALUE && !keys.iter().any(|k| k == name) {
            keys.push(name.to_string());
        }
    }
    keys
}

/// `timestamp` followed by the listed columns that are present.
fn fixed_keys(df: &DataFrame, keys: &[&str]) -> Vec<String> {
    std::iter::once(TIMESTAMP)
        .chain(keys.iter().copied())
        .filter(|k| has_column(df, k))
        .map(str::to_string)
        .collect()
}

pub(crate) fn group_sum(df: DataFrame, keys: &[String]) -> PolarsResult<DataFrame> {
    let by: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
    df.lazy()
        .group_by(by.clone())
        .agg([col(VALUE).sum()])
        .sort_by_exprs(by, vec![false; keys.len()], false, false)
        .collect()
}
