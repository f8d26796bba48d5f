use crate::relations::{first_seen, RelationTables};
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap};

/// User-maintained mapping tables, shared by every scenario of a run.
#[derive(Debug, Clone, Default)]
pub struct MappingTables {
    /// Original technology name → canonical technology name.
    pub tech_renames: HashMap<String, String>,
    /// Canonical technologies in stacking order.
    pub ordered_technologies: Vec<String>,
    /// Technologies whose curtailment is reported.
    pub vre_technologies: Vec<String>,
    /// `region` plus the custom aggregation columns.
    pub region_mapping: Option<DataFrame>,
    /// `parent` → `reserve_region`, `reserve_type`.
    pub reserve_region_type: Option<DataFrame>,
}

impl MappingTables {
    /// Attach a region aggregation table. Empty tables leave native
    /// regions untouched.
    pub fn with_region_mapping(mut self, df: DataFrame) -> PolarsResult<Self> {
        if df.height() == 0 {
            self.region_mapping = None;
            return Ok(self);
        }

        let columns: Vec<Expr> = df
            .get_column_names()
            .into_iter()
            .filter(|name| *name != "category")
            .map(|name| col(name).cast(DataType::Utf8))
            .collect();
        let df = df.lazy().select(columns).collect()?;

        self.region_mapping = Some(first_seen(df, "region", "region mapping")?);
        Ok(self)
    }

    /// Attach the reserve region/type table. Accepts either the
    /// `parent, Reserve_Region, Type` headers or the canonical names.
    pub fn with_reserve_region_type(mut self, df: DataFrame) -> PolarsResult<Self> {
        if df.height() == 0 {
            self.reserve_region_type = None;
            return Ok(self);
        }

        let names = df.get_column_names();
        let pick = |candidates: &[&str]| -> PolarsResult<String> {
            candidates
                .iter()
                .find(|c| names.contains(*c))
                .map(|c| c.to_string())
                .ok_or_else(|| {
                    PolarsError::ColumnNotFound(format!("reserve mapping needs one of {:?}", candidates).into())
                })
        };
        let parent = pick(&["parent", "Reserve", "reserve"])?;
        let region = pick(&["Reserve_Region", "reserve_region"])?;
        let kind = pick(&["Type", "reserve_type"])?;

        let df = df
            .clone()
            .lazy()
            .select([
                col(&parent).cast(DataType::Utf8).alias("parent"),
                col(&region).cast(DataType::Utf8).alias("reserve_region"),
                col(&kind).cast(DataType::Utf8).alias("reserve_type"),
            ])
            .collect()?;

        self.reserve_region_type = Some(first_seen(df, "parent", "reserve region mapping")?);
        Ok(self)
    }

    /// Canonical name for `tech`; unmapped names pass through unchanged.
    pub fn rename_technology<'a>(&'a self, tech: &'a str) -> &'a str {
        self.tech_renames.get(tech).map(String::as_str).unwrap_or(tech)
    }

    /// Names a generator technology is allowed to carry after renaming.
    pub fn canonical_technologies(&self) -> BTreeSet<&str> {
        if self.ordered_technologies.is_empty() {
            self.tech_renames.values().map(String::as_str).collect()
        } else {
            self.ordered_technologies.iter().map(String::as_str).collect()
        }
    }

    /// Technologies present in `found` without a canonical entry.
    pub fn unmapped_technologies<'a, I>(&self, found: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let canonical = self.canonical_technologies();
        found
            .into_iter()
            .filter(|tech| !canonical.contains(tech))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Everything a normalizer may consult, fixed for one scenario.
#[derive(Debug, Clone, Default)]
pub struct FormatterContext {
    pub relations: RelationTables,
    pub mappings: MappingTables,
}

impl FormatterContext {
    pub fn new(relations: RelationTables, mappings: MappingTables) -> Self {
        Self { relations, mappings }
    }
}
