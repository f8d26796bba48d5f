use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FormatterError;

/// Column holding the time index of every raw and canonical table.
pub const TIMESTAMP: &str = "timestamp";
/// The single numeric column of every raw and canonical table.
pub const VALUE: &str = "value";

/// Object categories exposed by the simulation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Region,
    Zone,
    Generator,
    Line,
    Interface,
    Reserve,
    ReserveGenerators,
    Fuel,
    Constraint,
    Emission,
    Storage,
    RegionRegions,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Region,
        Category::Zone,
        Category::Generator,
        Category::Line,
        Category::Interface,
        Category::Reserve,
        Category::ReserveGenerators,
        Category::Fuel,
        Category::Constraint,
        Category::Emission,
        Category::Storage,
        Category::RegionRegions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Region => "region",
            Category::Zone => "zone",
            Category::Generator => "generator",
            Category::Line => "line",
            Category::Interface => "interface",
            Category::Reserve => "reserve",
            Category::ReserveGenerators => "reserve_generators",
            Category::Fuel => "fuel",
            Category::Constraint => "constraint",
            Category::Emission => "emission",
            Category::Storage => "storage",
            Category::RegionRegions => "region_regions",
        }
    }

    /// Class the raw results are stored under. Interfaces are reported on
    /// the line class and only differ in how they are normalized.
    pub fn source_class(&self) -> &'static str {
        match self {
            Category::Interface => "line",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = FormatterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| FormatterError::UnknownCategory(wanted.to_string()))
    }
}

/// Time granularity requested from the raw results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timescale {
    Interval,
    Day,
    Week,
    Month,
    Year,
}

impl Timescale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timescale::Interval => "interval",
            Timescale::Day => "day",
            Timescale::Week => "week",
            Timescale::Month => "month",
            Timescale::Year => "year",
        }
    }

    pub fn is_annual(&self) -> bool {
        matches!(self, Timescale::Year)
    }
}

impl fmt::Display for Timescale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timescale {
    type Err = FormatterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(Timescale::Interval),
            "day" => Ok(Timescale::Day),
            "week" => Ok(Timescale::Week),
            "month" => Ok(Timescale::Month),
            "year" => Ok(Timescale::Year),
            other => Err(FormatterError::UnknownTimescale(other.to_string())),
        }
    }
}

/// One row of the property selection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub category: Category,
    pub property: String,
    pub timescale: Timescale,
    pub unit_multiplier: f64,
    pub collect: bool,
}

impl PropertySpec {
    pub fn new(category: Category, property: &str, timescale: Timescale) -> Self {
        Self {
            category,
            property: property.to_string(),
            timescale,
            unit_multiplier: 1.0,
            collect: true,
        }
    }

    pub fn with_unit_multiplier(mut self, unit_multiplier: f64) -> Self {
        self.unit_multiplier = unit_multiplier;
        self
    }

    /// Store key of this property, e.g. `generator_Available_Capacity`.
    pub fn key(&self) -> String {
        store_key(self.category.as_str(), &self.property)
    }
}

pub fn store_key(group: &str, property: &str) -> String {
    format!("{}_{}", group, property.replace(' ', "_"))
}

/// Non-fatal conditions met while formatting a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    MissingProperty {
        category: Category,
        property: String,
        partition: String,
    },
    MissingRelation {
        relation: String,
    },
    CategoryMismatch {
        technologies: Vec<String>,
    },
    WriteContention {
        key: String,
        attempts: usize,
        reason: String,
    },
    DerivedMetricPrecondition {
        metric: String,
        reason: String,
    },
    UnreadablePartition {
        partition: String,
        reason: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingProperty { category, property, partition } => write!(
                f,
                "cannot find {} for {} in {}; property does not exist",
                property, category, partition
            ),
            Diagnostic::MissingRelation { relation } => {
                write!(f, "relation {} not included in results; merge skipped", relation)
            }
            Diagnostic::CategoryMismatch { technologies } => write!(
                f,
                "generators without a correct category mapping: {}",
                technologies.join(", ")
            ),
            Diagnostic::WriteContention { key, attempts, reason } => write!(
                f,
                "saving {} failed after {} attempts, will not attempt again: {}",
                key, attempts, reason
            ),
            Diagnostic::DerivedMetricPrecondition { metric, reason } => {
                write!(f, "{} not calculated: {}", metric, reason)
            }
            Diagnostic::UnreadablePartition { partition, reason } => {
                write!(f, "partition {} skipped: {}", partition, reason)
            }
        }
    }
}
