use anyhow::{bail, Context, Result};
use formatter_core::{Category, MappingTables, PipelineOptions, PropertySpec, RetryPolicy, Timescale};
use log::{info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file of a formatting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatterSettings {
    pub scenarios: Vec<String>,
    pub solutions_folder: PathBuf,
    pub processed_folder: PathBuf,
    /// Folder holding the mapping CSVs below.
    pub mapping_folder: PathBuf,
    /// Property selection table: group, data_set, data_type,
    /// unit_multiplier, collect_data.
    pub properties_file: PathBuf,
    /// Technology renames: Original, New.
    pub gen_names_file: String,
    pub ordered_gen_categories_file: String,
    pub vre_gen_cat_file: String,
    pub region_mapping_file: Option<String>,
    pub reserve_region_type_file: Option<String>,
    /// Value of lost load, $/MWh.
    pub voll: f64,
    pub overlap_hours: u32,
    pub variance_tolerance: f64,
    pub skip_existing_properties: bool,
    pub overwrite_existing_store: bool,
    pub write_retry_delays_secs: Vec<u64>,
}

impl Default for FormatterSettings {
    fn default() -> Self {
        Self {
            scenarios: Vec::new(),
            solutions_folder: PathBuf::from("solutions"),
            processed_folder: PathBuf::from("processed"),
            mapping_folder: PathBuf::from("mapping_folder"),
            properties_file: PathBuf::from("plexos_properties.csv"),
            gen_names_file: "gen_names.csv".to_string(),
            ordered_gen_categories_file: "ordered_gen_categories.csv".to_string(),
            vre_gen_cat_file: "vre_gen_cat.csv".to_string(),
            region_mapping_file: None,
            reserve_region_type_file: None,
            voll: 10_000.0,
            overlap_hours: 0,
            variance_tolerance: 0.0,
            skip_existing_properties: false,
            overwrite_existing_store: false,
            write_retry_delays_secs: vec![30, 60],
        }
    }
}

impl FormatterSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading settings {}", path.display()))?;
        let settings: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))?;
        Ok(settings)
    }

    /// Write the default settings to `path`; an existing file is left alone.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("{} already exists; remove it to regenerate the defaults", path.display());
        }
        let text = serde_yaml::to_string(&Self::default())?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            solutions_folder: self.solutions_folder.clone(),
            processed_folder: self.processed_folder.clone(),
            skip_existing_properties: self.skip_existing_properties,
            overwrite_existing_store: self.overwrite_existing_store,
            variance_tolerance: self.variance_tolerance,
            overlap_hours: self.overlap_hours,
            voll: self.voll,
            retry: RetryPolicy::new(
                self.write_retry_delays_secs
                    .iter()
                    .map(|s| Duration::from_secs(*s))
                    .collect(),
            ),
        }
    }

    fn mapping_path(&self, file: &str) -> PathBuf {
        self.mapping_folder.join(file)
    }
}

/// Read the property selection table. With `row` (1-based) only that
/// row is returned, collected regardless of its flag.
pub fn load_properties(path: &Path, row: Option<usize>) -> Result<Vec<PropertySpec>> {
    let df = read_csv(path)?;
    let column = |name: &str| -> Result<Vec<Option<String>>> {
        Ok(df
            .column(name)
            .with_context(|| format!("{} has no '{}' column", path.display(), name))?
            .utf8()?
            .into_iter()
            .map(|v| v.map(|s| s.trim().to_string()))
            .collect())
    };
    let groups = column("group")?;
    let data_sets = column("data_set")?;
    let data_types = column("data_type")?;
    let multipliers = column("unit_multiplier")?;
    let collect = column("collect_data")?;

    if let Some(n) = row {
        if n == 0 || n > df.height() {
            bail!("row {} is outside the {} properties in {}", n, df.height(), path.display());
        }
        info!("Will process row {} of the properties regardless of its collect flag", n);
    }

    let mut properties = Vec::new();
    for i in 0..df.height() {
        let selected = match row {
            Some(n) => i + 1 == n,
            None => collect[i].as_deref().map(is_true).unwrap_or(false),
        };
        if !selected {
            continue;
        }

        let (Some(group), Some(data_set), Some(data_type)) = (&groups[i], &data_sets[i], &data_types[i]) else {
            warn!("Properties row {} is incomplete; skipped", i + 1);
            continue;
        };
        let category: Category = match group.parse() {
            Ok(category) => category,
            Err(e) => {
                warn!("Properties row {}: {}; skipped", i + 1, e);
                continue;
            }
        };
        let timescale: Timescale = match data_type.parse() {
            Ok(timescale) => timescale,
            Err(e) => {
                warn!("Properties row {}: {}; skipped", i + 1, e);
                continue;
            }
        };
        let unit_multiplier = match multipliers[i].as_deref() {
            None | Some("") => 1.0,
            Some(m) => m
                .parse::<f64>()
                .with_context(|| format!("properties row {}: bad unit_multiplier '{}'", i + 1, m))?,
        };

        properties.push(PropertySpec::new(category, data_set, timescale).with_unit_multiplier(unit_multiplier));
    }

    info!("{} properties selected from {}", properties.len(), path.display());
    Ok(properties)
}

pub fn load_mappings(settings: &FormatterSettings) -> Result<MappingTables> {
    let gen_names = read_csv(&settings.mapping_path(&settings.gen_names_file))?;
    let originals = string_column(&gen_names, "Original")?;
    let renamed = string_column(&gen_names, "New")?;
    let tech_renames: HashMap<String, String> = originals
        .into_iter()
        .zip(renamed)
        .filter_map(|(original, new)| Some((original?, new?)))
        .collect();

    let mut mappings = MappingTables {
        tech_renames,
        ordered_technologies: first_column(&settings.mapping_path(&settings.ordered_gen_categories_file))?,
        vre_technologies: first_column(&settings.mapping_path(&settings.vre_gen_cat_file))?,
        ..Default::default()
    };

    if let Some(file) = &settings.region_mapping_file {
        let df = read_csv(&settings.mapping_path(file))?;
        mappings = mappings.with_region_mapping(df)?;
    }
    if let Some(file) = &settings.reserve_region_type_file {
        let df = read_csv(&settings.mapping_path(file))?;
        mappings = mappings.with_reserve_region_type(df)?;
    }

    info!(
        "Loaded {} technology renames, {} ordered technologies, {} variable renewables",
        mappings.tech_renames.len(),
        mappings.ordered_technologies.len(),
        mappings.vre_technologies.len()
    );
    Ok(mappings)
}

// Every column as a string; numbers in mapping files are names, not values.
fn read_csv(path: &Path) -> Result<DataFrame> {
    let df = CsvReader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?
        .has_header(true)
        .infer_schema(Some(0))
        .finish()
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(df)
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    Ok(df
        .column(name)?
        .utf8()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        .collect())
}

fn first_column(path: &Path) -> Result<Vec<String>> {
    let df = read_csv(path)?;
    let Some(name) = df.get_column_names().first().map(|n| n.to_string()) else {
        return Ok(Vec::new());
    };
    Ok(string_column(&df, &name)?.into_iter().flatten().collect())
}

fn is_true(flag: &str) -> bool {
    matches!(flag.to_ascii_lowercase().as_str(), "true" | "t" | "1" | "yes")
}
