use crate::context::{FormatterContext, MappingTables};
use crate::derived::DerivedMetricCalculator;
use crate::error::{FormatterError, Result};
use crate::models::{Category, Diagnostic, PropertySpec, VALUE};
use crate::normalizer::{technologies, NormalizerRegistry};
use crate::reconciler::PartitionReconciler;
use crate::relations::RelationTables;
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper};
use crate::source::{ResultSource, ZipPartition};
use crate::store::CanonicalStore;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Run-wide settings of the scenario processor.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Holds one sub-folder of partition archives per scenario.
    pub solutions_folder: PathBuf,
    /// Receives `<scenario>/<scenario>_formatted.zip`.
    pub processed_folder: PathBuf,
    pub skip_existing_properties: bool,
    /// Replace a store left by an earlier run instead of adding to it.
    pub overwrite_existing_store: bool,
    pub variance_tolerance: f64,
    /// Hours shared by adjacent partitions. Logged only.
    pub overlap_hours: u32,
    pub voll: f64,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            solutions_folder: PathBuf::from("solutions"),
            processed_folder: PathBuf::from("processed"),
            skip_existing_properties: false,
            overwrite_existing_store: false,
            variance_tolerance: 0.0,
            overlap_hours: 0,
            voll: 10_000.0,
            retry: RetryPolicy::store_contention(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioStage {
    LoadRelations,
    Normalize,
    Reconcile,
    Write,
    DeriveMetrics,
    Done,
}

impl fmt::Display for ScenarioStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioStage::LoadRelations => "load relations",
            ScenarioStage::Normalize => "normalize",
            ScenarioStage::Reconcile => "reconcile",
            ScenarioStage::Write => "write",
            ScenarioStage::DeriveMetrics => "derive metrics",
            ScenarioStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// What happened to one scenario.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub partitions: usize,
    pub written: Vec<String>,
    pub skipped_existing: Vec<String>,
    /// Keys whose write was abandoned after the retry schedule.
    pub failed_writes: Vec<String>,
    /// Keys dropped because reading, normalizing or reconciling them failed.
    pub failed_properties: Vec<String>,
    pub derived: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Formats every selected property of a scenario into its store.
pub struct ScenarioProcessor {
    options: PipelineOptions,
    mappings: MappingTables,
    properties: Vec<PropertySpec>,
    registry: NormalizerRegistry,
    sleeper: Box<dyn Sleeper>,
}

impl ScenarioProcessor {
    pub fn new(options: PipelineOptions, mappings: MappingTables, properties: Vec<PropertySpec>) -> Self {
        Self {
            options,
            mappings,
            properties,
            registry: NormalizerRegistry::standard(),
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn store_path(&self, scenario: &str) -> PathBuf {
        self.options
            .processed_folder
            .join(scenario)
            .join(format!("{}_formatted.zip", scenario))
    }

    /// Partition archives of `scenario`, in filename order.
    pub fn partitions(&self, scenario: &str) -> Result<Vec<PathBuf>> {
        let dir = self.options.solutions_folder.join(scenario);
        let pattern = dir.join("*.zip");
        let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(FormatterError::NoPartitions(dir));
        }
        Ok(files)
    }

    pub fn process_scenario(&self, scenario: &str) -> Result<ScenarioReport> {
        let start = Instant::now();
        let mut report = ScenarioReport {
            scenario: scenario.to_string(),
            ..Default::default()
        };

        stage(scenario, ScenarioStage::LoadRelations);
        let sources = self.open_partitions(scenario, &mut report.diagnostics)?;
        report.partitions = sources.len();
        if sources.len() > 1 && self.options.overlap_hours > 0 {
            info!(
                "{} partitions overlap by {} hours; overlapping rows are resolved per property",
                sources.len(),
                self.options.overlap_hours
            );
        }

        let relations = RelationTables::load(&sources[0], &mut report.diagnostics)?;
        let ctx = FormatterContext::new(relations, self.mappings.clone());
        let mut store = CanonicalStore::new(self.store_path(scenario), self.options.overwrite_existing_store);
        info!("Writing {} to {}", scenario, store.path().display());

        self.write_metadata(&ctx, &mut store, &mut report);

        let selected: Vec<&PropertySpec> = self.properties.iter().filter(|p| p.collect).collect();
        let progress = ProgressBar::new(selected.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let reconciler = PartitionReconciler::new(self.options.variance_tolerance);
        for spec in selected {
            progress.set_message(spec.key());
            if let Err(e) = self.process_property(spec, &sources, &ctx, &reconciler, &mut store, &mut report) {
                error!("Formatting {} failed: {}", spec.key(), e);
                report.failed_properties.push(spec.key());
            }
            progress.inc(1);
        }
        progress.finish_with_message("properties done");

        stage(scenario, ScenarioStage::DeriveMetrics);
        let calculator = DerivedMetricCalculator::new(self.mappings.vre_technologies.clone(), self.options.voll);
        report.derived = calculator.run(
            &mut store,
            &self.options.retry,
            self.sleeper.as_ref(),
            &mut report.diagnostics,
        );

        collect_failed_writes(&mut report);
        stage(scenario, ScenarioStage::Done);
        info!(
            "{} formatted in {:.2} minutes ({} keys, {} diagnostics)",
            scenario,
            start.elapsed().as_secs_f64() / 60.0,
            report.written.len() + report.derived.len(),
            report.diagnostics.len()
        );
        Ok(report)
    }

    fn open_partitions(&self, scenario: &str, diagnostics: &mut Vec<Diagnostic>) -> Result<Vec<ZipPartition>> {
        let files = self.partitions(scenario)?;
        let mut sources = Vec::with_capacity(files.len());

        for (i, path) in files.iter().enumerate() {
            match ZipPartition::open(path) {
                Ok(partition) => sources.push(partition),
                // Relations come from the first partition; without it there is nothing to merge against.
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    warn!("Skipping partition {}: {}", path.display(), e);
                    diagnostics.push(Diagnostic::UnreadablePartition {
                        partition: path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!("{} partitions for {}", sources.len(), scenario);
        Ok(sources)
    }

    // Native regions are only listed when no region mapping replaces them.
    fn write_metadata(&self, ctx: &FormatterContext, store: &mut CanonicalStore, report: &mut ScenarioReport) {
        let regions = ctx.relations.regions.as_ref().filter(|_| ctx.mappings.region_mapping.is_none());
        let listings = [
            ("metadata_regions", regions),
            ("metadata_zones", ctx.relations.zones.as_ref()),
            ("metadata_lines", ctx.relations.lines.as_ref()),
        ];
        let mut tables: Vec<(String, DataFrame)> = listings
            .into_iter()
            .filter_map(|(key, listing)| listing.map(|df| (key.to_string(), df.clone())))
            .collect();
        if tables.is_empty() {
            return;
        }

        match store.write_batch_with_retry(&mut tables, &self.options.retry, self.sleeper.as_ref()) {
            Ok(()) => report.written.extend(tables.into_iter().map(|(key, _)| key)),
            Err(diagnostic) => report.diagnostics.push(diagnostic),
        }
    }

    fn process_property(
        &self,
        spec: &PropertySpec,
        sources: &[ZipPartition],
        ctx: &FormatterContext,
        reconciler: &PartitionReconciler,
        store: &mut CanonicalStore,
        report: &mut ScenarioReport,
    ) -> Result<()> {
        let key = spec.key();
        if self.options.skip_existing_properties && store.contains(&key)? {
            info!("{} already in store; skipping", key);
            report.skipped_existing.push(key);
            return Ok(());
        }

        info!("Processing {} {}", spec.category, spec.property);
        stage(&key, ScenarioStage::Normalize);
        let mut frames = Vec::with_capacity(sources.len());
        let mut unmapped = BTreeSet::new();

        for source in sources {
            debug!("    {}", source.name());
            let raw = match source.query(spec.category, &spec.property, spec.timescale) {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    let diagnostic = Diagnostic::MissingProperty {
                        category: spec.category,
                        property: spec.property.clone(),
                        partition: source.name().to_string(),
                    };
                    warn!("{}", diagnostic);
                    report.diagnostics.push(diagnostic);
                    break;
                }
                Err(e) => {
                    error!("Reading {} from {} failed: {}", key, source.name(), e);
                    report.failed_properties.push(key);
                    return Ok(());
                }
            };

            let normalized = match self.registry.normalize(spec.category, raw, ctx) {
                Ok(df) => df,
                Err(e) => {
                    error!("Normalizing {} from {} failed: {}", key, source.name(), e);
                    report.failed_properties.push(key);
                    return Ok(());
                }
            };
            if spec.category == Category::Generator {
                let found = technologies(&normalized)?;
                unmapped.extend(ctx.mappings.unmapped_technologies(found.iter().map(String::as_str)));
            }
            frames.push(normalized);
        }

        if !unmapped.is_empty() {
            let diagnostic = Diagnostic::CategoryMismatch {
                technologies: unmapped.into_iter().collect(),
            };
            warn!("{}", diagnostic);
            report.diagnostics.push(diagnostic);
        }

        if frames.iter().all(|df| df.height() == 0) {
            debug!("Nothing collected for {}", key);
            return Ok(());
        }

        stage(&key, ScenarioStage::Reconcile);
        let reconciled = match reconciler.reconcile(frames, spec.timescale, spec.unit_multiplier) {
            Ok(reconciled) => reconciled,
            Err(e) => {
                error!("Reconciling {} failed: {}", key, e);
                report.failed_properties.push(key);
                return Ok(());
            }
        };
        let mut table = reconciled.table;

        if spec.category == Category::Region && spec.property == "Unserved Energy" {
            let total = table.column(VALUE)?.f64()?.sum().unwrap_or(0.0);
            if total > 0.0 {
                warn!("Scenario contains Unserved Energy: {} MW", total);
            }
        }

        stage(&key, ScenarioStage::Write);
        self.save(&key, &mut table, store, report);
        Ok(())
    }

    fn save(&self, key: &str, df: &mut DataFrame, store: &mut CanonicalStore, report: &mut ScenarioReport) {
        match store.write_with_retry(key, df, &self.options.retry, self.sleeper.as_ref()) {
            Ok(()) => report.written.push(key.to_string()),
            Err(diagnostic) => report.diagnostics.push(diagnostic),
        }
    }
}

fn stage(subject: &str, stage: ScenarioStage) {
    debug!("{}: {}", subject, stage);
}

fn collect_failed_writes(report: &mut ScenarioReport) {
    report.failed_writes = report
        .diagnostics
        .iter()
        .filter_map(|d| match d {
            Diagnostic::WriteContention { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();
}
