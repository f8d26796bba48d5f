use crate::models::{store_key, Diagnostic, TIMESTAMP, VALUE};
use crate::normalizer::{group_sum, has_column, key_columns};
use crate::retry::{RetryPolicy, Sleeper};
use crate::store::CanonicalStore;
use log::{info, warn};
use polars::prelude::*;
use std::collections::HashSet;

const GENERATION: &str = "generation";
// Columns identifying one generator in one interval.
const IDENTITY_KEYS: [&str; 3] = [TIMESTAMP, "tech", "gen_name"];

/// Secondary series computed from tables already in the store.
#[derive(Debug, Clone)]
pub struct DerivedMetricCalculator {
    pub vre_technologies: Vec<String>,
    /// Value of lost load, cost per MWh.
    pub voll: f64,
}

impl DerivedMetricCalculator {
    pub fn new(vre_technologies: Vec<String>, voll: f64) -> Self {
        Self { vre_technologies, voll }
    }

    /// Available capacity minus generation for variable-renewable
    /// technologies. Missing generation counts as zero; negative results
    /// are clipped to zero. `None` when no listed technology is present.
    pub fn curtailment(&self, available: &DataFrame, generation: &DataFrame) -> PolarsResult<Option<DataFrame>> {
        if !has_column(available, "tech") {
            return Ok(None);
        }

        let vre: HashSet<&str> = self.vre_technologies.iter().map(String::as_str).collect();
        let mask: BooleanChunked = available
            .column("tech")?
            .utf8()?
            .into_iter()
            .map(|tech| tech.map(|t| vre.contains(t)).unwrap_or(false))
            .collect();
        let available = available.filter(&mask)?;
        if available.height() == 0 {
            return Ok(None);
        }

        let keys = key_columns(&available);
        // Relation columns may be null, and null never matches in a join.
        let join_on: Vec<String> = IDENTITY_KEYS
            .iter()
            .filter(|k| has_column(&available, k) && has_column(generation, k))
            .map(|k| k.to_string())
            .collect();

        let mut wanted = join_on.clone();
        wanted.push(VALUE.to_string());
        let mut generation = group_sum(generation.select(&wanted)?, &join_on)?;
        generation.rename(VALUE, GENERATION)?;

        let difference = col(VALUE) - col(GENERATION).fill_null(lit(0.0));
        let mut select: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
        select.push(
            when(difference.clone().lt(lit(0.0)))
                .then(lit(0.0))
                .otherwise(difference)
                .alias(VALUE),
        );

        let by: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
        let curtailment = available
            .left_join(&generation, &join_on, &join_on)?
            .lazy()
            .select(select)
            .sort_by_exprs(by, vec![false; keys.len()], false, true)
            .collect()?;
        Ok(Some(curtailment))
    }

    pub fn cost_of_unserved_energy(&self, unserved_energy: &DataFrame) -> PolarsResult<DataFrame> {
        unserved_energy
            .clone()
            .lazy()
            .with_column(col(VALUE) * lit(self.voll))
            .collect()
    }

    /// Compute and store every derived metric whose inputs are present.
    /// Returns the keys written. A metric that cannot be computed, for
    /// whatever reason, becomes a diagnostic and the others still run.
    pub fn run(
        &self,
        store: &mut CanonicalStore,
        policy: &RetryPolicy,
        sleeper: &dyn Sleeper,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<String> {
        let mut written = Vec::new();

        let curtailment_key = store_key("generator", "Curtailment");
        match self.curtailment_from_store(store) {
            Ok(Some(mut curtailment)) => {
                save(store, &curtailment_key, &mut curtailment, policy, sleeper, diagnostics, &mut written)
            }
            Ok(None) => skip(
                diagnostics,
                &curtailment_key,
                "no variable-renewable technology in available capacity",
            ),
            Err(reason) => skip(diagnostics, &curtailment_key, &reason),
        }

        for group in ["region", "zone"] {
            let key = store_key(group, "Cost Unserved Energy");
            match self.unserved_cost_from_store(store, group) {
                Ok(mut cost) => save(store, &key, &mut cost, policy, sleeper, diagnostics, &mut written),
                Err(reason) => skip(diagnostics, &key, &reason),
            }
        }

        written
    }

    fn curtailment_from_store(&self, store: &CanonicalStore) -> std::result::Result<Option<DataFrame>, String> {
        let available = read_input(store, &store_key("generator", "Available Capacity"))?;
        let generation = read_input(store, &store_key("generator", "Generation"))?;
        match (available, generation) {
            (Some(available), Some(generation)) => self
                .curtailment(&available, &generation)
                .map_err(|e| format!("computing curtailment: {}", e)),
            _ => Err("generator_Available_Capacity and generator_Generation are both required".to_string()),
        }
    }

    fn unserved_cost_from_store(&self, store: &CanonicalStore, group: &str) -> std::result::Result<DataFrame, String> {
        let unserved_key = store_key(group, "Unserved Energy");
        let unserved = read_input(store, &unserved_key)?.ok_or_else(|| format!("{} not in store", unserved_key))?;
        self.cost_of_unserved_energy(&unserved)
            .map_err(|e| format!("computing cost of unserved energy: {}", e))
    }
}

// Missing and empty tables both read as `None`.
fn read_input(store: &CanonicalStore, key: &str) -> std::result::Result<Option<DataFrame>, String> {
    store
        .read(key)
        .map(non_empty)
        .map_err(|e| format!("reading {}: {}", key, e))
}

fn save(
    store: &mut CanonicalStore,
    key: &str,
    df: &mut DataFrame,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    diagnostics: &mut Vec<Diagnostic>,
    written: &mut Vec<String>,
) {
    match store.write_with_retry(key, df, policy, sleeper) {
        Ok(()) => {
            info!("{} calculated", key);
            written.push(key.to_string());
        }
        Err(diagnostic) => diagnostics.push(diagnostic),
    }
}

fn skip(diagnostics: &mut Vec<Diagnostic>, metric: &str, reason: &str) {
    warn!("{} not calculated: {}", metric, reason);
    diagnostics.push(Diagnostic::DerivedMetricPrecondition {
        metric: metric.to_string(),
        reason: reason.to_string(),
    });
}

fn non_empty(df: Option<DataFrame>) -> Option<DataFrame> {
    df.filter(|df| df.height() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::tests::RecordingSleeper;
    use tempfile::TempDir;

    fn calculator() -> DerivedMetricCalculator {
        DerivedMetricCalculator::new(vec!["techA".to_string()], 1000.0)
    }

    fn values(df: &DataFrame) -> Vec<f64> {
        df.column(VALUE).unwrap().f64().unwrap().into_no_null_iter().collect()
    }

    fn by_tech(techs: &[&str], values: &[f64]) -> DataFrame {
        df!(
            "timestamp" => vec!["t0"; techs.len()],
            "tech" => techs,
            "gen_name" => techs.iter().map(|t| format!("{}_1", t)).collect::<Vec<_>>(),
            "value" => values
        )
        .unwrap()
    }

    #[test]
    fn test_curtailment_only_covers_vre() {
        let available = by_tech(&["techA", "techB"], &[100.0, 50.0]);
        let generation = by_tech(&["techA", "techB"], &[80.0, 50.0]);

        let out = calculator().curtailment(&available, &generation).unwrap().unwrap();
        let techs: Vec<&str> = out.column("tech").unwrap().utf8().unwrap().into_no_null_iter().collect();
        assert_eq!(techs, vec!["techA"]);
        assert_eq!(values(&out), vec![20.0]);
        assert_eq!(out.get_column_names(), vec!["timestamp", "tech", "gen_name", "value"]);
    }

    #[test]
    fn test_curtailment_clips_and_fills() {
        let available = df!(
            "timestamp" => &["t0", "t1", "t2"],
            "tech" => &["techA"; 3],
            "value" => &[100.0, 30.0, 60.0]
        )
        .unwrap();
        // t1 over-generates, t2 has no generation row
        let generation = df!(
            "timestamp" => &["t0", "t1"],
            "tech" => &["techA"; 2],
            "value" => &[70.0, 45.0]
        )
        .unwrap();

        let out = calculator().curtailment(&available, &generation).unwrap().unwrap();
        assert_eq!(values(&out), vec![30.0, 0.0, 60.0]);
    }

    #[test]
    fn test_curtailment_without_vre_is_none() {
        let available = by_tech(&["techB"], &[50.0]);
        assert!(calculator().curtailment(&available, &available).unwrap().is_none());
    }

    #[test]
    fn test_cost_of_unserved_energy_scales_by_voll() {
        let unserved = df!(
            "timestamp" => &["t0", "t1", "t2"],
            "region" => &["North"; 3],
            "value" => &[0.0, 5.0, 10.0]
        )
        .unwrap();
        let cost = calculator().cost_of_unserved_energy(&unserved).unwrap();
        assert_eq!(values(&cost), vec![0.0, 5000.0, 10000.0]);
    }

    #[test]
    fn test_run_writes_available_metrics() {
        let dir = TempDir::new().unwrap();
        let mut store = CanonicalStore::new(dir.path().join("store.zip"), true);
        store
            .write("generator_Available_Capacity", &mut by_tech(&["techA", "techB"], &[100.0, 50.0]))
            .unwrap();
        store
            .write("generator_Generation", &mut by_tech(&["techA", "techB"], &[80.0, 50.0]))
            .unwrap();
        store
            .write(
                "region_Unserved_Energy",
                &mut df!("timestamp" => &["t0"], "region" => &["North"], "value" => &[2.0]).unwrap(),
            )
            .unwrap();

        let mut diagnostics = Vec::new();
        let written = calculator()
            .run(&mut store, &RetryPolicy::no_retry(), &RecordingSleeper::default(), &mut diagnostics);

        assert_eq!(written, vec!["generator_Curtailment", "region_Cost_Unserved_Energy"]);
        assert_eq!(
            diagnostics,
            vec![Diagnostic::DerivedMetricPrecondition {
                metric: "zone_Cost_Unserved_Energy".to_string(),
                reason: "zone_Unserved_Energy not in store".to_string(),
            }]
        );
        let cost = store.read("region_Cost_Unserved_Energy").unwrap().unwrap();
        assert_eq!(values(&cost), vec![2000.0]);
    }

    #[test]
    fn test_curtailment_joins_on_generator_identity() {
        // Two generators of one technology, one without a region.
        let available = df!(
            "timestamp" => &["t0", "t0"],
            "tech" => &["techA", "techA"],
            "gen_name" => &["A_1", "A_2"],
            "region" => &[Some("North"), None],
            "value" => &[50.0, 100.0]
        )
        .unwrap();
        let generation = df!(
            "timestamp" => &["t0", "t0"],
            "tech" => &["techA", "techA"],
            "gen_name" => &["A_1", "A_2"],
            "region" => &[Some("North"), None],
            "value" => &[20.0, 80.0]
        )
        .unwrap();

        let out = calculator().curtailment(&available, &generation).unwrap().unwrap();
        assert_eq!(out.height(), 2);
        let names: Vec<&str> = out.column("gen_name").unwrap().utf8().unwrap().into_no_null_iter().collect();
        assert_eq!(names, vec!["A_1", "A_2"]);
        assert_eq!(values(&out), vec![30.0, 20.0]);
        assert_eq!(out.column("region").unwrap().null_count(), 1);
    }

    fn curtailment_precondition(diagnostics: &[Diagnostic]) -> Option<String> {
        diagnostics.iter().find_map(|d| match d {
            Diagnostic::DerivedMetricPrecondition { metric, reason } if metric == "generator_Curtailment" => {
                Some(reason.clone())
            }
            _ => None,
        })
    }

    #[test]
    fn test_run_on_empty_store_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut store = CanonicalStore::new(dir.path().join("store.zip"), true);

        let mut diagnostics = Vec::new();
        let written = calculator().run(
            &mut store,
            &RetryPolicy::no_retry(),
            &RecordingSleeper::default(),
            &mut diagnostics,
        );

        assert!(written.is_empty());
        assert_eq!(diagnostics.len(), 3);
        assert_eq!(
            curtailment_precondition(&diagnostics).as_deref(),
            Some("generator_Available_Capacity and generator_Generation are both required")
        );
        assert!(store.read("generator_Curtailment").unwrap().is_none());
    }

    #[test]
    fn test_run_without_generation_skips_curtailment() {
        let dir = TempDir::new().unwrap();
        let mut store = CanonicalStore::new(dir.path().join("store.zip"), true);
        store
            .write("generator_Available_Capacity", &mut by_tech(&["techA"], &[100.0]))
            .unwrap();

        let mut diagnostics = Vec::new();
        let written = calculator().run(
            &mut store,
            &RetryPolicy::no_retry(),
            &RecordingSleeper::default(),
            &mut diagnostics,
        );

        assert!(written.is_empty());
        assert!(curtailment_precondition(&diagnostics).is_some());
        assert!(store.read("generator_Curtailment").unwrap().is_none());
        assert_eq!(store.keys().unwrap(), vec!["generator_Available_Capacity"]);
    }

    #[test]
    fn test_run_on_damaged_store_reports_every_metric() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.zip");
        std::fs::write(&path, b"not a zip archive").unwrap();
        let mut store = CanonicalStore::new(&path, false);

        let mut diagnostics = Vec::new();
        let written = calculator().run(
            &mut store,
            &RetryPolicy::no_retry(),
            &RecordingSleeper::default(),
            &mut diagnostics,
        );

        assert!(written.is_empty());
        assert_eq!(diagnostics.len(), 3);
        assert!(diagnostics
            .iter()
            .all(|d| matches!(d, Diagnostic::DerivedMetricPrecondition { reason, .. } if reason.starts_with("reading "))));
    }
}
