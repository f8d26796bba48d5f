use crate::models::{Timescale, VALUE};
use crate::normalizer::{has_column, key_columns};
use log::{debug, info};
use polars::prelude::*;
use serde::Serialize;

/// How annual partitions of one property were combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnualPolicy {
    /// Partitions differ; they are separate observations.
    Sum,
    /// Partitions re-report the same values.
    Max,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub table: DataFrame,
    pub annual_policy: Option<AnnualPolicy>,
    pub duplicates_removed: usize,
}

/// Merges the per-partition tables of one property into a single
/// canonical table.
#[derive(Debug, Clone, Copy)]
pub struct PartitionReconciler {
    /// Largest per-key variance still treated as "identical partitions".
    pub variance_tolerance: f64,
}

impl Default for PartitionReconciler {
    fn default() -> Self {
        Self {
            variance_tolerance: 0.0,
        }
    }
}

impl PartitionReconciler {
    pub fn new(variance_tolerance: f64) -> Self {
        Self { variance_tolerance }
    }

    /// Partitions must be given in filename order; both policies depend on it.
    pub fn reconcile(
        &self,
        partitions: Vec<DataFrame>,
        timescale: Timescale,
        unit_multiplier: f64,
    ) -> PolarsResult<Reconciled> {
        let mut frames = partitions.into_iter().filter(|df| df.height() > 0);
        let mut table = match frames.next() {
            Some(first) => first,
            None => {
                return Ok(Reconciled {
                    table: DataFrame::default(),
                    annual_policy: None,
                    duplicates_removed: 0,
                })
            }
        };
        for df in frames {
            table.vstack_mut(&df)?;
        }
        table.align_chunks();

        let keys = key_columns(&table);
        if timescale.is_annual() {
            self.reconcile_annual(table, &keys, unit_multiplier)
        } else {
            reconcile_series(table, &keys)
        }
    }

    fn reconcile_annual(&self, table: DataFrame, keys: &[String], unit_multiplier: f64) -> PolarsResult<Reconciled> {
        let by: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
        let scaled = table
            .lazy()
            .with_column(col(VALUE) * lit(unit_multiplier))
            .collect()?;

        let mut variance = scaled
            .clone()
            .lazy()
            .group_by(by.clone())
            .agg([col(VALUE).var(1)]);
        // Hydro output legitimately moves between re-solves.
        if has_column(&scaled, "tech") {
            variance = variance.filter(col("tech").neq(lit("Hydro")).or(col("tech").is_null()));
        }
        let max_variance = variance
            .select([col(VALUE).max()])
            .collect()?
            .column(VALUE)?
            .f64()?
            .get(0);

        let policy = match max_variance {
            Some(v) if v > self.variance_tolerance => AnnualPolicy::Sum,
            _ => AnnualPolicy::Max,
        };
        match policy {
            AnnualPolicy::Sum => info!("Values differ between partitions (max variance {:?}); summing", max_variance),
            AnnualPolicy::Max => info!("Partitions report identical values; reporting the maximum"),
        }

        let value = match policy {
            AnnualPolicy::Sum => col(VALUE).sum(),
            AnnualPolicy::Max => col(VALUE).max(),
        };
        let table = scaled
            .lazy()
            .group_by(by.clone())
            .agg([value])
            .sort_by_exprs(by, vec![false; keys.len()], false, false)
            .collect()?;

        Ok(Reconciled {
            table,
            annual_policy: Some(policy),
            duplicates_removed: 0,
        })
    }
}

fn reconcile_series(table: DataFrame, keys: &[String]) -> PolarsResult<Reconciled> {
    let before = table.height();
    let subset = if keys.is_empty() { None } else { Some(keys) };
    let deduped = table.unique_stable(subset, UniqueKeepStrategy::First, None)?;

    let duplicates_removed = before - deduped.height();
    if duplicates_removed > 0 {
        info!("Drop duplicates removed {} rows", duplicates_removed);
    } else {
        debug!("No overlapping rows between partitions");
    }

    let by: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
    let table = if by.is_empty() {
        deduped
    } else {
        deduped
            .lazy()
            .sort_by_exprs(by, vec![false; keys.len()], false, true)
            .collect()?
    };

    Ok(Reconciled {
        table,
        annual_policy: None,
        duplicates_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annual(techs: &[&str], values: &[f64]) -> DataFrame {
        df!(
            "timestamp" => vec!["2030"; techs.len()],
            "tech" => techs,
            "value" => values
        )
        .unwrap()
    }

    fn values(df: &DataFrame) -> Vec<f64> {
        df.column(VALUE).unwrap().f64().unwrap().into_no_null_iter().collect()
    }

    #[test]
    fn test_identical_annual_partitions_take_max() {
        let partition = annual(&["Gas-CC", "Wind"], &[5.0, 10.0]);
        let out = PartitionReconciler::default()
            .reconcile(vec![partition.clone(), partition], Timescale::Year, 1.0)
            .unwrap();

        assert_eq!(out.annual_policy, Some(AnnualPolicy::Max));
        assert_eq!(values(&out.table), vec![5.0, 10.0]);
    }

    #[test]
    fn test_differing_annual_partitions_are_summed() {
        let out = PartitionReconciler::default()
            .reconcile(
                vec![
                    annual(&["Gas-CC", "Wind"], &[5.0, 10.0]),
                    annual(&["Gas-CC", "Wind"], &[5.0, 12.0]),
                ],
                Timescale::Year,
                1.0,
            )
            .unwrap();

        assert_eq!(out.annual_policy, Some(AnnualPolicy::Sum));
        assert_eq!(values(&out.table), vec![10.0, 22.0]);
    }

    #[test]
    fn test_hydro_variance_is_ignored() {
        let out = PartitionReconciler::default()
            .reconcile(
                vec![
                    annual(&["Hydro", "Wind"], &[3.0, 10.0]),
                    annual(&["Hydro", "Wind"], &[4.0, 10.0]),
                ],
                Timescale::Year,
                1.0,
            )
            .unwrap();

        assert_eq!(out.annual_policy, Some(AnnualPolicy::Max));
        assert_eq!(values(&out.table), vec![4.0, 10.0]);
    }

    #[test]
    fn test_variance_below_tolerance_takes_max() {
        let out = PartitionReconciler::new(0.5)
            .reconcile(
                vec![annual(&["Wind"], &[10.0]), annual(&["Wind"], &[10.2])],
                Timescale::Year,
                1.0,
            )
            .unwrap();
        assert_eq!(out.annual_policy, Some(AnnualPolicy::Max));
        assert_eq!(values(&out.table), vec![10.2]);
    }

    #[test]
    fn test_unit_multiplier_scales_annual_values() {
        let out = PartitionReconciler::default()
            .reconcile(vec![annual(&["Wind"], &[2.5])], Timescale::Year, 1000.0)
            .unwrap();
        assert_eq!(values(&out.table), vec![2500.0]);
    }

    #[test]
    fn test_interval_overlap_keeps_first_partition() {
        let first = df!("timestamp" => &["t0", "t1"], "region" => &["North", "North"], "value" => &[1.0, 2.0]).unwrap();
        let second = df!("timestamp" => &["t1", "t2"], "region" => &["North", "North"], "value" => &[9.0, 3.0]).unwrap();

        let out = PartitionReconciler::default()
            .reconcile(vec![first, second], Timescale::Interval, 1.0)
            .unwrap();

        assert_eq!(out.annual_policy, None);
        assert_eq!(out.duplicates_removed, 1);
        assert_eq!(out.table.height(), 3);
        assert_eq!(values(&out.table), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_single_partition_is_unchanged() {
        let partition = df!(
            "timestamp" => &["t0", "t0", "t1"],
            "region" => &["North", "South", "North"],
            "value" => &[1.0, 2.0, 3.0]
        )
        .unwrap();

        let out = PartitionReconciler::default()
            .reconcile(vec![partition.clone()], Timescale::Interval, 1.0)
            .unwrap();
        assert_eq!(out.duplicates_removed, 0);
        assert_eq!(out.table.get_column_names(), partition.get_column_names());
        assert_eq!(values(&out.table), values(&partition));
    }

    #[test]
    fn test_no_partitions_reconcile_to_empty() {
        let out = PartitionReconciler::default()
            .reconcile(vec![DataFrame::default()], Timescale::Year, 1.0)
            .unwrap();
        assert_eq!(out.table.height(), 0);
        assert_eq!(out.annual_policy, None);
    }
}
