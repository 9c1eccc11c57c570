//! Declarative data-quality scoring over the landed tables.
//!
//! Each spec names a table, its required columns, value ranges, duplicate
//! keys, and a freshness window. The four dimension scores are computed by
//! SQL over the live table and folded into a weighted overall score; a
//! table below its threshold is reported as failing and the quality job
//! turns that into a failed dependency for everything downstream.

use chrono::{Duration, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use serde::Serialize;

use crate::error::BatchError;
use crate::pipeline::transform::ContentType;
use crate::repository::models::QualityThresholdRecord;
use crate::repository::pool::{run_blocking, SqlitePool};

/// Dimension weights; equal by default, adjustable per table.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityWeights {
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub freshness: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.25,
            validity: 0.25,
            consistency: 0.25,
            freshness: 0.25,
        }
    }
}

/// Allowed numeric range for one column.
#[derive(Debug, Clone, Serialize)]
pub struct ValueRange {
    pub column: String,
    pub min: f64,
    pub max: f64,
}

/// Declarative check description for one table.
#[derive(Debug, Clone, Serialize)]
pub struct QualitySpec {
    pub table: String,
    pub required_columns: Vec<String>,
    pub date_column: Option<String>,
    pub freshness_threshold_days: i64,
    pub duplicate_key_columns: Vec<String>,
    pub value_ranges: Vec<ValueRange>,
    pub weights: QualityWeights,
    pub min_overall_score: f64,
}

/// Scores for one table, all in [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub table: String,
    pub row_count: u64,
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub freshness: f64,
    pub overall: f64,
    pub passed: bool,
}

pub struct QualityGate {
    pool: SqlitePool,
    tz: Tz,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    n: i64,
}

impl QualityGate {
    pub fn new(pool: SqlitePool, tz: Tz) -> Self {
        Self { pool, tz }
    }

    /// Built-in specs for every published table. The
    /// `data_quality_thresholds` table overrides score floors and weights
    /// at evaluation time.
    pub fn default_specs() -> Vec<QualitySpec> {
        let mut specs: Vec<QualitySpec> = ContentType::ALL
            .iter()
            .map(|ct| QualitySpec {
                table: ct.table().to_string(),
                required_columns: vec!["content_id".to_string(), "title".to_string()],
                date_column: Some("last_sync_at".to_string()),
                freshness_threshold_days: 2,
                duplicate_key_columns: vec!["content_id".to_string()],
                value_ranges: vec![
                    ValueRange {
                        column: "longitude".to_string(),
                        min: 123.0,
                        max: 132.0,
                    },
                    ValueRange {
                        column: "latitude".to_string(),
                        min: 32.0,
                        max: 39.0,
                    },
                ],
                weights: QualityWeights::default(),
                min_overall_score: 0.7,
            })
            .collect();

        specs.push(QualitySpec {
            table: "weather_current".to_string(),
            required_columns: vec![
                "region_code".to_string(),
                "weather_date".to_string(),
                "temperature".to_string(),
            ],
            date_column: Some("weather_date".to_string()),
            freshness_threshold_days: 1,
            duplicate_key_columns: vec!["region_code".to_string(), "weather_date".to_string()],
            value_ranges: vec![
                ValueRange {
                    column: "temperature".to_string(),
                    min: -50.0,
                    max: 60.0,
                },
                ValueRange {
                    column: "humidity".to_string(),
                    min: 0.0,
                    max: 100.0,
                },
            ],
            weights: QualityWeights::default(),
            min_overall_score: 0.6,
        });

        specs.push(QualitySpec {
            table: "weather_forecasts".to_string(),
            required_columns: vec![
                "region_code".to_string(),
                "forecast_date".to_string(),
                "forecast_time".to_string(),
            ],
            date_column: Some("forecast_date".to_string()),
            freshness_threshold_days: 1,
            duplicate_key_columns: vec![
                "region_code".to_string(),
                "forecast_date".to_string(),
                "forecast_time".to_string(),
            ],
            value_ranges: vec![ValueRange {
                column: "temperature".to_string(),
                min: -50.0,
                max: 60.0,
            }],
            // Forecast payloads live or die on field coverage; weight the
            // content dimensions over the structural ones.
            weights: QualityWeights {
                completeness: 0.4,
                validity: 0.4,
                consistency: 0.1,
                freshness: 0.1,
            },
            min_overall_score: 0.5,
        });

        specs.push(QualitySpec {
            table: "historical_weather_daily".to_string(),
            required_columns: vec!["region_code".to_string(), "weather_date".to_string()],
            date_column: Some("weather_date".to_string()),
            freshness_threshold_days: 3,
            duplicate_key_columns: vec!["region_code".to_string(), "weather_date".to_string()],
            value_ranges: vec![ValueRange {
                column: "avg_temp".to_string(),
                min: -50.0,
                max: 60.0,
            }],
            weights: QualityWeights::default(),
            min_overall_score: 0.6,
        });

        specs
    }

    /// Apply any configured threshold overrides to a spec list.
    pub async fn with_overrides(
        &self,
        mut specs: Vec<QualitySpec>,
    ) -> Result<Vec<QualitySpec>, BatchError> {
        use crate::schema::data_quality_thresholds::dsl;
        let pool = self.pool.clone();
        let overrides = run_blocking(pool, move |conn| {
            dsl::data_quality_thresholds.load::<QualityThresholdRecord>(conn)
        })
        .await?;

        for row in overrides {
            if let Some(spec) = specs.iter_mut().find(|s| s.table == row.table_name) {
                spec.min_overall_score = row.min_overall_score;
                spec.weights = QualityWeights {
                    completeness: row.completeness_weight,
                    validity: row.validity_weight,
                    consistency: row.consistency_weight,
                    freshness: row.freshness_weight,
                };
            }
        }
        Ok(specs)
    }

    pub async fn evaluate_all(
        &self,
        specs: &[QualitySpec],
    ) -> Result<Vec<QualityReport>, BatchError> {
        let mut reports = Vec::with_capacity(specs.len());
        for spec in specs {
            reports.push(self.evaluate(spec).await?);
        }
        Ok(reports)
    }

    /// Score one table against its spec.
    pub async fn evaluate(&self, spec: &QualitySpec) -> Result<QualityReport, BatchError> {
        let total = self
            .count(format!("SELECT COUNT(*) AS n FROM {}", spec.table))
            .await?;
        if total == 0 {
            return Ok(QualityReport {
                table: spec.table.clone(),
                row_count: 0,
                completeness: 0.0,
                validity: 0.0,
                consistency: 0.0,
                freshness: 0.0,
                overall: 0.0,
                passed: false,
            });
        }
        let total_f = total as f64;

        let completeness = if spec.required_columns.is_empty() {
            1.0
        } else {
            let clause = spec
                .required_columns
                .iter()
                .map(|c| format!("{c} IS NOT NULL"))
                .collect::<Vec<_>>()
                .join(" AND ");
            let complete = self
                .count(format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE {clause}",
                    spec.table
                ))
                .await?;
            complete as f64 / total_f
        };

        let validity = if spec.value_ranges.is_empty() {
            1.0
        } else {
            let clause = spec
                .value_ranges
                .iter()
                .map(|r| {
                    format!(
                        "({col} IS NOT NULL AND {col} >= {min} AND {col} <= {max})",
                        col = r.column,
                        min = r.min,
                        max = r.max
                    )
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            let valid = self
                .count(format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE {clause}",
                    spec.table
                ))
                .await?;
            valid as f64 / total_f
        };

        let consistency = if spec.duplicate_key_columns.is_empty() {
            1.0
        } else {
            let keys = spec.duplicate_key_columns.join(", ");
            let groups = self
                .count(format!(
                    "SELECT COUNT(*) AS n FROM \
                     (SELECT 1 FROM {} GROUP BY {keys} HAVING COUNT(*) > 1)",
                    spec.table
                ))
                .await?;
            (1.0 - groups as f64 / total_f).clamp(0.0, 1.0)
        };

        let freshness = match &spec.date_column {
            None => 1.0,
            Some(column) => {
                let today = Utc::now().with_timezone(&self.tz).date_naive();
                let cutoff = (today - Duration::days(spec.freshness_threshold_days))
                    .format("%Y-%m-%d")
                    .to_string();
                let fresh = self
                    .count(format!(
                        "SELECT COUNT(*) AS n FROM {} WHERE {column} >= '{cutoff}'",
                        spec.table
                    ))
                    .await?;
                if fresh > 0 {
                    1.0
                } else {
                    0.0
                }
            }
        };

        let w = &spec.weights;
        let weight_sum = w.completeness + w.validity + w.consistency + w.freshness;
        let overall = if weight_sum > 0.0 {
            ((completeness * w.completeness
                + validity * w.validity
                + consistency * w.consistency
                + freshness * w.freshness)
                / weight_sum)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        Ok(QualityReport {
            table: spec.table.clone(),
            row_count: total as u64,
            completeness,
            validity,
            consistency,
            freshness,
            overall,
            passed: overall >= spec.min_overall_score,
        })
    }

    async fn count(&self, sql: String) -> Result<i64, BatchError> {
        let pool = self.pool.clone();
        let row = run_blocking(pool, move |conn| {
            diesel::sql_query(sql).get_result::<CountRow>(conn)
        })
        .await?;
        Ok(row.n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_specs_cover_all_published_tables() {
        let specs = QualityGate::default_specs();
        assert_eq!(specs.len(), 11);
        for ct in ContentType::ALL {
            assert!(specs.iter().any(|s| s.table == ct.table()));
        }
        assert!(specs.iter().any(|s| s.table == "weather_forecasts"));
    }

    #[test]
    fn default_weights_are_normalized() {
        for spec in QualityGate::default_specs() {
            let w = spec.weights;
            let sum = w.completeness + w.validity + w.consistency + w.freshness;
            assert!((sum - 1.0).abs() < 1e-9, "weights of {} sum to {sum}", spec.table);
        }
    }
}
