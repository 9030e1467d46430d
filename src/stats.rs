//! Descriptive statistics for numeric columns
//!
//! Column types come from [`MetadataProvider`]; every aggregate runs through a
//! request-scoped [`DatabaseClient`], so the statistics see exactly what a
//! generated SELECT would see.
use crate::database::{DatabaseClient, DatabaseError, MetadataProvider};
use crate::database_sqlite::quote_identifier;
use crate::nl_sql::validator::forbidden_keyword;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Declared-type prefixes with numeric affinity
const NUMERIC_TYPES: &[&str] = &[
    "INTEGER", "INT", "TINYINT", "SMALLINT", "BIGINT", "REAL", "DOUBLE", "FLOAT", "NUMERIC",
    "DECIMAL", "BOOLEAN", "BOOL",
];

/// Rows sampled to infer the type of an untyped column
const TYPE_SAMPLE_ROWS: usize = 10;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Column {column} in table {table} does not exist")]
    UnknownColumn { table: String, column: String },

    #[error("Column {column} in table {table} is not numeric")]
    NotNumeric { table: String, column: String },

    #[error("Filter rejected: {0}")]
    UnsafeFilter(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quartiles {
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
}

/// Statistics of one numeric column; value fields are `None` when every row is NULL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub table: String,
    pub column: String,
    /// Rows considered, NULLs included
    pub rows: u64,
    /// Non-NULL values
    pub count: u64,
    pub null_count: u64,
    pub distinct: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub sum: Option<f64>,
    /// Population standard deviation
    pub std_dev: Option<f64>,
    pub quartiles: Option<Quartiles>,
}

impl ColumnStats {
    pub fn range(&self) -> Option<f64> {
        Some(self.max? - self.min?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub table: String,
    pub numeric_columns: Vec<String>,
    pub columns: Vec<ColumnStats>,
}

pub struct StatsCollector<'a> {
    metadata: &'a dyn MetadataProvider,
    client: &'a mut dyn DatabaseClient,
}

impl<'a> StatsCollector<'a> {
    pub fn new(metadata: &'a dyn MetadataProvider, client: &'a mut dyn DatabaseClient) -> Self {
        Self { metadata, client }
    }

    /// Numeric columns of `table` in declaration order
    pub async fn numeric_columns(&mut self, table: &str) -> Result<Vec<String>, StatsError> {
        let details = self.metadata.get_table_details(table).await?;
        let mut numeric = Vec::new();
        for column in &details.columns {
            if self.is_numeric(table, &column.name, &column.data_type).await? {
                numeric.push(column.name.clone());
            }
        }
        debug!(
            "[StatsCollector::numeric_columns] {} of {} columns in {} are numeric",
            numeric.len(),
            details.columns.len(),
            table
        );
        Ok(numeric)
    }

    /// Statistics for one column, optionally restricted by a WHERE condition
    pub async fn column_stats(
        &mut self,
        table: &str,
        column: &str,
        filter: Option<&str>,
    ) -> Result<ColumnStats, StatsError> {
        let details = self.metadata.get_table_details(table).await?;
        let info = details
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| StatsError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        if !self.is_numeric(table, &info.name, &info.data_type).await? {
            return Err(StatsError::NotNumeric {
                table: table.to_string(),
                column: info.name.clone(),
            });
        }
        if let Some(filter) = filter {
            check_filter(filter)?;
        }

        let quoted_table = quote_identifier(table);
        let col = quote_identifier(&info.name);
        let condition = filter.map(|f| format!("({f})"));

        let aggregate_sql = format!(
            "SELECT COUNT(*), COUNT({col}), COUNT(DISTINCT {col}), MIN({col}), MAX({col}), AVG({col}), SUM({col}) \
             FROM {quoted_table}{}",
            where_clause(condition.iter().map(String::as_str))
        );
        let aggregate = self.client.execute_query(&aggregate_sql).await?;
        let cells: Vec<&str> = aggregate
            .rows
            .first()
            .map(|row| row.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let cell = |i: usize| cells.get(i).copied().unwrap_or("");
        let integer = |i: usize| cell(i).parse::<u64>().unwrap_or(0);

        let rows = integer(0);
        let count = integer(1);
        let not_null = format!("{col} IS NOT NULL");
        let values_sql = format!(
            "SELECT {col} FROM {quoted_table}{} ORDER BY {col}",
            where_clause(std::iter::once(not_null.as_str()).chain(condition.iter().map(String::as_str)))
        );
        let values: Vec<f64> = self
            .client
            .execute_query(&values_sql)
            .await?
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| number(v)))
            .collect();

        let mean = number(cell(5));
        Ok(ColumnStats {
            table: table.to_string(),
            column: info.name.clone(),
            rows,
            count,
            null_count: rows.saturating_sub(count),
            distinct: integer(2),
            min: number(cell(3)),
            max: number(cell(4)),
            mean,
            sum: number(cell(6)),
            std_dev: mean.and_then(|m| std_dev(&values, m)),
            quartiles: quartiles(&values),
        })
    }

    /// Statistics for every numeric column of `table`
    pub async fn analyze_table(&mut self, table: &str) -> Result<TableStats, StatsError> {
        let numeric_columns = self.numeric_columns(table).await?;
        let mut columns = Vec::with_capacity(numeric_columns.len());
        for column in &numeric_columns {
            columns.push(self.column_stats(table, column, None).await?);
        }
        Ok(TableStats {
            table: table.to_string(),
            numeric_columns,
            columns,
        })
    }

    /// Declared numeric affinity, or, for untyped and custom-typed columns,
    /// a sample whose non-NULL values are all stored as numbers
    async fn is_numeric(
        &mut self,
        table: &str,
        column: &str,
        data_type: &str,
    ) -> Result<bool, StatsError> {
        let declared = data_type.trim().to_uppercase();
        if NUMERIC_TYPES.iter().any(|t| declared.starts_with(t)) {
            return Ok(true);
        }
        if !declared.is_empty() && (declared.contains("CHAR") || declared.contains("TEXT")) {
            return Ok(false);
        }

        let col = quote_identifier(column);
        let sample = self
            .client
            .execute_query(&format!(
                "SELECT typeof({col}) FROM {} WHERE {col} IS NOT NULL LIMIT {TYPE_SAMPLE_ROWS}",
                quote_identifier(table)
            ))
            .await?;
        Ok(!sample.rows.is_empty()
            && sample.rows.iter().all(|row| {
                matches!(
                    row.first().map(String::as_str),
                    Some("integer" | "real" | "numeric")
                )
            }))
    }
}

fn check_filter(filter: &str) -> Result<(), StatsError> {
    if filter.contains(';') {
        return Err(StatsError::UnsafeFilter(
            "statement separators are not allowed".to_string(),
        ));
    }
    if filter.to_uppercase().contains("SELECT") {
        return Err(StatsError::UnsafeFilter(
            "subqueries are not allowed".to_string(),
        ));
    }
    if let Some(keyword) = forbidden_keyword(filter) {
        return Err(StatsError::UnsafeFilter(format!(
            "forbidden keyword {keyword}"
        )));
    }
    Ok(())
}

fn where_clause<'c>(conditions: impl Iterator<Item = &'c str>) -> String {
    let conditions: Vec<&str> = conditions.collect();
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn number(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn std_dev(values: &[f64], mean: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Lower nearest-rank quartiles over sorted values
fn quartiles(sorted: &[f64]) -> Option<Quartiles> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let at = |fraction: f64| sorted[((fraction * n as f64) as usize).min(n - 1)];
    Some(Quartiles {
        q1: at(0.25),
        median: at(0.5),
        q3: at(0.75),
    })
}

/// One-line summary: `Count: 5 | Nulls: 0 | Distinct: 5 | Min: 34.00 | ...`
pub fn format_stats_summary(stats: &ColumnStats) -> String {
    if stats.count == 0 {
        return format!("No data available ({} NULL rows)", stats.null_count);
    }
    let mut parts = vec![
        format!("Count: {}", stats.count),
        format!("Nulls: {}", stats.null_count),
        format!("Distinct: {}", stats.distinct),
    ];
    let labelled = [
        ("Min", stats.min),
        ("Max", stats.max),
        ("Average", stats.mean),
        ("Range", stats.range()),
        ("Std Dev", stats.std_dev.filter(|s| *s > 0.0)),
        ("Q1", stats.quartiles.map(|q| q.q1)),
        ("Median", stats.quartiles.map(|q| q.median)),
        ("Q3", stats.quartiles.map(|q| q.q3)),
    ];
    parts.extend(
        labelled
            .into_iter()
            .filter_map(|(label, value)| value.map(|v| format!("{label}: {v:.2}"))),
    );
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_sqlite::SqliteDatabase;
    use crate::test_support::{assert_connection_released, seeded_database};
    use rstest::rstest;

    async fn vitals_database() -> SqliteDatabase {
        let db = seeded_database().await;
        for statement in [
            "CREATE TABLE vitals (id INTEGER PRIMARY KEY, heart_rate REAL, score, label VARCHAR(20), active BOOLEAN)",
            "INSERT INTO vitals VALUES
                (1, 72.5, 3, 'calm', 1),
                (2, NULL, 4, 'calm', 1),
                (3, 88.0, NULL, 'alert', 0),
                (4, 72.5, 5, NULL, 1)",
        ] {
            sqlx::query(statement).execute(db.pool()).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_column_stats_over_patient_ages() {
        let db = seeded_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        let stats = collector
            .column_stats("json_patients", "anchor_age", None)
            .await
            .unwrap();
        assert_eq!(stats.rows, 5);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.null_count, 0);
        assert_eq!(stats.distinct, 5);
        assert_eq!(stats.min, Some(34.0));
        assert_eq!(stats.max, Some(71.0));
        assert_eq!(stats.mean, Some(53.0));
        assert_eq!(stats.sum, Some(265.0));
        assert_eq!(stats.range(), Some(37.0));
        assert_eq!(
            stats.quartiles,
            Some(Quartiles {
                q1: 45.0,
                median: 52.0,
                q3: 63.0
            })
        );
        // ages 34 45 52 63 71 around 53: squared deviations sum to 850
        let expected = (850.0_f64 / 5.0).sqrt();
        assert!((stats.std_dev.unwrap() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_filtered_column_stats() {
        let db = seeded_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        let stats = collector
            .column_stats("json_patients", "anchor_age", Some("gender = 'F'"))
            .await
            .unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Some(34.0));
        assert_eq!(stats.max, Some(63.0));
        assert_eq!(stats.quartiles.map(|q| q.median), Some(52.0));
    }

    #[tokio::test]
    async fn test_nulls_and_duplicates_are_counted() {
        let db = vitals_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        let stats = collector
            .column_stats("vitals", "heart_rate", None)
            .await
            .unwrap();
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.null_count, 1);
        assert_eq!(stats.distinct, 2);
        assert_eq!(stats.min, Some(72.5));
        assert_eq!(stats.max, Some(88.0));
    }

    #[tokio::test]
    async fn test_numeric_columns_by_declared_type_and_sample() {
        let db = vitals_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        assert_eq!(
            collector.numeric_columns("vitals").await.unwrap(),
            vec!["id", "heart_rate", "score", "active"]
        );
        assert_eq!(
            collector.numeric_columns("json_patients").await.unwrap(),
            vec!["subject_id", "anchor_age", "anchor_year"]
        );
    }

    #[rstest]
    #[case("json_patients", "gender")]
    #[case("json_transfers", "outtime")]
    #[case("vitals", "label")]
    #[tokio::test]
    async fn test_text_columns_are_not_numeric(#[case] table: &str, #[case] column: &str) {
        let db = vitals_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        let err = collector.column_stats(table, column, None).await.unwrap_err();
        assert!(matches!(err, StatsError::NotNumeric { .. }), "{err}");
    }

    #[rstest]
    #[case("1 = 1; DROP TABLE json_patients")]
    #[case("subject_id IN (SELECT note_id FROM staff_notes)")]
    #[case("gender = 'F') OR (DELETE")]
    #[tokio::test]
    async fn test_unsafe_filters_are_rejected(#[case] filter: &str) {
        let db = seeded_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        let err = collector
            .column_stats("json_patients", "anchor_age", Some(filter))
            .await
            .unwrap_err();
        assert!(matches!(err, StatsError::UnsafeFilter(_)), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_table_and_column() {
        let db = seeded_database().await;
        let metadata = db.metadata_provider();
        let mut session = db.session().await.unwrap();
        let mut collector = StatsCollector::new(&metadata, &mut session);

        assert!(matches!(
            collector.column_stats("json_patients", "weight", None).await,
            Err(StatsError::UnknownColumn { .. })
        ));
        assert!(matches!(
            collector.analyze_table("missing").await,
            Err(StatsError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_analyze_table_releases_connection() {
        let db = seeded_database().await;
        let metadata = db.metadata_provider();
        {
            let mut session = db.session().await.unwrap();
            let mut collector = StatsCollector::new(&metadata, &mut session);
            let analysis = collector.analyze_table("json_providers").await.unwrap();
            assert_eq!(analysis.numeric_columns, vec!["npi"]);
            assert_eq!(analysis.columns.len(), 1);
            assert_eq!(analysis.columns[0].count, 3);
        }
        assert_connection_released(&db).await;
    }

    #[test]
    fn test_summary_format() {
        let stats = ColumnStats {
            table: "json_patients".into(),
            column: "anchor_age".into(),
            rows: 3,
            count: 3,
            null_count: 0,
            distinct: 3,
            min: Some(30.0),
            max: Some(50.0),
            mean: Some(40.0),
            sum: Some(120.0),
            std_dev: Some(0.0),
            quartiles: Some(Quartiles {
                q1: 30.0,
                median: 40.0,
                q3: 50.0,
            }),
        };
        assert_eq!(
            format_stats_summary(&stats),
            "Count: 3 | Nulls: 0 | Distinct: 3 | Min: 30.00 | Max: 50.00 | Average: 40.00 \
             | Range: 20.00 | Q1: 30.00 | Median: 40.00 | Q3: 50.00"
        );

        let empty = ColumnStats {
            rows: 2,
            count: 0,
            null_count: 2,
            distinct: 0,
            min: None,
            max: None,
            mean: None,
            sum: None,
            std_dev: None,
            quartiles: None,
            ..stats
        };
        assert_eq!(format_stats_summary(&empty), "No data available (2 NULL rows)");
    }

    #[rstest]
    #[case(&[], None)]
    #[case(&[7.0], Some((7.0, 7.0, 7.0)))]
    #[case(&[1.0, 2.0, 3.0, 4.0], Some((2.0, 3.0, 4.0)))]
    fn test_quartile_ranks(#[case] values: &[f64], #[case] expected: Option<(f64, f64, f64)>) {
        assert_eq!(
            quartiles(values).map(|q| (q.q1, q.median, q.q3)),
            expected
        );
    }
}
