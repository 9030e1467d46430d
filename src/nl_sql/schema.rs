//! Searchable schema description built from live introspection
//!
//! Every table contributes one table-level summary snippet followed by one
//! snippet per column, in catalog order. The index is an immutable snapshot:
//! a schema change means building a new one.

use crate::database::{ColumnInfo, MetadataProvider, TableDetails};
use crate::nl_sql::error::{NlSqlError, NlSqlResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Descriptions for tables of the admissions schema
const TABLE_DESCRIPTIONS: &[(&str, &str)] = &[
    ("json_patients", "Patients: demographics, one row per patient"),
    ("json_admissions", "Hospital admissions (stays), one row per admission"),
    ("json_providers", "Healthcare providers (doctors, staff)"),
    ("json_transfers", "Transfers between care units during an admission"),
    ("json_lab", "Laboratory test results"),
    ("json_diagnoses", "Diagnoses coded per admission"),
    ("json_insurance", "Insurance plans"),
    ("json_careunits", "Care units (wards, clinics)"),
];

/// Descriptions for well-known columns; keyed by column name, optionally table-qualified
const COLUMN_DESCRIPTIONS: &[(&str, &str)] = &[
    ("subject_id", "Patient unique identifier"),
    ("gender", "Gender (M/F)"),
    ("anchor_age", "Patient age"),
    ("anchor_year", "Reference year"),
    ("dod", "Date of death, if any"),
    ("hadm_id", "Admission unique identifier"),
    ("admittime", "Admission date and time"),
    ("dischtime", "Discharge date and time"),
    ("admission_type", "Admission type (EMERGENCY, ELECTIVE, URGENT, ...)"),
    ("admit_provider_id", "Provider who admitted the patient"),
    ("admission_location", "Where the patient was admitted from"),
    ("discharge_location", "Where the patient was discharged to"),
    ("insurance", "Insurance category"),
    ("race", "Race"),
    ("marital_status", "Marital status"),
    ("transfer_id", "Transfer unique identifier"),
    ("eventtype", "Transfer event type (admit, transfer, discharge)"),
    ("careunit", "Care unit"),
    ("intime", "Time the patient entered the unit"),
    ("outtime", "Time the patient left the unit"),
    ("provider_id", "Provider identifier"),
    ("npi", "National provider identifier"),
    ("dea", "DEA number"),
    ("icd_code", "Diagnosis code"),
];

/// One retrievable unit of schema description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaSnippet {
    pub table: String,
    /// `None` for the table-level summary
    pub column: Option<String>,
    pub data_type: String,
    pub is_primary_key: bool,
    pub description: String,
}

impl SchemaSnippet {
    pub fn is_table_summary(&self) -> bool {
        self.column.is_none()
    }

    /// Column name, or `*` for the table summary
    pub fn column_label(&self) -> &str {
        self.column.as_deref().unwrap_or("*")
    }

    /// Text used for keyword matching and embedding
    pub fn search_text(&self) -> String {
        match &self.column {
            Some(column) => format!(
                "{} {} {} {}",
                self.table, column, self.data_type, self.description
            ),
            None => format!("{} {}", self.table, self.description),
        }
    }

    /// Line rendered into the generation prompt
    pub fn render(&self) -> String {
        match &self.column {
            Some(column) => {
                let pk = if self.is_primary_key { ", PRIMARY KEY" } else { "" };
                if self.description.is_empty() {
                    format!("{}.{} ({}{})", self.table, column, self.data_type, pk)
                } else {
                    format!(
                        "{}.{} ({}{}): {}",
                        self.table, column, self.data_type, pk, self.description
                    )
                }
            }
            None => format!("Table {}: {}", self.table, self.description),
        }
    }
}

/// Introspected table kept alongside its snippets
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
    pub row_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaColumn {
    pub name: String,
    pub data_type: String,
    pub is_primary_key: bool,
    pub nullable: bool,
}

impl From<&ColumnInfo> for SchemaColumn {
    fn from(col: &ColumnInfo) -> Self {
        Self {
            name: col.name.clone(),
            data_type: col.data_type.clone(),
            is_primary_key: col.is_primary_key,
            nullable: col.nullable,
        }
    }
}

/// Immutable snapshot of the schema as snippets
#[derive(Debug, Clone)]
pub struct SchemaIndex {
    tables: Vec<TableSchema>,
    snippets: Vec<SchemaSnippet>,
    built_at: DateTime<Utc>,
}

impl SchemaIndex {
    /// Introspect every table through `provider`.
    ///
    /// Tables whose details cannot be read are skipped; an empty catalog is an error.
    pub async fn build(provider: &dyn MetadataProvider) -> NlSqlResult<Self> {
        let table_names = provider
            .get_tables()
            .await
            .map_err(|e| NlSqlError::SchemaError(format!("Failed to get tables: {e}")))?;

        debug!("Found {} tables to index", table_names.len());

        let mut details = Vec::with_capacity(table_names.len());
        for name in &table_names {
            match provider.get_table_details(name).await {
                Ok(table) => details.push(table),
                Err(e) => warn!("Failed to read schema for table {}: {}", name, e),
            }
        }

        if details.is_empty() {
            return Err(NlSqlError::SchemaError(
                "database contains no readable tables".to_string(),
            ));
        }

        let index = Self::from_tables(details);
        info!(
            "Schema index built: {} tables, {} snippets",
            index.tables.len(),
            index.snippets.len()
        );
        Ok(index)
    }

    /// Build an index from already introspected tables
    pub fn from_tables(tables: Vec<TableDetails>) -> Self {
        let mut snippets = Vec::new();
        let mut schemas = Vec::with_capacity(tables.len());

        for table in tables {
            snippets.push(table_summary(&table));
            for col in &table.columns {
                snippets.push(SchemaSnippet {
                    table: table.name.clone(),
                    column: Some(col.name.clone()),
                    data_type: col.data_type.clone(),
                    is_primary_key: col.is_primary_key,
                    description: column_description(&table.name, &col.name)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            schemas.push(TableSchema {
                name: table.name.clone(),
                columns: table.columns.iter().map(SchemaColumn::from).collect(),
                row_count: table.row_count,
            });
        }

        Self {
            tables: schemas,
            snippets,
            built_at: Utc::now(),
        }
    }

    pub fn snippets(&self) -> &[SchemaSnippet] {
        &self.snippets
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_summary(&self, name: &str) -> Option<&SchemaSnippet> {
        self.snippets
            .iter()
            .find(|s| s.is_table_summary() && s.table.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Human-readable listing of every table and column
    pub fn overview(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let rows = table
                .row_count
                .map(|n| format!(" ({n} rows)"))
                .unwrap_or_default();
            out.push_str(&format!("{}{}\n", table.name, rows));
            if let Some(description) = table_description(&table.name) {
                out.push_str(&format!("  {description}\n"));
            }
            for col in &table.columns {
                let pk = if col.is_primary_key { " PRIMARY KEY" } else { "" };
                out.push_str(&format!("  - {} {}{}\n", col.name, col.data_type, pk));
            }
        }
        out
    }
}

fn table_summary(table: &TableDetails) -> SchemaSnippet {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            if c.is_primary_key {
                format!("{} ({}, PRIMARY KEY)", c.name, c.data_type)
            } else {
                format!("{} ({})", c.name, c.data_type)
            }
        })
        .collect();

    let mut description = String::new();
    if let Some(text) = table_description(&table.name) {
        description.push_str(text);
        description.push_str(". ");
    }
    if let Some(rows) = table.row_count {
        description.push_str(&format!("{rows} rows. "));
    }
    description.push_str("Columns: ");
    description.push_str(&columns.join(", "));

    SchemaSnippet {
        table: table.name.clone(),
        column: None,
        data_type: "TABLE".to_string(),
        is_primary_key: false,
        description,
    }
}

fn table_description(table: &str) -> Option<&'static str> {
    let table = table.to_lowercase();
    TABLE_DESCRIPTIONS
        .iter()
        .find(|(name, _)| *name == table)
        .map(|(_, d)| *d)
}

fn column_description(table: &str, column: &str) -> Option<&'static str> {
    let qualified = format!("{}.{}", table.to_lowercase(), column.to_lowercase());
    let column = column.to_lowercase();
    COLUMN_DESCRIPTIONS
        .iter()
        .find(|(name, _)| *name == qualified)
        .or_else(|| COLUMN_DESCRIPTIONS.iter().find(|(name, _)| *name == column))
        .map(|(_, d)| *d)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::DatabaseError;
    use crate::test_support::seeded_database;
    use async_trait::async_trait;

    fn column(name: &str, data_type: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: !pk,
            is_primary_key: pk,
            default_value: None,
        }
    }

    /// Small two-table index for retrieval and prompt tests
    pub(crate) fn sample_index() -> SchemaIndex {
        SchemaIndex::from_tables(vec![
            TableDetails {
                name: "json_patients".to_string(),
                columns: vec![
                    column("subject_id", "INTEGER", true),
                    column("gender", "TEXT", false),
                    column("anchor_age", "INTEGER", false),
                ],
                row_count: Some(5),
            },
            TableDetails {
                name: "json_admissions".to_string(),
                columns: vec![
                    column("hadm_id", "INTEGER", true),
                    column("subject_id", "INTEGER", false),
                    column("admittime", "TEXT", false),
                    column("insurance", "TEXT", false),
                ],
                row_count: Some(6),
            },
            TableDetails {
                name: "json_providers".to_string(),
                columns: vec![column("provider_id", "TEXT", true)],
                row_count: Some(3),
            },
        ])
    }

    #[test]
    fn test_snippets_in_catalog_order_with_summary_first() {
        let index = sample_index();
        assert_eq!(index.len(), 3 + 4 + 1 + 3);

        let first = &index.snippets()[0];
        assert!(first.is_table_summary());
        assert_eq!(first.table, "json_patients");
        assert_eq!(first.column_label(), "*");
        assert!(first.description.contains("subject_id (INTEGER, PRIMARY KEY)"));
        assert!(first.description.contains("5 rows"));

        let second = &index.snippets()[1];
        assert_eq!(second.column.as_deref(), Some("subject_id"));
        assert!(second.is_primary_key);
        assert_eq!(second.description, "Patient unique identifier");
    }

    #[test]
    fn test_render() {
        let index = sample_index();
        let admittime = index
            .snippets()
            .iter()
            .find(|s| s.column.as_deref() == Some("admittime"))
            .unwrap();
        assert_eq!(
            admittime.render(),
            "json_admissions.admittime (TEXT): Admission date and time"
        );
        assert!(index
            .table_summary("JSON_ADMISSIONS")
            .unwrap()
            .render()
            .starts_with("Table json_admissions: Hospital admissions"));
    }

    #[test]
    fn test_overview_lists_columns() {
        let overview = sample_index().overview();
        assert!(overview.contains("json_patients (5 rows)"));
        assert!(overview.contains("  - subject_id INTEGER PRIMARY KEY"));
    }

    #[tokio::test]
    async fn test_build_from_live_database() {
        let db = seeded_database().await;
        let provider = db.metadata_provider();
        let index = SchemaIndex::build(&provider).await.unwrap();

        assert_eq!(index.tables()[0].name, "json_patients");
        assert!(index.table("staff_notes").is_some());
        assert_eq!(index.table("json_admissions").unwrap().row_count, Some(6));
    }

    struct BrokenProvider;

    #[async_trait]
    impl MetadataProvider for BrokenProvider {
        async fn get_tables(&self) -> Result<Vec<String>, DatabaseError> {
            Ok(vec!["ghost".to_string()])
        }

        async fn get_table_details(&self, table: &str) -> Result<TableDetails, DatabaseError> {
            Err(DatabaseError::MetadataError(format!("Table '{table}' does not exist")))
        }

        async fn get_row_count(&self, _table: &str) -> Result<i64, DatabaseError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_build_without_readable_tables_fails() {
        let err = SchemaIndex::build(&BrokenProvider).await.unwrap_err();
        assert!(matches!(err, NlSqlError::SchemaError(_)));
    }
}
