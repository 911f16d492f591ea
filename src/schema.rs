//! Schema and load-statement synthesis.
//!
//! Turns a merged patient table into SQL: a per-patient table definition with
//! column types inferred from the data, and one `INSERT` per row. The
//! statements of all patients are collected into a [`LoadScript`].
//!
//! Every statement is rendered on a single line (newlines inside values are
//! collapsed to spaces), so a rendered script can be split back into
//! statements line by line.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::segregate::patient_id_from_dir;
use crate::table::{Table, file_name_of, is_missing, list_subdirs};

/// Column type inferred from a column's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target database flavour for generated DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SqlDialect {
    #[default]
    Sqlite,
    /// `INTEGER` is 32-bit and `REAL` single precision here, so wider types
    /// are emitted.
    Postgres,
}

impl SqlDialect {
    /// Dialect implied by a connection URL's scheme.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            SqlDialect::Postgres
        } else {
            SqlDialect::Sqlite
        }
    }

    /// Column type name for an inferred type.
    pub fn type_name(&self, sql_type: SqlType) -> &'static str {
        match (self, sql_type) {
            (SqlDialect::Postgres, SqlType::Integer) => "BIGINT",
            (SqlDialect::Postgres, SqlType::Real) => "DOUBLE PRECISION",
            (_, t) => t.as_str(),
        }
    }
}

fn parse_real(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Infer a column type from every non-missing value.
///
/// All values integral → `INTEGER`; all numeric → `REAL`; anything else, or
/// no values at all → `TEXT`.
pub fn infer_type<'a>(values: impl IntoIterator<Item = &'a str>) -> SqlType {
    let mut inferred: Option<SqlType> = None;
    for value in values.into_iter().filter(|v| !is_missing(v)) {
        let kind = if value.parse::<i64>().is_ok() {
            SqlType::Integer
        } else if parse_real(value).is_some() {
            SqlType::Real
        } else {
            return SqlType::Text;
        };
        inferred = Some(match (inferred, kind) {
            (Some(SqlType::Real), _) | (_, SqlType::Real) => SqlType::Real,
            _ => SqlType::Integer,
        });
    }
    inferred.unwrap_or(SqlType::Text)
}

/// Table name for a patient: `patient_<id>` with `-` and space replaced by `_`.
pub fn table_name(patient_id: &str) -> String {
    format!("patient_{}", patient_id.replace(['-', ' '], "_"))
}

/// Column name with `-`, space and `.` replaced by `_`.
pub fn sanitize_column(name: &str) -> String {
    name.replace(['-', ' ', '.'], "_")
}

/// Single-quoted SQL string literal. Embedded quotes are doubled and line
/// breaks collapse to spaces.
pub fn quote_literal(value: &str) -> String {
    let flat = value.replace("\r\n", " ").replace(['\n', '\r'], " ");
    format!("'{}'", flat.replace('\'', "''"))
}

/// One column of a patient table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    /// Sanitized SQL name.
    pub name: String,
    /// Header in the merged CSV.
    pub source: String,
    pub sql_type: SqlType,
}

/// Relational schema derived from one merged patient table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientTableSchema {
    pub patient_id: String,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub dialect: SqlDialect,
}

impl PatientTableSchema {
    /// Derive the schema of `table` for `patient_id`.
    pub fn infer(patient_id: &str, table: &Table) -> PipelineResult<Self> {
        let name = table_name(patient_id);
        if table.column_count() == 0 {
            return Err(PipelineError::NoColumns(name));
        }

        let mut seen = HashMap::new();
        let mut columns = Vec::with_capacity(table.column_count());
        for (i, header) in table.headers.iter().enumerate() {
            let mut sql_name = sanitize_column(header);
            if sql_name.is_empty() {
                sql_name = format!("column_{}", i + 1);
            }
            if seen.insert(sql_name.to_lowercase(), i).is_some() {
                return Err(PipelineError::ColumnNameCollision {
                    table: name,
                    column: sql_name,
                });
            }
            columns.push(ColumnDef {
                name: sql_name,
                source: header.clone(),
                sql_type: infer_type(table.column_values(i)),
            });
        }

        Ok(Self {
            patient_id: patient_id.to_string(),
            table_name: name,
            columns,
            dialect: SqlDialect::default(),
        })
    }

    /// Render DDL for another dialect.
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", self.table_name)
    }

    pub fn create_table_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, self.dialect.type_name(c.sql_type)))
            .collect();
        format!("CREATE TABLE {} ({});", self.table_name, cols.join(", "))
    }

    /// `DROP TABLE IF EXISTS` followed by `CREATE TABLE`.
    pub fn create_statements(&self) -> Vec<String> {
        vec![self.drop_table_sql(), self.create_table_sql()]
    }

    /// One `INSERT` per row of `table`.
    pub fn insert_statements(&self, table: &Table) -> Vec<String> {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let prefix = format!("INSERT INTO {} ({}) VALUES", self.table_name, names.join(", "));
        table
            .rows
            .iter()
            .map(|row| {
                let values: Vec<String> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(col, cell)| render_value(col.sql_type, cell))
                    .collect();
                format!("{} ({});", prefix, values.join(", "))
            })
            .collect()
    }

    /// Create statements followed by all inserts.
    pub fn statements(&self, table: &Table) -> Vec<String> {
        let mut out = self.create_statements();
        out.extend(self.insert_statements(table));
        out
    }
}

fn render_value(sql_type: SqlType, cell: &str) -> String {
    if is_missing(cell) {
        return "NULL".to_string();
    }
    match sql_type {
        SqlType::Integer => match cell.parse::<i64>() {
            Ok(v) => v.to_string(),
            Err(_) => quote_literal(cell),
        },
        SqlType::Real => match parse_real(cell) {
            Some(v) => format!("{:?}", v),
            None => quote_literal(cell),
        },
        SqlType::Text => quote_literal(cell),
    }
}

/// Statements for one patient inside a load script.
#[derive(Debug, Clone)]
pub struct PatientSection {
    pub schema: PatientTableSchema,
    pub statements: Vec<String>,
}

/// Aggregate DROP/CREATE/INSERT script for all patients.
#[derive(Debug, Clone)]
pub struct LoadScript {
    generated_at: DateTime<Utc>,
    dialect: SqlDialect,
    sections: Vec<PatientSection>,
    /// table name → patient id that claimed it
    owners: HashMap<String, String>,
}

impl Default for LoadScript {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadScript {
    pub fn new() -> Self {
        Self::with_dialect(SqlDialect::default())
    }

    pub fn with_dialect(dialect: SqlDialect) -> Self {
        Self {
            generated_at: Utc::now(),
            dialect,
            sections: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Append a patient's statements. Fails if another patient already
    /// produced the same table name.
    pub fn add_patient(&mut self, patient_id: &str, table: &Table) -> PipelineResult<&PatientSection> {
        let schema = PatientTableSchema::infer(patient_id, table)?.with_dialect(self.dialect);
        let key = schema.table_name.to_lowercase();
        if let Some(first) = self.owners.get(&key) {
            return Err(PipelineError::TableNameCollision {
                table: schema.table_name,
                first: first.clone(),
                second: patient_id.to_string(),
            });
        }
        self.owners.insert(key, patient_id.to_string());

        let statements = schema.statements(table);
        self.sections.push(PatientSection { schema, statements });
        Ok(&self.sections[self.sections.len() - 1])
    }

    pub fn sections(&self) -> &[PatientSection] {
        &self.sections
    }

    pub fn patient_count(&self) -> usize {
        self.sections.len()
    }

    pub fn statement_count(&self) -> usize {
        self.sections.iter().map(|s| s.statements.len()).sum()
    }

    /// Render the script text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "-- Generated by patientdb at {}\n-- Patients: {}\n",
            self.generated_at.to_rfc3339(),
            self.patient_count()
        ));
        for section in &self.sections {
            out.push('\n');
            out.push_str(&format!(
                "-- Patient: {}\n",
                section.schema.patient_id.replace(['\r', '\n'], " ")
            ));
            for stmt in &section.statements {
                out.push_str(stmt);
                out.push('\n');
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> PipelineResult<()> {
        fs::write(path, self.render())?;
        Ok(())
    }

    /// Split a rendered script into executable statements, dropping comments
    /// and blank lines.
    pub fn split_statements(script: &str) -> Vec<String> {
        script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("--"))
            .map(str::to_string)
            .collect()
    }
}

/// Load script plus the patients that could not be included.
#[derive(Debug)]
pub struct GenerationReport {
    pub script: LoadScript,
    /// Merged file path and error message.
    pub failures: Vec<(PathBuf, String)>,
}

/// Build the load script from every patient folder's merged table.
///
/// Unreadable tables are logged and skipped. A table-name collision aborts
/// generation.
pub fn generate_load_script(
    patients_root: &Path,
    merged_name: &str,
    dialect: SqlDialect,
) -> PipelineResult<GenerationReport> {
    let mut script = LoadScript::with_dialect(dialect);
    let mut failures = Vec::new();

    for folder in list_subdirs(patients_root)? {
        let path = folder.join(merged_name);
        if !path.is_file() {
            continue;
        }
        let patient = patient_id_from_dir(&folder).unwrap_or_else(|| file_name_of(&folder));
        let table = match Table::read_csv(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                failures.push((path, e.to_string()));
                continue;
            }
        };
        match script.add_patient(&patient, &table) {
            Ok(section) => debug!(
                "{}: {} columns, {} statements",
                section.schema.table_name,
                section.schema.columns.len(),
                section.statements.len()
            ),
            Err(e @ PipelineError::TableNameCollision { .. }) => return Err(e),
            Err(e) => {
                warn!("cannot build schema for {}: {}", patient, e);
                failures.push((path, e.to_string()));
            }
        }
    }

    info!(
        "load script: {} patients, {} statements",
        script.patient_count(),
        script.statement_count()
    );
    Ok(GenerationReport { script, failures })
}
