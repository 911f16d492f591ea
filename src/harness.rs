//! Query/stress harness.
//!
//! Runs a small fixed set of analytic queries against every patient's table,
//! one patient after another on a single engine connection, and aggregates
//! success and timing statistics. A failing query is recorded and the run
//! moves on; nothing short of losing the connection stops it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::engine::SqlEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::{PatientTableSchema, table_name};
use crate::segregate::patient_id_from_dir;
use crate::table::{Table, list_subdirs};

/// Placeholder replaced by the patient's table name.
pub const TABLE_PLACEHOLDER: &str = "{table}";

/// A named query templated on `{table}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessQuery {
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub description: String,
}

impl HarnessQuery {
    pub fn new(name: impl Into<String>, sql: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            description: description.into(),
        }
    }

    /// SQL with the table placeholder filled in.
    pub fn render(&self, table: &str) -> String {
        self.sql.replace(TABLE_PLACEHOLDER, table)
    }
}

/// The built-in query set, written against prefixed Synthea-style columns.
pub fn default_queries() -> Vec<HarnessQuery> {
    vec![
        HarnessQuery::new(
            "Patient Demographics",
            "SELECT patients_FIRST AS first_name, patients_LAST AS last_name, \
             patients_GENDER AS gender, patients_BIRTHDATE AS birth_date \
             FROM {table} LIMIT 1",
            "Get basic patient information",
        ),
        HarnessQuery::new(
            "Clinical Record Count",
            "SELECT COUNT(*) AS total_records, \
             COUNT(DISTINCT medications_DESCRIPTION) AS unique_medications, \
             COUNT(DISTINCT conditions_DESCRIPTION) AS unique_conditions \
             FROM {table}",
            "Count clinical records and unique items",
        ),
        HarnessQuery::new(
            "Healthcare Summary",
            "SELECT patients_HEALTHCARE_EXPENSES AS total_expenses, \
             patients_HEALTHCARE_COVERAGE AS coverage, \
             COUNT(DISTINCT procedures_CODE) AS total_procedures \
             FROM {table} \
             GROUP BY patients_HEALTHCARE_EXPENSES, patients_HEALTHCARE_COVERAGE \
             LIMIT 1",
            "Healthcare cost and procedure summary",
        ),
    ]
}

/// A patient and the merged table the harness queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientTarget {
    pub patient_id: String,
    pub path: PathBuf,
}

/// Patient folders under `patients_root` holding a merged table, sorted.
pub fn discover_patients(patients_root: &Path, merged_name: &str) -> PipelineResult<Vec<PatientTarget>> {
    let mut targets = Vec::new();
    for folder in list_subdirs(patients_root)? {
        let path = folder.join(merged_name);
        if !path.is_file() {
            continue;
        }
        if let Some(patient_id) = patient_id_from_dir(&folder) {
            targets.push(PatientTarget { patient_id, path });
        }
    }
    Ok(targets)
}

/// How patient tables get into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageMode {
    /// Load each merged CSV right before querying it, drop it afterwards.
    #[default]
    Stage,
    /// Tables were materialized beforehand from the load script.
    Preloaded,
}

fn secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Result of one query against one patient.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub name: String,
    pub success: bool,
    pub rows_returned: usize,
    /// First returned row, if any.
    pub result: Option<serde_json::Map<String, serde_json::Value>>,
    pub error: Option<String>,
    #[serde(serialize_with = "secs")]
    pub elapsed: Duration,
}

impl QueryOutcome {
    fn failed(name: &str, error: String, elapsed: Duration) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            rows_returned: 0,
            result: None,
            error: Some(error),
            elapsed,
        }
    }
}

/// All query outcomes of one patient.
#[derive(Debug, Clone, Serialize)]
pub struct PatientResult {
    pub patient_id: String,
    pub file_path: PathBuf,
    pub table_name: String,
    pub queries: Vec<QueryOutcome>,
    #[serde(serialize_with = "secs")]
    pub total_time: Duration,
}

impl PatientResult {
    /// A patient succeeds iff every query succeeded.
    pub fn succeeded(&self) -> bool {
        self.queries.iter().all(|q| q.success)
    }
}

/// Per-query totals across all patients.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub name: String,
    /// Times the query was sent to the engine.
    pub executions: usize,
    pub failures: usize,
    #[serde(serialize_with = "secs")]
    pub total_time: Duration,
}

/// One recorded (patient, query) failure.
#[derive(Debug, Clone, Serialize)]
pub struct QueryError {
    pub patient: String,
    pub query: String,
    pub error: String,
}

/// Success-rate band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityBand {
    Excellent,
    Good,
    NeedsWork,
}

/// Throughput band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpeedBand {
    Fast,
    Decent,
    Slow,
}

impl QualityBand {
    pub fn from_rate(rate: f64) -> Self {
        if rate > 0.95 {
            Self::Excellent
        } else if rate > 0.85 {
            Self::Good
        } else {
            Self::NeedsWork
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Excellent => "EXCELLENT: >95% success rate",
            Self::Good => "GOOD: >85% success rate, minor issues to fix",
            Self::NeedsWork => "NEEDS WORK: <=85% success rate, data cleaning required",
        }
    }
}

impl SpeedBand {
    pub fn from_qps(qps: f64) -> Self {
        if qps > 20.0 {
            Self::Fast
        } else if qps > 10.0 {
            Self::Decent
        } else {
            Self::Slow
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Fast => "FAST: >20 queries/sec",
            Self::Decent => "DECENT: >10 queries/sec",
            Self::Slow => "SLOW: <=10 queries/sec, consider optimization",
        }
    }
}

/// Qualitative reading of a report. Carries no contractual meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub quality: QualityBand,
    /// `None` when no query time was measured.
    pub speed: Option<SpeedBand>,
}

/// Run-level statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub started_at: DateTime<Utc>,
    pub total_patients: usize,
    pub successful_patients: usize,
    pub failed_patients: usize,
    /// Sum of all query execution times.
    #[serde(serialize_with = "secs")]
    pub total_query_time: Duration,
    /// Wall time of the whole run, staging included.
    #[serde(serialize_with = "secs")]
    pub wall_time: Duration,
    #[serde(serialize_with = "opt_secs")]
    pub fastest_patient: Option<Duration>,
    #[serde(serialize_with = "opt_secs")]
    pub slowest_patient: Option<Duration>,
    pub per_query: Vec<QueryStats>,
    pub patient_results: Vec<PatientResult>,
    pub errors: Vec<QueryError>,
}

impl StressReport {
    fn new(queries: &[HarnessQuery]) -> Self {
        Self {
            started_at: Utc::now(),
            total_patients: 0,
            successful_patients: 0,
            failed_patients: 0,
            total_query_time: Duration::ZERO,
            wall_time: Duration::ZERO,
            fastest_patient: None,
            slowest_patient: None,
            per_query: queries
                .iter()
                .map(|q| QueryStats {
                    name: q.name.clone(),
                    ..QueryStats::default()
                })
                .collect(),
            patient_results: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn record(&mut self, patient: PatientResult) {
        for (stats, outcome) in self.per_query.iter_mut().zip(&patient.queries) {
            if !outcome.success {
                stats.failures += 1;
                self.errors.push(QueryError {
                    patient: patient.patient_id.clone(),
                    query: outcome.name.clone(),
                    error: outcome.error.clone().unwrap_or_default(),
                });
            }
        }

        let t = patient.total_time;
        self.fastest_patient = Some(self.fastest_patient.map_or(t, |f| f.min(t)));
        self.slowest_patient = Some(self.slowest_patient.map_or(t, |s| s.max(t)));

        self.total_patients += 1;
        if patient.succeeded() {
            self.successful_patients += 1;
        } else {
            self.failed_patients += 1;
        }
        self.patient_results.push(patient);
    }

    fn record_execution(&mut self, index: usize, elapsed: Duration) {
        self.total_query_time += elapsed;
        if let Some(stats) = self.per_query.get_mut(index) {
            stats.executions += 1;
            stats.total_time += elapsed;
        }
    }

    /// Fraction of patients whose queries all succeeded; 0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.total_patients == 0 {
            return 0.0;
        }
        self.successful_patients as f64 / self.total_patients as f64
    }

    /// Queries actually sent to the engine.
    pub fn queries_executed(&self) -> usize {
        self.per_query.iter().map(|q| q.executions).sum()
    }

    /// Executions divided by pure query time.
    pub fn queries_per_second(&self) -> Option<f64> {
        let secs = self.total_query_time.as_secs_f64();
        (secs > 0.0).then(|| self.queries_executed() as f64 / secs)
    }

    pub fn average_patient_time(&self) -> Option<Duration> {
        (self.total_patients > 0).then(|| self.wall_time / self.total_patients as u32)
    }

    /// Most frequent error messages, grouped by their first 30 characters.
    pub fn error_breakdown(&self, limit: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for e in &self.errors {
            let key: String = e.error.chars().take(30).collect();
            *counts.entry(key).or_default() += 1;
        }
        let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sorted.truncate(limit);
        sorted
    }

    /// First `n` fully successful patients.
    pub fn sample_successes(&self, n: usize) -> Vec<&PatientResult> {
        self.patient_results
            .iter()
            .filter(|p| p.succeeded())
            .take(n)
            .collect()
    }

    pub fn verdict(&self) -> Verdict {
        Verdict {
            quality: QualityBand::from_rate(self.success_rate()),
            speed: self.queries_per_second().map(SpeedBand::from_qps),
        }
    }
}

/// Sequential query runner over one engine connection.
pub struct StressHarness {
    engine: SqlEngine,
    queries: Vec<HarnessQuery>,
    mode: StageMode,
    progress_every: usize,
}

impl StressHarness {
    pub fn new(engine: SqlEngine, queries: Vec<HarnessQuery>) -> Self {
        Self {
            engine,
            queries,
            mode: StageMode::default(),
            progress_every: 10,
        }
    }

    pub fn mode(mut self, mode: StageMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn queries(&self) -> &[HarnessQuery] {
        &self.queries
    }

    /// Run every query against every target.
    pub async fn run(&self, targets: &[PatientTarget]) -> StressReport {
        let mut report = StressReport::new(&self.queries);
        let start = Instant::now();
        info!("stress test on {} patients, {} queries each", targets.len(), self.queries.len());

        for (i, target) in targets.iter().enumerate() {
            let result = self.run_patient(target, &mut report).await;
            if result.succeeded() {
                info!("patient {} complete: {:.3}s", target.patient_id, result.total_time.as_secs_f64());
            } else {
                warn!("patient {} failed: {:.3}s", target.patient_id, result.total_time.as_secs_f64());
            }
            report.record(result);

            let done = i + 1;
            if self.progress_every > 0 && done % self.progress_every == 0 {
                info!(
                    "progress: {}/{} patients, success rate {}/{} ({:.1}%)",
                    done,
                    targets.len(),
                    report.successful_patients,
                    done,
                    report.success_rate() * 100.0
                );
            }
        }

        report.wall_time = start.elapsed();
        report
    }

    async fn run_patient(&self, target: &PatientTarget, report: &mut StressReport) -> PatientResult {
        let start = Instant::now();
        let mut queries = Vec::with_capacity(self.queries.len());

        let staged = match self.mode {
            StageMode::Stage => self.stage(target).await,
            StageMode::Preloaded => Ok(table_name(&target.patient_id)),
        };
        let table = match staged {
            Ok(table) => {
                for (index, query) in self.queries.iter().enumerate() {
                    let outcome = self.run_query(query, &table).await;
                    report.record_execution(index, outcome.elapsed);
                    queries.push(outcome);
                }
                if self.mode == StageMode::Stage {
                    self.drop_staged(&table).await;
                }
                table
            }
            Err(e) => {
                warn!("cannot stage patient {}: {}", target.patient_id, e);
                for query in &self.queries {
                    queries.push(QueryOutcome::failed(
                        &query.name,
                        format!("staging failed: {}", e),
                        Duration::ZERO,
                    ));
                }
                table_name(&target.patient_id)
            }
        };

        PatientResult {
            patient_id: target.patient_id.clone(),
            file_path: target.path.clone(),
            table_name: table,
            queries,
            total_time: start.elapsed(),
        }
    }

    /// Load a merged CSV into the engine; returns the table name.
    ///
    /// A table that already exists is never replaced: it may hold data loaded
    /// from a script, which is what [`StageMode::Preloaded`] is for. Creation
    /// and inserts share one transaction, so a failed insert leaves no table.
    async fn stage(&self, target: &PatientTarget) -> PipelineResult<String> {
        let table = Table::read_csv(&target.path)?;
        let schema =
            PatientTableSchema::infer(&target.patient_id, &table)?.with_dialect(self.engine.dialect());
        if self.engine.table_exists(&schema.table_name).await {
            return Err(PipelineError::Execution(format!(
                "table {} already exists; query it with preloaded mode",
                schema.table_name
            )));
        }

        let mut statements = vec![schema.create_table_sql()];
        statements.extend(schema.insert_statements(&table));
        self.engine.execute_script(&statements).await?;
        Ok(schema.table_name)
    }

    async fn drop_staged(&self, table: &str) {
        let drop = format!("DROP TABLE IF EXISTS {}", table);
        if let Err(e) = self.engine.execute(&drop).await {
            warn!("cannot drop {}: {}", table, e);
        }
    }

    async fn run_query(&self, query: &HarnessQuery, table: &str) -> QueryOutcome {
        let sql = query.render(table);
        let start = Instant::now();
        let result = self.engine.fetch_all(&sql).await;
        let elapsed = start.elapsed();

        match result {
            Ok(rows) => {
                debug!("{}: {:.3}s ({} rows)", query.name, elapsed.as_secs_f64(), rows.row_count());
                QueryOutcome {
                    name: query.name.clone(),
                    success: true,
                    rows_returned: rows.row_count(),
                    result: rows.first_row(),
                    error: None,
                    elapsed,
                }
            }
            Err(e) => {
                debug!("{}: {}", query.name, e);
                QueryOutcome::failed(&query.name, e.to_string(), elapsed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn write_patient(root: &Path, id: &str, csv: &str) -> PatientTarget {
        let folder = root.join(format!("patient_{}", id));
        fs::create_dir_all(&folder).unwrap();
        let path = folder.join("merged.csv");
        fs::write(&path, csv).unwrap();
        PatientTarget {
            patient_id: id.to_string(),
            path,
        }
    }

    const FULL: &str = "Id,patients_FIRST,patients_LAST,patients_GENDER,patients_BIRTHDATE,\
patients_HEALTHCARE_EXPENSES,patients_HEALTHCARE_COVERAGE,PATIENT,medications_DESCRIPTION,\
conditions_DESCRIPTION,procedures_CODE\n\
P1,Ann,Lee,F,1980-01-01,1000.5,200,P1,Aspirin,Flu,123\n\
,,,,,,,P1,Ibuprofen,,456\n";

    #[test]
    fn test_render_query() {
        let q = HarnessQuery::new("n", "SELECT * FROM {table} LIMIT 1", "");
        assert_eq!(q.render("patient_P1"), "SELECT * FROM patient_P1 LIMIT 1");
    }

    #[test]
    fn test_discover_patients() {
        let dir = tempfile::tempdir().unwrap();
        write_patient(dir.path(), "B", "x\n1\n");
        write_patient(dir.path(), "A", "x\n1\n");
        fs::create_dir(dir.path().join("patient_C")).unwrap();
        let ids: Vec<String> = discover_patients(dir.path(), "merged.csv")
            .unwrap()
            .into_iter()
            .map(|t| t.patient_id)
            .collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_default_queries_succeed_on_full_table() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_patient(dir.path(), "P1", FULL);
        let engine = SqlEngine::in_memory().await.unwrap();
        let harness = StressHarness::new(engine, default_queries());

        let report = harness.run(&[target]).await;
        assert_eq!(report.successful_patients, 1);
        assert!(report.errors.is_empty(), "{:?}", report.errors);

        let counts = &report.patient_results[0].queries[1];
        let row = counts.result.as_ref().unwrap();
        assert_eq!(row["total_records"], serde_json::json!(2));
        assert_eq!(row["unique_medications"], serde_json::json!(2));
        assert_eq!(row["unique_conditions"], serde_json::json!(1));
        assert_eq!(report.queries_executed(), 3);
    }

    #[tokio::test]
    async fn test_failed_query_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_patient(dir.path(), "P1", FULL);
        let bad = write_patient(dir.path(), "P2", "Id,patients_FIRST\nP2,Bob\n");
        let engine = SqlEngine::in_memory().await.unwrap();
        let harness = StressHarness::new(engine, default_queries());

        let report = harness.run(&[bad, good]).await;
        assert_eq!(report.total_patients, 2);
        assert_eq!(report.successful_patients + report.failed_patients, 2);
        assert_eq!(report.failed_patients, 1);
        assert!(!report.patient_results[0].succeeded());
        assert!(report.patient_results[1].succeeded());
        // every default query references a column P2 lacks
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.queries_executed(), 6);
        assert_eq!(report.verdict().quality, QualityBand::NeedsWork);
        assert!(report.fastest_patient <= report.slowest_patient);
    }

    #[tokio::test]
    async fn test_staging_failure_fails_every_query() {
        let dir = tempfile::tempdir().unwrap();
        let target = PatientTarget {
            patient_id: "P9".into(),
            path: dir.path().join("missing.csv"),
        };
        let engine = SqlEngine::in_memory().await.unwrap();
        let report = StressHarness::new(engine, default_queries()).run(&[target]).await;
        assert_eq!(report.failed_patients, 1);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.queries_executed(), 0);
        assert_eq!(report.queries_per_second(), None);
        assert!(report.errors[0].error.starts_with("staging failed"));
    }

    #[tokio::test]
    async fn test_staging_leaves_loaded_tables_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_patient(dir.path(), "P1", FULL);
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("p.db").display());
        let db = SqlEngine::connect(&url).await.unwrap();

        let table = Table::read_csv(&target.path).unwrap();
        let schema = PatientTableSchema::infer("P1", &table).unwrap();
        db.execute_script(&schema.statements(&table)).await.unwrap();

        let report = StressHarness::new(db.clone(), default_queries())
            .run(&[target.clone()])
            .await;
        assert_eq!(report.failed_patients, 1);
        assert!(report.errors[0].error.contains("preloaded"));
        assert!(db.table_exists("patient_P1").await);
        let rows = db.fetch_all("SELECT COUNT(*) AS n FROM patient_P1").await.unwrap();
        assert_eq!(rows.rows[0][0], serde_json::json!(2));

        let report = StressHarness::new(db.clone(), default_queries())
            .mode(StageMode::Preloaded)
            .run(&[target])
            .await;
        assert_eq!(report.successful_patients, 1);
        assert!(db.table_exists("patient_P1").await);
    }

    #[tokio::test]
    async fn test_staged_table_dropped_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_patient(dir.path(), "P1", FULL);
        let db = SqlEngine::in_memory().await.unwrap();
        let report = StressHarness::new(db.clone(), default_queries()).run(&[target]).await;
        assert_eq!(report.successful_patients, 1);
        assert!(!db.table_exists("patient_P1").await);
    }

    #[test]
    fn test_error_breakdown_groups_prefixes() {
        let mut report = StressReport::new(&[]);
        for (p, msg) in [("a", "no such column: x"), ("b", "no such column: x"), ("c", "other")] {
            report.errors.push(QueryError {
                patient: p.into(),
                query: "q".into(),
                error: msg.into(),
            });
        }
        assert_eq!(
            report.error_breakdown(5),
            vec![("no such column: x".to_string(), 2), ("other".to_string(), 1)]
        );
        assert_eq!(report.error_breakdown(1).len(), 1);
    }

    #[test]
    fn test_bands() {
        assert_eq!(QualityBand::from_rate(0.96), QualityBand::Excellent);
        assert_eq!(QualityBand::from_rate(0.9), QualityBand::Good);
        assert_eq!(QualityBand::from_rate(0.85), QualityBand::NeedsWork);
        assert_eq!(SpeedBand::from_qps(25.0), SpeedBand::Fast);
        assert_eq!(SpeedBand::from_qps(15.0), SpeedBand::Decent);
        assert_eq!(SpeedBand::from_qps(1.0), SpeedBand::Slow);
    }

    #[test]
    fn test_empty_report() {
        let report = StressReport::new(&default_queries());
        assert_eq!(report.success_rate(), 0.0);
        assert_eq!(report.average_patient_time(), None);
        assert!(report.sample_successes(3).is_empty());
    }
}
