//! Pipeline configuration.
//!
//! Every stage takes a [`PipelineConfig`] instead of reaching for ambient
//! paths. Configuration is read from TOML and can be overridden from the CLI.
//!
//! ```toml
//! input_dir = "data/raw"
//! output_dir = "data"
//! roster_name = "patients.csv"
//!
//! [[queries]]
//! name = "Row Count"
//! sql = "SELECT COUNT(*) AS n FROM {table}"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};
use crate::harness::HarnessQuery;
use crate::schema::SqlDialect;

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "patientdb.toml";

/// Identifier aliases in probing priority order.
pub const DEFAULT_ID_ALIASES: &[&str] = &[
    "patient_id",
    "id",
    "Id",
    "PATIENTID",
    "PATIENT",
    "patients_Id",
    "patient",
];

/// Main pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the raw resource CSV files.
    pub input_dir: PathBuf,

    /// Destination root; patient folders land in `<output_dir>/patients`.
    pub output_dir: PathBuf,

    /// File name of the roster (master patient registry).
    pub roster_name: String,

    /// File name of the merged table inside each patient folder.
    pub merged_file_name: String,

    /// File name of the generated load script inside `output_dir`.
    pub load_script_name: String,

    /// Column names recognized as the patient identifier, in priority order.
    pub id_aliases: Vec<String>,

    /// Engine URL for the stress harness and the `load` command.
    pub database_url: String,

    /// Harness queries; empty means the built-in set.
    pub queries: Vec<HarnessQuery>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            roster_name: "patients.csv".to_string(),
            merged_file_name: "merged_patient_data.csv".to_string(),
            load_script_name: "load_script.sql".to_string(),
            id_aliases: DEFAULT_ID_ALIASES.iter().map(|s| s.to_string()).collect(),
            database_url: "sqlite::memory:".to_string(),
            queries: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> PipelineResult<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file.
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Resolve the configuration: explicit path, then `./patientdb.toml`,
    /// then the user config directory, then defaults.
    pub fn load(explicit: Option<&Path>) -> PipelineResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::from_file(&local);
        }
        if let Some(dir) = dirs::config_dir() {
            let user = dir.join("patientdb").join(CONFIG_FILE_NAME);
            if user.exists() {
                return Self::from_file(&user);
            }
        }
        Ok(Self::default())
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.roster_name.trim().is_empty() {
            return Err(PipelineError::Config("roster_name must not be empty".into()));
        }
        if self.merged_file_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "merged_file_name must not be empty".into(),
            ));
        }
        if self.id_aliases.is_empty() {
            return Err(PipelineError::Config(
                "id_aliases must name at least one column".into(),
            ));
        }
        for q in &self.queries {
            if !q.sql.contains("{table}") {
                return Err(PipelineError::Config(format!(
                    "query '{}' does not reference {{table}}",
                    q.name
                )));
            }
        }
        Ok(())
    }

    /// Root directory holding the per-patient folders.
    pub fn patients_root(&self) -> PathBuf {
        self.output_dir.join("patients")
    }

    /// Location of the generated load script.
    pub fn load_script_path(&self) -> PathBuf {
        self.output_dir.join(&self.load_script_name)
    }

    /// SQL dialect of the configured database.
    pub fn dialect(&self) -> SqlDialect {
        SqlDialect::from_url(&self.database_url)
    }

    /// Harness queries, falling back to the built-in set.
    pub fn harness_queries(&self) -> Vec<HarnessQuery> {
        if self.queries.is_empty() {
            crate::harness::default_queries()
        } else {
            self.queries.clone()
        }
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the input directory
    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    /// Set the output directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Set the roster file name
    pub fn roster(mut self, name: impl Into<String>) -> Self {
        self.config.roster_name = name.into();
        self
    }

    /// Set the merged file name
    pub fn merged_file(mut self, name: impl Into<String>) -> Self {
        self.config.merged_file_name = name.into();
        self
    }

    /// Set the database URL
    pub fn database(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Replace the harness queries
    pub fn queries(mut self, queries: Vec<HarnessQuery>) -> Self {
        self.config.queries = queries;
        self
    }

    /// Build the configuration
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.roster_name, "patients.csv");
        assert_eq!(config.id_aliases[0], "patient_id");
        assert_eq!(config.patients_root(), PathBuf::from("./patients"));
        assert_eq!(config.harness_queries().len(), 3);
        assert_eq!(config.dialect(), SqlDialect::Sqlite);
    }

    #[test]
    fn test_postgres_url_selects_dialect() {
        let config = PipelineConfig::builder()
            .database("postgresql://localhost/patients")
            .build();
        assert_eq!(config.dialect(), SqlDialect::Postgres);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = PipelineConfig::from_toml(
            r#"
            input_dir = "raw"
            output_dir = "out"

            [[queries]]
            name = "Count"
            sql = "SELECT COUNT(*) FROM {table}"
            "#,
        )
        .unwrap();
        assert_eq!(config.input_dir, PathBuf::from("raw"));
        assert_eq!(config.load_script_path(), PathBuf::from("out/load_script.sql"));
        assert_eq!(config.roster_name, "patients.csv");
        assert_eq!(config.harness_queries().len(), 1);
    }

    #[test]
    fn test_query_without_placeholder_rejected() {
        let err = PipelineConfig::from_toml(
            r#"
            [[queries]]
            name = "Broken"
            sql = "SELECT 1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_builder() {
        let config = PipelineConfig::builder()
            .input_dir("in")
            .output_dir("out")
            .roster("people.csv")
            .database("sqlite://x.db")
            .build();
        assert_eq!(config.roster_name, "people.csv");
        assert_eq!(config.database_url, "sqlite://x.db");
    }
}
