//! Patient segregation.
//!
//! Splits every resource table into per-patient subsets, one folder per
//! roster identifier:
//!
//! ```text
//! <output_dir>/patients/patient_<id>/<resource>.csv
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::table::{Table, file_name_of, is_missing, list_csv_files};

/// Folder name prefix for patient directories.
pub const PATIENT_DIR_PREFIX: &str = "patient_";

/// Outcome of one segregation run.
#[derive(Debug, Default)]
pub struct SegregationReport {
    /// Identifier column found in the roster.
    pub roster_column: String,
    /// Patient folders created, in roster order.
    pub patients: Vec<PatientFolder>,
    /// Identifiers for which no folder was created.
    pub skipped_ids: Vec<String>,
    /// Resource files without any identifier alias column.
    pub resources_without_id: Vec<String>,
    /// Resource files that could not be read, with the error message.
    pub unreadable: Vec<(String, String)>,
}

impl SegregationReport {
    /// Total subset files written across all patients.
    pub fn files_written(&self) -> usize {
        self.patients.iter().map(|p| p.resources.len()).sum()
    }
}

/// One created patient folder.
#[derive(Debug, Clone)]
pub struct PatientFolder {
    pub patient_id: String,
    pub path: PathBuf,
    /// Resource file name and rows written.
    pub resources: Vec<(String, usize)>,
}

/// Folder for a patient identifier under `root`. The identifier is embedded
/// verbatim.
pub fn patient_dir(root: &Path, patient_id: &str) -> PathBuf {
    root.join(format!("{}{}", PATIENT_DIR_PREFIX, patient_id))
}

/// Identifier of a patient folder, if the folder follows the naming scheme.
pub fn patient_id_from_dir(dir: &Path) -> Option<String> {
    dir.file_name()?
        .to_str()?
        .strip_prefix(PATIENT_DIR_PREFIX)
        .map(str::to_string)
}

/// Identifiers that would leave the patients root or name no folder at all.
fn usable_as_folder(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// A loaded resource with its identifier column resolved.
struct Resource {
    name: String,
    table: Table,
    id_column: Option<usize>,
}

/// Distinct non-missing values of a column in first-appearance order.
fn distinct_ids(table: &Table, column: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    table
        .column_values(column)
        .filter(|v| !is_missing(v))
        .filter(|v| seen.insert(v.to_string()))
        .map(str::to_string)
        .collect()
}

/// Partition every resource file of `config.input_dir` by patient.
pub fn segregate(config: &PipelineConfig) -> PipelineResult<SegregationReport> {
    let input = &config.input_dir;
    if !input.is_dir() {
        return Err(PipelineError::InputDirMissing(input.clone()));
    }

    let mut report = SegregationReport::default();
    let mut resources = Vec::new();
    for path in list_csv_files(input)? {
        let name = file_name_of(&path);
        match Table::read_csv(&path) {
            Ok(table) => {
                let id_column = table
                    .find_column(&config.id_aliases)
                    .and_then(|alias| table.column_index(alias));
                if id_column.is_none() {
                    report.resources_without_id.push(name.clone());
                }
                resources.push(Resource {
                    name,
                    table,
                    id_column,
                });
            }
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                report.unreadable.push((name, e.to_string()));
            }
        }
    }

    if let Some((_, reason)) = report.unreadable.iter().find(|(name, _)| *name == config.roster_name) {
        return Err(PipelineError::RosterUnreadable {
            roster: config.roster_name.clone(),
            reason: reason.clone(),
        });
    }
    let roster = resources
        .iter()
        .find(|r| r.name == config.roster_name)
        .ok_or_else(|| PipelineError::RosterMissing(config.roster_name.clone()))?;
    if roster.table.is_empty() {
        return Err(PipelineError::RosterEmpty(config.roster_name.clone()));
    }
    let roster_alias = roster
        .table
        .find_column(&config.id_aliases)
        .ok_or_else(|| PipelineError::roster_id_missing(&config.roster_name, &config.id_aliases))?;
    report.roster_column = roster_alias.to_string();
    let roster_ids = match roster.table.column_index(roster_alias) {
        Some(index) => distinct_ids(&roster.table, index),
        None => Vec::new(),
    };

    let root = config.patients_root();
    for patient_id in roster_ids {
        if !usable_as_folder(&patient_id) {
            warn!("skipping identifier {:?}: not usable as a folder name", patient_id);
            report.skipped_ids.push(patient_id);
            continue;
        }
        let folder = patient_dir(&root, &patient_id);
        if let Err(e) = fs::create_dir_all(&folder) {
            warn!("cannot create {}: {}", folder.display(), e);
            report.skipped_ids.push(patient_id);
            continue;
        }

        let mut written = Vec::new();
        for resource in &resources {
            let Some(column) = resource.id_column else {
                continue;
            };
            let subset = resource.table.filter_eq(column, &patient_id);
            if subset.is_empty() {
                continue;
            }
            let out = folder.join(&resource.name);
            match subset.write_csv(&out) {
                Ok(()) => written.push((resource.name.clone(), subset.row_count())),
                Err(e) => warn!("cannot write {}: {}", out.display(), e),
            }
        }
        debug!("created folder for patient {} ({} files)", patient_id, written.len());
        report.patients.push(PatientFolder {
            patient_id,
            path: folder,
            resources: written,
        });
    }

    info!(
        "segregated {} patients into {} files",
        report.patients.len(),
        report.files_written()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_for(dir: &Path) -> PipelineConfig {
        PipelineConfig::builder()
            .input_dir(dir)
            .output_dir(dir)
            .build()
    }

    #[test]
    fn test_segregate_two_patients_one_resource() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patients.csv"), "Id,patients_FIRST\nP1,Ann\nP2,Bob\n").unwrap();
        fs::write(
            dir.path().join("medications.csv"),
            "PATIENT,medications_CODE\nP1,10\nP1,11\nP3,12\n",
        )
        .unwrap();

        let report = segregate(&config_for(dir.path())).unwrap();
        assert_eq!(report.roster_column, "Id");
        assert_eq!(report.patients.len(), 2);

        let p1 = patient_dir(&dir.path().join("patients"), "P1");
        let meds = Table::read_csv(&p1.join("medications.csv")).unwrap();
        assert_eq!(meds.row_count(), 2);
        assert!(p1.join("patients.csv").exists());

        let p2 = patient_dir(&dir.path().join("patients"), "P2");
        assert!(p2.join("patients.csv").exists());
        assert!(!p2.join("medications.csv").exists());
    }

    #[test]
    fn test_resource_without_id_column_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patients.csv"), "Id\nP1\n").unwrap();
        fs::write(dir.path().join("codes.csv"), "CODE,DESCRIPTION\n1,x\n").unwrap();

        let report = segregate(&config_for(dir.path())).unwrap();
        assert_eq!(report.resources_without_id, vec!["codes.csv"]);
        let p1 = patient_dir(&dir.path().join("patients"), "P1");
        assert!(!p1.join("codes.csv").exists());
    }

    #[test]
    fn test_missing_roster() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("meds.csv"), "PATIENT\nP1\n").unwrap();
        let err = segregate(&config_for(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::RosterMissing(_)));
        assert!(!dir.path().join("patients").exists());
    }

    #[test]
    fn test_unreadable_roster_reports_read_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patients.csv"), b"Id\n\xff\xfe\n").unwrap();
        let err = segregate(&config_for(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::RosterUnreadable { .. }), "{err}");
        assert!(err.is_roster_condition());
        assert!(!dir.path().join("patients").exists());
    }

    #[test]
    fn test_empty_roster() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patients.csv"), "Id\n").unwrap();
        let err = segregate(&config_for(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::RosterEmpty(_)));
    }

    #[test]
    fn test_roster_without_alias() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patients.csv"), "NAME\nAnn\n").unwrap();
        let err = segregate(&config_for(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::RosterIdMissing { .. }));
        assert!(!dir.path().join("patients").exists());
    }

    #[test]
    fn test_missing_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir.path().join("nope"));
        assert!(matches!(
            segregate(&config).unwrap_err(),
            PipelineError::InputDirMissing(_)
        ));
    }

    #[test]
    fn test_duplicate_and_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patients.csv"), "Id\nP1\nP1\n../x\n\n").unwrap();
        let report = segregate(&config_for(dir.path())).unwrap();
        assert_eq!(report.patients.len(), 1);
        assert_eq!(report.skipped_ids, vec!["../x"]);
    }

    #[test]
    fn test_patient_id_from_dir() {
        assert_eq!(
            patient_id_from_dir(Path::new("/x/patients/patient_0a-1")),
            Some("0a-1".to_string())
        );
        assert_eq!(patient_id_from_dir(Path::new("/x/other")), None);
    }
}
