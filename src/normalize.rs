//! Column-label normalization.
//!
//! Repairs the doubled prefixes left behind when a resource file is prefixed
//! more than once: `meds_meds_CODE` → `meds_CODE`. Only exact repetition of
//! the leading `_`-separated segment is detected. Repetition is collapsed
//! completely, so normalizing an already normalized label changes nothing.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::prefix::Rename;
use crate::segregate::patient_id_from_dir;
use crate::table::{Table, file_name_of, list_subdirs};

/// Field separator between prefix segments.
pub const SEPARATOR: char = '_';

/// Collapsed label, or `None` when the label has no repeated leading segment.
pub fn normalize_label(label: &str) -> Option<String> {
    let mut rest = label;
    loop {
        let mut parts = rest.splitn(3, SEPARATOR);
        let (Some(first), Some(second)) = (parts.next(), parts.next()) else {
            break;
        };
        if first != second {
            break;
        }
        // drop "<first>_"
        rest = &rest[first.len() + 1..];
    }
    (rest.len() != label.len()).then(|| rest.to_string())
}

/// Outcome of normalizing one table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalizationReport {
    pub renamed: Vec<Rename>,
    /// Renames not applied because the target name already exists.
    pub conflicts: Vec<Rename>,
}

impl NormalizationReport {
    pub fn count(&self) -> usize {
        self.renamed.len()
    }

    pub fn is_noop(&self) -> bool {
        self.renamed.is_empty()
    }
}

/// Normalize every column label of `table` in one pass.
pub fn normalize_columns(table: &mut Table) -> NormalizationReport {
    let mut report = NormalizationReport::default();
    let mut taken: HashSet<String> = table.headers.iter().cloned().collect();

    for header in table.headers.iter_mut() {
        let Some(to) = normalize_label(header) else {
            continue;
        };
        let rename = Rename {
            from: header.clone(),
            to: to.clone(),
        };
        if taken.contains(&to) {
            report.conflicts.push(rename);
            continue;
        }
        taken.remove(header.as_str());
        taken.insert(to.clone());
        *header = to;
        report.renamed.push(rename);
    }
    report
}

/// Normalize a CSV file's header in place. The file is rewritten only when a
/// label changed.
pub fn normalize_file(path: &Path) -> PipelineResult<NormalizationReport> {
    let mut table = Table::read_csv(path)?;
    let report = normalize_columns(&mut table);
    if !report.is_noop() {
        table.write_csv(path)?;
        debug!("normalized {} labels in {}", report.count(), path.display());
    }
    Ok(report)
}

/// Normalize the merged table of every patient folder under `patients_root`.
/// Returns the patient identifier and report of each file that changed or
/// had conflicts; failures are logged and skipped.
pub fn normalize_all(
    patients_root: &Path,
    merged_name: &str,
) -> PipelineResult<Vec<(String, NormalizationReport)>> {
    let mut changed = Vec::new();
    for folder in list_subdirs(patients_root)? {
        let path = folder.join(merged_name);
        if !path.is_file() {
            continue;
        }
        let patient = patient_id_from_dir(&folder).unwrap_or_else(|| file_name_of(&folder));
        match normalize_file(&path) {
            Ok(report) if report.is_noop() && report.conflicts.is_empty() => {}
            Ok(report) => changed.push((patient, report)),
            Err(e) => warn!("cannot normalize {}: {}", path.display(), e),
        }
    }
    info!("normalized labels in {} merged tables", changed.len());
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::table;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_collapse_doubled_prefix() {
        assert_eq!(
            normalize_label("medications_medications_CODE").as_deref(),
            Some("medications_CODE")
        );
        assert_eq!(normalize_label("a_a_a_b").as_deref(), Some("a_b"));
        assert_eq!(normalize_label("a_a").as_deref(), Some("a"));
    }

    #[test]
    fn test_untouched_labels() {
        assert_eq!(normalize_label("medications_CODE"), None);
        assert_eq!(normalize_label("PATIENT"), None);
        assert_eq!(normalize_label("a_b_a_b"), None);
        assert_eq!(normalize_label(""), None);
    }

    #[test]
    fn test_second_pass_is_noop() {
        let mut t = table(
            &["Id", "patients_patients_FIRST", "meds_meds_meds_CODE", "meds_STOP"],
            &[&["P1", "Ann", "1", ""]],
        );
        let first = normalize_columns(&mut t);
        assert_eq!(first.count(), 2);
        assert_eq!(
            t.headers,
            vec!["Id", "patients_FIRST", "meds_CODE", "meds_STOP"]
        );

        let snapshot = t.clone();
        let second = normalize_columns(&mut t);
        assert!(second.is_noop());
        assert_eq!(t, snapshot);
    }

    #[test]
    fn test_conflicting_rename_not_applied() {
        let mut t = table(&["meds_CODE", "meds_meds_CODE"], &[]);
        let report = normalize_columns(&mut t);
        assert!(report.is_noop());
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(t.headers, vec!["meds_CODE", "meds_meds_CODE"]);
    }

    #[test]
    fn test_normalize_file_rewrites_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.csv");
        std::fs::write(&path, "x_x_y\n1\n").unwrap();
        assert_eq!(normalize_file(&path).unwrap().count(), 1);
        assert_eq!(Table::read_csv(&path).unwrap().headers, vec!["x_y"]);
        assert!(normalize_file(&path).unwrap().is_noop());
    }
}
