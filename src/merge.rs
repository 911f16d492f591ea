//! Patient merging.
//!
//! A patient's resource subsets are combined into one wide table. Each subset
//! is keyed by its own row sequence number (0, 1, 2, …) and the subsets are
//! full-outer-joined on that key: row `i` of the merged table holds row `i` of
//! every subset that has one, and missing cells for those that do not. The
//! merged table therefore has as many rows as the longest subset and no row
//! of a shorter subset is ever shifted against another.
//!
//! Columns sharing a name are kept once, taken from the first subset in file
//! order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::segregate::patient_id_from_dir;
use crate::table::{Table, file_name_of, list_csv_files, list_subdirs};

/// Merge tables by row sequence, first occurrence of a column name wins.
pub fn merge_tables(tables: &[Table]) -> Table {
    let height = tables.iter().map(Table::row_count).max().unwrap_or(0);

    // (table index, column index) of every surviving column
    let mut seen = HashSet::new();
    let mut picks = Vec::new();
    let mut headers = Vec::new();
    for (t, table) in tables.iter().enumerate() {
        for (c, name) in table.headers.iter().enumerate() {
            if seen.insert(name.as_str()) {
                picks.push((t, c));
                headers.push(name.clone());
            }
        }
    }

    let rows = (0..height)
        .map(|seq| {
            picks
                .iter()
                .map(|&(t, c)| {
                    tables[t]
                        .rows
                        .get(seq)
                        .and_then(|row| row.get(c).cloned())
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    Table { headers, rows }
}

/// Merge every resource subset in a patient folder into `merged_name`.
///
/// Returns `None` without writing anything when the folder holds no subsets.
pub fn merge_patient_folder(folder: &Path, merged_name: &str) -> PipelineResult<Option<PathBuf>> {
    let mut tables = Vec::new();
    for path in list_csv_files(folder)? {
        if file_name_of(&path) == merged_name {
            continue;
        }
        tables.push(Table::read_csv(&path)?);
    }
    if tables.is_empty() {
        return Ok(None);
    }

    let merged = merge_tables(&tables);
    let out = folder.join(merged_name);
    merged.write_csv(&out)?;
    debug!(
        "merged {} files into {} ({} rows, {} columns)",
        tables.len(),
        out.display(),
        merged.row_count(),
        merged.column_count()
    );
    Ok(Some(out))
}

/// Outcome of merging every patient folder.
#[derive(Debug, Default)]
pub struct MergeReport {
    pub merged: Vec<PathBuf>,
    /// Folders that held no resource subsets.
    pub empty: Vec<PathBuf>,
    /// Patient identifier and error message.
    pub failures: Vec<(String, String)>,
}

/// Merge every patient folder under `patients_root`. A failing patient is
/// logged and skipped.
pub fn merge_all(patients_root: &Path, merged_name: &str) -> PipelineResult<MergeReport> {
    let mut report = MergeReport::default();
    for folder in list_subdirs(patients_root)? {
        let patient = patient_id_from_dir(&folder).unwrap_or_else(|| file_name_of(&folder));
        match merge_patient_folder(&folder, merged_name) {
            Ok(Some(path)) => report.merged.push(path),
            Ok(None) => report.empty.push(folder),
            Err(e) => {
                warn!("merge failed for patient {}: {}", patient, e);
                report.failures.push((patient, e.to_string()));
            }
        }
    }
    info!(
        "merged {} patient folders ({} empty, {} failed)",
        report.merged.len(),
        report.empty.len(),
        report.failures.len()
    );
    Ok(report)
}
