//! Column prefixing.
//!
//! Every column of a resource file is namespaced by its resource type
//! (`medications.csv`: `CODE` → `medications_CODE`) so that columns from
//! different resources can live side by side after the merge. Identifier
//! aliases stay untouched; they are the join keys.
//!
//! Prefixing is not idempotent. Running it twice yields
//! `medications_medications_CODE`, which [`crate::normalize`] repairs.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::table::{Table, file_name_of, list_csv_files};

/// One renamed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// Outcome of prefixing a directory.
#[derive(Debug, Default)]
pub struct PrefixReport {
    /// File name and its renamings, per processed file.
    pub files: Vec<(String, Vec<Rename>)>,
    /// File name and error message, per file that could not be processed.
    pub failures: Vec<(String, String)>,
}

/// Resource name of a file: its name without extension.
pub fn resource_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Rename every non-alias column to `<resource>_<column>`.
pub fn prefix_columns(resource: &str, table: &mut Table, aliases: &[String]) -> Vec<Rename> {
    let mut renames = Vec::new();
    for header in table.headers.iter_mut() {
        if aliases.iter().any(|a| a.as_str() == header.as_str()) {
            continue;
        }
        let to = format!("{}_{}", resource, header);
        renames.push(Rename {
            from: std::mem::replace(header, to.clone()),
            to,
        });
    }
    renames
}

/// Prefix one resource file in place.
pub fn prefix_file(path: &Path, aliases: &[String]) -> PipelineResult<Vec<Rename>> {
    let resource = resource_name(path);
    let mut table = Table::read_csv(path)?;
    let renames = prefix_columns(&resource, &mut table, aliases);
    table.write_csv(path)?;
    debug!("prefixed {} columns of {}", renames.len(), path.display());
    Ok(renames)
}

/// Prefix every resource file in `dir`. A file that fails is logged and
/// skipped.
pub fn prefix_directory(dir: &Path, aliases: &[String]) -> PipelineResult<PrefixReport> {
    let mut report = PrefixReport::default();
    for path in list_csv_files(dir)? {
        let name = file_name_of(&path);
        match prefix_file(&path, aliases) {
            Ok(renames) => report.files.push((name, renames)),
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                report.failures.push((name, e.to_string()));
            }
        }
    }
    info!(
        "prefixed {} resource files ({} failed)",
        report.files.len(),
        report.failures.len()
    );
    Ok(report)
}
