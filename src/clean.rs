//! Patient folder cleanup.
//!
//! Once a patient's merged table exists the per-resource subsets are no
//! longer needed. Cleaning deletes every CSV in the folder except the merged
//! file. A file that cannot be deleted is logged and left in place.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::table::{file_name_of, list_csv_files, list_subdirs};

#[derive(Debug, Default)]
pub struct CleanReport {
    pub deleted: Vec<PathBuf>,
    /// Path and error message of each file that could not be deleted.
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanReport {
    fn absorb(&mut self, other: CleanReport) {
        self.deleted.extend(other.deleted);
        self.failures.extend(other.failures);
    }
}

/// Delete every CSV in `folder` except `keep`.
pub fn clean_patient_folder(folder: &Path, keep: &str) -> PipelineResult<CleanReport> {
    let mut report = CleanReport::default();
    for path in list_csv_files(folder)? {
        if file_name_of(&path) == keep {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("deleted {}", path.display());
                report.deleted.push(path);
            }
            Err(e) => {
                warn!("error deleting {}: {}", path.display(), e);
                report.failures.push((path, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Clean every patient folder under `patients_root`. Folders without a merged
/// table are left alone so no data is lost before merging.
pub fn clean_all_patient_folders(patients_root: &Path, keep: &str) -> PipelineResult<CleanReport> {
    let mut report = CleanReport::default();
    for folder in list_subdirs(patients_root)? {
        if !folder.join(keep).is_file() {
            debug!("no {} in {}, not cleaning", keep, folder.display());
            continue;
        }
        match clean_patient_folder(&folder, keep) {
            Ok(r) => report.absorb(r),
            Err(e) => {
                warn!("cannot clean {}: {}", folder.display(), e);
                report.failures.push((folder, e.to_string()));
            }
        }
    }
    info!(
        "deleted {} resource subsets ({} failures)",
        report.deleted.len(),
        report.failures.len()
    );
    Ok(report)
}
