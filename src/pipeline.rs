//! End-to-end pipeline.
//!
//! Runs the file-based stages in order: prefix (optional), segregate, merge,
//! normalize, clean (optional), load-script generation. Stages only hand off
//! through the filesystem, so each one can also be run on its own.

use std::path::PathBuf;

use tracing::info;

use crate::clean::{CleanReport, clean_all_patient_folders};
use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::merge::{MergeReport, merge_all};
use crate::normalize::{NormalizationReport, normalize_all};
use crate::prefix::{PrefixReport, prefix_directory};
use crate::schema::generate_load_script;
use crate::segregate::{SegregationReport, segregate};

/// Optional stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Prefix raw resource files in place first. Not idempotent.
    pub prefix: bool,
    /// Delete resource subsets once merged.
    pub clean: bool,
}

/// What each stage did.
#[derive(Debug)]
pub struct PipelineSummary {
    pub prefix: Option<PrefixReport>,
    pub segregation: SegregationReport,
    pub merge: MergeReport,
    pub normalized: Vec<(String, NormalizationReport)>,
    pub clean: Option<CleanReport>,
    pub load_script: PathBuf,
    pub script_patients: usize,
    pub script_statements: usize,
    /// Merged files left out of the load script, with the reason.
    pub script_failures: Vec<(PathBuf, String)>,
}

/// Run every stage. A roster condition aborts the run before any patient
/// folder is created.
pub fn run(config: &PipelineConfig, options: RunOptions) -> PipelineResult<PipelineSummary> {
    let prefix = if options.prefix {
        Some(prefix_directory(&config.input_dir, &config.id_aliases)?)
    } else {
        None
    };

    let segregation = segregate(config)?;
    let root = config.patients_root();
    let merge = merge_all(&root, &config.merged_file_name)?;
    let normalized = normalize_all(&root, &config.merged_file_name)?;
    let clean = if options.clean {
        Some(clean_all_patient_folders(&root, &config.merged_file_name)?)
    } else {
        None
    };

    let generated = generate_load_script(&root, &config.merged_file_name, config.dialect())?;
    let load_script = config.load_script_path();
    generated.script.write(&load_script)?;
    info!("wrote load script to {}", load_script.display());

    Ok(PipelineSummary {
        prefix,
        segregation,
        merge,
        normalized,
        clean,
        load_script,
        script_patients: generated.script.patient_count(),
        script_statements: generated.script.statement_count(),
        script_failures: generated.failures,
    })
}
