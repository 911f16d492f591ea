//! # patientdb
//!
//! Patient-centric tables from per-resource clinical CSV extracts.
//!
//! A directory of resource files (`patients.csv`, `medications.csv`, …) is
//! turned into one folder and one wide merged table per patient, a SQL load
//! script with one typed table per patient, and a stress report from running
//! analytic queries against every patient.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use patientdb::prelude::*;
//!
//! let config = PipelineConfig::builder()
//!     .input_dir("data/raw")
//!     .output_dir("data")
//!     .build();
//!
//! let summary = patientdb::pipeline::run(&config, RunOptions::default())?;
//! println!("{} patients", summary.script_patients);
//! ```
//!
//! ## Stages
//!
//! | Stage      | Module        | Output                                   |
//! |------------|---------------|------------------------------------------|
//! | Prefix     | [`prefix`]    | `CODE` → `medications_CODE`, in place    |
//! | Segregate  | [`segregate`] | `patients/patient_<id>/<resource>.csv`   |
//! | Merge      | [`merge`]     | `patients/patient_<id>/merged_patient_data.csv` |
//! | Normalize  | [`normalize`] | `meds_meds_CODE` → `meds_CODE`           |
//! | Clean      | [`clean`]     | only the merged table is kept            |
//! | Schema     | [`schema`]    | `load_script.sql`                        |
//! | Stress     | [`harness`]   | [`harness::StressReport`]                |

pub mod clean;
pub mod config;
pub mod engine;
pub mod error;
pub mod harness;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod prefix;
pub mod schema;
pub mod segregate;
pub mod table;

pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::engine::{QueryRows, SqlEngine};
    pub use crate::error::*;
    pub use crate::harness::{
        HarnessQuery, PatientTarget, StageMode, StressHarness, StressReport, default_queries,
        discover_patients,
    };
    pub use crate::pipeline::{PipelineSummary, RunOptions};
    pub use crate::schema::{LoadScript, PatientTableSchema, SqlDialect, SqlType};
    pub use crate::table::Table;
}
