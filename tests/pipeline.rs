use std::fs;
use std::path::Path;

use patientdb::merge::merge_patient_folder;
use patientdb::prelude::*;
use patientdb::schema::generate_load_script;
use patientdb::segregate::{patient_dir, segregate};
use pretty_assertions::assert_eq;

fn config_for(dir: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .input_dir(dir.join("raw"))
        .output_dir(dir)
        .merged_file("merged_patient_data.csv")
        .build()
}

fn write_raw(dir: &Path, name: &str, content: &str) {
    let raw = dir.join("raw");
    fs::create_dir_all(&raw).unwrap();
    fs::write(raw.join(name), content).unwrap();
}

#[test]
fn test_two_patients_one_resource_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "patients.csv", "Id\nP1\nP2\n");
    write_raw(dir.path(), "allergies.csv", "PATIENT,allergies_CODE\nP1,7\n");
    let config = config_for(dir.path());
    segregate(&config).unwrap();

    let root = config.patients_root();
    let p1 = patient_dir(&root, "P1");
    let p2 = patient_dir(&root, "P2");
    assert!(p1.is_dir());
    assert!(!p2.join("allergies.csv").exists());

    let subset = Table::read_csv(&p1.join("allergies.csv")).unwrap();
    assert_eq!(subset.rows, vec![vec!["P1", "7"]]);

    // merge a folder holding only that resource subset
    fs::remove_file(p1.join("patients.csv")).unwrap();
    let merged_path = merge_patient_folder(&p1, &config.merged_file_name).unwrap().unwrap();
    let merged = Table::read_csv(&merged_path).unwrap();
    assert_eq!(merged, subset);

    let schema = PatientTableSchema::infer("P1", &merged).unwrap();
    assert_eq!(
        schema.create_table_sql(),
        "CREATE TABLE patient_P1 (PATIENT TEXT, allergies_CODE INTEGER);"
    );
    let inserts = schema.insert_statements(&merged);
    assert_eq!(
        inserts,
        vec!["INSERT INTO patient_P1 (PATIENT, allergies_CODE) VALUES ('P1', 7);".to_string()]
    );
}

#[test]
fn test_shared_column_keeps_first_file_value() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "patients.csv", "Id\nP1\n");
    write_raw(dir.path(), "a_notes.csv", "PATIENT,notes\nP1,from a\n");
    write_raw(dir.path(), "b_notes.csv", "PATIENT,notes\nP1,from b\n");
    let config = config_for(dir.path());
    segregate(&config).unwrap();

    let p1 = patient_dir(&config.patients_root(), "P1");
    let merged_path = merge_patient_folder(&p1, &config.merged_file_name).unwrap().unwrap();
    let merged = Table::read_csv(&merged_path).unwrap();
    let notes: Vec<&String> = merged.headers.iter().filter(|h| *h == "notes").collect();
    assert_eq!(notes.len(), 1);
    let idx = merged.column_index("notes").unwrap();
    assert_eq!(merged.rows[0][idx], "from a");
}

#[tokio::test]
async fn test_load_script_roundtrips_quotes_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "patients.csv", "Id,patients_LAST\nP-1,O'Hara\nP 2,\"Smith, \"\"Jr\"\"\"\n");
    let config = config_for(dir.path());
    segregate(&config).unwrap();
    patientdb::merge::merge_all(&config.patients_root(), &config.merged_file_name).unwrap();

    let generated = generate_load_script(&config.patients_root(), &config.merged_file_name, config.dialect()).unwrap();
    generated.script.write(&config.load_script_path()).unwrap();
    let text = fs::read_to_string(config.load_script_path()).unwrap();
    assert!(text.contains("-- Patient: P-1"));

    let db = SqlEngine::in_memory().await.unwrap();
    db.execute_script(&LoadScript::split_statements(&text)).await.unwrap();

    let rows = db.fetch_all("SELECT patients_LAST FROM patient_P_1").await.unwrap();
    assert_eq!(rows.rows[0][0], serde_json::json!("O'Hara"));
    let rows = db.fetch_all("SELECT patients_LAST FROM patient_P_2").await.unwrap();
    assert_eq!(rows.rows[0][0], serde_json::json!("Smith, \"Jr\""));
}

#[tokio::test]
async fn test_preloaded_stress_run() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "patients.csv", "Id,patients_FIRST\nP1,Ann\nP2,Bob\n");
    let config = config_for(dir.path());
    segregate(&config).unwrap();
    patientdb::merge::merge_all(&config.patients_root(), &config.merged_file_name).unwrap();
    let generated = generate_load_script(&config.patients_root(), &config.merged_file_name, config.dialect()).unwrap();

    let db = SqlEngine::in_memory().await.unwrap();
    db.execute_all(&LoadScript::split_statements(&generated.script.render()))
        .await
        .unwrap();

    let queries = vec![HarnessQuery::new(
        "First Name",
        "SELECT patients_FIRST FROM {table}",
        "",
    )];
    let targets = discover_patients(&config.patients_root(), &config.merged_file_name).unwrap();
    let report = StressHarness::new(db, queries)
        .mode(StageMode::Preloaded)
        .run(&targets)
        .await;

    assert_eq!(report.total_patients, 2);
    assert_eq!(report.successful_patients, 2);
    assert_eq!(report.patient_results[1].queries[0].result.as_ref().unwrap()["patients_FIRST"], "Bob");
}
