use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn pricepipe() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pricepipe"))
}

fn temp_project(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "pricepipe_e2e_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(root.join("data")).expect("project dirs");
    root
}

fn write_sample(project: &Path) {
    let mut csv =
        String::from("id,name,neighbourhood_group,room_type,price,last_review\n");
    for i in 0..30 {
        csv.push_str(&format!(
            "{},\"Cozy, spot {}\",Manhattan,Entire home/apt,{},2019-05-{:02}\n",
            i,
            i,
            100 + i,
            (i % 28) + 1
        ));
    }
    for i in 30..50 {
        csv.push_str(&format!(
            "{},Room {},Brooklyn,Private room,{},\n",
            i,
            i,
            60 + i
        ));
    }
    fs::write(project.join("data").join("sample1.csv"), csv).expect("sample");
}

fn write_config(project: &Path) {
    let config = "\
main:
  project_name: nyc_airbnb
  experiment_name: integration
  steps: all
  data_dir: data
etl:
  sample: sample1.csv
  min_price: 10
  max_price: 350
data_check:
  kl_threshold: 0.5
modeling:
  test_size: 0.2
  val_size: 0.2
  random_seed: 42
  stratify_by: neighbourhood_group
";
    fs::write(project.join("config.yaml"), config).expect("config");
}

fn version_dir(store: &Path, name: &str, version: u64) -> PathBuf {
    store.join(name).join(format!("v{}", version))
}

#[test]
fn run_publishes_artifacts_into_the_project_store() {
    let project = temp_project("run");
    write_sample(&project);
    write_config(&project);
    let store = project.join(".pricepipe").join("artifacts");

    // First pass: no blessed reference yet, so stop before data_check.
    let status = pricepipe()
        .current_dir(&project)
        .args(["run", "config.yaml", "--steps", "download,basic_cleaning"])
        .status()
        .expect("spawn run");
    assert!(status.success(), "partial run should succeed");
    assert!(version_dir(&store, "sample.csv", 1).join("metadata.json").is_file());
    assert!(
        version_dir(&store, "clean_sample.csv", 1)
            .join("metadata.json")
            .is_file(),
        "cleaned artifact must persist in the project store"
    );

    // Bless the cleaned data as the drift reference, then run everything.
    let status = pricepipe()
        .current_dir(&project)
        .args(["artifacts", "alias", "clean_sample.csv", "reference", "1"])
        .status()
        .expect("spawn alias");
    assert!(status.success(), "alias should succeed");

    let status = pricepipe()
        .current_dir(&project)
        .args(["run", "config.yaml"])
        .status()
        .expect("spawn full run");
    assert!(status.success(), "full run should succeed");

    for name in ["trainval_data.csv", "test_data.csv", "price_model"] {
        assert!(
            version_dir(&store, name, 1).join("metadata.json").is_file(),
            "{} v1 must persist in the project store",
            name
        );
    }
    // The full run republished the upstream artifacts as fresh versions.
    assert!(version_dir(&store, "sample.csv", 2).join("metadata.json").is_file());

    let runs = project.join(".pricepipe").join("runs");
    let mut run_dirs = 0;
    for entry in fs::read_dir(&runs).expect("runs dir") {
        let dir = entry.expect("run entry").path();
        run_dirs += 1;
        assert!(
            !dir.join("scratch").exists(),
            "scratch must be released when the run ends"
        );
        let state: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join("run_state.json")).expect("state"))
                .expect("state json");
        assert_eq!(state["status"], "completed");
    }
    assert_eq!(run_dirs, 2);
    let _ = fs::remove_dir_all(project);
}

#[test]
fn failed_step_aborts_the_run_and_marks_the_state() {
    let project = temp_project("fail");
    write_config(&project);
    // data/ exists but the sample file does not, so download fails.

    let status = pricepipe()
        .current_dir(&project)
        .args(["run", "config.yaml", "--steps", "download,basic_cleaning"])
        .status()
        .expect("spawn run");
    assert!(!status.success(), "run must fail without the sample file");

    let store = project.join(".pricepipe").join("artifacts");
    assert!(
        !store.join("sample.csv").exists(),
        "nothing may be published by a failed download"
    );

    let runs = project.join(".pricepipe").join("runs");
    let run_dir = fs::read_dir(&runs)
        .expect("runs dir")
        .next()
        .expect("one run")
        .expect("entry")
        .path();
    assert!(!run_dir.join("scratch").exists());
    let state: serde_json::Value =
        serde_json::from_slice(&fs::read(run_dir.join("run_state.json")).expect("state"))
            .expect("state json");
    assert_eq!(state["status"], "failed");
    let step_state: serde_json::Value = serde_json::from_slice(
        &fs::read(
            run_dir
                .join("steps")
                .join("download")
                .join("step_state.json"),
        )
        .expect("step state"),
    )
    .expect("step state json");
    assert_eq!(step_state["status"], "failed");
    let _ = fs::remove_dir_all(project);
}
