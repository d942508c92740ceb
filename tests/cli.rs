use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn bin(root: &Path) -> Command {
    let path = assert_cmd::cargo::cargo_bin!("aiscalator");
    let mut cmd = Command::new(path);
    cmd.env("HOME", root.join("home"))
        .env_remove("AISCALATOR_HOME")
        .env_remove("RUST_LOG")
        .current_dir(root);
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

#[test]
fn version_prints_package_version() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(contains(format!("aiscalator {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn setup_generates_application_config() {
    let dir = tempdir().unwrap();
    let app_home = dir.path().join("app");

    let output = bin(dir.path())
        .arg("--json")
        .arg("--app-home")
        .arg(&app_home)
        .arg("setup")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    let config_file = app_home.join("config").join("aiscalator.conf");
    assert_eq!(
        value["result"]["config_file"].as_str(),
        Some(config_file.to_str().unwrap())
    );
    assert!(value["result"]["user_id"].as_str().unwrap().starts_with('u'));
    assert!(config_file.is_file());
    assert!(app_home.join("config").join("requirements.txt").is_file());

    let text = fs::read_to_string(&config_file).unwrap();
    assert!(!text.contains("testUserID"));
    assert!(text.contains("// in UTC timezone"));
}

#[test]
fn setup_reuses_existing_config_from_env_home() {
    let dir = tempdir().unwrap();
    let env_home = dir.path().join("env_home");
    fs::create_dir_all(env_home.join("config")).unwrap();
    fs::write(
        env_home.join("config").join("aiscalator.conf"),
        "aiscalator.metadata.user.id = u-env\n",
    )
    .unwrap();

    let output = bin(dir.path())
        .env("AISCALATOR_HOME", &env_home)
        .arg("--json")
        .arg("setup")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(value["result"]["user_id"], "u-env");
    assert!(!dir.path().join("home/.aiscalator").exists());
}

#[test]
fn doctor_reports_missing_docker_in_json() {
    let dir = tempdir().unwrap();
    let output = bin(dir.path())
        .env("PATH", "")
        .arg("--json")
        .arg("doctor")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    let checks = value["result"]["checks"].as_array().expect("checks");
    let docker = checks
        .iter()
        .find(|row| row["id"] == "docker_runtime")
        .expect("docker_runtime check");
    assert_eq!(docker["ok"], false);
    let app = checks
        .iter()
        .find(|row| row["id"] == "app_config")
        .expect("app_config check");
    assert_eq!(app["ok"], false);
}

#[test]
fn doctor_fails_without_json_when_docker_missing() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .env("PATH", "")
        .arg("doctor")
        .assert()
        .failure()
        .stdout(contains("[fail] docker_runtime"));
}

#[test]
fn jupyter_new_scaffolds_step_then_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    let output = bin(dir.path())
        .args(["--json", "jupyter", "new", ".", "--name", "demo"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(value["result"]["config"].as_str().unwrap().ends_with("demo.conf"));
    assert!(dir.path().join("demo/demo.conf").is_file());
    assert!(dir.path().join("demo/notebook/demo.ipynb").is_file());
    assert!(dir.path().join("demo/apt_packages.txt").is_file());

    bin(dir.path())
        .args(["jupyter", "new", ".", "--name", "demo"])
        .assert()
        .failure()
        .stderr(contains("already exists"));
}

#[test]
fn jupyter_new_writes_yaml() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .args(["jupyter", "new", "steps", "--name", "demo", "--format", "yaml"])
        .assert()
        .success();
    let text = fs::read_to_string(dir.path().join("steps/demo/demo.yaml")).unwrap();
    assert!(text.contains("code_path: notebook/demo.ipynb"));

    bin(dir.path())
        .arg("--app-home")
        .arg(dir.path().join("app"))
        .args(["jupyter", "run", "steps/demo/demo.yaml", "missing"])
        .assert()
        .failure()
        .stderr(contains("Available candidates are: steps.demo"));
}

#[test]
fn unknown_step_lists_candidates() {
    let dir = tempdir().unwrap();
    let app_home = dir.path().join("app");
    bin(dir.path())
        .args(["jupyter", "new", ".", "--name", "demo"])
        .assert()
        .success();

    bin(dir.path())
        .arg("--app-home")
        .arg(&app_home)
        .args(["jupyter", "run", "demo/demo.conf", "missing"])
        .assert()
        .failure()
        .stderr(contains("Available candidates are: steps.demo"));
}

#[test]
fn malformed_config_is_reported_with_location() {
    let dir = tempdir().unwrap();
    let app_home = dir.path().join("app");
    fs::write(
        dir.path().join("bad.conf"),
        "steps {\n  demo {\n    task { type = jupyter\n",
    )
    .unwrap();

    let output = bin(dir.path())
        .arg("--json")
        .arg("--app-home")
        .arg(&app_home)
        .args(["jupyter", "run", "bad.conf"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(value["ok"], false);
    let error = value["error"].as_str().unwrap();
    assert!(error.contains("unable to parse configuration"));
    assert!(error.contains("line"));
}

#[test]
fn airflow_push_copies_dag_code_into_config_home() {
    let dir = tempdir().unwrap();
    let app_home = dir.path().join("app");
    bin(dir.path())
        .args(["airflow", "new", ".", "--name", "daily"])
        .assert()
        .success();

    bin(dir.path())
        .arg("--app-home")
        .arg(&app_home)
        .args(["airflow", "push", "daily/daily.conf"])
        .assert()
        .success()
        .stdout(contains("daily.ipynb"));
    assert!(app_home.join("workspace/dags/daily.ipynb").is_file());
}

#[test]
fn airflow_setup_records_workspaces() {
    let dir = tempdir().unwrap();
    let app_home = dir.path().join("app");
    let airflow_home = dir.path().join("airflow");
    let workspace = dir.path().join("ws");

    let output = bin(dir.path())
        .arg("--json")
        .arg("--app-home")
        .arg(&app_home)
        .args(["airflow", "setup", "-d"])
        .arg(&airflow_home)
        .arg(&workspace)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(
        value["result"]["workspace_paths"][0].as_str(),
        Some(workspace.to_str().unwrap())
    );
    assert!(airflow_home.join("workspace/dags").is_dir());
    assert!(airflow_home
        .join("config/docker-compose-CeleryExecutor.yml")
        .is_file());
    let text = fs::read_to_string(app_home.join("config/aiscalator.conf")).unwrap();
    assert!(text.contains("app_config_home_directory"));
}
