//! `aiscalator airflow ...`: the local Airflow deployment driven through
//! docker-compose, plus dag authoring in Jupyter Lab.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::docker_image;
use crate::error::AiscalatorError;
use crate::jupyter::{self, ConfigFormat, NOTEBOOK_TEMPLATE};
use crate::loader::AppConfig;
use crate::project::{normalize, JobKind, ProjectConfig, DAG_TEMPLATE};
use crate::runner::{execute_passthrough, LabSession, ProcessRunner, WaitPolicy};

pub const COMPOSE_FILE_NAME: &str = "docker-compose-CeleryExecutor.yml";
const COMPOSE_TEMPLATE: &str = include_str!("../config/docker-compose-CeleryExecutor.yml");
pub const DEFAULT_SERVICE: &str = "webserver";

/// Folder of the config home that the compose file mounts as the dags folder.
pub fn dags_dir(app: &AppConfig) -> PathBuf {
    app.app_config_home().join("workspace").join("dags")
}

/// The compose file named by `airflow.docker_compose_file`, or the packaged
/// one installed under the config home.
pub fn compose_file(app: &AppConfig) -> Result<PathBuf, AiscalatorError> {
    if let Some(file) = app.docker_compose_file() {
        return Ok(file);
    }
    install_compose_file(&app.app_config_home())
}

fn install_compose_file(config_home: &Path) -> Result<PathBuf, AiscalatorError> {
    let config_dir = config_home.join("config");
    let file = config_dir.join(COMPOSE_FILE_NAME);
    if !file.exists() {
        fs::create_dir_all(&config_dir)?;
        fs::write(&file, COMPOSE_TEMPLATE)?;
        debug!("Installed {}", file.display());
    }
    Ok(file)
}

fn absolute(path: &Path) -> Result<PathBuf, AiscalatorError> {
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    Ok(normalize(&env::current_dir()?.join(path)))
}

/// Points the application config at `config_home` and `workspaces`, then
/// creates the folders the compose file mounts. With `append` the
/// workspaces are added to the ones already configured.
pub fn setup(
    app: &AppConfig,
    config_home: &Path,
    workspaces: &[String],
    append: bool,
) -> Result<AppConfig, AiscalatorError> {
    let config_home = absolute(config_home)?;
    let mut paths = if append { app.workspace_paths() } else { Vec::new() };
    for workspace in workspaces {
        let workspace = absolute(Path::new(workspace))?;
        fs::create_dir_all(&workspace)?;
        let workspace = workspace.display().to_string();
        if !paths.contains(&workspace) {
            paths.push(workspace);
        }
    }
    let app = app
        .redefine_config_home(&config_home)?
        .redefine_workspace_paths(&paths)?;
    ProjectConfig::app_only(app.clone()).validate_config()?;

    fs::create_dir_all(dags_dir(&app))?;
    install_compose_file(&config_home)?;
    info!(
        "Airflow config home is {} with {} workspace(s)",
        config_home.display(),
        paths.len()
    );
    Ok(app)
}

/// Concatenates every env file of the application into the `.env` read by
/// docker-compose next to `compose_file`.
fn write_compose_env(project: &ProjectConfig, compose_file: &Path) -> Result<(), AiscalatorError> {
    let Some(dir) = compose_file.parent() else {
        return Ok(());
    };
    let mut content = String::new();
    for env_file in project.user_env_files(None)? {
        if env_file.is_file() {
            content.push_str(&fs::read_to_string(&env_file)?);
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
        }
    }
    fs::write(dir.join(".env"), content)?;
    Ok(())
}

/// `docker-compose -f <compose file> <args>` attached to the terminal.
pub fn docker_compose<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
    args: &[String],
) -> Result<(), AiscalatorError> {
    project.validate_config()?;
    let file = compose_file(project.app())?;
    write_compose_env(project, &file)?;
    let mut commands = vec![
        "docker-compose".to_string(),
        "-f".to_string(),
        file.display().to_string(),
    ];
    commands.extend(args.iter().cloned());
    execute_passthrough(runner, &commands, None)
}

pub fn start<R: ProcessRunner + ?Sized>(project: &ProjectConfig, runner: &R) -> Result<(), AiscalatorError> {
    docker_compose(project, runner, &["up".to_string(), "-d".to_string()])
}

pub fn stop<R: ProcessRunner + ?Sized>(project: &ProjectConfig, runner: &R) -> Result<(), AiscalatorError> {
    docker_compose(project, runner, &["down".to_string()])
}

/// `docker-compose run --rm <service> <subcommand>`.
pub fn run<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
    service: &str,
    subcommand: &[String],
) -> Result<(), AiscalatorError> {
    let mut args = vec!["run".to_string(), "--rm".to_string(), service.to_string()];
    args.extend(subcommand.iter().cloned());
    docker_compose(project, runner, &args)
}

/// Starts Jupyter Lab on the focused dag's notebook.
pub fn edit<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
    open_browser: bool,
    policy: WaitPolicy,
) -> Result<LabSession, AiscalatorError> {
    project.validate_config()?;
    let image = docker_image::build(project, JobKind::Dag, runner)?
        .ok_or_else(|| AiscalatorError::Process("Failed to build docker image".to_string()))?;
    let notebook = jupyter::check_notebook_dir(runner, project, JobKind::Dag)?;
    jupyter::start_lab(project, JobKind::Dag, runner, &image, &notebook, open_browser, policy)
}

/// Copies the focused dag's code file into the dags folder and returns the
/// copy.
pub fn push(project: &ProjectConfig) -> Result<PathBuf, AiscalatorError> {
    project.validate_config()?;
    if !project.has_dag_field("definition.code_path") {
        return Err(AiscalatorError::Config("definition.code_path is not defined".to_string()));
    }
    let code_path = project
        .dag_file_path("definition.code_path")
        .ok_or_else(|| AiscalatorError::Config("definition.code_path is not a string".to_string()))?;
    if !code_path.is_file() {
        return Err(AiscalatorError::Config(format!(
            "{} does not exist",
            code_path.display()
        )));
    }
    let target_dir = dags_dir(project.app());
    fs::create_dir_all(&target_dir)?;
    let file_name = code_path
        .file_name()
        .ok_or_else(|| AiscalatorError::Config(format!("{} is not a file", code_path.display())))?;
    let target = target_dir.join(file_name);
    fs::copy(&code_path, &target)?;
    info!("Pushed {} to {}", code_path.display(), target.display());
    Ok(target)
}

/// Scaffolds `<path>/<name>/` with a dag configuration and its notebook.
pub fn new(path: &Path, name: &str, format: ConfigFormat) -> Result<PathBuf, AiscalatorError> {
    let dir = path.join(name);
    let file = jupyter::write_config(&dir, name, DAG_TEMPLATE, format)?;
    let notebook = dir.join("dags").join(format!("{name}.ipynb"));
    if !notebook.exists() {
        fs::create_dir_all(dir.join("dags"))?;
        fs::write(&notebook, NOTEBOOK_TEMPLATE)?;
    }
    info!("Created dag configuration {}", file.display());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::{CallKind, MockRunner};
    use crate::tree::{ConfigTree, Value};
    use tempfile::tempdir;

    fn app(home: &Path) -> AppConfig {
        let mut tree = ConfigTree::new();
        tree.set_path("aiscalator.metadata.user.id", Value::from("u42"));
        AppConfig::from_tree(tree, home.join("config").join("aiscalator.conf"))
    }

    #[test]
    fn start_runs_compose_with_merged_env() {
        let dir = tempdir().expect("tempdir");
        let home = dir.path().join("home");
        fs::create_dir_all(home.join("config")).expect("mkdir");
        fs::write(home.join("config/.env"), "AIRFLOW_UID=50000").expect("env");
        let project = ProjectConfig::app_only(app(&home));
        let runner = MockRunner::default();
        start(&project, &runner).expect("start");

        let compose = home.join("config").join(COMPOSE_FILE_NAME);
        assert!(compose.is_file());
        assert_eq!(
            fs::read_to_string(home.join("config/.env")).expect("env"),
            "AIRFLOW_UID=50000\n"
        );
        let calls = runner.calls.borrow();
        assert_eq!(calls[0].kind, CallKind::Passthrough);
        assert_eq!(
            calls[0].argv,
            vec![
                "docker-compose".to_string(),
                "-f".to_string(),
                compose.display().to_string(),
                "up".to_string(),
                "-d".to_string()
            ]
        );
    }

    #[test]
    fn run_targets_a_service() {
        let dir = tempdir().expect("tempdir");
        let project = ProjectConfig::app_only(app(dir.path()));
        let runner = MockRunner::default();
        run(&project, &runner, DEFAULT_SERVICE, &["airflow".to_string(), "list_dags".to_string()])
            .expect("run");
        let argv = &runner.argvs()[0];
        assert_eq!(&argv[3..], &["run", "--rm", "webserver", "airflow", "list_dags"]);
    }

    #[test]
    fn setup_rewrites_app_config_and_creates_folders() {
        let dir = tempdir().expect("tempdir");
        let home = dir.path().join("home");
        fs::create_dir_all(home.join("config")).expect("mkdir");
        let original = app(&home);
        let first = dir.path().join("ws1").display().to_string();
        let second = dir.path().join("ws2").display().to_string();

        let updated = setup(&original, &dir.path().join("airflow"), &[first.clone()], false).expect("setup");
        let updated = setup(&updated, &dir.path().join("airflow"), &[second.clone()], true).expect("append");

        assert_eq!(updated.workspace_paths(), vec![first, second]);
        assert_eq!(updated.app_config_home(), dir.path().join("airflow"));
        assert!(dir.path().join("airflow/workspace/dags").is_dir());
        assert!(dir.path().join("airflow/config").join(COMPOSE_FILE_NAME).is_file());
        assert!(dir.path().join("ws2").is_dir());

        let reloaded = AppConfig::load(&home.join("config/aiscalator.conf")).expect("reload");
        assert_eq!(reloaded.workspace_paths().len(), 2);
    }

    #[test]
    fn push_copies_the_dag_code() {
        let dir = tempdir().expect("tempdir");
        let file = new(dir.path(), "daily", ConfigFormat::Hocon).expect("new");
        let project = ProjectConfig::new(
            app(&dir.path().join("home")),
            file.to_str().unwrap(),
            None,
            None,
        )
        .expect("project");
        assert_eq!(project.dag_container_name().as_deref(), Some("airflow_dags_daily"));
        let pushed = push(&project).expect("push");
        assert_eq!(pushed, dir.path().join("home/workspace/dags/daily.ipynb"));
        assert!(pushed.is_file());
    }
}
