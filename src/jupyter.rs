//! `aiscalator jupyter ...`: notebook steps run with papermill or edited in
//! Jupyter Lab inside the step image.

use clap::ValueEnum;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::docker_args::{RuntimeArgsBuilder, NOTEBOOK_DIR};
use crate::docker_image::{self, DEFAULT_DOCKER_SRC};
use crate::error::AiscalatorError;
use crate::hocon;
use crate::loader::{copy_replace, touch};
use crate::project::{notebook_file, JobKind, ProjectConfig, STEP_TEMPLATE};
use crate::runner::{
    execute, wait_for_jupyter_lab, LabSession, LogRegexAnalyzer, ProcessRunner, WaitPolicy,
};

pub const NOTEBOOK_TEMPLATE: &str = include_str!("../config/template/notebook.json");
pub const DEFAULT_IMAGE_NAME: &str = "aiscalator/jupyter-spark";
const DEFAULT_LAB_PORT: u16 = 10000;
const LAB_CONTAINER_PORT: &str = "8888";
const CUSTOMIZATION_FILES: [&str; 4] = [
    "apt_repository.txt",
    "apt_packages.txt",
    "requirements.txt",
    "lab_extensions.txt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Hocon,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Hocon => "conf",
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

/// Papermill parameters given on the command line.
#[derive(Debug, Clone, Default)]
pub struct NotebookParams {
    /// `-p KEY VALUE`, values parsed by papermill.
    pub parameters: Vec<(String, String)>,
    /// `-r KEY VALUE`, values passed as raw strings.
    pub raw: Vec<(String, String)>,
}

impl NotebookParams {
    fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.raw.is_empty()
    }

    fn append_to(&self, commands: &mut Vec<String>) {
        for (flag, pairs) in [("-p", &self.parameters), ("-r", &self.raw)] {
            for (key, value) in pairs {
                commands.push(flag.to_string());
                commands.push(key.clone());
                commands.push(value.clone());
            }
        }
    }
}

/// Creates `notebook` from the packaged empty notebook when it is missing,
/// converting its `.py` twin with jupytext when one exists.
pub fn check_notebook<R: ProcessRunner + ?Sized>(runner: &R, notebook: &Path) -> Result<(), AiscalatorError> {
    if notebook.exists() {
        return Ok(());
    }
    if let Some(parent) = notebook.parent() {
        fs::create_dir_all(parent)?;
    }
    let (_, script) = notebook_file(notebook);
    if script.is_file() {
        let commands = vec![
            "jupytext".to_string(),
            "--from".to_string(),
            "py:percent".to_string(),
            "--to".to_string(),
            "ipynb".to_string(),
            script.display().to_string(),
            "-o".to_string(),
            notebook.display().to_string(),
        ];
        match execute(runner, &commands, None, &LogRegexAnalyzer::passthrough()) {
            Ok(()) => {
                // Keep the script newer so the pair stays in sync.
                fs::OpenOptions::new()
                    .append(true)
                    .open(&script)?
                    .set_modified(SystemTime::now())?;
                return Ok(());
            }
            Err(err) => warn!("Unable to convert {}: {err}", script.display()),
        }
    }
    debug!("Creating empty notebook {}", notebook.display());
    fs::write(notebook, NOTEBOOK_TEMPLATE)?;
    Ok(())
}

/// Ensures the focused notebook exists along with notebooks for every
/// script or notebook sitting next to it.
pub fn check_notebook_dir<R: ProcessRunner + ?Sized>(
    runner: &R,
    project: &ProjectConfig,
    kind: JobKind,
) -> Result<PathBuf, AiscalatorError> {
    let field = format!("{}.code_path", kind.marker());
    let code_path = project
        .job_file_path(kind, &field)
        .ok_or_else(|| AiscalatorError::Config(format!("{field} is not defined")))?;
    let (notebook, _) = notebook_file(&code_path);
    check_notebook(runner, &notebook)?;
    if let Some(dir) = notebook.parent() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let sibling = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("py") | Some("ipynb")
            );
            if sibling && path != code_path {
                check_notebook(runner, &notebook_file(&path).0)?;
            }
        }
    }
    Ok(notebook)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn build_image<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    kind: JobKind,
    runner: &R,
) -> Result<String, AiscalatorError> {
    docker_image::build(project, kind, runner)?
        .ok_or_else(|| AiscalatorError::Process("Failed to build docker image".to_string()))
}

/// Host port published for the container's Jupyter port.
pub fn lab_port(project: &ProjectConfig) -> u16 {
    project
        .app()
        .ports()
        .iter()
        .filter_map(|mapping| mapping.rsplit_once(':'))
        .find(|(_, container)| *container == LAB_CONTAINER_PORT)
        .and_then(|(host, _)| host.rsplit(':').next())
        .and_then(|host| host.parse().ok())
        .unwrap_or(DEFAULT_LAB_PORT)
}

fn run_papermill<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
    image: &str,
    notebook: &Path,
    prepare_only: bool,
    params: &NotebookParams,
) -> Result<String, AiscalatorError> {
    let container_notebook = format!("{NOTEBOOK_DIR}{}", file_name(notebook));
    let output = project.step_notebook_output_path(&container_notebook);
    let program = [
        image.to_string(),
        "bash".to_string(),
        "start-papermill.sh".to_string(),
        "papermill".to_string(),
        container_notebook,
        output.clone(),
    ];
    let builder = RuntimeArgsBuilder::new(project, JobKind::Step);
    let reason = if prepare_only { "prepare" } else { "run" };
    let mut commands = builder.build(&program, reason)?;
    if prepare_only {
        commands.push("--prepare-only".to_string());
    }
    commands.extend(project.step_extract_parameters());
    params.append_to(&mut commands);
    execute(runner, &commands, None, &LogRegexAnalyzer::passthrough())?;
    Ok(output)
}

/// Executes the focused step's notebook with papermill and returns the host
/// path of the executed copy.
pub fn run<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
    params: &NotebookParams,
    prepare_only: bool,
) -> Result<PathBuf, AiscalatorError> {
    project.validate_config()?;
    let image = build_image(project, JobKind::Step, runner)?;
    let notebook = check_notebook_dir(runner, project, JobKind::Step)?;
    let output = run_papermill(project, runner, &image, &notebook, prepare_only, params)?;
    let output_name = file_name(Path::new(&output));
    let result = match project.step_file_path("task.execution_dir_path") {
        Some(dir) => dir.join(output_name),
        None => PathBuf::from(output),
    };
    info!("Executed notebook written to {}", result.display());
    Ok(result)
}

/// Starts Jupyter Lab on the focused step's notebook.
pub fn edit<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
    params: &NotebookParams,
    open_browser: bool,
    policy: WaitPolicy,
) -> Result<LabSession, AiscalatorError> {
    project.validate_config()?;
    let image = build_image(project, JobKind::Step, runner)?;
    let notebook = check_notebook_dir(runner, project, JobKind::Step)?;
    if project.has_step_field("task.parameters") || !params.is_empty() {
        run_papermill(project, runner, &image, &notebook, true, params)?;
    }
    start_lab(project, JobKind::Step, runner, &image, &notebook, open_browser, policy)
}

pub(crate) fn start_lab<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    kind: JobKind,
    runner: &R,
    image: &str,
    notebook: &Path,
    open_browser: bool,
    policy: WaitPolicy,
) -> Result<LabSession, AiscalatorError> {
    let program = [
        image.to_string(),
        "start.sh".to_string(),
        "jupyter".to_string(),
        "lab".to_string(),
    ];
    let commands = RuntimeArgsBuilder::new(project, kind).build(&program, "edit")?;
    wait_for_jupyter_lab(
        runner,
        &commands,
        &file_name(notebook),
        lab_port(project),
        "work/notebook",
        open_browser,
        policy,
    )
}

/// Validates the application configuration and builds the default image.
pub fn setup<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    runner: &R,
) -> Result<Option<String>, AiscalatorError> {
    project.validate_config()?;
    info!("Building the {DEFAULT_DOCKER_SRC} image");
    docker_image::build_named(project, JobKind::Step, runner, Some(DEFAULT_IMAGE_NAME), None)
}

/// The configuration file `new` would write, when it already exists.
pub fn existing_config(path: &Path, name: &str) -> Option<PathBuf> {
    [ConfigFormat::Hocon, ConfigFormat::Json, ConfigFormat::Yaml]
        .into_iter()
        .map(|format| path.join(name).join(format!("{name}.{}", format.extension())))
        .find(|file| file.is_file())
}

/// Writes `template` with every `Untitled` replaced by `name` in the chosen
/// format and returns the written file.
pub fn write_config(
    dir: &Path,
    name: &str,
    template: &str,
    format: ConfigFormat,
) -> Result<PathBuf, AiscalatorError> {
    fs::create_dir_all(dir)?;
    let text = copy_replace(template, &[("Untitled", name.to_string())])?;
    let content = match format {
        ConfigFormat::Hocon => text,
        ConfigFormat::Json => {
            let tree = hocon::parse_str(&text, name)?;
            let mut json = serde_json::to_string_pretty(&tree.to_json())?;
            json.push('\n');
            json
        }
        ConfigFormat::Yaml => serde_yaml::to_string(&hocon::parse_str(&text, name)?.to_json())?,
    };
    let file = dir.join(format!("{name}.{}", format.extension()));
    fs::write(&file, content)?;
    Ok(file)
}

/// Scaffolds `<path>/<name>/`: the step configuration, an empty notebook
/// and empty image customization lists.
pub fn new(path: &Path, name: &str, format: ConfigFormat) -> Result<PathBuf, AiscalatorError> {
    let dir = path.join(name);
    let file = write_config(&dir, name, STEP_TEMPLATE, format)?;
    let notebook = dir.join("notebook").join(format!("{name}.ipynb"));
    if !notebook.exists() {
        fs::create_dir_all(dir.join("notebook"))?;
        fs::write(&notebook, NOTEBOOK_TEMPLATE)?;
    }
    for list in CUSTOMIZATION_FILES {
        touch(&dir.join(list))?;
    }
    info!("Created step configuration {}", file.display());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::AppConfig;
    use crate::runner::mock::{CallKind, MockRunner, Scripted};
    use crate::tree::{ConfigTree, Value};
    use std::time::Duration;
    use tempfile::tempdir;

    fn app(home: &Path) -> AppConfig {
        let mut tree = ConfigTree::new();
        tree.set_path("aiscalator.metadata.user.id", Value::from("u42"));
        AppConfig::from_tree(tree, home.join("config").join("aiscalator.conf"))
    }

    fn project(dir: &Path, text: &str) -> ProjectConfig {
        let conf = dir.join("step.conf");
        fs::write(&conf, text).expect("write");
        ProjectConfig::new(app(&dir.join("home")), conf.to_str().unwrap(), None, None).expect("project")
    }

    fn built() -> Scripted {
        Scripted {
            lines: vec!["Successfully built cafe01".to_string()],
            status: 0,
        }
    }

    const STEP: &str = "steps.demo.task {\n  type = jupyter\n  code_path = notebook/demo.ipynb\n  execution_dir_path = notebook_run\n  parameters = [{ alpha = 1 }]\n}\n";

    #[test]
    fn run_executes_papermill_in_the_built_image() {
        let dir = tempdir().expect("tempdir");
        let project = project(dir.path(), STEP);
        let runner = MockRunner::with_script(vec![built()]);
        let params = NotebookParams {
            parameters: vec![("beta".to_string(), "2".to_string())],
            raw: vec![("gamma".to_string(), "x y".to_string())],
        };
        let output = run(&project, &runner, &params, false).expect("run");

        let calls = runner.argvs();
        assert_eq!(calls.len(), 2);
        let papermill = &calls[1];
        assert_eq!(papermill[3], "jupyter_steps_demo_run");
        let program = papermill.iter().position(|arg| arg == "cafe01").expect("image");
        assert_eq!(
            &papermill[program..program + 5],
            &["cafe01", "bash", "start-papermill.sh", "papermill", "/home/jovyan/work/notebook/demo.ipynb"]
        );
        assert!(papermill[program + 5].starts_with("/home/jovyan/work/notebook_run/demo_"));
        assert_eq!(
            &papermill[program + 6..],
            &["-p", "alpha", "1", "-p", "beta", "2", "-r", "gamma", "x y"]
        );
        assert!(output.starts_with(fs::canonicalize(dir.path()).unwrap().join("notebook_run")));
        assert!(dir.path().join("notebook/demo.ipynb").is_file());
    }

    #[test]
    fn run_fails_without_built_image() {
        let dir = tempdir().expect("tempdir");
        let project = project(dir.path(), STEP);
        let runner = MockRunner::default();
        let err = run(&project, &runner, &NotebookParams::default(), false).unwrap_err();
        assert!(err.to_string().ends_with("Failed to build docker image"));
    }

    #[test]
    fn edit_prepares_parameters_then_starts_lab() {
        let dir = tempdir().expect("tempdir");
        let project = project(dir.path(), STEP);
        let runner = MockRunner::with_script(vec![
            built(),
            Scripted::default(),
            Scripted {
                lines: vec!["http://(host or 127.0.0.1):8888/?token=abc".to_string()],
                status: 0,
            },
        ]);
        let policy = WaitPolicy {
            attempts: 1,
            interval: Duration::from_millis(1),
        };
        let session = edit(&project, &runner, &NotebookParams::default(), false, policy).expect("edit");
        assert_eq!(
            session.url.as_deref(),
            Some("http://localhost:10000/lab/tree/work/notebook/demo.ipynb?token=abc")
        );
        let calls = runner.calls.borrow();
        assert!(calls[1].argv.contains(&"--prepare-only".to_string()));
        assert_eq!(calls[2].kind, CallKind::Spawn);
        assert_eq!(calls[2].argv[3], "jupyter_steps_demo_edit");
        assert!(calls[2].argv.ends_with(&[
            "cafe01".to_string(),
            "start.sh".to_string(),
            "jupyter".to_string(),
            "lab".to_string()
        ]));
    }

    #[test]
    fn lab_port_follows_published_mapping() {
        let dir = tempdir().expect("tempdir");
        let conf = dir.path().join("step.conf");
        fs::write(&conf, STEP).expect("write");
        let mut tree = ConfigTree::new();
        tree.set_path(
            "aiscalator.jupyter.ports",
            Value::List(vec![Value::from("4040:4040"), Value::from("127.0.0.1:9999:8888")]),
        );
        let app = AppConfig::from_tree(tree, dir.path().join("aiscalator.conf"));
        let project = ProjectConfig::new(app, conf.to_str().unwrap(), None, None).expect("project");
        assert_eq!(lab_port(&project), 9999);
    }

    #[test]
    fn new_scaffolds_a_step_directory() {
        let dir = tempdir().expect("tempdir");
        let file = new(dir.path(), "demo", ConfigFormat::Hocon).expect("new");
        assert_eq!(file, dir.path().join("demo/demo.conf"));
        let text = fs::read_to_string(&file).expect("read");
        assert!(text.contains("demo {"));
        assert!(text.contains("notebook/demo.ipynb"));
        assert!(dir.path().join("demo/notebook/demo.ipynb").is_file());
        assert!(dir.path().join("demo/requirements.txt").is_file());
        assert_eq!(existing_config(dir.path(), "demo"), Some(file));
        assert_eq!(existing_config(dir.path(), "other"), None);
    }

    #[test]
    fn new_writes_json_and_yaml() {
        let dir = tempdir().expect("tempdir");
        let json = new(dir.path(), "j", ConfigFormat::Json).expect("json");
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json).expect("read")).expect("valid json");
        assert_eq!(parsed["steps"]["j"]["task"]["type"], "jupyter");

        let yaml = new(dir.path(), "y", ConfigFormat::Yaml).expect("yaml");
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(yaml).expect("read")).expect("valid yaml");
        assert_eq!(parsed["steps"]["y"]["task"]["code_path"].as_str(), Some("notebook/y.ipynb"));
    }

    #[test]
    fn scaffolded_configs_load_back_in_every_format() {
        let dir = tempdir().expect("tempdir");
        for (name, format) in [
            ("h", ConfigFormat::Hocon),
            ("j", ConfigFormat::Json),
            ("y", ConfigFormat::Yaml),
        ] {
            let file = new(dir.path(), name, format).expect("new");
            let project =
                ProjectConfig::new(app(&dir.path().join("home")), file.to_str().unwrap(), None, None)
                    .expect("project");
            let expected = format!("steps.{name}");
            assert_eq!(project.step_name(), Some(expected.as_str()));
            let notebook = fs::canonicalize(dir.path())
                .unwrap()
                .join(name)
                .join("notebook")
                .join(format!("{name}.ipynb"));
            assert_eq!(project.step_file_path("task.code_path"), Some(notebook));
        }
    }

    #[test]
    fn check_notebook_converts_scripts_with_jupytext() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("demo.py"), "# %%\nprint(1)\n").expect("write");
        let runner = MockRunner::default();
        check_notebook(&runner, &dir.path().join("demo.ipynb")).expect("check");
        let calls = runner.argvs();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "jupytext");
    }

    #[test]
    fn check_notebook_falls_back_to_empty_notebook() {
        let dir = tempdir().expect("tempdir");
        let notebook = dir.path().join("nested/fresh.ipynb");
        let runner = MockRunner::default();
        check_notebook(&runner, &notebook).expect("check");
        assert_eq!(fs::read_to_string(&notebook).expect("read"), NOTEBOOK_TEMPLATE);
        assert!(runner.argvs().is_empty());
    }
}
