//! The configuration object built once per command: application config plus
//! the focused step and dag of a project configuration file.

use chrono::Utc;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::AiscalatorError;
use crate::hocon;
use crate::loader::{self, AppConfig, SourceKind};
use crate::selector::{self, Candidate, DAG_MARKER, DAG_ROOT, STEP_MARKER, STEP_ROOT};
use crate::tree::{ConfigTree, Value};
use crate::validate::{validate, Violation};

pub const STEP_TEMPLATE: &str = include_str!("../config/template/step.conf");
pub const MINIMUM_STEP_TEMPLATE: &str = include_str!("../config/template/minimum_step.conf");
pub const DAG_TEMPLATE: &str = include_str!("../config/template/dag.conf");
pub const MINIMUM_DAG_TEMPLATE: &str = include_str!("../config/template/minimum_dag.conf");

const TEMPLATE_NAME: &str = "Untitled";
pub const NOTEBOOK_RUN_DIR: &str = "/home/jovyan/work/notebook_run/";

/// Which focused object a command works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Step,
    Dag,
}

impl JobKind {
    pub fn marker(self) -> &'static str {
        match self {
            Self::Step => STEP_MARKER,
            Self::Dag => DAG_MARKER,
        }
    }
}

#[derive(Debug)]
struct ConfigSource {
    path: PathBuf,
    root_dir: PathBuf,
    // Inline and remote sources are written out so they can be mounted.
    _materialized: Option<NamedTempFile>,
}

#[derive(Debug)]
pub struct ProjectConfig {
    app: AppConfig,
    source: Option<ConfigSource>,
    step: Option<Candidate>,
    dag: Option<Candidate>,
}

impl ProjectConfig {
    /// Application-only configuration, for commands without a project file.
    pub fn app_only(app: AppConfig) -> Self {
        Self {
            app,
            source: None,
            step: None,
            dag: None,
        }
    }

    pub fn new(
        app: AppConfig,
        source: &str,
        step_selection: Option<&str>,
        dag_selection: Option<&str>,
    ) -> Result<Self, AiscalatorError> {
        let loaded = loader::parse_source(source)?;
        let step = selector::select(&loaded.tree, STEP_ROOT, STEP_MARKER, step_selection)?;
        let dag = selector::select(&loaded.tree, DAG_ROOT, DAG_MARKER, dag_selection)?;
        let source = match loaded.kind {
            SourceKind::File(path) => {
                let path = fs::canonicalize(&path)?;
                let root_dir = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/"));
                ConfigSource {
                    path,
                    root_dir,
                    _materialized: None,
                }
            }
            SourceKind::Url(_) | SourceKind::Inline => materialize(&loaded.tree)?,
        };
        debug!(
            "Loaded {} (step: {:?}, dag: {:?})",
            source.path.display(),
            step.as_ref().map(|c| c.name.as_str()),
            dag.as_ref().map(|c| c.name.as_str())
        );
        Ok(Self {
            app,
            source: Some(source),
            step,
            dag,
        })
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.source.as_ref().map(|source| source.path.as_path())
    }

    pub fn root_dir(&self) -> Option<&Path> {
        self.source.as_ref().map(|source| source.root_dir.as_path())
    }

    /// Absolute paths pass through; relative ones resolve against the
    /// directory of the configuration file.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            return normalize(path);
        }
        let base = match self.root_dir() {
            Some(root) => root.to_path_buf(),
            None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        normalize(&base.join(path))
    }

    pub fn user_id(&self) -> &str {
        self.app.user_id()
    }

    pub fn step_name(&self) -> Option<&str> {
        self.step.as_ref().map(|c| c.name.as_str())
    }

    pub fn step_field(&self, field: &str) -> Option<&Value> {
        self.step.as_ref().and_then(|c| c.tree.get_path(field))
    }

    pub fn has_step_field(&self, field: &str) -> bool {
        self.step_field(field).is_some()
    }

    pub fn step_str(&self, field: &str) -> Option<&str> {
        self.step_field(field).and_then(Value::as_str)
    }

    pub fn step_file_path(&self, field: &str) -> Option<PathBuf> {
        self.step_str(field).map(|value| self.resolve_path(value))
    }

    /// `<task.type>_<step name>` with dots replaced, e.g. `jupyter_steps_demo`.
    /// The name is the qualified one, root included, so `docker ps` shows
    /// `jupyter_steps_demo` rather than `jupyter_demo`.
    pub fn step_container_name(&self) -> Option<String> {
        let name = self.step_name()?;
        let kind = self.step_str("task.type").unwrap_or("step");
        Some(format!("{kind}_{}", name.replace('.', "_")))
    }

    /// `-p key value` for every entry of `task.parameters`.
    pub fn step_extract_parameters(&self) -> Vec<String> {
        let mut result = Vec::new();
        let Some(params) = self.step_field("task.parameters").and_then(Value::as_list) else {
            return result;
        };
        for param in params {
            if let Value::Tree(param) = param {
                for (key, value) in param.iter() {
                    result.push("-p".to_string());
                    result.push(key.to_string());
                    result.push(value.to_plain_string());
                }
            }
        }
        result
    }

    /// Path inside the container where papermill writes the executed notebook.
    pub fn step_notebook_output_path(&self, notebook: &str) -> String {
        let base = Path::new(notebook)
            .file_name()
            .map(|name| name.to_string_lossy().replace(".ipynb", ""))
            .unwrap_or_default();
        format!(
            "{NOTEBOOK_RUN_DIR}{base}_{}{}.ipynb",
            timestamp_now(),
            self.user_id()
        )
    }

    pub fn dag_name(&self) -> Option<&str> {
        self.dag.as_ref().map(|c| c.name.as_str())
    }

    pub fn dag_field(&self, field: &str) -> Option<&Value> {
        self.dag.as_ref().and_then(|c| c.tree.get_path(field))
    }

    pub fn has_dag_field(&self, field: &str) -> bool {
        self.dag_field(field).is_some()
    }

    pub fn dag_str(&self, field: &str) -> Option<&str> {
        self.dag_field(field).and_then(Value::as_str)
    }

    pub fn dag_file_path(&self, field: &str) -> Option<PathBuf> {
        self.dag_str(field).map(|value| self.resolve_path(value))
    }

    /// `airflow_<dag name>` with dots replaced, e.g. `airflow_dags_nightly`.
    pub fn dag_container_name(&self) -> Option<String> {
        self.dag_name()
            .map(|name| format!("airflow_{}", name.replace('.', "_")))
    }

    pub fn job_field(&self, kind: JobKind, field: &str) -> Option<&Value> {
        match kind {
            JobKind::Step => self.step_field(field),
            JobKind::Dag => self.dag_field(field),
        }
    }

    pub fn job_str(&self, kind: JobKind, field: &str) -> Option<&str> {
        self.job_field(kind, field).and_then(Value::as_str)
    }

    pub fn job_file_path(&self, kind: JobKind, field: &str) -> Option<PathBuf> {
        self.job_str(kind, field).map(|value| self.resolve_path(value))
    }

    pub fn job_container_name(&self, kind: JobKind) -> Option<String> {
        match kind {
            JobKind::Step => self.step_container_name(),
            JobKind::Dag => self.dag_container_name(),
        }
    }

    /// Env files for a container: inline `KEY = value` entries and named
    /// env files of `env` are concatenated into one temporary file, followed
    /// by the global `config/.env` of the application home.
    pub fn user_env_files(&self, env: Option<&Value>) -> Result<Vec<PathBuf>, AiscalatorError> {
        let mut result = Vec::new();
        if let Some(env) = env {
            let entries: Vec<&Value> = match env {
                Value::List(items) => items.iter().collect(),
                other => vec![other],
            };
            let mut file = tempfile::Builder::new().prefix("aiscalator_").tempfile()?;
            for entry in entries {
                match entry {
                    Value::Tree(vars) => {
                        for (key, value) in vars.iter() {
                            writeln!(file, "{key}={}", value.to_plain_string())?;
                        }
                    }
                    Value::String(name) if self.resolve_path(name).is_file() => {
                        let content = fs::read_to_string(self.resolve_path(name))?;
                        file.write_all(content.as_bytes())?;
                        if !content.is_empty() && !content.ends_with('\n') {
                            writeln!(file)?;
                        }
                    }
                    other => warn!(
                        "Undefined env {}: expecting a dict of environment variables or path to environment configuration file.",
                        other.to_plain_string()
                    ),
                }
            }
            let (_, path) = file.keep().map_err(|err| err.error)?;
            result.push(path);
        }
        result.push(self.app.app_config_home().join("config").join(".env"));
        Ok(result)
    }

    /// Checks the application config and the focused step and dag against the
    /// packaged templates. Minimum templates are enforced; the full ones only
    /// produce the returned advisories.
    pub fn validate_config(&self) -> Result<Vec<Violation>, AiscalatorError> {
        let mut advisories = Vec::new();
        let label = "In Global Application Configuration file ";
        let minimum = hocon::parse_str(loader::MINIMUM_APP_CONFIG_TEMPLATE, "minimum_aiscalator.conf")?;
        advisories.extend(validate(self.app.tree(), &minimum, label, true, true)?);
        let full = hocon::parse_str(loader::APP_CONFIG_TEMPLATE, "aiscalator.conf")?;
        advisories.extend(validate(self.app.tree(), &full, label, false, true)?);

        if let Some(step) = &self.step {
            let label = format!("in step named {}", step.name);
            let minimum = template_entry(MINIMUM_STEP_TEMPLATE, "minimum_step.conf", STEP_ROOT)?;
            advisories.extend(validate(&step.tree, &minimum, &label, true, true)?);
            let full = template_entry(STEP_TEMPLATE, "step.conf", STEP_ROOT)?;
            advisories.extend(validate(&step.tree, &full, &label, false, true)?);
        }
        if let Some(dag) = &self.dag {
            let label = format!("in dag named {}", dag.name);
            let minimum = template_entry(MINIMUM_DAG_TEMPLATE, "minimum_dag.conf", DAG_ROOT)?;
            advisories.extend(validate(&dag.tree, &minimum, &label, true, true)?);
            let full = template_entry(DAG_TEMPLATE, "dag.conf", DAG_ROOT)?;
            advisories.extend(validate(&dag.tree, &full, &label, false, true)?);
        }
        Ok(advisories)
    }
}

fn template_entry(text: &str, name: &str, root: &str) -> Result<ConfigTree, AiscalatorError> {
    let template = hocon::parse_str(text, name)?;
    template
        .get_tree(&format!("{root}.{TEMPLATE_NAME}"))
        .cloned()
        .ok_or_else(|| AiscalatorError::Config(format!("{name} has no {root}.{TEMPLATE_NAME} entry")))
}

fn materialize(tree: &ConfigTree) -> Result<ConfigSource, AiscalatorError> {
    let mut file = tempfile::Builder::new()
        .prefix("aiscalator_")
        .suffix(".conf")
        .tempfile()?;
    file.write_all(tree.to_hocon().as_bytes())?;
    file.flush()?;
    Ok(ConfigSource {
        path: file.path().to_path_buf(),
        root_dir: env::current_dir()?,
        _materialized: Some(file),
    })
}

fn timestamp_now() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Lexically removes `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The `.ipynb` and `.py` twins of a code path.
pub fn notebook_file(code_path: &Path) -> (PathBuf, PathBuf) {
    let stem = match code_path.file_stem() {
        Some(stem) => code_path.with_file_name(stem),
        None => code_path.to_path_buf(),
    };
    let mut notebook = stem.clone().into_os_string();
    notebook.push(".ipynb");
    let mut script = stem.into_os_string();
    script.push(".py");
    (PathBuf::from(notebook), PathBuf::from(script))
}
