//! Assembles `docker run` invocations for a focused step or dag.
//!
//! Token order is fixed: base invocation and ports, env files, the
//! configuration and image customization mounts, the notebook directory,
//! module and data mounts, the execution directory, then the program.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::AiscalatorError;
use crate::project::{notebook_file, JobKind, ProjectConfig};
use crate::tree::Value;

pub const WORK_DIR: &str = "/home/jovyan/work/";
pub const NOTEBOOK_DIR: &str = "/home/jovyan/work/notebook/";
const MODULES_DIR: &str = "/home/jovyan/work/modules/";
const INPUT_DIR: &str = "/home/jovyan/work/data/input/";
const OUTPUT_DIR: &str = "/home/jovyan/work/data/output/";
const EXECUTION_DIR: &str = "/home/jovyan/work/notebook_run/";

/// Image customization inputs mounted next to the configuration file.
const CUSTOMIZATION_MOUNTS: [(&str, &str); 4] = [
    ("docker_image.apt_repository_path", "apt_repository.txt"),
    ("docker_image.apt_package_path", "apt_packages.txt"),
    ("docker_image.requirements_path", "requirements.txt"),
    ("docker_image.lab_extension_path", "lab_extensions.txt"),
];

#[derive(Clone, Copy)]
struct MountOptions {
    readonly: bool,
    make_dirs: bool,
}

pub struct RuntimeArgsBuilder<'a> {
    project: &'a ProjectConfig,
    kind: JobKind,
}

fn bind(source: &Path, target: &str, readonly: bool) -> [String; 2] {
    let mut mount = format!("type=bind,source={},target={target}", source.display());
    if readonly {
        mount.push_str(",readonly");
    }
    ["--mount".to_string(), mount]
}

impl<'a> RuntimeArgsBuilder<'a> {
    pub fn new(project: &'a ProjectConfig, kind: JobKind) -> Self {
        Self { project, kind }
    }

    fn job_field(&self, name: &str) -> Option<&'a Value> {
        self.project
            .job_field(self.kind, &format!("{}.{name}", self.kind.marker()))
    }

    pub fn container_name(&self) -> Result<String, AiscalatorError> {
        self.project
            .job_container_name(self.kind)
            .ok_or_else(|| AiscalatorError::Config("no step or dag is selected".to_string()))
    }

    /// Host directory holding the notebook of the job's `code_path`.
    pub fn notebook_dir(&self) -> Result<PathBuf, AiscalatorError> {
        let marker = self.kind.marker();
        let code_path = self
            .project
            .job_file_path(self.kind, &format!("{marker}.code_path"))
            .ok_or_else(|| AiscalatorError::Config(format!("{marker}.code_path is not defined")))?;
        let (notebook, _) = notebook_file(&code_path);
        Ok(notebook
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(code_path))
    }

    /// The full `docker run` command line, ending with `program`.
    pub fn build(&self, program: &[String], reason: &str) -> Result<Vec<String>, AiscalatorError> {
        let mut commands = vec![
            "docker".to_string(),
            "run".to_string(),
            "--name".to_string(),
            format!("{}_{reason}", self.container_name()?),
            "--rm".to_string(),
        ];
        for port in self.project.app().ports() {
            commands.push("-p".to_string());
            commands.push(port);
        }

        for env_file in self.project.user_env_files(self.job_field("env"))? {
            if env_file.is_file() {
                commands.push("--env-file".to_string());
                commands.push(env_file.display().to_string());
            }
        }

        commands.extend(self.image_mounts()?);

        let notebook_dir = self.notebook_dir()?;
        commands.extend(bind(&notebook_dir, NOTEBOOK_DIR, false));

        commands.extend(self.task_mounts()?);

        if let Some(execution_dir) = self.job_field("execution_dir_path").and_then(Value::as_str) {
            let execution_dir = self.project.resolve_path(execution_dir);
            fs::create_dir_all(&execution_dir)?;
            commands.extend(bind(&execution_dir, EXECUTION_DIR, false));
        }

        commands.extend(program.iter().cloned());
        Ok(commands)
    }

    fn image_mounts(&self) -> Result<Vec<String>, AiscalatorError> {
        let config_path = self
            .project
            .config_path()
            .ok_or_else(|| AiscalatorError::Config("no configuration file to mount".to_string()))?;
        let basename = config_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut commands = Vec::new();
        commands.extend(bind(config_path, &format!("{WORK_DIR}{basename}"), false));
        for (field, target) in CUSTOMIZATION_MOUNTS {
            match self.project.job_file_path(self.kind, field) {
                Some(path) if path.is_file() => {
                    commands.extend(bind(&path, &format!("{WORK_DIR}{target}"), false))
                }
                Some(path) => debug!("Skipping mount of missing {}", path.display()),
                None => {}
            }
        }
        Ok(commands)
    }

    fn task_mounts(&self) -> Result<Vec<String>, AiscalatorError> {
        let mut commands = Vec::new();
        let plain = MountOptions {
            readonly: false,
            make_dirs: false,
        };
        commands.extend(self.mount_entries("modules_src_path", MODULES_DIR, plain)?);
        commands.extend(self.mount_entries(
            "input_data_path",
            INPUT_DIR,
            MountOptions {
                readonly: true,
                make_dirs: false,
            },
        )?);
        commands.extend(self.mount_entries(
            "output_data_path",
            OUTPUT_DIR,
            MountOptions {
                readonly: false,
                make_dirs: true,
            },
        )?);
        Ok(commands)
    }

    /// Each entry maps a name under `target_dir` to a host path. Missing
    /// host paths are skipped unless `make_dirs` creates them first.
    fn mount_entries(
        &self,
        field: &str,
        target_dir: &str,
        options: MountOptions,
    ) -> Result<Vec<String>, AiscalatorError> {
        let mut commands = Vec::new();
        let entries: Vec<&Value> = match self.job_field(field) {
            Some(Value::List(items)) => items.iter().collect(),
            Some(other) => vec![other],
            None => return Ok(commands),
        };
        for entry in entries {
            let Value::Tree(mapping) = entry else {
                debug!("Ignoring {field} entry that is not a mapping");
                continue;
            };
            for (name, host) in mapping.iter() {
                let source = self.project.resolve_path(&host.to_plain_string());
                if options.make_dirs {
                    fs::create_dir_all(&source)?;
                }
                if source.exists() {
                    commands.extend(bind(&source, &format!("{target_dir}{name}"), options.readonly));
                } else {
                    debug!("Skipping mount of missing {}", source.display());
                }
            }
        }
        Ok(commands)
    }
}
