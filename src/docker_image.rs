//! Builds the notebook image for a step or dag, customized with its apt,
//! pip and Jupyter Lab extension lists.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::AiscalatorError;
use crate::project::{JobKind, ProjectConfig};
use crate::runner::{execute, LogRegexAnalyzer, ProcessRunner};

pub const DEFAULT_DOCKER_SRC: &str = "jupyter-spark";
const BUILT_IMAGE_PATTERN: &str = r"(?:Successfully built |writing image sha256:)([a-zA-Z0-9]+)";

struct PackagedSource {
    name: &'static str,
    files: &'static [(&'static str, &'static str)],
}

const PACKAGED_SOURCES: &[PackagedSource] = &[PackagedSource {
    name: DEFAULT_DOCKER_SRC,
    files: &[
        (
            "Dockerfile",
            include_str!("../config/docker/jupyter-spark/Dockerfile"),
        ),
        (
            "start-papermill.sh",
            include_str!("../config/docker/jupyter-spark/start-papermill.sh"),
        ),
    ],
}];

const APT_REPOSITORY_MACRO: &str = "# apt_repository.txt #";
const APT_PACKAGES_MACRO: &str = "# apt_packages.txt #";
const REQUIREMENTS_MACRO: &str = "# requirements.txt #";
const LAB_EXTENSIONS_MACRO: &str = "# lab_extensions.txt #";

const APT_CLEANUP: &str = "    && apt-get purge --auto-remove -yqq $buildDeps \\
    && apt-get autoremove -yqq --purge \\
    && apt-get clean \\
    && rm -rf \\
    /var/lib/apt/lists/* \\
    /tmp/* \\
    /var/tmp/* \\
    /usr/share/man \\
    /usr/share/doc \\
    /usr/share/doc-base
";

const REQUIREMENTS_INSTALL: &str = "
COPY requirements.txt requirements.txt
RUN pip install -r requirements.txt
RUN rm requirements.txt";

/// Where the Dockerfile and its companion files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerSource {
    Directory(PathBuf),
    Packaged(&'static str),
}

/// A `dockerfile_src` directory containing `<name>/Dockerfile` wins over
/// the packaged sources.
pub fn find_docker_src(name: &str, dirs: &[PathBuf]) -> Result<DockerSource, AiscalatorError> {
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.join("Dockerfile").is_file() {
            return Ok(DockerSource::Directory(candidate));
        }
    }
    PACKAGED_SOURCES
        .iter()
        .find(|source| source.name == name)
        .map(|source| DockerSource::Packaged(source.name))
        .ok_or_else(|| AiscalatorError::Config(format!("no docker source named {name}")))
}

fn read_source(source: &DockerSource) -> Result<Vec<(String, String)>, AiscalatorError> {
    match source {
        DockerSource::Packaged(name) => Ok(PACKAGED_SOURCES
            .iter()
            .filter(|packaged| packaged.name == *name)
            .flat_map(|packaged| packaged.files.iter())
            .map(|(file, content)| (file.to_string(), content.to_string()))
            .collect()),
        DockerSource::Directory(dir) => {
            let mut files = Vec::new();
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    let content = fs::read_to_string(entry.path())?;
                    files.push((entry.file_name().to_string_lossy().into_owned(), content));
                }
            }
            Ok(files)
        }
    }
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\"'\"'"))
    }
}

/// Each non-empty, non-comment line quoted and wrapped in `prefix`/`suffix`.
pub fn format_file_content(path: &Path, prefix: &str, suffix: &str) -> Result<String, AiscalatorError> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| format!("{prefix}{}{suffix}", shell_quote(line)))
        .collect())
}

/// Dockerfile text with the customization macros the application allows
/// replaced by install instructions. Requirements are copied into
/// `build_dir`.
pub fn customize_dockerfile(
    project: &ProjectConfig,
    kind: JobKind,
    dockerfile: &str,
    build_dir: &Path,
) -> Result<String, AiscalatorError> {
    let app = project.app();
    let mut dockerfile = dockerfile.to_string();
    let existing = |field: &str| project.job_file_path(kind, field).filter(|path| path.is_file());

    if app.allows("apt_repository") {
        if let Some(path) = existing("docker_image.apt_repository_path") {
            let value = format_file_content(&path, " ", "\\\n")?;
            if !value.is_empty() {
                let value = format!(
                    "RUN apt-get update \\\n && apt-get install -yqq \\\n      software-properties-common \\\n && apt-add-repository \\\n{value} && apt-get update"
                );
                dockerfile = dockerfile.replace(APT_REPOSITORY_MACRO, &value);
            }
        }
    }
    if app.allows("apt_packages") {
        if let Some(path) = existing("docker_image.apt_package_path") {
            let value = format_file_content(&path, " ", "\\\n")?;
            if !value.is_empty() {
                let value = format!("RUN apt-get install -yqq \\\n{value}{APT_CLEANUP}");
                dockerfile = dockerfile.replace(APT_PACKAGES_MACRO, &value);
            }
        }
    }
    if app.allows("requirements") {
        if let Some(path) = existing("docker_image.requirements_path") {
            fs::copy(&path, build_dir.join("requirements.txt"))?;
            dockerfile = dockerfile.replace(REQUIREMENTS_MACRO, REQUIREMENTS_INSTALL);
        }
    }
    if app.allows("lab_extensions") {
        if let Some(path) = existing("docker_image.lab_extension_path") {
            let value = format_file_content(&path, "&& jupyter labextension install ", " \\\n")?;
            if !value.is_empty() {
                let value = format!("RUN echo 'Installing Jupyter Extensions' \\\n{value}");
                dockerfile = dockerfile.replace(LAB_EXTENSIONS_MACRO, &value);
            }
        }
    }
    Ok(dockerfile)
}

/// Writes the build context for the focused job into `build_dir`.
pub fn prepare_build_dir(project: &ProjectConfig, kind: JobKind, build_dir: &Path) -> Result<(), AiscalatorError> {
    let name = project
        .job_str(kind, "docker_image.input_docker_src")
        .unwrap_or(DEFAULT_DOCKER_SRC);
    let source = find_docker_src(name, &project.app().dockerfile_src())?;
    debug!("Using docker source {source:?}");
    for (file, content) in read_source(&source)? {
        let content = if file == "Dockerfile" {
            customize_dockerfile(project, kind, &content, build_dir)?
        } else {
            content
        };
        fs::write(build_dir.join(&file), content)?;
    }
    Ok(())
}

/// Builds the image and returns its id, tagging it when the job sets
/// `docker_image.output_docker_name` and `output_docker_tag`.
pub fn build<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    kind: JobKind,
    runner: &R,
) -> Result<Option<String>, AiscalatorError> {
    build_named(
        project,
        kind,
        runner,
        project.job_str(kind, "docker_image.output_docker_name"),
        project.job_str(kind, "docker_image.output_docker_tag"),
    )
}

pub fn build_named<R: ProcessRunner + ?Sized>(
    project: &ProjectConfig,
    kind: JobKind,
    runner: &R,
    output_name: Option<&str>,
    output_tag: Option<&str>,
) -> Result<Option<String>, AiscalatorError> {
    let build_dir = tempfile::Builder::new().prefix("aiscalator_").tempdir()?;
    prepare_build_dir(project, kind, build_dir.path())?;

    let mut commands = vec!["docker".to_string(), "build".to_string(), "--rm".to_string()];
    if let Some(name) = output_name {
        commands.push("-t".to_string());
        commands.push(format!("{name}:latest"));
    }
    commands.push(".".to_string());

    let analyzer = LogRegexAnalyzer::new(BUILT_IMAGE_PATTERN)?;
    execute(runner, &commands, Some(build_dir.path()), &analyzer)?;
    let image = analyzer.artifact();

    if let (Some(image), Some(name), Some(tag)) = (image.as_deref(), output_name, output_tag) {
        let commands = vec![
            "docker".to_string(),
            "tag".to_string(),
            image.to_string(),
            format!("{name}:{tag}"),
        ];
        execute(runner, &commands, None, &LogRegexAnalyzer::passthrough())?;
    }
    if let Some(image) = &image {
        info!("Built docker image {image}");
    }
    Ok(image)
}
