//! Turns configuration sources into trees and manages the application
//! configuration file.

use chrono::Utc;
use regex::{NoExpand, RegexBuilder};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AiscalatorError;
use crate::hocon;
use crate::tree::{ConfigTree, Value};

pub const APP_CONFIG_TEMPLATE: &str = include_str!("../config/template/aiscalator.conf");
pub const MINIMUM_APP_CONFIG_TEMPLATE: &str =
    include_str!("../config/template/minimum_aiscalator.conf");

const APP_HOME_ENV: &str = "AISCALATOR_HOME";
const APP_CONFIG_FILE: &str = "aiscalator.conf";
const CUSTOMIZATION_FILES: [&str; 3] = ["apt_packages.txt", "requirements.txt", "lab_extensions.txt"];

/// Where a configuration tree came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    File(PathBuf),
    Url(String),
    Inline,
}

#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub tree: ConfigTree,
    pub kind: SourceKind,
}

/// Interprets `source` as a local file, then as a URL, then as inline
/// configuration text. The first interpretation that parses wins. Files
/// ending in `.yaml` or `.yml` are read as YAML, everything else as HOCON.
pub fn parse_source(source: &str) -> Result<LoadedSource, AiscalatorError> {
    let path = Path::new(source);
    if path.is_file() {
        let text = fs::read_to_string(path)?;
        let tree = if is_yaml(path) {
            parse_yaml(&text, &path.display().to_string())?
        } else {
            hocon::parse_str(&text, &path.display().to_string())?
        };
        return Ok(LoadedSource {
            tree,
            kind: SourceKind::File(path.to_path_buf()),
        });
    }

    if looks_like_url(source) {
        match fetch_url(source) {
            Ok(text) => match hocon::parse_str(&text, source) {
                Ok(tree) => {
                    return Ok(LoadedSource {
                        tree,
                        kind: SourceKind::Url(source.to_string()),
                    })
                }
                Err(err) => debug!("{source} did not parse as remote configuration: {err}"),
            },
            Err(err) => debug!("unable to fetch {source}: {err}"),
        }
    }

    let tree = hocon::parse_str(source, "inline configuration")?;
    Ok(LoadedSource {
        tree,
        kind: SourceKind::Inline,
    })
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn parse_yaml(text: &str, source_desc: &str) -> Result<ConfigTree, AiscalatorError> {
    let parse_error = |message: String| AiscalatorError::ConfigParse {
        source_desc: source_desc.to_string(),
        message,
    };
    let document: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|err| parse_error(err.to_string()))?;
    ConfigTree::from_yaml(&document)
        .ok_or_else(|| parse_error("expected a mapping at the document root".to_string()))
}

fn looks_like_url(source: &str) -> bool {
    let trimmed = source.trim();
    !trimmed.contains('\n') && (trimmed.starts_with("http://") || trimmed.starts_with("https://"))
}

fn fetch_url(url: &str) -> Result<String, AiscalatorError> {
    let response = reqwest::blocking::get(url.trim())?.error_for_status()?;
    Ok(response.text()?)
}

/// Candidate application config homes, in lookup order.
#[derive(Debug, Clone)]
pub struct AppLocations {
    pub override_home: Option<PathBuf>,
    pub env_home: Option<PathBuf>,
    pub user_home: PathBuf,
}

impl AppLocations {
    pub fn discover(override_home: Option<&Path>) -> Self {
        let env_home = env::var_os(APP_HOME_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self {
            override_home: override_home.map(Path::to_path_buf),
            env_home,
            user_home: default_app_home(),
        }
    }

    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut homes: Vec<&PathBuf> = Vec::new();
        homes.extend(self.override_home.as_ref());
        homes.extend(self.env_home.as_ref());
        homes.push(&self.user_home);
        homes.into_iter().map(|home| app_config_file(home)).collect()
    }

    /// A fresh configuration goes to an explicitly requested home, otherwise
    /// to the user's home directory.
    pub fn generation_home(&self) -> &Path {
        self.override_home.as_deref().unwrap_or(&self.user_home)
    }
}

pub fn default_app_home() -> PathBuf {
    let mut base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".aiscalator");
    base
}

pub fn app_config_file(home: &Path) -> PathBuf {
    home.join("config").join(APP_CONFIG_FILE)
}

/// Process-wide application configuration, keyed under `aiscalator`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    tree: ConfigTree,
    file: PathBuf,
}

impl AppConfig {
    #[cfg(test)]
    pub fn from_tree(tree: ConfigTree, file: PathBuf) -> Self {
        Self { tree, file }
    }

    pub fn load(file: &Path) -> Result<Self, AiscalatorError> {
        let text = fs::read_to_string(file)?;
        let tree = hocon::parse_str(&text, &file.display().to_string())?;
        Ok(Self {
            tree,
            file: file.to_path_buf(),
        })
    }

    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.tree.get_path(&format!("aiscalator.{field}"))
    }

    pub fn has(&self, field: &str) -> bool {
        self.tree.contains_path(&format!("aiscalator.{field}"))
    }

    fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    fn get_strings(&self, field: &str) -> Vec<String> {
        self.tree
            .get_list(&format!("aiscalator.{field}"))
            .map(|items| items.iter().map(Value::to_plain_string).collect())
            .unwrap_or_default()
    }

    /// `app_config_home_directory` when set, else the home holding the file.
    pub fn app_config_home(&self) -> PathBuf {
        if let Some(home) = self.get_str("app_config_home_directory") {
            return PathBuf::from(home);
        }
        self.file
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(default_app_home)
    }

    pub fn user_id(&self) -> &str {
        self.get_str("metadata.user.id").unwrap_or_default()
    }

    pub fn log_level(&self) -> Option<&str> {
        self.get_str("logging.level")
    }

    pub fn docker_compose_file(&self) -> Option<PathBuf> {
        self.get_str("airflow.docker_compose_file").map(PathBuf::from)
    }

    pub fn workspace_paths(&self) -> Vec<String> {
        self.get_strings("airflow.setup.workspace_paths")
    }

    pub fn dockerfile_src(&self) -> Vec<PathBuf> {
        self.get_strings("jupyter.dockerfile_src")
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    /// Port publishes for notebook containers.
    pub fn ports(&self) -> Vec<String> {
        if self.has("jupyter.ports") {
            self.get_strings("jupyter.ports")
        } else {
            vec!["10000:8888".to_string(), "4040:4040".to_string()]
        }
    }

    /// Whether a docker image customization such as `apt_packages` is enabled.
    pub fn allows(&self, customization: &str) -> bool {
        self.tree
            .get_bool(&format!("aiscalator.jupyter.docker_image.allow_{customization}"))
            .unwrap_or(false)
    }

    pub fn redefine_config_home(&self, config_home: &Path) -> Result<AppConfig, AiscalatorError> {
        let mut patch = ConfigTree::new();
        patch.set_path(
            "aiscalator.app_config_home_directory",
            Value::from(config_home.display().to_string()),
        );
        self.rewrite(patch)
    }

    pub fn redefine_workspace_paths(&self, workspaces: &[String]) -> Result<AppConfig, AiscalatorError> {
        let mut patch = ConfigTree::new();
        patch.set_path(
            "aiscalator.airflow.setup.workspace_paths",
            Value::List(workspaces.iter().map(|ws| Value::from(ws.as_str())).collect()),
        );
        self.rewrite(patch)
    }

    /// Applies `patch` over the current tree and persists the result,
    /// returning the new configuration. `self` is left untouched.
    fn rewrite(&self, patch: ConfigTree) -> Result<AppConfig, AiscalatorError> {
        let tree = patch.with_fallback(&self.tree);
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.file, tree.to_hocon())?;
        info!("Rewrote application configuration {}", self.file.display());
        Ok(AppConfig {
            tree,
            file: self.file.clone(),
        })
    }
}

/// Finds the application configuration, generating it from the packaged
/// template on first use.
pub fn locate_application_config(locations: &AppLocations) -> Result<AppConfig, AiscalatorError> {
    for candidate in locations.candidates() {
        if candidate.is_file() {
            debug!("Using application configuration {}", candidate.display());
            return AppConfig::load(&candidate);
        }
    }
    let file = generate_application_config(locations.generation_home())?;
    AppConfig::load(&file)
}

pub fn generate_application_config(home: &Path) -> Result<PathBuf, AiscalatorError> {
    let dst = app_config_file(home);
    info!(
        "Generating a new configuration file for aiscalator: {}",
        dst.display()
    );
    let config_dir = home.join("config");
    fs::create_dir_all(&config_dir)?;
    let content = copy_replace(
        APP_CONFIG_TEMPLATE,
        &[
            ("testUserID", generate_user_id()),
            (
                r"(=\s*)generation_date",
                format!(
                    "= \"{}\" // in UTC timezone",
                    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f+00:00")
                ),
            ),
        ],
    )?;
    fs::write(&dst, content)?;
    for name in CUSTOMIZATION_FILES {
        touch(&config_dir.join(name))?;
    }
    Ok(dst)
}

/// Replaces every case-insensitive match of each pattern. Replacement text
/// is inserted literally.
pub fn copy_replace(content: &str, rules: &[(&str, String)]) -> Result<String, AiscalatorError> {
    let mut result = content.to_string();
    for (pattern, replacement) in rules {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| AiscalatorError::Config(format!("invalid pattern {pattern}: {err}")))?;
        result = regex
            .replace_all(&result, NoExpand(replacement.as_str()))
            .into_owned();
    }
    Ok(result)
}

pub(crate) fn touch(path: &Path) -> Result<(), AiscalatorError> {
    fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// `u` followed by a UUID derived from the machine identity, so that
/// regenerating on the same host yields the same id.
pub fn generate_user_id() -> String {
    let identity = fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
        })
        .or_else(|| env::var("HOSTNAME").ok().filter(|text| !text.is_empty()));
    let id = match identity {
        Some(identity) => Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.as_bytes()),
        None => Uuid::new_v4(),
    };
    format!("u{}", id.simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::tempdir;

    fn locations_for(home: &Path) -> AppLocations {
        AppLocations {
            override_home: Some(home.to_path_buf()),
            env_home: None,
            user_home: home.join("unused-user-home"),
        }
    }

    #[test]
    fn parse_source_prefers_existing_files() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("step.conf");
        fs::write(&file, "steps.demo.task.code_path = nb.py\n").expect("write");
        let loaded = parse_source(file.to_str().unwrap()).expect("parse");
        assert_eq!(loaded.kind, SourceKind::File(file.clone()));
        assert_eq!(loaded.tree.get_str("steps.demo.task.code_path"), Some("nb.py"));
    }

    fn serve_once(status: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/step.conf")
    }

    #[test]
    fn parse_source_fetches_urls() {
        let url = serve_once("200 OK", "steps.remote.task { type = jupyter, code_path = nb.ipynb }\n");
        let loaded = parse_source(&url).expect("parse");
        assert_eq!(loaded.kind, SourceKind::Url(url.clone()));
        assert_eq!(loaded.tree.get_str("steps.remote.task.code_path"), Some("nb.ipynb"));
    }

    #[test]
    fn failed_fetch_falls_through_to_inline_parsing() {
        let url = serve_once("404 Not Found", "");
        let err = parse_source(&url).unwrap_err();
        match err {
            AiscalatorError::ConfigParse { source_desc, .. } => {
                assert_eq!(source_desc, "inline configuration")
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn yaml_files_load_through_serde_yaml() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("step.yaml");
        fs::write(&file, "steps:\n  demo:\n    task:\n      type: jupyter\n      code_path: nb.py\n").expect("write");
        let loaded = parse_source(file.to_str().unwrap()).expect("parse");
        assert_eq!(loaded.tree.get_str("steps.demo.task.code_path"), Some("nb.py"));

        fs::write(&file, "- just\n- a list\n").expect("write");
        assert!(matches!(
            parse_source(file.to_str().unwrap()),
            Err(AiscalatorError::ConfigParse { .. })
        ));
    }

    #[test]
    fn parse_source_falls_back_to_inline_text() {
        let loaded = parse_source("steps { demo { task { code_path = \"nb.py\" } } }").expect("parse");
        assert_eq!(loaded.kind, SourceKind::Inline);
        assert!(loaded.tree.contains_path("steps.demo.task"));
    }

    #[test]
    fn parse_source_reports_inline_parse_errors() {
        let err = parse_source("this { is not").unwrap_err();
        assert!(matches!(err, AiscalatorError::ConfigParse { .. }));
    }

    #[test]
    fn generation_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let locations = locations_for(dir.path());
        let first = locate_application_config(&locations).expect("generate");
        let user_id = first.user_id().to_string();
        assert!(user_id.starts_with('u'));
        assert!(first.get_str("metadata.generation_date").is_some());
        assert!(dir.path().join("config/requirements.txt").is_file());

        let before = fs::read_to_string(first.file()).expect("read");
        let second = locate_application_config(&locations).expect("locate");
        assert_eq!(second.user_id(), user_id);
        assert_eq!(fs::read_to_string(second.file()).expect("read"), before);
    }

    #[test]
    fn candidates_follow_override_env_home_order() {
        let locations = AppLocations {
            override_home: Some(PathBuf::from("/o")),
            env_home: Some(PathBuf::from("/e")),
            user_home: PathBuf::from("/h"),
        };
        assert_eq!(
            locations.candidates(),
            vec![
                PathBuf::from("/o/config/aiscalator.conf"),
                PathBuf::from("/e/config/aiscalator.conf"),
                PathBuf::from("/h/config/aiscalator.conf"),
            ]
        );
        assert_eq!(locations.generation_home(), Path::new("/o"));
    }

    #[test]
    fn redefinitions_persist_and_return_new_config() {
        let dir = tempdir().expect("tempdir");
        let config = locate_application_config(&locations_for(dir.path())).expect("generate");
        let moved = config
            .redefine_config_home(Path::new("/srv/aiscalator"))
            .expect("redefine home");
        assert_eq!(moved.app_config_home(), PathBuf::from("/srv/aiscalator"));
        assert_eq!(config.app_config_home(), dir.path().to_path_buf());

        let with_ws = moved
            .redefine_workspace_paths(&["/a".to_string(), "/b".to_string()])
            .expect("redefine ws");
        let reloaded = AppConfig::load(with_ws.file()).expect("reload");
        assert_eq!(reloaded.workspace_paths(), vec!["/a", "/b"]);
        assert_eq!(reloaded.app_config_home(), PathBuf::from("/srv/aiscalator"));
        assert_eq!(reloaded.user_id(), config.user_id());
    }

    #[test]
    fn copy_replace_is_case_insensitive_and_literal() {
        let out = copy_replace("name = UNTITLED $x", &[("untitled", "my$1step".to_string())])
            .expect("replace");
        assert_eq!(out, "name = my$1step $x");
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let config = AppConfig::from_tree(ConfigTree::new(), PathBuf::from("/x/config/aiscalator.conf"));
        assert_eq!(config.ports(), vec!["10000:8888", "4040:4040"]);
        assert!(!config.allows("apt_packages"));
        assert_eq!(config.app_config_home(), PathBuf::from("/x"));
        assert_eq!(config.user_id(), "");
    }
}
