use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiscalatorError {
    #[error("config error: {0}")]
    Config(String),
    #[error("unable to parse configuration from {source_desc}: {message}")]
    ConfigParse {
        source_desc: String,
        message: String,
    },
    #[error("{}", selection_not_found_message(.selection, .root_node, .marker, .candidates))]
    SelectionNotFound {
        selection: String,
        root_node: String,
        marker: String,
        candidates: Vec<String>,
    },
    #[error("{path}: Missing definition of {key}")]
    MissingField { path: String, key: String },
    #[error("{path}: Type mismatch of {key} found type {found} instead of {expected}")]
    TypeMismatch {
        path: String,
        key: String,
        found: &'static str,
        expected: &'static str,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

fn selection_not_found_message(
    selection: &str,
    root_node: &str,
    marker: &str,
    candidates: &[String],
) -> String {
    let mut message = format!("{selection}'s {marker} was not found in {root_node} configurations.");
    if candidates.is_empty() {
        message.push_str(" No candidates are defined.");
    } else {
        message.push_str(&format!(
            " Available candidates are: {}",
            candidates.join(" ")
        ));
    }
    message
}

impl AiscalatorError {
    pub fn process_details(&self) -> Option<ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_not_found_lists_candidates() {
        let err = AiscalatorError::SelectionNotFound {
            selection: "missing".to_string(),
            root_node: "steps".to_string(),
            marker: "task".to_string(),
            candidates: vec!["steps.demo".to_string(), "steps.other".to_string()],
        };
        let text = err.to_string();
        assert!(text.starts_with("missing's task was not found in steps"));
        assert!(text.contains("Available candidates are: steps.demo steps.other"));
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let err = AiscalatorError::TypeMismatch {
            path: "in step named steps.demo.task".to_string(),
            key: "type".to_string(),
            found: "number",
            expected: "string",
        };
        assert_eq!(
            err.to_string(),
            "in step named steps.demo.task: Type mismatch of type found type number instead of string"
        );
    }
}
