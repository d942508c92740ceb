//! Structural comparison of a configuration against a reference template.

use std::fmt;
use tracing::warn;

use crate::error::AiscalatorError;
use crate::tree::{ConfigTree, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing {
        path: String,
        key: String,
    },
    TypeMismatch {
        path: String,
        key: String,
        found: &'static str,
        expected: &'static str,
    },
}

impl Violation {
    fn is_fatal(&self, missing_is_fatal: bool, mismatch_is_fatal: bool) -> bool {
        match self {
            Self::Missing { .. } => missing_is_fatal,
            Self::TypeMismatch { .. } => mismatch_is_fatal,
        }
    }

    pub fn into_error(self) -> AiscalatorError {
        match self {
            Self::Missing { path, key } => AiscalatorError::MissingField { path, key },
            Self::TypeMismatch {
                path,
                key,
                found,
                expected,
            } => AiscalatorError::TypeMismatch {
                path,
                key,
                found,
                expected,
            },
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { path, key } => write!(f, "{path}: Missing definition of {key}"),
            Self::TypeMismatch {
                path,
                key,
                found,
                expected,
            } => write!(
                f,
                "{path}: Type mismatch of {key} found type {found} instead of {expected}"
            ),
        }
    }
}

/// Checks every key of `reference` against `test`. Violations whose toggle
/// is set abort with the matching error; the others are logged as warnings
/// and returned. Keys only present in `test` are never reported.
///
/// Lists are compared as a cross product: every element of the tested list
/// must satisfy every tree element of the reference list.
pub fn validate(
    test: &ConfigTree,
    reference: &ConfigTree,
    path_label: &str,
    missing_is_fatal: bool,
    mismatch_is_fatal: bool,
) -> Result<Vec<Violation>, AiscalatorError> {
    let mut checker = Checker {
        missing_is_fatal,
        mismatch_is_fatal,
        advisories: Vec::new(),
    };
    checker.trees(test, reference, path_label)?;
    Ok(checker.advisories)
}

struct Checker {
    missing_is_fatal: bool,
    mismatch_is_fatal: bool,
    advisories: Vec<Violation>,
}

impl Checker {
    fn report(&mut self, violation: Violation) -> Result<(), AiscalatorError> {
        if violation.is_fatal(self.missing_is_fatal, self.mismatch_is_fatal) {
            return Err(violation.into_error());
        }
        warn!("Warning {violation}");
        self.advisories.push(violation);
        Ok(())
    }

    fn trees(&mut self, test: &ConfigTree, reference: &ConfigTree, path: &str) -> Result<(), AiscalatorError> {
        for (key, expected) in reference.iter() {
            let Some(found) = test.get(key) else {
                self.report(Violation::Missing {
                    path: path.to_string(),
                    key: key.to_string(),
                })?;
                continue;
            };
            if found.kind() != expected.kind() {
                self.report(Violation::TypeMismatch {
                    path: path.to_string(),
                    key: key.to_string(),
                    found: found.kind().as_str(),
                    expected: expected.kind().as_str(),
                })?;
                continue;
            }
            let nested = format!("{path}.{key}");
            match (found, expected) {
                (Value::Tree(found), Value::Tree(expected)) => self.trees(found, expected, &nested)?,
                (Value::List(found), Value::List(expected)) => self.lists(found, expected, &nested)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn lists(&mut self, test: &[Value], reference: &[Value], path: &str) -> Result<(), AiscalatorError> {
        for (index, item) in test.iter().enumerate() {
            for template in reference {
                let Value::Tree(template) = template else {
                    continue;
                };
                match item {
                    Value::Tree(item) => self.trees(item, template, path)?,
                    other => self.report(Violation::TypeMismatch {
                        path: path.to_string(),
                        key: format!("element {index}"),
                        found: other.kind().as_str(),
                        expected: "tree",
                    })?,
                }
            }
        }
        Ok(())
    }
}
