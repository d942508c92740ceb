//! In-memory configuration tree.
//!
//! A [`ConfigTree`] is an ordered mapping from keys to [`Value`]s. Entries keep
//! the order in which they were first defined so that every traversal of the
//! same tree visits keys identically. Dotted paths such as `task.code_path`
//! address nested trees.

use serde_json::json;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Number(Number),
    Tree(ConfigTree),
    List(Vec<Value>),
}

/// Runtime type of a [`Value`], compared during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Number,
    Tree,
    List,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::Tree => "tree",
            Self::List => "list",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Tree(_) => ValueKind::Tree,
            Self::List(_) => ValueKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_tree(&self) -> Option<&ConfigTree> {
        match self {
            Self::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Scalar rendering used for command-line arguments and env files.
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
            Self::Tree(tree) => tree.to_json().to_string(),
            Self::List(_) => self.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(value) => json!(value),
            Self::Bool(value) => json!(value),
            Self::Number(Number::Int(value)) => json!(value),
            Self::Number(Number::Float(value)) => json!(value),
            Self::Tree(tree) => tree.to_json(),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

impl Value {
    /// Converts a YAML document value. `null` has no counterpart and yields
    /// `None`, so null entries are dropped as in HOCON.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Value> {
        match value {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::Bool(flag) => Some(Value::Bool(*flag)),
            serde_yaml::Value::Number(number) => Some(Value::Number(match number.as_i64() {
                Some(int) => Number::Int(int),
                None => Number::Float(number.as_f64()?),
            })),
            serde_yaml::Value::String(text) => Some(Value::String(text.clone())),
            serde_yaml::Value::Sequence(items) => Some(Value::List(
                items.iter().filter_map(Value::from_yaml).collect(),
            )),
            serde_yaml::Value::Mapping(_) => ConfigTree::from_yaml(value).map(Value::Tree),
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(Number::Int(value))
    }
}

impl From<ConfigTree> for Value {
    fn from(value: ConfigTree) -> Self {
        Self::Tree(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    entries: Vec<(String, Value)>,
}

/// Equality by path: two trees are equal when they define the same keys with
/// equal values, regardless of definition order.
impl PartialEq for ConfigTree {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|segment| !segment.is_empty())
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Direct child lookup, without path splitting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = split_path(path);
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = current.as_tree()?.get(segment)?;
        }
        Some(current)
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.get_path(path).is_some()
    }

    pub fn get_tree(&self, path: &str) -> Option<&ConfigTree> {
        self.get_path(path).and_then(Value::as_tree)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get_path(path).and_then(Value::as_bool)
    }

    pub fn get_list(&self, path: &str) -> Option<&[Value]> {
        self.get_path(path).and_then(Value::as_list)
    }

    /// Sets a direct child, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(existing, _)| existing == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Defines a direct child the way a repeated key in a document does: two
    /// trees merge recursively, anything else is replaced.
    pub fn merge_entry(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match value {
            Value::Tree(incoming) => {
                if let Some((_, Value::Tree(existing))) =
                    self.entries.iter_mut().find(|(existing, _)| *existing == key)
                {
                    for (child_key, child_value) in incoming.entries {
                        existing.merge_entry(child_key, child_value);
                    }
                    return;
                }
                self.insert(key, Value::Tree(incoming));
            }
            other => self.insert(key, other),
        }
    }

    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self
                .entries
                .iter_mut()
                .find(|(existing, _)| existing == head)
            {
                Some((_, Value::Tree(child))) => child.remove_path(rest),
                _ => None,
            },
        }
    }

    /// Sets the value at a dotted path, creating intermediate trees. A
    /// non-tree value in the way is replaced by a tree.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = split_path(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            let index = match current.entries.iter().position(|(existing, _)| existing == segment) {
                Some(index) => index,
                None => {
                    current.entries.push((segment.to_string(), Value::Tree(ConfigTree::new())));
                    current.entries.len() - 1
                }
            };
            let slot = &mut current.entries[index].1;
            if !matches!(slot, Value::Tree(_)) {
                *slot = Value::Tree(ConfigTree::new());
            }
            current = match slot {
                Value::Tree(child) => child,
                _ => return,
            };
        }
        current.insert(*last, value);
    }

    /// Returns a tree where keys of `self` take precedence over `fallback`;
    /// nested trees present on both sides are combined the same way.
    pub fn with_fallback(&self, fallback: &ConfigTree) -> ConfigTree {
        let mut merged = fallback.clone();
        for (key, value) in &self.entries {
            let combined = match (value, fallback.get(key)) {
                (Value::Tree(mine), Some(Value::Tree(theirs))) => {
                    Value::Tree(mine.with_fallback(theirs))
                }
                _ => value.clone(),
            };
            merged.insert(key.clone(), combined);
        }
        merged
    }

    /// `None` unless `value` is a mapping. Keys keep document order.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<ConfigTree> {
        let serde_yaml::Value::Mapping(mapping) = value else {
            return None;
        };
        let mut tree = ConfigTree::new();
        for (key, item) in mapping {
            let key = match key {
                serde_yaml::Value::String(text) => text.clone(),
                serde_yaml::Value::Number(number) => number.to_string(),
                serde_yaml::Value::Bool(flag) => flag.to_string(),
                _ => continue,
            };
            if let Some(item) = Value::from_yaml(item) {
                tree.insert(key, item);
            }
        }
        Some(tree)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.entries {
            map.insert(key.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Renders the tree as a HOCON document that parses back to an equal tree.
    pub fn to_hocon(&self) -> String {
        let mut out = String::new();
        write_entries(&mut out, self, 0);
        out
    }
}

fn quote(text: &str) -> String {
    // serde_json string escaping is valid HOCON quoted-string syntax.
    serde_json::Value::String(text.to_string()).to_string()
}

fn write_entries(out: &mut String, tree: &ConfigTree, indent: usize) {
    for (key, value) in tree.iter() {
        let _ = write!(out, "{}{} ", "  ".repeat(indent), quote(key));
        match value {
            Value::Tree(child) => {
                out.push_str("{\n");
                write_entries(out, child, indent + 1);
                let _ = writeln!(out, "{}}}", "  ".repeat(indent));
            }
            other => {
                out.push_str("= ");
                write_value(out, other, indent);
                out.push('\n');
            }
        }
    }
}

fn write_value(out: &mut String, value: &Value, indent: usize) {
    match value {
        Value::String(text) => out.push_str(&quote(text)),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::Tree(child) => {
            out.push_str("{\n");
            write_entries(out, child, indent + 1);
            out.push_str(&"  ".repeat(indent));
            out.push('}');
        }
        Value::List(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push_str("[\n");
            for item in items {
                out.push_str(&"  ".repeat(indent + 1));
                write_value(out, item, indent + 1);
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push(']');
        }
    }
}
