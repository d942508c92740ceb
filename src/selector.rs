//! Discovery of marked subtrees (steps carry `task`, dags carry
//! `definition`) and selection of one of them by qualified name.

use crate::error::AiscalatorError;
use crate::tree::{ConfigTree, Value};

pub const STEP_ROOT: &str = "steps";
pub const STEP_MARKER: &str = "task";
pub const DAG_ROOT: &str = "dags";
pub const DAG_MARKER: &str = "definition";

/// A subtree that directly contains the marker key, with its dot-path from
/// the root of the searched tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub tree: ConfigTree,
}

enum SearchNode<'a> {
    Marked(&'a ConfigTree),
    Unmarked(&'a ConfigTree),
}

impl<'a> SearchNode<'a> {
    fn classify(tree: &'a ConfigTree, marker: &str) -> Self {
        if tree.contains_key(marker) {
            Self::Marked(tree)
        } else {
            Self::Unmarked(tree)
        }
    }
}

fn qualify(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn walk(node: SearchNode<'_>, path: &str, marker: &str, found: &mut Vec<Candidate>) {
    match node {
        SearchNode::Marked(tree) => found.push(Candidate {
            name: path.to_string(),
            tree: tree.clone(),
        }),
        SearchNode::Unmarked(tree) => {
            for (key, value) in tree.iter() {
                if let Value::Tree(child) = value {
                    walk(
                        SearchNode::classify(child, marker),
                        &qualify(path, key),
                        marker,
                        found,
                    );
                }
            }
        }
    }
}

/// Every subtree below `tree` containing `marker`, in key order. A marked
/// subtree is never searched further.
pub fn find_marked_subtrees(tree: &ConfigTree, marker: &str) -> Vec<Candidate> {
    let mut found = Vec::new();
    walk(SearchNode::classify(tree, marker), "", marker, &mut found);
    found
}

/// Selects one candidate below `root_node`. Without a selection the first
/// candidate is returned; a selection must match a qualified name exactly.
pub fn select(
    tree: &ConfigTree,
    root_node: &str,
    marker: &str,
    selection: Option<&str>,
) -> Result<Option<Candidate>, AiscalatorError> {
    let Some(root) = tree.get_tree(root_node) else {
        return Ok(None);
    };
    let mut candidates: Vec<Candidate> = find_marked_subtrees(root, marker)
        .into_iter()
        .map(|c| Candidate {
            name: qualify(root_node, &c.name),
            tree: c.tree,
        })
        .collect();
    match selection.filter(|name| !name.is_empty()) {
        None => Ok(candidates.into_iter().next()),
        Some(name) => {
            if let Some(index) = candidates.iter().position(|c| c.name == name) {
                return Ok(Some(candidates.swap_remove(index)));
            }
            Err(AiscalatorError::SelectionNotFound {
                selection: name.to_string(),
                root_node: root_node.to_string(),
                marker: marker.to_string(),
                candidates: candidates.into_iter().map(|c| c.name).collect(),
            })
        }
    }
}
