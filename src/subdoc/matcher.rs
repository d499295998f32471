//! Walking a path through a document.
//!
//! A [`Match`] records the resolved steps taken from the root. The walk stops
//! at the first component that does not exist, so the number of steps tells
//! whether the full path, or only its parent, was reached.

use serde_json::Value;

use super::path::{Component, Path};
use super::SubdocError;

/// One resolved hop from a container to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone)]
pub struct Match {
    steps: Vec<Step>,
    path_len: usize,
}

impl Match {
    /// Walk `path` from `root`. Type conflicts along the way are errors;
    /// missing components are not.
    pub fn execute(root: &Value, path: &Path) -> Result<Self, SubdocError> {
        let mut steps = Vec::with_capacity(path.len());
        let mut parent = root;

        for component in path.components() {
            let next = match (component, parent) {
                (Component::Index(idx), Value::Array(array)) => {
                    if array.is_empty() {
                        break;
                    }
                    let resolved = if *idx == -1 {
                        array.len() - 1
                    } else {
                        *idx as usize
                    };
                    match array.get(resolved) {
                        Some(child) => {
                            steps.push(Step::Index(resolved));
                            child
                        }
                        None => break,
                    }
                }
                (Component::Key(key), Value::Object(object)) => match object.get(key) {
                    Some(child) => {
                        steps.push(Step::Key(key.clone()));
                        child
                    }
                    None => break,
                },
                _ => return Err(SubdocError::PathMismatch),
            };
            parent = next;
        }

        Ok(Self {
            steps,
            path_len: path.len(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Every component was found.
    pub fn is_found(&self) -> bool {
        self.steps.len() == self.path_len
    }

    /// The container the last component lives in (or would live in) exists.
    pub fn has_immediate_parent(&self) -> bool {
        self.path_len == 0 || self.steps.len() + 1 >= self.path_len
    }

    /// Steps to the container holding the match (or the deepest node reached).
    pub fn parent_steps(&self) -> &[Step] {
        if self.is_found() && !self.steps.is_empty() {
            &self.steps[..self.steps.len() - 1]
        } else {
            &self.steps
        }
    }

    /// Deepest node reached.
    pub fn deepest<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        resolve(root, &self.steps)
    }
}

pub fn resolve<'a>(root: &'a Value, steps: &[Step]) -> Option<&'a Value> {
    steps.iter().try_fold(root, |node, step| match (step, node) {
        (Step::Key(key), Value::Object(object)) => object.get(key),
        (Step::Index(idx), Value::Array(array)) => array.get(*idx),
        _ => None,
    })
}

pub fn resolve_mut<'a>(root: &'a mut Value, steps: &[Step]) -> Option<&'a mut Value> {
    steps.iter().try_fold(root, |node, step| match (step, node) {
        (Step::Key(key), Value::Object(object)) => object.get_mut(key),
        (Step::Index(idx), Value::Array(array)) => array.get_mut(*idx),
        _ => None,
    })
}
