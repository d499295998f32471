//! Applying one operation to a document.
//!
//! The document is parsed into a [`Value`], the path is matched, and the
//! operation mutates the tree in place. Callers get back the serialized new
//! document for mutations and the matched value for operations that return
//! one.

use serde_json::{Map, Value};

use super::matcher::{resolve, resolve_mut, Match, Step};
use super::operation::Operation;
use super::path::{Component, Path};
use super::SubdocError;

/// Outcome of a successful operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubdocResult {
    pub matched: Option<Value>,
    /// Whole document after a mutation.
    pub document: Option<Value>,
}

impl SubdocResult {
    pub fn match_bytes(&self) -> Vec<u8> {
        self.matched.as_ref().map(to_bytes).unwrap_or_default()
    }

    pub fn document_bytes(&self) -> Vec<u8> {
        self.document.as_ref().map(to_bytes).unwrap_or_default()
    }
}

fn to_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Parsed operand.
#[derive(Debug, Clone)]
enum Operand {
    None,
    Single(Value),
    Multi(Vec<Value>),
}

impl Operand {
    fn parse(op: Operation, fragment: Option<&[u8]>) -> Result<Self, SubdocError> {
        if !op.requires_value() {
            return Ok(Self::None);
        }
        let fragment = match fragment {
            Some(f) if !f.is_empty() => f,
            _ => return Err(SubdocError::CannotInsert),
        };
        let bad_value = || {
            if op == Operation::Counter {
                SubdocError::DeltaRange
            } else {
                SubdocError::CannotInsert
            }
        };

        let operand = if op.is_array_parent() {
            let mut wrapped = Vec::with_capacity(fragment.len() + 2);
            wrapped.push(b'[');
            wrapped.extend_from_slice(fragment);
            wrapped.push(b']');
            let mut values: Vec<Value> =
                serde_json::from_slice(&wrapped).map_err(|_| bad_value())?;
            match values.len() {
                0 => return Err(SubdocError::CannotInsert),
                1 => Self::Single(values.remove(0)),
                _ => Self::Multi(values),
            }
        } else {
            Self::Single(serde_json::from_slice(fragment).map_err(|_| bad_value())?)
        };

        if matches!(operand, Self::Multi(_)) && !op.allows_multi_value() {
            return Err(SubdocError::CannotInsert);
        }
        Ok(operand)
    }

    fn single(&self) -> Result<&Value, SubdocError> {
        match self {
            Self::Single(v) => Ok(v),
            _ => Err(SubdocError::CannotInsert),
        }
    }

    /// Elements to splice into an array.
    fn elements(&self) -> Vec<Value> {
        match self {
            Self::None => Vec::new(),
            Self::Single(v) => vec![v.clone()],
            Self::Multi(vs) => vs.clone(),
        }
    }
}

/// Execute `op` at `path` against the JSON text `doc`.
///
/// `value` is the raw operand fragment; `mkdir_p` allows creating missing
/// intermediate dictionaries.
pub fn execute(
    doc: &[u8],
    path: &str,
    op: Operation,
    value: Option<&[u8]>,
    mkdir_p: bool,
) -> Result<SubdocResult, SubdocError> {
    let path = Path::parse(path)?;
    let operand = Operand::parse(op, value)?;
    let root: Value = serde_json::from_slice(doc).map_err(|_| SubdocError::DocNotJson)?;
    let matched = Match::execute(&root, &path)?;

    let mut executor = Executor {
        root,
        path,
        matched,
        operand,
        op,
        mkdir_p,
    };
    executor.operate()
}

struct Executor {
    root: Value,
    path: Path,
    matched: Match,
    operand: Operand,
    op: Operation,
    mkdir_p: bool,
}

enum Container {
    Object,
    Array,
}

impl Executor {
    fn operate(&mut self) -> Result<SubdocResult, SubdocError> {
        match self.op {
            Operation::Get | Operation::Exists | Operation::GetCount => {
                if !self.matched.is_found() {
                    return Err(SubdocError::PathNotFound);
                }
                let found = self.current_match()?;
                let matched = if self.op == Operation::GetCount {
                    Some(count(found)?)
                } else {
                    Some(found.clone())
                };
                Ok(SubdocResult {
                    matched,
                    document: None,
                })
            }
            Operation::Replace => {
                let value = self.operand.single()?.clone();
                self.replace(value)?;
                Ok(self.mutated(None))
            }
            Operation::DictUpsert => {
                if matches!(self.path.last(), Some(Component::Index(_))) {
                    return Err(SubdocError::PathInvalid);
                }
                let value = self.operand.single()?.clone();
                if self.matched.is_found() {
                    self.replace(value)?;
                } else {
                    self.dict_add(value)?;
                }
                Ok(self.mutated(None))
            }
            Operation::DictAdd => {
                let value = self.operand.single()?.clone();
                self.dict_add(value)?;
                Ok(self.mutated(None))
            }
            Operation::ArrayAppend | Operation::ArrayPrepend | Operation::AddUnique => {
                self.array_add()?;
                Ok(self.mutated(None))
            }
            Operation::ArrayInsert => {
                self.array_insert()?;
                Ok(self.mutated(None))
            }
            Operation::Remove => {
                let removed = self.remove()?;
                Ok(self.mutated(Some(removed)))
            }
            Operation::Counter => {
                let result = self.counter()?;
                Ok(self.mutated(Some(result)))
            }
        }
    }

    fn mutated(&self, matched: Option<Value>) -> SubdocResult {
        SubdocResult {
            matched,
            document: Some(self.root.clone()),
        }
    }

    fn current_match(&self) -> Result<&Value, SubdocError> {
        resolve(&self.root, self.matched.steps()).ok_or(SubdocError::PathNotFound)
    }

    fn deepest(&self) -> Result<&Value, SubdocError> {
        self.matched
            .deepest(&self.root)
            .ok_or(SubdocError::PathNotFound)
    }

    fn deepest_mut(&mut self) -> Result<&mut Value, SubdocError> {
        resolve_mut(&mut self.root, self.matched.steps()).ok_or(SubdocError::PathNotFound)
    }

    fn last_key(&self) -> Result<String, SubdocError> {
        match self.path.last() {
            Some(Component::Key(key)) => Ok(key.clone()),
            _ => Err(SubdocError::PathNotFound),
        }
    }

    fn replace(&mut self, value: Value) -> Result<(), SubdocError> {
        if !self.matched.is_found() {
            return Err(SubdocError::PathNotFound);
        }
        if self.path.is_empty() {
            return Err(SubdocError::CannotInsert);
        }
        *self.deepest_mut()? = value;
        Ok(())
    }

    fn dict_add(&mut self, value: Value) -> Result<(), SubdocError> {
        if self.matched.is_found() {
            return Err(SubdocError::PathExists);
        }
        if !self.matched.has_immediate_parent() {
            if !self.mkdir_p {
                return Err(SubdocError::PathNotFound);
            }
            return self.create_parents(Container::Object, vec![value]);
        }
        let key = match self.path.last() {
            Some(Component::Key(key)) => key.clone(),
            _ => return Err(SubdocError::PathMismatch),
        };
        match self.deepest_mut()? {
            Value::Object(object) => {
                object.insert(key, value);
                Ok(())
            }
            _ => Err(SubdocError::PathMismatch),
        }
    }

    /// Build the missing dictionaries below the deepest node reached, then
    /// store `values` under the last component.
    fn create_parents(&mut self, kind: Container, values: Vec<Value>) -> Result<(), SubdocError> {
        if self.deepest()?.is_array() {
            return Err(SubdocError::PathMismatch);
        }
        let first_missing = self.matched.steps().len();
        let mut missing = Vec::new();
        for idx in first_missing..self.path.len().saturating_sub(1) {
            match self.path.get(idx) {
                Some(Component::Key(key)) => missing.push(key.clone()),
                _ => return Err(SubdocError::PathNotFound),
            }
        }
        let last = self.last_key()?;

        let leaf = match kind {
            Container::Array => Value::Array(values),
            Container::Object => values.into_iter().next().unwrap_or(Value::Null),
        };
        let subtree = missing
            .into_iter()
            .rev()
            .fold((last, leaf), |(child_key, child), key| {
                let mut object = Map::new();
                object.insert(child_key, child);
                (key, Value::Object(object))
            });

        match self.deepest_mut()? {
            Value::Object(object) => {
                object.insert(subtree.0, subtree.1);
                Ok(())
            }
            _ => Err(SubdocError::PathMismatch),
        }
    }

    fn array_add(&mut self) -> Result<(), SubdocError> {
        if !self.matched.is_found() {
            if self.mkdir_p {
                let values = self.operand.elements();
                return self.create_parents(Container::Array, values);
            }
            return Err(SubdocError::PathNotFound);
        }

        let op = self.op;
        let values = self.operand.elements();
        let unique = match op {
            Operation::AddUnique => Some(self.operand.single()?.clone()),
            _ => None,
        };
        let array = match self.deepest_mut()? {
            Value::Array(array) => array,
            _ => return Err(SubdocError::PathMismatch),
        };
        if let Some(candidate) = unique {
            ensure_unique(array, &candidate)?;
        }
        let at = if op == Operation::ArrayPrepend { 0 } else { array.len() };
        array.splice(at..at, values);
        Ok(())
    }

    fn array_insert(&mut self) -> Result<(), SubdocError> {
        let position = match self.path.last() {
            Some(Component::Index(-1)) => return Err(SubdocError::PathInvalid),
            Some(Component::Index(n)) => *n as usize,
            _ => return Err(SubdocError::PathInvalid),
        };
        if !self.matched.has_immediate_parent() {
            return Err(SubdocError::PathNotFound);
        }
        let parent_steps: Vec<Step> = self.matched.parent_steps().to_vec();
        let values = self.operand.elements();
        let array = match resolve_mut(&mut self.root, &parent_steps) {
            Some(Value::Array(array)) => array,
            Some(_) => return Err(SubdocError::PathMismatch),
            None => return Err(SubdocError::PathNotFound),
        };
        if position > array.len() {
            return Err(SubdocError::PathNotFound);
        }
        array.splice(position..position, values);
        Ok(())
    }

    fn remove(&mut self) -> Result<Value, SubdocError> {
        if !self.matched.is_found() {
            return Err(SubdocError::PathNotFound);
        }
        if self.path.is_empty() {
            return Err(SubdocError::CannotInsert);
        }
        let parent_steps: Vec<Step> = self.matched.parent_steps().to_vec();
        let last = self
            .matched
            .steps()
            .last()
            .cloned()
            .ok_or(SubdocError::PathNotFound)?;
        let removed = match (resolve_mut(&mut self.root, &parent_steps), last) {
            (Some(Value::Object(object)), Step::Key(key)) => object.shift_remove(&key),
            (Some(Value::Array(array)), Step::Index(idx)) if idx < array.len() => {
                Some(array.remove(idx))
            }
            _ => None,
        };
        removed.ok_or(SubdocError::PathNotFound)
    }

    fn counter(&mut self) -> Result<Value, SubdocError> {
        // Fractions, strings and values beyond i64 are all bad deltas.
        let delta = match self.operand.single()? {
            Value::Number(n) => n.as_i64().ok_or(SubdocError::DeltaRange)?,
            _ => return Err(SubdocError::DeltaRange),
        };
        if delta == 0 {
            return Err(SubdocError::DeltaRange);
        }

        if self.matched.is_found() {
            let current = match self.current_match()? {
                Value::Number(n) => match n.as_i64() {
                    Some(current) => current,
                    None if n.is_u64() => return Err(SubdocError::NumberTooBig),
                    None => return Err(SubdocError::PathMismatch),
                },
                _ => return Err(SubdocError::PathMismatch),
            };
            let next = current
                .checked_add(delta)
                .ok_or(SubdocError::DeltaRange)?;
            let result = Value::from(next);
            self.replace(result.clone())?;
            return Ok(result);
        }

        let result = Value::from(delta);
        let parent_is_object = self.matched.has_immediate_parent()
            && matches!(self.deepest()?, Value::Object(_));
        if parent_is_object {
            self.dict_add(result.clone())?;
        } else if self.mkdir_p && matches!(self.deepest()?, Value::Object(_)) {
            self.create_parents(Container::Object, vec![result.clone()])?;
        } else {
            return Err(SubdocError::PathNotFound);
        }
        Ok(result)
    }
}

fn count(value: &Value) -> Result<Value, SubdocError> {
    match value {
        Value::Object(object) => Ok(Value::from(object.len())),
        Value::Array(array) => Ok(Value::from(array.len())),
        _ => Err(SubdocError::PathMismatch),
    }
}

fn ensure_unique(array: &[Value], candidate: &Value) -> Result<(), SubdocError> {
    if candidate.is_array() || candidate.is_object() {
        return Err(SubdocError::CannotInsert);
    }
    for element in array {
        if element.is_array() || element.is_object() {
            return Err(SubdocError::PathMismatch);
        }
        if element == candidate {
            return Err(SubdocError::PathExists);
        }
    }
    Ok(())
}
