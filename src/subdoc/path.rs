//! Path expressions.
//!
//! ```text
//!   a.b[2].`c.d`[-1]
//!   └┬┘└┬┘└┬┘└─┬──┘└┬┘
//!   key key idx key idx (-1 = last element)
//! ```
//!
//! Backticks quote a component verbatim; a doubled backtick inside quotes is
//! a literal backtick. A `.` directly after `]` is consumed without starting
//! an empty component.

use super::SubdocError;

/// Deepest path accepted.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Key(String),
    /// Array position; `-1` addresses the last element.
    Index(i64),
}

impl Component {
    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    fn parse(text: String, index: bool) -> Result<Self, SubdocError> {
        if text.is_empty() {
            return Err(SubdocError::PathInvalid);
        }
        if !index {
            return Ok(Self::Key(text));
        }
        match text.parse::<i64>() {
            Ok(n) if n >= -1 => Ok(Self::Index(n)),
            _ => Err(SubdocError::PathInvalid),
        }
    }
}

/// Parsed path. The empty path addresses the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path {
    components: Vec<Component>,
}

impl Path {
    pub fn parse(input: &str) -> Result<Self, SubdocError> {
        let mut components: Vec<Component> = Vec::new();
        let mut current = String::new();
        let mut want_index = false;
        let mut in_escape = false;

        let prev_was_index =
            |components: &[Component]| components.last().map_or(false, Component::is_index);

        let mut chars = input.chars().peekable();
        while let Some(ch) = chars.next() {
            if in_escape {
                match ch {
                    // a doubled backtick inside an escape is a literal one
                    '`' if chars.peek() == Some(&'`') => {
                        chars.next();
                        current.push('`');
                    }
                    '`' => in_escape = false,
                    _ => current.push(ch),
                }
                continue;
            }
            if ch == '`' {
                in_escape = true;
                continue;
            }

            match ch {
                '[' => {
                    if want_index {
                        return Err(SubdocError::PathInvalid);
                    }
                    if !current.is_empty() {
                        push(&mut components, std::mem::take(&mut current), false)?;
                    }
                    want_index = true;
                }
                ']' => {
                    if !want_index {
                        return Err(SubdocError::PathInvalid);
                    }
                    push(&mut components, std::mem::take(&mut current), true)?;
                    want_index = false;
                }
                '.' => {
                    if !prev_was_index(&components) || !current.is_empty() {
                        push(&mut components, std::mem::take(&mut current), false)?;
                        want_index = false;
                    }
                }
                _ => current.push(ch),
            }
        }

        if want_index || in_escape {
            return Err(SubdocError::PathInvalid);
        }
        if current.is_empty() {
            if !components.is_empty() && !prev_was_index(&components) {
                return Err(SubdocError::PathInvalid);
            }
        } else {
            push(&mut components, current, false)?;
        }
        Ok(Self { components })
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Component> {
        self.components.get(idx)
    }

    pub fn last(&self) -> Option<&Component> {
        self.components.last()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }
}

fn push(components: &mut Vec<Component>, text: String, index: bool) -> Result<(), SubdocError> {
    if components.len() >= MAX_DEPTH {
        return Err(SubdocError::PathTooBig);
    }
    components.push(Component::parse(text, index)?);
    Ok(())
}
