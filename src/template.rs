//! Rendering of query statements before they are submitted.
//!
//! Statements may reference local variables as `$name`; a multi-line cell
//! may start with `target << statement` to capture or persist its results.

use crate::error::{NextcodeError, NextcodeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_EXTENSION: &str = ".tsv";

/// Replace every `$name` in `statement` with the value of `name` in `vars`
pub fn render(statement: &str, vars: &HashMap<String, String>) -> NextcodeResult<String> {
    let mut out = String::with_capacity(statement.len());
    let mut chars = statement.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
            continue;
        }
        let value = vars
            .get(&name)
            .ok_or_else(|| NextcodeError::Template(format!("Variable '{}' not found", name)))?;
        out.push_str(value);
    }
    Ok(out)
}

/// What to do with the results of a cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellTarget {
    /// Assign the results to a local variable
    Variable(String),
    /// Persist the results to a file in the project
    Persist(String),
}

/// A query statement parsed from a notebook line or cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GorCell {
    pub statement: String,
    pub target: Option<CellTarget>,
}

impl GorCell {
    /// Parse a line, and optionally the cell body that follows it
    pub fn parse(line: &str, cell: Option<&str>) -> Self {
        let Some(cell) = cell else {
            return Self {
                statement: line.to_string(),
                target: None,
            };
        };

        let (target, head) = match line.split_once("<<") {
            Some((var, rest)) => {
                let var = var.trim().to_string();
                let target = if var.contains('/') || var.contains('.') {
                    CellTarget::Persist(var)
                } else {
                    CellTarget::Variable(var)
                };
                (Some(target), rest)
            }
            None => (None, line),
        };

        Self {
            statement: format!("{}\n{}", head, cell),
            target,
        }
    }

    pub fn persist(&self) -> Option<&str> {
        match &self.target {
            Some(CellTarget::Persist(path)) => Some(path),
            _ => None,
        }
    }

    /// Render `$name` references in the statement
    pub fn render(&self, vars: &HashMap<String, String>) -> NextcodeResult<String> {
        render(&self.statement, vars)
    }
}

/// Local variable backing a relation reference such as `[var:name]`
pub fn relation_variable_name(relation: &str) -> &str {
    let trimmed = relation.trim_start_matches('[').trim_end_matches(']');
    trimmed.rsplit(':').next().unwrap_or(trimmed)
}

/// MD5 fingerprint of relation contents, used by the server for caching.
///
/// The digest is taken over the quoted, escaped form of the data (as the
/// Python SDK writes it) so both clients hit the same cache entries.
pub fn fingerprint(contents: &str) -> String {
    format!("{:x}", md5::compute(quoted_literal(contents).as_bytes()))
}

// Python 3 `repr()` of a str
fn quoted_literal(contents: &str) -> String {
    let quote = if contents.contains('\'') && !contents.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(contents.len() + 2);
    out.push(quote);
    for c in contents.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if !is_printable(c) => {
                let code = c as u32;
                if code < 0x100 {
                    out.push_str(&format!("\\x{:02x}", code));
                } else if code < 0x10000 {
                    out.push_str(&format!("\\u{:04x}", code));
                } else {
                    out.push_str(&format!("\\U{:08x}", code));
                }
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    if c.is_control() || c.is_whitespace() {
        return false;
    }
    !matches!(
        c as u32,
        0xad | 0x600..=0x605
            | 0x61c
            | 0x6dd
            | 0x70f
            | 0x200b..=0x200f
            | 0x202a..=0x202e
            | 0x2060..=0x206f
            | 0xfeff
            | 0xfff0..=0xfffb
            | 0xe000..=0xf8ff
    )
}

/// Tab-separated data sent along with a query and referenced by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRelation {
    pub name: String,
    pub fingerprint: String,
    pub extension: String,
    pub data: String,
}

impl VirtualRelation {
    /// Build a relation. The data gets a leading `#` header marker if it has none.
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> NextcodeResult<Self> {
        let name = name.into();
        let mut data = data.into();
        if name.is_empty() {
            return Err(NextcodeError::query("Virtual relations must have name and data fields"));
        }
        if !data.starts_with('#') {
            data.insert(0, '#');
        }
        Ok(Self {
            fingerprint: fingerprint(&data),
            extension: DEFAULT_EXTENSION.to_string(),
            name,
            data,
        })
    }

    /// Relation for a `name=data` keyword, referenced in statements as `[name]`
    pub fn keyword(name: &str, data: impl Into<String>) -> NextcodeResult<Self> {
        Self::new(format!("[{}]", name), data)
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Copy ready to send: header marker on the data, fingerprint and extension filled in
    pub(crate) fn normalized(&self) -> NextcodeResult<Self> {
        let mut rel = Self::new(self.name.clone(), self.data.clone())?;
        if !self.fingerprint.is_empty() {
            rel.fingerprint = self.fingerprint.clone();
        }
        if !self.extension.is_empty() {
            rel.extension = self.extension.clone();
        }
        Ok(rel)
    }
}
