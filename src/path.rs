//! Reference-path resolution.
//!
//! Paths are dot-delimited segments rooted at one of the context roots
//! (`inputs`, `outputs`, `variables`) or one of the transient bindings
//! (`result`, `item`, `key`, `value`, `entry`). Numeric-looking segments
//! address list indices. Writes create missing intermediate mappings but
//! never grow lists, and only `outputs` and `variables` accept writes.

use serde_json::{Map, Value};

use crate::error::PathError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    Inputs,
    Outputs,
    Variables,
    Result,
    Item,
    Key,
    Value,
    Entry,
}

impl Root {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "inputs" => Some(Root::Inputs),
            "outputs" => Some(Root::Outputs),
            "variables" => Some(Root::Variables),
            "result" => Some(Root::Result),
            "item" => Some(Root::Item),
            "key" => Some(Root::Key),
            "value" => Some(Root::Value),
            "entry" => Some(Root::Entry),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Root::Inputs => "inputs",
            Root::Outputs => "outputs",
            Root::Variables => "variables",
            Root::Result => "result",
            Root::Item => "item",
            Root::Key => "key",
            Root::Value => "value",
            Root::Entry => "entry",
        }
    }

    /// Only `outputs` and `variables` accept writes; everything else is a
    /// read-only root.
    pub fn is_writable(&self) -> bool {
        matches!(self, Root::Outputs | Root::Variables)
    }
}

/// One path segment: the literal text plus its list-index reading when the
/// segment is all digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub index: Option<usize>,
}

impl Segment {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            index: text.parse::<usize>().ok(),
        }
    }
}

/// A parsed reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPath {
    pub root: Root,
    pub segments: Vec<Segment>,
    raw: String,
}

impl RefPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let malformed = || PathError::Malformed {
            path: raw.to_string(),
        };
        let mut parts = raw.split('.');
        let head = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let root = Root::parse(head).ok_or_else(malformed)?;
        let mut segments = Vec::new();
        for part in parts {
            if part.is_empty() {
                return Err(malformed());
            }
            segments.push(Segment::new(part));
        }
        Ok(Self {
            root,
            segments,
            raw: raw.to_string(),
        })
    }

    /// True when `text` looks like a reference path: dotted identifier
    /// segments starting at a known root, with no template syntax.
    pub fn looks_like_path(text: &str) -> bool {
        if text.is_empty() || !text.split('.').all(is_plain_segment) {
            return false;
        }
        text.split('.')
            .next()
            .and_then(Root::parse)
            .is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl std::fmt::Display for RefPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Walk `segments` below `root`, returning the addressed value.
pub fn read_value<'a>(
    root: &'a Value,
    segments: &[Segment],
    full_path: &str,
) -> Result<&'a Value, PathError> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(&segment.text).ok_or_else(|| PathError::NotFound {
                path: full_path.to_string(),
            })?,
            Value::Array(list) => {
                let index = segment.index.ok_or_else(|| PathError::TypeConflict {
                    path: full_path.to_string(),
                    segment: segment.text.clone(),
                })?;
                list.get(index).ok_or_else(|| PathError::NotFound {
                    path: full_path.to_string(),
                })?
            }
            _ => {
                return Err(PathError::TypeConflict {
                    path: full_path.to_string(),
                    segment: segment.text.clone(),
                })
            }
        };
    }
    Ok(current)
}

/// Write `value` at `segments` below `root`, creating missing intermediate
/// mappings. Lists are indexed only within their current length.
pub fn write_value(
    root: &mut Value,
    segments: &[Segment],
    value: Value,
    full_path: &str,
) -> Result<(), PathError> {
    let (last, intermediate) = segments.split_last().ok_or_else(|| PathError::Malformed {
        path: full_path.to_string(),
    })?;

    let mut current = root;
    for segment in intermediate {
        current = match current {
            Value::Object(map) => {
                let slot = map
                    .entry(segment.text.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() && !slot.is_array() {
                    return Err(PathError::TypeConflict {
                        path: full_path.to_string(),
                        segment: segment.text.clone(),
                    });
                }
                slot
            }
            Value::Array(list) => {
                let index = segment.index.ok_or_else(|| PathError::TypeConflict {
                    path: full_path.to_string(),
                    segment: segment.text.clone(),
                })?;
                list.get_mut(index).ok_or_else(|| PathError::NotFound {
                    path: full_path.to_string(),
                })?
            }
            _ => {
                return Err(PathError::TypeConflict {
                    path: full_path.to_string(),
                    segment: segment.text.clone(),
                })
            }
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.text.clone(), value);
            Ok(())
        }
        Value::Array(list) => {
            let index = last.index.ok_or_else(|| PathError::TypeConflict {
                path: full_path.to_string(),
                segment: last.text.clone(),
            })?;
            let slot = list.get_mut(index).ok_or_else(|| PathError::NotFound {
                path: full_path.to_string(),
            })?;
            *slot = value;
            Ok(())
        }
        _ => Err(PathError::TypeConflict {
            path: full_path.to_string(),
            segment: last.text.clone(),
        }),
    }
}
