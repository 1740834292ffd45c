// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dot-path addressing into JSON documents.
//!
//! `"db.models.User"` walks object keys; numeric segments such as `"routes.0"`
//! index arrays; the empty path is the document root.

use forkline_protocol::Mutation;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from applying a mutation at a path.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PathError {
    /// A segment walks into a string, number or boolean.
    #[error("'{path}' does not address an object or array")]
    NotAContainer { path: String },

    /// A segment under an array is not a number.
    #[error("'{segment}' is not an array index (at '{path}')")]
    InvalidIndex { path: String, segment: String },

    /// An array index is past the end (appending at `len` is allowed for `set`).
    #[error("index {index} out of bounds at '{path}'")]
    OutOfBounds { path: String, index: usize },

    /// `push` target exists but is not an array.
    #[error("'{path}' is not an array")]
    NotAnArray { path: String },

    /// The document root cannot be deleted.
    #[error("cannot delete the document root")]
    Root,
}

fn segments(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

fn prefix(segments: &[&str], len: usize) -> String {
    segments[..len].join(".")
}

fn parse_index(segments: &[&str], at: usize) -> Result<usize, PathError> {
    segments[at]
        .parse::<usize>()
        .map_err(|_| PathError::InvalidIndex {
            path: prefix(segments, at + 1),
            segment: segments[at].to_string(),
        })
}

/// Read the value at `path`.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walk to the container holding the last segment, creating missing (or
/// null) intermediate objects.
fn parent_mut<'a>(root: &'a mut Value, segments: &[&str]) -> Result<&'a mut Value, PathError> {
    let mut current = root;
    let parents = segments.len().saturating_sub(1);

    for at in 0..parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => {
                let child = map
                    .entry(segments[at].to_string())
                    .or_insert(Value::Null);
                if child.is_null() {
                    *child = Value::Object(Map::new());
                }
                child
            }
            Value::Array(items) => {
                let index = parse_index(segments, at)?;
                let len = items.len();
                items.get_mut(index).ok_or(PathError::OutOfBounds {
                    path: prefix(segments, at + 1),
                    index: len.max(index),
                })?
            }
            _ => {
                return Err(PathError::NotAContainer {
                    path: prefix(segments, at),
                });
            }
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    Ok(current)
}

fn set(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segments = segments(path);
    let Some(last) = segments.last() else {
        *root = value;
        return Ok(());
    };

    match parent_mut(root, &segments)? {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(&segments, segments.len() - 1)?;
            if index < items.len() {
                items[index] = value;
                Ok(())
            } else if index == items.len() {
                items.push(value);
                Ok(())
            } else {
                Err(PathError::OutOfBounds {
                    path: path.to_string(),
                    index,
                })
            }
        }
        _ => Err(PathError::NotAContainer {
            path: prefix(&segments, segments.len() - 1),
        }),
    }
}

fn push(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segments = segments(path);
    let target = match segments.last() {
        None => root,
        Some(last) => match parent_mut(root, &segments)? {
            Value::Object(map) => map
                .entry(last.to_string())
                .or_insert_with(|| Value::Array(Vec::new())),
            Value::Array(items) => {
                let index = parse_index(&segments, segments.len() - 1)?;
                let len = items.len();
                items.get_mut(index).ok_or(PathError::OutOfBounds {
                    path: path.to_string(),
                    index: len.max(index),
                })?
            }
            _ => {
                return Err(PathError::NotAContainer {
                    path: prefix(&segments, segments.len() - 1),
                });
            }
        },
    };

    if target.is_null() {
        *target = Value::Array(Vec::new());
    }
    match target {
        Value::Array(items) => {
            items.push(value);
            Ok(())
        }
        _ => Err(PathError::NotAnArray {
            path: path.to_string(),
        }),
    }
}

fn delete(root: &mut Value, path: &str) -> Result<bool, PathError> {
    let segments = segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return Err(PathError::Root);
    };

    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(child) => child,
                None => return Ok(false),
            },
            Value::Array(items) => {
                match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(child) => child,
                    None => return Ok(false),
                }
            }
            _ => return Ok(false),
        };
    }

    Ok(match current {
        Value::Object(map) => map.remove(*last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    })
}

/// Apply `mutation` to `root`.
///
/// Returns whether the document changed. `root` is left untouched when an
/// error is returned.
pub fn apply(root: &mut Value, mutation: &Mutation) -> Result<bool, PathError> {
    // Work on a copy so a failure halfway down a path (after intermediate
    // objects were created) leaves the document as it was.
    let mut next = root.clone();
    let changed = match mutation {
        Mutation::Set { path, value } => {
            set(&mut next, path, value.clone())?;
            true
        }
        Mutation::Push { path, value } => {
            push(&mut next, path, value.clone())?;
            true
        }
        Mutation::Delete { path } => delete(&mut next, path)?,
        Mutation::Replace { document } => {
            next = document.clone();
            true
        }
    };
    if changed {
        *root = next;
    }
    Ok(changed)
}
