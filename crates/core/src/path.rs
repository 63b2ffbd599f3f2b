//! Dotted field paths into configuration documents.
//!
//! A path such as `spec.template.spec.containers.0.image` is split on `.`;
//! purely numeric segments address array elements positionally. Keys that
//! themselves contain a dot (common for config map entries) are written in
//! brackets: `data[app.properties]`.

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    /// Numeric tokens become positional indices, everything else a key.
    pub fn from_token(token: &str) -> Self {
        token
            .parse::<usize>()
            .map_or_else(|_| Self::Key(token.to_string()), Self::Index)
    }

    fn key_str(&self) -> String {
        match self {
            Self::Key(key) => key.clone(),
            Self::Index(index) => index.to_string(),
        }
    }
}

/// A parsed dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a dotted path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for empty paths, empty segments, or an
    /// unterminated bracket.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::invalid_path(raw, "path is empty"));
        }

        let mut segments = Vec::new();
        let mut rest = raw;
        loop {
            let (segment, remainder) = if let Some(bracketed) = rest.strip_prefix('[') {
                let close = bracketed
                    .find(']')
                    .ok_or_else(|| Error::invalid_path(raw, "unterminated '['"))?;
                let (key, after) = bracketed.split_at(close);
                (Segment::Key(key.to_string()), after.strip_prefix(']').unwrap_or(after))
            } else {
                let end = rest.find(['.', '[']).unwrap_or(rest.len());
                let (token, after) = rest.split_at(end);
                if token.is_empty() {
                    return Err(Error::invalid_path(raw, "empty segment"));
                }
                (Segment::from_token(token), after)
            };
            segments.push(segment);

            if remainder.is_empty() {
                break;
            }
            rest = match remainder.strip_prefix('.') {
                Some(next) if !next.is_empty() => next,
                Some(_) => return Err(Error::invalid_path(raw, "trailing '.'")),
                None if remainder.starts_with('[') => remainder,
                None => return Err(Error::invalid_path(raw, "expected '.' after ']'")),
            };
        }

        Ok(Self { segments })
    }

    /// Build a path from segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Path segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// A new path with `key` appended as a single segment.
    #[must_use]
    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::from_token(key));
        Self { segments }
    }

    /// A new path with `key` appended as an object key, even when numeric.
    #[must_use]
    pub fn key(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Key(key.to_string()));
        Self { segments }
    }

    /// Whether `self` is `other` or an ancestor of it.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Whether the two paths address overlapping branches of a document.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Look up the value at this path.
    pub fn get<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(document, |current, segment| match (current, segment) {
                (Value::Object(map), segment) => map.get(&segment.key_str()),
                (Value::Array(items), Segment::Index(index)) => items.get(*index),
                _ => None,
            })
    }

    /// Set the value at this path, creating intermediate objects and arrays.
    ///
    /// Returns whether the document changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PatchFailed`] when an intermediate value is a scalar, or
    /// a key segment addresses an array.
    pub fn set(&self, document: &mut Value, value: Value) -> Result<bool> {
        let slot = self
            .segments
            .iter()
            .try_fold(document, |current, segment| self.descend(current, segment))?;
        if *slot == value {
            return Ok(false);
        }
        *slot = value;
        Ok(true)
    }

    /// Build the minimal nested document holding `value` at this path.
    ///
    /// Array positions before the addressed index are filled with `null`.
    pub fn nest(&self, value: Value) -> Value {
        self.segments
            .iter()
            .rev()
            .fold(value, |inner, segment| match segment {
                Segment::Key(key) => {
                    let mut map = Map::new();
                    map.insert(key.clone(), inner);
                    Value::Object(map)
                }
                Segment::Index(index) => {
                    let mut items = vec![Value::Null; *index];
                    items.push(inner);
                    Value::Array(items)
                }
            })
    }

    fn descend<'a>(&self, current: &'a mut Value, segment: &Segment) -> Result<&'a mut Value> {
        if current.is_null() {
            *current = match segment {
                Segment::Index(_) => Value::Array(Vec::new()),
                Segment::Key(_) => Value::Object(Map::new()),
            };
        }

        match (current, segment) {
            (Value::Object(map), segment) => Ok(map.entry(segment.key_str()).or_insert(Value::Null)),
            (Value::Array(items), Segment::Index(index)) => {
                if items.len() <= *index {
                    items.resize(index.saturating_add(1), Value::Null);
                }
                items
                    .get_mut(*index)
                    .ok_or_else(|| Error::patch_failed(self.to_string(), "index out of range"))
            }
            (Value::Array(_), Segment::Key(key)) => Err(Error::patch_failed(
                self.to_string(),
                format!("key '{key}' addresses an array"),
            )),
            (other, _) => Err(Error::patch_failed(
                self.to_string(),
                format!("cannot descend into scalar {other}"),
            )),
        }
    }
}

/// Keys that would not parse back as the same key when written bare.
fn needs_brackets(key: &str) -> bool {
    key.is_empty() || key.contains(['.', '[', ']']) || key.parse::<usize>().is_ok()
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) if needs_brackets(key) => {
                    write!(f, "[{key}]")?;
                }
                Segment::Key(key) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                Segment::Index(index) => {
                    if position > 0 {
                        f.write_str(".")?;
                    }
                    write!(f, "{index}")?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
