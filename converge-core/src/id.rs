//! Composite identifiers.
//!
//! Resources without a single natural key are persisted under one opaque
//! string made of their key components joined by a reserved separator,
//! e.g. `rtb-0123,subnet-4567`. Decoding distinguishes a structurally
//! broken identifier (`MalformedId`, permanent) from a well-formed one whose
//! remote object is missing (`NotFound`, reported later by the read).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default separator between identifier components.
pub const DEFAULT_SEPARATOR: char = ',';

/// A decoded identifier: its components and the string they encode to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeId {
    parts: Vec<String>,
    encoded: String,
}

impl CompositeId {
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn part(&self, index: usize) -> Option<&str> {
        self.parts.get(index).map(String::as_str)
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn into_parts(self) -> Vec<String> {
        self.parts
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl AsRef<str> for CompositeId {
    fn as_ref(&self) -> &str {
        &self.encoded
    }
}

/// Encodes component tuples into identifiers and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeIdCodec {
    separator: char,
    allow_empty_parts: bool,
}

impl Default for CompositeIdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl CompositeIdCodec {
    pub const fn new(separator: char) -> Self {
        Self {
            separator,
            allow_empty_parts: false,
        }
    }

    /// Accept empty components (e.g. an optional key part).
    pub const fn allow_empty_parts(mut self, allow: bool) -> Self {
        self.allow_empty_parts = allow;
        self
    }

    pub const fn separator(&self) -> char {
        self.separator
    }

    /// Join components into an identifier.
    pub fn encode<S: AsRef<str>>(&self, components: &[S]) -> Result<CompositeId> {
        if components.is_empty() {
            return Err(Error::InvalidComponent {
                index: 0,
                reason: "at least one component is required".to_string(),
            });
        }

        let mut parts = Vec::with_capacity(components.len());
        for (index, component) in components.iter().enumerate() {
            let component = component.as_ref();
            if component.is_empty() && !self.allow_empty_parts {
                return Err(Error::InvalidComponent {
                    index,
                    reason: "component is empty".to_string(),
                });
            }
            if component.contains(self.separator) {
                return Err(Error::InvalidComponent {
                    index,
                    reason: format!(
                        "component {:?} contains separator {:?}",
                        component, self.separator
                    ),
                });
            }
            parts.push(component.to_string());
        }

        let encoded = parts.join(&self.separator.to_string());
        Ok(CompositeId { parts, encoded })
    }

    /// Split an identifier into exactly `expected_parts` components.
    pub fn decode(&self, id: &str, expected_parts: usize) -> Result<CompositeId> {
        let parts: Vec<String> = id.split(self.separator).map(str::to_string).collect();

        let has_empty = !self.allow_empty_parts && parts.iter().any(String::is_empty);
        if parts.len() != expected_parts || has_empty {
            return Err(Error::MalformedId {
                id: id.to_string(),
                expected: expected_parts,
                found: parts.len(),
                separator: self.separator,
            });
        }

        Ok(CompositeId {
            parts,
            encoded: id.to_string(),
        })
    }
}
