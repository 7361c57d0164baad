//! Hierarchical dataset path names (`pool/data/home`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Characters that may not appear in a dataset path component.
const RESERVED: &[char] = &['@', '#', '<', '!'];

/// A dataset path: an ordered list of non-empty components.
///
/// The empty path is the root of the namespace. It never names a real
/// dataset but is used as the left side of the `<` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetPath {
    components: Vec<String>,
}

impl DatasetPath {
    /// Parse a `/`-separated dataset path.
    ///
    /// An empty string parses to the root path.
    pub fn parse(s: &str) -> Result<Self, DatasetPathError> {
        if s.is_empty() {
            return Ok(Self::root());
        }

        let mut components = Vec::new();
        for component in s.split('/') {
            if component.is_empty() {
                return Err(DatasetPathError::EmptyComponent(s.to_string()));
            }
            if let Some(c) = component
                .chars()
                .find(|c| RESERVED.contains(c) || c.is_whitespace())
            {
                return Err(DatasetPathError::InvalidCharacter {
                    path: s.to_string(),
                    character: c,
                });
            }
            components.push(component.to_string());
        }

        Ok(Self { components })
    }

    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Whether `prefix` is a (non-strict) component-wise prefix of this path.
    pub fn has_prefix(&self, prefix: &DatasetPath) -> bool {
        self.components.starts_with(&prefix.components)
    }

    /// Strip `prefix` from the front, returning `None` if it is not a prefix.
    pub fn trim_prefix(&self, prefix: &DatasetPath) -> Option<DatasetPath> {
        self.components
            .strip_prefix(prefix.components.as_slice())
            .map(|rest| DatasetPath {
                components: rest.to_vec(),
            })
    }

    /// The enclosing dataset, `None` for top-level datasets and the root.
    pub fn parent(&self) -> Option<DatasetPath> {
        match self.components.split_last() {
            Some((_, rest)) if !rest.is_empty() => Some(DatasetPath {
                components: rest.to_vec(),
            }),
            _ => None,
        }
    }

    /// Append all components of `suffix`.
    pub fn extend(&self, suffix: &DatasetPath) -> DatasetPath {
        let mut components = self.components.clone();
        components.extend(suffix.components.iter().cloned());
        DatasetPath { components }
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))
    }
}

impl FromStr for DatasetPath {
    type Err = DatasetPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DatasetPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatasetPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatasetPathError {
    #[error("dataset path '{0}' contains an empty component")]
    EmptyComponent(String),

    #[error("dataset path '{path}' contains invalid character '{character}'")]
    InvalidCharacter { path: String, character: char },
}
