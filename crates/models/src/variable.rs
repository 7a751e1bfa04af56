//! Structured variable identities and trainable inventories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Component path of a trainable variable, e.g. `encoder/conv1/weights`.
///
/// Identities compare segment by segment; `encoder/conv1` is never equal to
/// (or a prefix match for) `encoder/conv10`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableId {
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid variable path '{0}'")]
pub struct InvalidVariableId(pub String);

impl VariableId {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, the component that owns the variable.
    pub fn component(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or_default()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }
}

impl FromStr for VariableId {
    type Err = InvalidVariableId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('/').map(str::to_string).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(InvalidVariableId(s.to_string()));
        }
        Ok(Self { segments })
    }
}

impl TryFrom<String> for VariableId {
    type Error = InvalidVariableId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VariableId> for String {
    fn from(id: VariableId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Init {
    /// Glorot uniform over `(fan_in, fan_out)` of a 2-D shape.
    Xavier,
    Zeros,
}

/// One entry of a model's trainable inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub id: VariableId,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl VariableSpec {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Host copy of one variable, the unit checkpoints are made of.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableValues {
    pub id: VariableId,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}
