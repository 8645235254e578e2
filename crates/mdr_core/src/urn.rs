//! URN codec: `urn:<namespace>:<elementType>:<identifier>:<version>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MdrError;
use crate::types::ElementType;

const PREFIX: &str = "urn";

/// The externally visible handle of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    pub namespace: String,
    pub element_type: ElementType,
    pub identifier: String,
    pub version: i32,
}

impl Urn {
    pub fn parse(s: &str) -> Result<Self, MdrError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 5 {
            return Err(MdrError::MalformedUrn(format!(
                "{s}: expected 5 colon-separated parts, got {}",
                parts.len()
            )));
        }
        if parts[0] != PREFIX {
            return Err(MdrError::MalformedUrn(format!(
                "{s}: must start with '{PREFIX}'"
            )));
        }
        if parts[1].parse::<u64>().is_err() {
            return Err(MdrError::MalformedUrn(format!(
                "{s}: namespace identifier '{}' is not numeric",
                parts[1]
            )));
        }
        let element_type = ElementType::parse(parts[2])?;
        if parts[3].is_empty() {
            return Err(MdrError::MalformedUrn(format!("{s}: empty identifier")));
        }
        let version = parts[4]
            .parse::<i32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| MdrError::MalformedUrn(format!("{s}: bad version '{}'", parts[4])))?;
        if element_type == ElementType::Namespace && parts[1] != parts[3] {
            return Err(MdrError::MalformedUrn(format!(
                "{s}: namespace urn must reference itself"
            )));
        }

        Ok(Self {
            namespace: parts[1].to_string(),
            element_type,
            identifier: parts[3].to_string(),
            version,
        })
    }

    /// URN of a namespace identity (self-referential).
    pub fn namespace(identifier: impl Into<String>, version: i32) -> Self {
        let identifier = identifier.into();
        Self {
            namespace: identifier.clone(),
            element_type: ElementType::Namespace,
            identifier,
            version,
        }
    }

    pub fn is_namespace(&self) -> bool {
        self.element_type == ElementType::Namespace
    }

    /// Same logical element, different version.
    pub fn with_version(&self, version: i32) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}:{}:{}:{}:{}",
            self.namespace, self.element_type, self.identifier, self.version
        )
    }
}

impl FromStr for Urn {
    type Err = MdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Urn {
    type Error = MdrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.to_string()
    }
}
