//! Content payload attached to an identity, and the ordering rules for
//! attaching/detaching it inside a `WriteBatch`.
//!
//! Content rows are owned by exactly one identity. Revisions and imports get a
//! deep copy; nothing is shared by reference.

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::MdrError;
use crate::ports::{IdentityRef, WriteBatch};
use crate::types::{ElementType, IdentityId, NewIdentity, RelationKind};
use crate::urn::Urn;

// ── Content rows ──────────────────────────────────────────────

/// Language-tagged designation + definition text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub language: String,
    pub designation: String,
    #[serde(default)]
    pub definition: String,
}

/// Free-form key/value annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub key: String,
    pub value: String,
}

/// Link to an external terminology concept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptAssociation {
    pub system: String,
    #[serde(default)]
    pub version: String,
    pub term: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub linktype: RelationKind,
}

// ── Value domain rules ────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Datatype {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Time,
    Datetime,
    Enumerated,
    Tbd,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRule {
    #[serde(default)]
    pub use_regex: bool,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub use_maximum_length: bool,
    #[serde(default)]
    pub maximum_length: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericRule {
    #[serde(default)]
    pub use_minimum: bool,
    #[serde(default)]
    pub use_maximum: bool,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub unit_of_measure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeRule {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub hour_format: Option<String>,
}

/// Validation rule of a value domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDomainBody {
    pub datatype: Datatype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTimeRule>,
}

impl ValueDomainBody {
    pub fn new(datatype: Datatype) -> Self {
        Self {
            datatype,
            text: None,
            numeric: None,
            datetime: None,
        }
    }

    /// Checks the rule is self-consistent and matches its datatype.
    pub fn validate(&self) -> Result<(), MdrError> {
        if let Some(text) = &self.text {
            if self.datatype != Datatype::String {
                return Err(MdrError::InvalidInput(format!(
                    "text rule on {} value domain",
                    self.datatype
                )));
            }
            if text.use_regex {
                let pattern = text.regex.as_deref().ok_or_else(|| {
                    MdrError::InvalidInput("use_regex set without a regex".into())
                })?;
                Regex::new(pattern)
                    .map_err(|e| MdrError::InvalidInput(format!("invalid regex: {e}")))?;
            }
            if text.use_maximum_length && text.maximum_length.map_or(true, |l| l <= 0) {
                return Err(MdrError::InvalidInput(
                    "maximum_length must be positive".into(),
                ));
            }
        }
        if let Some(numeric) = &self.numeric {
            if !matches!(self.datatype, Datatype::Integer | Datatype::Float) {
                return Err(MdrError::InvalidInput(format!(
                    "numeric rule on {} value domain",
                    self.datatype
                )));
            }
            if (numeric.use_minimum && numeric.minimum.is_none())
                || (numeric.use_maximum && numeric.maximum.is_none())
            {
                return Err(MdrError::InvalidInput(
                    "numeric bound enabled without a value".into(),
                ));
            }
            if let (true, true, Some(min), Some(max)) = (
                numeric.use_minimum,
                numeric.use_maximum,
                numeric.minimum,
                numeric.maximum,
            ) {
                if min > max {
                    return Err(MdrError::InvalidInput(format!(
                        "minimum {min} exceeds maximum {max}"
                    )));
                }
            }
        }
        if self.datetime.is_some()
            && !matches!(
                self.datatype,
                Datatype::Date | Datatype::Time | Datatype::Datetime
            )
        {
            return Err(MdrError::InvalidInput(format!(
                "datetime rule on {} value domain",
                self.datatype
            )));
        }
        Ok(())
    }
}

// ── Type-specific body ────────────────────────────────────────

/// Kind-specific payload. One variant per element type; dispatch sites match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementBody {
    Namespace {
        #[serde(default)]
        hidden: bool,
    },
    DataElement {
        value_domain: Urn,
    },
    DataElementGroup {
        members: Vec<Urn>,
    },
    Record {
        members: Vec<Urn>,
    },
    DescribedValueDomain {
        domain: ValueDomainBody,
    },
    EnumeratedValueDomain {
        domain: ValueDomainBody,
        permitted_values: Vec<Urn>,
    },
    PermissibleValue {
        value: String,
    },
}

impl ElementBody {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Namespace { .. } => ElementType::Namespace,
            Self::DataElement { .. } => ElementType::DataElement,
            Self::DataElementGroup { .. } => ElementType::DataElementGroup,
            Self::Record { .. } => ElementType::Record,
            Self::DescribedValueDomain { .. } => ElementType::DescribedValueDomain,
            Self::EnumeratedValueDomain { .. } => ElementType::EnumeratedValueDomain,
            Self::PermissibleValue { .. } => ElementType::PermissibleValue,
        }
    }

    /// Children held as membership edges.
    pub fn members(&self) -> &[Urn] {
        match self {
            Self::DataElementGroup { members } | Self::Record { members } => members,
            Self::EnumeratedValueDomain {
                permitted_values, ..
            } => permitted_values,
            Self::Namespace { .. }
            | Self::DataElement { .. }
            | Self::DescribedValueDomain { .. }
            | Self::PermissibleValue { .. } => &[],
        }
    }

    /// Every URN this body points at (members plus the data element's value domain).
    pub fn references(&self) -> Vec<&Urn> {
        match self {
            Self::DataElement { value_domain } => vec![value_domain],
            other => other.members().iter().collect(),
        }
    }

    /// Rewrite every reference, e.g. after importing referenced elements.
    pub fn map_references<F>(&self, mut f: F) -> Result<Self, MdrError>
    where
        F: FnMut(&Urn) -> Result<Urn, MdrError>,
    {
        Ok(match self {
            Self::DataElement { value_domain } => Self::DataElement {
                value_domain: f(value_domain)?,
            },
            Self::DataElementGroup { members } => Self::DataElementGroup {
                members: map_all(members, &mut f)?,
            },
            Self::Record { members } => Self::Record {
                members: map_all(members, &mut f)?,
            },
            Self::EnumeratedValueDomain {
                domain,
                permitted_values,
            } => Self::EnumeratedValueDomain {
                domain: domain.clone(),
                permitted_values: map_all(permitted_values, &mut f)?,
            },
            Self::Namespace { .. }
            | Self::DescribedValueDomain { .. }
            | Self::PermissibleValue { .. } => self.clone(),
        })
    }

    fn validate(&self) -> Result<(), MdrError> {
        match self {
            Self::Namespace { .. } | Self::DataElementGroup { .. } | Self::Record { .. } => Ok(()),
            Self::DataElement { value_domain } => {
                if value_domain.element_type.is_value_domain() {
                    Ok(())
                } else {
                    Err(MdrError::InvalidInput(format!(
                        "data element value domain {value_domain} is not a value domain"
                    )))
                }
            }
            Self::DescribedValueDomain { domain } => {
                if domain.datatype == Datatype::Enumerated {
                    return Err(MdrError::InvalidInput(
                        "described value domain cannot be ENUMERATED".into(),
                    ));
                }
                domain.validate()
            }
            Self::EnumeratedValueDomain {
                domain,
                permitted_values,
            } => {
                if let Some(bad) = permitted_values
                    .iter()
                    .find(|u| u.element_type != ElementType::PermissibleValue)
                {
                    return Err(MdrError::InvalidInput(format!(
                        "{bad} is not a permissible value"
                    )));
                }
                domain.validate()
            }
            Self::PermissibleValue { value } => {
                if value.is_empty() {
                    Err(MdrError::InvalidInput("empty permissible value".into()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn map_all<F>(urns: &[Urn], f: &mut F) -> Result<Vec<Urn>, MdrError>
where
    F: FnMut(&Urn) -> Result<Urn, MdrError>,
{
    urns.iter().map(|u| f(u)).collect()
}

// ── Content ───────────────────────────────────────────────────

/// Everything attached to one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub definitions: Vec<Definition>,
    #[serde(default)]
    pub slots: Vec<Slot>,
    #[serde(default)]
    pub concept_associations: Vec<ConceptAssociation>,
    pub body: ElementBody,
}

impl Content {
    pub fn new(body: ElementBody) -> Self {
        Self {
            definitions: Vec::new(),
            slots: Vec::new(),
            concept_associations: Vec::new(),
            body,
        }
    }

    pub fn with_definition(
        mut self,
        language: impl Into<String>,
        designation: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        self.definitions.push(Definition {
            language: language.into(),
            designation: designation.into(),
            definition: definition.into(),
        });
        self
    }

    pub fn with_slot(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.slots.push(Slot {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn element_type(&self) -> ElementType {
        self.body.element_type()
    }

    /// First definition matching the language preference, else the first one stored.
    pub fn definition_for<S: AsRef<str>>(&self, preferences: &[S]) -> Option<&Definition> {
        preferences
            .iter()
            .find_map(|lang| {
                self.definitions
                    .iter()
                    .find(|d| d.language.eq_ignore_ascii_case(lang.as_ref()))
            })
            .or_else(|| self.definitions.first())
    }

    /// Validate shape before anything is persisted.
    pub fn validate(&self) -> Result<(), MdrError> {
        if self.definitions.is_empty() {
            return Err(MdrError::InvalidInput(format!(
                "{} needs at least one definition",
                self.element_type()
            )));
        }
        if let Some(d) = self
            .definitions
            .iter()
            .find(|d| d.designation.trim().is_empty())
        {
            return Err(MdrError::InvalidInput(format!(
                "empty designation for language '{}'",
                d.language
            )));
        }
        let mut languages: Vec<&str> = self
            .definitions
            .iter()
            .map(|d| d.language.as_str())
            .collect();
        languages.sort_unstable();
        if languages.windows(2).any(|w| w[0].eq_ignore_ascii_case(w[1])) {
            return Err(MdrError::InvalidInput(
                "duplicate definition language".into(),
            ));
        }
        self.body.validate()
    }
}

// ── Attach / detach ordering ──────────────────────────────────

/// Attach a new identity with its content and member edges.
///
/// Order inside the batch: identity row (with definitions, slots and concept
/// associations), then one edge per member in body order. `members` must be the
/// already-resolved refs of `content.body.members()`, same order.
pub fn attach(
    batch: &mut WriteBatch,
    identity: NewIdentity,
    content: Content,
    members: &[IdentityRef],
) -> IdentityRef {
    let target = batch.insert(identity, content);
    add_member_edges(batch, target, members);
    target
}

/// Replace the content of an existing identity in place, rebuilding its edges.
pub fn replace(
    batch: &mut WriteBatch,
    id: IdentityId,
    content: Content,
    members: &[IdentityRef],
) {
    batch.clear_members(id);
    batch.replace_content(id, content);
    add_member_edges(batch, IdentityRef::Existing(id), members);
}

/// Drop an identity and everything attached to it.
pub fn detach(batch: &mut WriteBatch, id: IdentityId) {
    batch.clear_members(id);
    batch.delete(id);
}

fn add_member_edges(batch: &mut WriteBatch, target: IdentityRef, members: &[IdentityRef]) {
    for (ordinal, member) in members.iter().enumerate() {
        batch.add_edge(target, *member, ordinal as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(s: &str) -> Urn {
        Urn::parse(s).unwrap()
    }

    #[test]
    fn definition_for_respects_preference_order() {
        let c = Content::new(ElementBody::PermissibleValue { value: "m".into() })
            .with_definition("de", "männlich", "")
            .with_definition("en", "male", "");
        assert_eq!(c.definition_for(&["en", "de"]).unwrap().designation, "male");
        assert_eq!(c.definition_for(&["fr", "DE"]).unwrap().designation, "männlich");
        assert_eq!(c.definition_for::<&str>(&[]).unwrap().designation, "männlich");
    }

    #[test]
    fn content_requires_definition() {
        let c = Content::new(ElementBody::PermissibleValue { value: "x".into() });
        assert!(matches!(c.validate(), Err(MdrError::InvalidInput(_))));
    }

    #[test]
    fn duplicate_languages_rejected() {
        let c = Content::new(ElementBody::PermissibleValue { value: "x".into() })
            .with_definition("en", "a", "")
            .with_definition("EN", "b", "");
        assert!(matches!(c.validate(), Err(MdrError::InvalidInput(_))));
    }

    #[test]
    fn data_element_must_point_at_value_domain() {
        let c = Content::new(ElementBody::DataElement {
            value_domain: urn("urn:1:dataelement:3:1"),
        })
        .with_definition("en", "age", "");
        assert!(c.validate().is_err());

        let ok = Content::new(ElementBody::DataElement {
            value_domain: urn("urn:1:describedvaluedomain:3:1"),
        })
        .with_definition("en", "age", "");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn value_domain_rules() {
        let mut vd = ValueDomainBody::new(Datatype::String);
        vd.text = Some(TextRule {
            use_regex: true,
            regex: Some("[a-z".into()),
            ..Default::default()
        });
        assert!(vd.validate().is_err());

        vd.text = Some(TextRule {
            use_regex: true,
            regex: Some("^[a-z]+$".into()),
            use_maximum_length: true,
            maximum_length: Some(12),
        });
        assert!(vd.validate().is_ok());

        let mut num = ValueDomainBody::new(Datatype::Integer);
        num.numeric = Some(NumericRule {
            use_minimum: true,
            use_maximum: true,
            minimum: Some(10.0),
            maximum: Some(1.0),
            unit_of_measure: None,
        });
        assert!(num.validate().is_err());

        let mut wrong = ValueDomainBody::new(Datatype::Boolean);
        wrong.numeric = Some(NumericRule::default());
        assert!(wrong.validate().is_err());
    }

    #[test]
    fn enumerated_domain_members_must_be_permissible_values() {
        let body = ElementBody::EnumeratedValueDomain {
            domain: ValueDomainBody::new(Datatype::Enumerated),
            permitted_values: vec![urn("urn:1:dataelement:3:1")],
        };
        let c = Content::new(body).with_definition("en", "sex", "");
        assert!(c.validate().is_err());
    }

    #[test]
    fn map_references_rewrites_members_and_value_domain() {
        let body = ElementBody::Record {
            members: vec![urn("urn:2:dataelement:1:1"), urn("urn:2:dataelement:2:4")],
        };
        let mapped = body
            .map_references(|u| {
                Ok(Urn {
                    namespace: "9".into(),
                    ..u.clone()
                })
            })
            .unwrap();
        assert!(mapped.members().iter().all(|u| u.namespace == "9"));

        let de = ElementBody::DataElement {
            value_domain: urn("urn:2:describedvaluedomain:5:1"),
        };
        assert_eq!(de.references().len(), 1);
        assert!(de.members().is_empty());
    }

    #[test]
    fn body_serde_is_tagged() {
        let body = ElementBody::PermissibleValue { value: "f".into() };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "permissible_value");
        assert_eq!(json["value"], "f");
    }
}
