//! Staged import: the interchange payload, job records and the conversion pipeline.
//!
//! Imports and exports use the same `StagedElementPayload` schema. A payload
//! references other elements either by the staging id of another element in
//! the same job, or by the URN of an identity that already exists.

pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::{
    ConceptAssociation, Content, Datatype, DateTimeRule, Definition, ElementBody, NumericRule,
    Slot, TextRule, ValueDomainBody,
};
use crate::error::MdrError;
use crate::types::{ElementType, Identity, IdentityId, JobStatus, Status};
use crate::urn::Urn;

pub use pipeline::{ConversionReport, ConvertedItem, JobLocks, StagingPipeline};

// ── Interchange payload ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub element_type: ElementType,
    /// Explicit staging id; falls back to `urn` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// One element of an import or export bundle. Exactly the fields of its kind are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedElementPayload {
    pub identification: Identification,
    #[serde(default)]
    pub definitions: Vec<Definition>,
    #[serde(default)]
    pub slots: Vec<Slot>,
    #[serde(default)]
    pub concept_associations: Vec<ConceptAssociation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_domain_urn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub datatype: Option<Datatype>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTimeRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permitted_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// URN of a permissible value in its source registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    /// Namespace listing flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

impl StagedElementPayload {
    fn empty(identification: Identification) -> Self {
        Self {
            identification,
            definitions: Vec::new(),
            slots: Vec::new(),
            concept_associations: Vec::new(),
            value_domain_urn: None,
            members: None,
            datatype: None,
            text: None,
            numeric: None,
            datetime: None,
            permitted_values: None,
            value: None,
            urn: None,
            hidden: None,
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.identification.element_type
    }

    /// Key of this element inside its job.
    pub fn staging_id(&self) -> Result<String, MdrError> {
        self.identification
            .staging_id
            .as_ref()
            .or(self.identification.urn.as_ref())
            .or(self.urn.as_ref())
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                MdrError::InvalidInput(format!(
                    "{} payload has neither stagingId nor urn",
                    self.element_type()
                ))
            })
    }

    /// Every reference this payload makes, in body order.
    pub fn dependencies(&self) -> Vec<&str> {
        self.value_domain_urn
            .iter()
            .chain(self.members.iter().flatten())
            .chain(self.permitted_values.iter().flatten())
            .map(String::as_str)
            .collect()
    }

    /// Payload of an existing identity. References are written as URNs, which
    /// double as staging ids when the bundle is imported again.
    pub fn from_element(identity: &Identity, content: &Content) -> Self {
        let urn = identity.urn().to_string();
        let mut payload = Self::empty(Identification {
            element_type: identity.element_type,
            staging_id: None,
            urn: Some(urn.clone()),
            status: Some(identity.status),
        });
        payload.definitions = content.definitions.clone();
        payload.slots = content.slots.clone();
        payload.concept_associations = content.concept_associations.clone();

        let strings = |urns: &[Urn]| urns.iter().map(Urn::to_string).collect::<Vec<_>>();
        match &content.body {
            ElementBody::Namespace { hidden } => payload.hidden = Some(*hidden),
            ElementBody::DataElement { value_domain } => {
                payload.value_domain_urn = Some(value_domain.to_string());
            }
            ElementBody::DataElementGroup { members } | ElementBody::Record { members } => {
                payload.members = Some(strings(members));
            }
            ElementBody::DescribedValueDomain { domain } => payload.set_domain(domain),
            ElementBody::EnumeratedValueDomain {
                domain,
                permitted_values,
            } => {
                payload.set_domain(domain);
                payload.permitted_values = Some(strings(permitted_values));
            }
            ElementBody::PermissibleValue { value } => {
                payload.value = Some(value.clone());
                payload.urn = Some(urn);
            }
        }
        payload
    }

    fn set_domain(&mut self, domain: &ValueDomainBody) {
        self.datatype = Some(domain.datatype);
        self.text = domain.text.clone();
        self.numeric = domain.numeric.clone();
        self.datetime = domain.datetime.clone();
    }

    fn domain(&self, default: Option<Datatype>) -> Result<ValueDomainBody, MdrError> {
        let datatype = self.datatype.or(default).ok_or_else(|| {
            MdrError::InvalidInput(format!("{} payload needs a type", self.element_type()))
        })?;
        Ok(ValueDomainBody {
            datatype,
            text: self.text.clone(),
            numeric: self.numeric.clone(),
            datetime: self.datetime.clone(),
        })
    }

    /// Build content, mapping each reference through `resolve`.
    pub fn to_content<F>(&self, mut resolve: F) -> Result<Content, MdrError>
    where
        F: FnMut(&str) -> Result<Urn, MdrError>,
    {
        let missing = |field: &str| {
            MdrError::InvalidInput(format!(
                "{} payload is missing {field}",
                self.element_type()
            ))
        };
        let mut resolve_all = |refs: &[String]| -> Result<Vec<Urn>, MdrError> {
            refs.iter().map(|r| resolve(r)).collect()
        };
        let body = match self.element_type() {
            ElementType::Namespace => ElementBody::Namespace {
                hidden: self.hidden.unwrap_or_default(),
            },
            ElementType::DataElement => {
                let reference = self
                    .value_domain_urn
                    .as_ref()
                    .ok_or_else(|| missing("valueDomainUrn"))?;
                let value_domain = resolve_all(std::slice::from_ref(reference))?
                    .pop()
                    .ok_or_else(|| missing("valueDomainUrn"))?;
                ElementBody::DataElement { value_domain }
            }
            ElementType::DataElementGroup => ElementBody::DataElementGroup {
                members: resolve_all(self.members.as_deref().unwrap_or_default())?,
            },
            ElementType::Record => ElementBody::Record {
                members: resolve_all(self.members.as_deref().unwrap_or_default())?,
            },
            ElementType::DescribedValueDomain => ElementBody::DescribedValueDomain {
                domain: self.domain(None)?,
            },
            ElementType::EnumeratedValueDomain => ElementBody::EnumeratedValueDomain {
                domain: self.domain(Some(Datatype::Enumerated))?,
                permitted_values: resolve_all(self.permitted_values.as_deref().unwrap_or_default())?,
            },
            ElementType::PermissibleValue => ElementBody::PermissibleValue {
                value: self.value.clone().ok_or_else(|| missing("value"))?,
            },
        };
        Ok(Content {
            definitions: self.definitions.clone(),
            slots: self.slots.clone(),
            concept_associations: self.concept_associations.clone(),
            body,
        })
    }
}

// ── Job records ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub target_namespace: Urn,
    pub status: JobStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(target_namespace: Urn, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target_namespace,
            status: JobStatus::Processing,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One payload of an import job and its conversion state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedElement {
    pub job_id: Uuid,
    pub staging_id: String,
    pub element_type: ElementType,
    pub payload: StagedElementPayload,
    pub converted: Option<IdentityId>,
    pub error: Option<String>,
}

impl StagedElement {
    pub fn new(job_id: Uuid, payload: StagedElementPayload) -> Result<Self, MdrError> {
        Ok(Self {
            job_id,
            staging_id: payload.staging_id()?,
            element_type: payload.element_type(),
            payload,
            converted: None,
            error: None,
        })
    }
}

/// A staged element that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unconvertable {
    pub staging_id: String,
    pub code: String,
    pub reason: String,
}

impl Unconvertable {
    pub fn new(staging_id: impl Into<String>, cause: &MdrError) -> Self {
        Self {
            staging_id: staging_id.into(),
            code: cause.code().to_string(),
            reason: cause.to_string(),
        }
    }

    /// Text stored on the staged row.
    pub fn to_row_error(&self) -> String {
        format!("{}: {}", self.code, self.reason)
    }

    pub fn from_row(row: &StagedElement) -> Option<Self> {
        let error = row.error.as_deref()?;
        let (code, reason) = error.split_once(": ").unwrap_or(("CONVERSION_FAILED", error));
        Some(Self {
            staging_id: row.staging_id.clone(),
            code: code.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Job record plus per-item progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub job: ImportJob,
    pub total: usize,
    pub converted: usize,
    pub pending: usize,
    pub unconvertable: Vec<Unconvertable>,
}

impl ImportReport {
    pub fn new(job: ImportJob, rows: &[StagedElement]) -> Self {
        let unconvertable: Vec<Unconvertable> = rows
            .iter()
            .filter(|r| r.converted.is_none())
            .filter_map(Unconvertable::from_row)
            .collect();
        let converted = rows.iter().filter(|r| r.converted.is_some()).count();
        Self {
            job,
            total: rows.len(),
            converted,
            pending: rows.len() - converted - unconvertable.len(),
            unconvertable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NamespaceId;
    use serde_json::json;

    fn urn(s: &str) -> Urn {
        Urn::parse(s).unwrap()
    }

    #[test]
    fn payload_reads_camel_case() {
        let payload: StagedElementPayload = serde_json::from_value(json!({
            "identification": { "elementType": "dataelement", "stagingId": "age" },
            "definitions": [{ "language": "en", "designation": "Age", "definition": "in years" }],
            "valueDomainUrn": "age-vd"
        }))
        .unwrap();
        assert_eq!(payload.staging_id().unwrap(), "age");
        assert_eq!(payload.dependencies(), vec!["age-vd"]);
        let content = payload
            .to_content(|r| {
                assert_eq!(r, "age-vd");
                Ok(urn("urn:4:describedvaluedomain:9:1"))
            })
            .unwrap();
        assert!(content.validate().is_ok());
    }

    #[test]
    fn staging_id_falls_back_to_urn() {
        let payload = StagedElementPayload::empty(Identification {
            element_type: ElementType::PermissibleValue,
            staging_id: None,
            urn: Some("urn:1:permissiblevalue:3:1".into()),
            status: None,
        });
        assert_eq!(payload.staging_id().unwrap(), "urn:1:permissiblevalue:3:1");

        let anonymous = StagedElementPayload::empty(Identification {
            element_type: ElementType::Record,
            staging_id: None,
            urn: None,
            status: None,
        });
        assert!(matches!(anonymous.staging_id(), Err(MdrError::InvalidInput(_))));
    }

    #[test]
    fn missing_kind_fields_are_rejected() {
        let payload = StagedElementPayload::empty(Identification {
            element_type: ElementType::DescribedValueDomain,
            staging_id: Some("vd".into()),
            urn: None,
            status: None,
        });
        let err = payload.to_content(|_| unreachable!()).unwrap_err();
        assert!(matches!(err, MdrError::InvalidInput(m) if m.contains("type")));
    }

    #[test]
    fn from_element_writes_references_as_urns() {
        let identity = Identity {
            id: IdentityId(7),
            element_type: ElementType::EnumeratedValueDomain,
            namespace_id: NamespaceId(1),
            namespace_identifier: "1".into(),
            identifier: "5".into(),
            version: 2,
            status: Status::Released,
            uuid: Uuid::new_v4(),
            created_by: "x".into(),
            created_at: Utc::now(),
        };
        let content = Content::new(ElementBody::EnumeratedValueDomain {
            domain: ValueDomainBody::new(Datatype::Enumerated),
            permitted_values: vec![urn("urn:1:permissiblevalue:1:1")],
        })
        .with_definition("en", "sex", "");
        let payload = StagedElementPayload::from_element(&identity, &content);
        assert_eq!(
            payload.identification.urn.as_deref(),
            Some("urn:1:enumeratedvaluedomain:5:2")
        );
        assert_eq!(payload.dependencies(), vec!["urn:1:permissiblevalue:1:1"]);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "ENUMERATED");
        assert!(json.get("valueDomainUrn").is_none());
        assert_eq!(json["permittedValues"][0], "urn:1:permissiblevalue:1:1");
    }

    #[test]
    fn namespace_keeps_hidden_flag() {
        let identity = Identity {
            id: IdentityId(1),
            element_type: ElementType::Namespace,
            namespace_id: NamespaceId(1),
            namespace_identifier: "3".into(),
            identifier: "3".into(),
            version: 1,
            status: Status::Released,
            uuid: Uuid::new_v4(),
            created_by: "x".into(),
            created_at: Utc::now(),
        };
        let content = Content::new(ElementBody::Namespace { hidden: true })
            .with_definition("en", "internal", "");
        let payload = StagedElementPayload::from_element(&identity, &content);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["hidden"], true);

        let back: StagedElementPayload = serde_json::from_value(json).unwrap();
        let copied = back.to_content(|_| unreachable!()).unwrap();
        assert_eq!(copied.body, ElementBody::Namespace { hidden: true });

        let mut plain = back;
        plain.hidden = None;
        let defaulted = plain.to_content(|_| unreachable!()).unwrap();
        assert_eq!(defaulted.body, ElementBody::Namespace { hidden: false });
    }

    #[test]
    fn report_counts_items() {
        let job = ImportJob::new(Urn::namespace("1", 1), "alice");
        let payload = |id: &str| {
            let mut p = StagedElementPayload::empty(Identification {
                element_type: ElementType::PermissibleValue,
                staging_id: Some(id.into()),
                urn: None,
                status: None,
            });
            p.value = Some(id.into());
            p
        };
        let mut rows: Vec<StagedElement> = ["a", "b", "c"]
            .iter()
            .map(|id| StagedElement::new(job.id, payload(id)).unwrap())
            .collect();
        rows[0].converted = Some(IdentityId(1));
        rows[1].error = Some(
            Unconvertable::new("b", &MdrError::NotFound("urn:1:dataelement:1:1".into()))
                .to_row_error(),
        );
        let report = ImportReport::new(job, &rows);
        assert_eq!((report.total, report.converted, report.pending), (3, 1, 1));
        assert_eq!(report.unconvertable[0].code, "NOT_FOUND");
    }
}
