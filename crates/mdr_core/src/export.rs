//! Export assembler: expands root identities into the closure of everything
//! needed to re-create them, as interchange payloads.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MdrError;
use crate::ports::Result;
use crate::registry::IdentityRegistry;
use crate::staging::StagedElementPayload;
use crate::types::{ElementType, Identity, IdentityId, JobStatus, Status};
use crate::urn::Urn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_by: String,
    pub full_export: bool,
    pub roots: Vec<Urn>,
    pub location: Option<String>,
    pub non_exportable: Vec<Urn>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(created_by: impl Into<String>, roots: Vec<Urn>, full_export: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Processing,
            created_by: created_by.into(),
            full_export,
            roots,
            location: None,
            non_exportable: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn finish(&mut self, location: String, non_exportable: Vec<Urn>) {
        self.status = JobStatus::Done;
        self.location = Some(location);
        self.non_exportable = non_exportable;
        self.updated_at = Utc::now();
    }

    pub fn abort(&mut self, error: &MdrError) {
        self.status = JobStatus::Aborted;
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
    }
}

/// Progress of one export, owned by the job that runs it.
#[derive(Debug, Default)]
pub struct ExportContext {
    visited: HashSet<IdentityId>,
    elements: Vec<StagedElementPayload>,
    non_exportable: Vec<Urn>,
    progress: usize,
}

impl ExportContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities processed so far.
    pub fn progress(&self) -> usize {
        self.progress
    }

    pub fn into_outcome(self) -> ExportOutcome {
        ExportOutcome {
            elements: self.elements,
            non_exportable: self.non_exportable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub elements: Vec<StagedElementPayload>,
    pub non_exportable: Vec<Urn>,
}

/// Serialized form written to the bundle store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub elements: Vec<StagedElementPayload>,
    #[serde(default)]
    pub non_exportable: Vec<String>,
}

impl ExportBundle {
    pub fn encode(outcome: &ExportOutcome) -> Result<Vec<u8>> {
        let bundle = ExportBundle {
            elements: outcome.elements.clone(),
            non_exportable: outcome.non_exportable.iter().map(Urn::to_string).collect(),
        };
        serde_json::to_vec_pretty(&bundle).map_err(|e| MdrError::Internal(e.into()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MdrError::InvalidInput(format!("not an export bundle: {e}")))
    }
}

#[derive(Clone)]
pub struct ExportAssembler {
    registry: IdentityRegistry,
}

impl ExportAssembler {
    pub fn new(registry: IdentityRegistry) -> Self {
        Self { registry }
    }

    /// Expand `roots` into `ctx`. Non-released identities are reported instead
    /// of exported unless `full_export` is set; their relatives are still walked.
    pub async fn closure(
        &self,
        ctx: &mut ExportContext,
        roots: &[Identity],
        full_export: bool,
    ) -> Result<()> {
        let element_types = ElementType::all_elements();
        let mut queue: VecDeque<Identity> = roots.iter().cloned().collect();
        while let Some(node) = queue.pop_front() {
            if !ctx.visited.insert(node.id) {
                continue;
            }
            ctx.progress += 1;

            let content = self.registry.content(node.id).await?;
            if node.is_namespace() {
                queue.extend(
                    self.registry
                        .visible_roots(&node, &element_types, true)
                        .await?,
                );
            } else {
                for reference in content.body.references() {
                    match self.registry.resolve(reference).await {
                        Ok(found) => queue.push_back(found),
                        Err(MdrError::NotFound(_)) => {
                            tracing::warn!(urn = %node.urn(), missing = %reference, "dangling reference skipped");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if full_export || node.status == Status::Released {
                ctx.elements
                    .push(StagedElementPayload::from_element(&node, &content));
            } else {
                ctx.non_exportable.push(node.urn());
            }
            tracing::debug!(urn = %node.urn(), progress = ctx.progress, "export visited");
        }
        Ok(())
    }

    pub async fn export(&self, roots: &[Identity], full_export: bool) -> Result<ExportOutcome> {
        let mut ctx = ExportContext::new();
        self.closure(&mut ctx, roots, full_export).await?;
        Ok(ctx.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::Identification;

    #[test]
    fn job_transitions() {
        let mut job = ExportJob::new("alice", vec![Urn::namespace("1", 1)], false);
        assert_eq!(job.status, JobStatus::Processing);
        job.finish(
            "memory://x".into(),
            vec![Urn::parse("urn:1:dataelement:2:1").unwrap()],
        );
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.location.as_deref(), Some("memory://x"));

        let mut failed = ExportJob::new("alice", vec![], true);
        failed.abort(&MdrError::NotFound("urn:1:namespace:1:1".into()));
        assert_eq!(failed.status, JobStatus::Aborted);
        assert!(failed.error.unwrap().contains("not found"));
    }

    #[test]
    fn bundle_is_camel_case_json() {
        let outcome = ExportOutcome {
            elements: vec![serde_json::from_value::<StagedElementPayload>(serde_json::json!({
                "identification": { "elementType": "permissiblevalue", "urn": "urn:1:permissiblevalue:1:1" },
                "value": "m"
            }))
            .unwrap()],
            non_exportable: vec![Urn::parse("urn:1:record:4:1").unwrap()],
        };
        let bytes = ExportBundle::encode(&outcome).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["nonExportable"][0], "urn:1:record:4:1");

        let decoded = ExportBundle::decode(&bytes).unwrap();
        assert_eq!(
            decoded.elements[0].identification,
            Identification {
                element_type: ElementType::PermissibleValue,
                staging_id: None,
                urn: Some("urn:1:permissiblevalue:1:1".into()),
                status: None,
            }
        );
        assert!(ExportBundle::decode(b"[]").is_err());
    }
}
