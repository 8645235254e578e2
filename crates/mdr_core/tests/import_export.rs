//! Staged imports and export bundles over the in-memory adapter.
//!
//! Jobs run as background tasks; tests poll the job record until it leaves
//! PROCESSING.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use mdr_core::content::{Content, Datatype, ElementBody, ValueDomainBody};
use mdr_core::export::ExportJob;
use mdr_core::in_memory::InMemoryRegistry;
use mdr_core::staging::{ImportReport, StagedElementPayload};
use mdr_core::types::{ElementType, JobStatus, Status};
use mdr_core::{MdrError, Principal, RegistryService, RegistryServiceImpl, Urn};

// ── Fixtures ───────────────────────────────────────────────────

fn admin() -> Principal {
    Principal::admin("alice")
}

fn payload(value: serde_json::Value) -> StagedElementPayload {
    serde_json::from_value(value).unwrap()
}

fn staged_vd(id: &str, name: &str) -> StagedElementPayload {
    payload(json!({
        "identification": { "elementType": "describedvaluedomain", "stagingId": id },
        "definitions": [{ "language": "en", "designation": name, "definition": "" }],
        "type": "INTEGER"
    }))
}

fn staged_de(id: &str, name: &str, value_domain: &str) -> StagedElementPayload {
    payload(json!({
        "identification": { "elementType": "dataelement", "stagingId": id },
        "definitions": [{ "language": "en", "designation": name, "definition": "" }],
        "valueDomainUrn": value_domain
    }))
}

fn staged_group(id: &str, members: &[&str]) -> StagedElementPayload {
    payload(json!({
        "identification": { "elementType": "dataelementgroup", "stagingId": id },
        "definitions": [{ "language": "en", "designation": id, "definition": "" }],
        "members": members
    }))
}

fn setup() -> (Arc<InMemoryRegistry>, RegistryServiceImpl) {
    let store = InMemoryRegistry::new();
    let svc = store.service();
    (store, svc)
}

async fn namespace(svc: &RegistryServiceImpl, status: Status) -> Urn {
    let content =
        Content::new(ElementBody::Namespace { hidden: false }).with_definition("en", "Study", "");
    svc.create_namespace(&admin(), content, status)
        .await
        .unwrap()
        .urn()
}

async fn wait_import(svc: &RegistryServiceImpl, job_id: Uuid) -> ImportReport {
    for _ in 0..200 {
        let report = svc.import_status(&admin(), job_id).await.unwrap();
        if report.job.status != JobStatus::Processing {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("import {job_id} did not finish");
}

async fn wait_export(svc: &RegistryServiceImpl, job_id: Uuid) -> ExportJob {
    for _ in 0..200 {
        let job = svc.export_status(&admin(), job_id).await.unwrap();
        if job.status != JobStatus::Processing {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("export {job_id} did not finish");
}

// ── Import ─────────────────────────────────────────────────────

#[tokio::test]
async fn import_converts_dependencies_first() {
    let (store, svc) = setup();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;

    // Submitted parents first; conversion still lands leaves before groups.
    let job = svc
        .submit_import(
            &p,
            &ns,
            vec![
                staged_group("vitals", &["height", "weight"]),
                staged_de("height", "Height", "cm"),
                staged_de("weight", "Weight", "kg"),
                staged_vd("cm", "Centimetres"),
                staged_vd("kg", "Kilograms"),
            ],
        )
        .await
        .unwrap();
    let report = wait_import(&svc, job).await;
    assert_eq!(report.job.status, JobStatus::Done);
    assert_eq!(report.total, 5);
    assert_eq!(report.converted, 5);
    assert_eq!(report.pending, 0);
    assert!(report.unconvertable.is_empty());
    // namespace + five elements
    assert_eq!(store.identity_count().await, 6);

    let roots = svc
        .visible_roots(&p, &ns, &[ElementType::DataElementGroup], true)
        .await
        .unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].status, Status::Draft);
    let members = svc.members(&p, &roots[0].urn()).await.unwrap();
    let names: Vec<Option<String>> = {
        let mut out = Vec::new();
        for m in &members {
            out.push(svc.describe(&p, &m.urn()).await.unwrap().designation);
        }
        out
    };
    assert_eq!(names, vec![Some("Height".into()), Some("Weight".into())]);
}

#[tokio::test]
async fn converting_twice_creates_nothing_new() {
    let (store, svc) = setup();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let job = svc
        .submit_import(&p, &ns, vec![staged_vd("vd", "Count"), staged_de("de", "N", "vd")])
        .await
        .unwrap();
    wait_import(&svc, job).await;
    let before = store.identity_count().await;

    let again = svc
        .convert_staged(&p, job, &["de".to_string(), "vd".to_string()])
        .await
        .unwrap();
    assert!(again.converted.is_empty());
    assert!(again.unconvertable.is_empty());
    assert_eq!(store.identity_count().await, before);

    let all = svc.convert_all(&p, job).await.unwrap();
    assert!(all.converted.is_empty());
    assert_eq!(store.identity_count().await, before);
}

#[tokio::test]
async fn concurrent_conversions_of_one_job_do_not_duplicate() {
    let (store, svc) = setup();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let job = svc
        .submit_import(
            &p,
            &ns,
            vec![
                staged_vd("vd", "Score"),
                staged_de("a", "A", "vd"),
                staged_de("b", "B", "vd"),
            ],
        )
        .await
        .unwrap();

    let ids = ["a".to_string(), "b".to_string()];
    let (left, right) = tokio::join!(
        svc.convert_staged(&p, job, &ids),
        svc.convert_staged(&p, job, &ids)
    );
    let converted = left.unwrap().converted.len() + right.unwrap().converted.len();
    assert!(converted <= 3);

    wait_import(&svc, job).await;
    assert_eq!(store.identity_count().await, 4);
}

#[tokio::test]
async fn failures_are_isolated_per_element() {
    let (store, svc) = setup();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let job = svc
        .submit_import(
            &p,
            &ns,
            vec![
                staged_vd("vd", "Score"),
                staged_de("good", "Good", "vd"),
                staged_de("bad", "Bad", "nowhere"),
                staged_group("mixed", &["good", "bad"]),
                staged_group("loop-a", &["loop-b"]),
                staged_group("loop-b", &["loop-a"]),
            ],
        )
        .await
        .unwrap();
    let report = wait_import(&svc, job).await;
    assert_eq!(report.job.status, JobStatus::Done);
    assert_eq!(report.converted, 2);
    assert_eq!(report.pending, 0);

    let mut failed: Vec<&str> = report
        .unconvertable
        .iter()
        .map(|u| u.staging_id.as_str())
        .collect();
    failed.sort_unstable();
    assert_eq!(failed, vec!["bad", "loop-a", "loop-b", "mixed"]);

    let bad = report
        .unconvertable
        .iter()
        .find(|u| u.staging_id == "bad")
        .unwrap();
    assert_eq!(bad.code, "MALFORMED_URN");
    let mixed = report
        .unconvertable
        .iter()
        .find(|u| u.staging_id == "mixed")
        .unwrap();
    assert_eq!(mixed.code, "CONVERSION_FAILED");

    // namespace + vd + good
    assert_eq!(store.identity_count().await, 3);
}

#[tokio::test]
async fn submit_rejects_bad_jobs_up_front() {
    let (_, svc) = setup();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;

    let err = svc.submit_import(&p, &ns, Vec::new()).await.unwrap_err();
    assert!(matches!(err, MdrError::InvalidInput(_)));

    let err = svc
        .submit_import(&p, &ns, vec![staged_vd("x", "a"), staged_vd("x", "b")])
        .await
        .unwrap_err();
    assert!(matches!(err, MdrError::InvalidInput(_)));

    let not_a_namespace = Urn::parse("urn:1:dataelement:1:1").unwrap();
    assert!(svc
        .submit_import(&p, &not_a_namespace, vec![staged_vd("x", "a")])
        .await
        .is_err());
}

#[tokio::test]
async fn deleted_import_is_gone() {
    let (_, svc) = setup();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let job = svc
        .submit_import(&p, &ns, vec![staged_vd("vd", "Score")])
        .await
        .unwrap();
    wait_import(&svc, job).await;

    svc.delete_import(&p, job).await.unwrap();
    let err = svc.import_status(&p, job).await.unwrap_err();
    assert!(matches!(err, MdrError::NotFound(_)));
}

// ── Export ─────────────────────────────────────────────────────

/// Released namespace with a released data element held by a draft group.
async fn seeded(svc: &RegistryServiceImpl) -> (Urn, Urn) {
    let p = admin();
    let ns = namespace(svc, Status::Released).await;
    let vd = svc
        .create_element(
            &p,
            &ns,
            Content::new(ElementBody::DescribedValueDomain {
                domain: ValueDomainBody::new(Datatype::Integer),
            })
            .with_definition("en", "Years", ""),
            Status::Released,
        )
        .await
        .unwrap()
        .urn();
    let de = svc
        .create_element(
            &p,
            &ns,
            Content::new(ElementBody::DataElement { value_domain: vd })
                .with_definition("en", "Age", ""),
            Status::Released,
        )
        .await
        .unwrap()
        .urn();
    let group = svc
        .create_element(
            &p,
            &ns,
            Content::new(ElementBody::DataElementGroup {
                members: vec![de.clone()],
            })
            .with_definition("en", "Demographics", ""),
            Status::Draft,
        )
        .await
        .unwrap()
        .urn();
    (ns, group)
}

fn shape(elements: &[StagedElementPayload]) -> Vec<(ElementType, String)> {
    let mut out: Vec<(ElementType, String)> = elements
        .iter()
        .filter(|e| e.identification.element_type != ElementType::Namespace)
        .map(|e| {
            let name = e
                .definitions
                .first()
                .map(|d| d.designation.clone())
                .unwrap_or_default();
            (e.identification.element_type, name)
        })
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn closure_reports_unreleased_unless_full() {
    let (_, svc) = setup();
    let p = admin();
    let (ns, group) = seeded(&svc).await;

    let partial = svc.export_closure(&p, &[ns.clone()], false).await.unwrap();
    assert_eq!(partial.non_exportable, vec![group.clone()]);
    assert_eq!(
        shape(&partial.elements),
        vec![
            (ElementType::DataElement, "Age".to_string()),
            (ElementType::DescribedValueDomain, "Years".to_string()),
        ]
    );

    let full = svc.export_closure(&p, &[ns], true).await.unwrap();
    assert!(full.non_exportable.is_empty());
    assert_eq!(full.elements.len(), 4);

    // Rooted at the group, the closure still reaches the value domain.
    let from_group = svc.export_closure(&p, &[group], true).await.unwrap();
    assert_eq!(from_group.elements.len(), 3);
}

#[tokio::test]
async fn export_then_import_reproduces_structure() {
    let (_, svc) = setup();
    let p = admin();
    let (source_ns, _) = seeded(&svc).await;

    let export = svc
        .submit_export(&p, &[source_ns.clone()], true)
        .await
        .unwrap();
    let job = wait_export(&svc, export).await;
    assert_eq!(job.status, JobStatus::Done);
    let location = job.location.clone().unwrap();
    let bundle = svc.load_bundle(&p, &location).await.unwrap();
    assert_eq!(bundle.len(), 4);

    let target_ns = namespace(&svc, Status::Draft).await;
    let import = svc
        .submit_import(&p, &target_ns, bundle.clone())
        .await
        .unwrap();
    let report = wait_import(&svc, import).await;
    assert_eq!(report.job.status, JobStatus::Done);
    assert!(report.unconvertable.is_empty());

    let copy = svc
        .export_closure(&p, &[target_ns.clone()], true)
        .await
        .unwrap();
    assert_eq!(shape(&copy.elements), shape(&bundle));

    let roots = svc
        .visible_roots(
            &p,
            &target_ns,
            &[ElementType::DataElementGroup, ElementType::DescribedValueDomain],
            true,
        )
        .await
        .unwrap();
    let types: Vec<ElementType> = roots.iter().map(|r| r.element_type).collect();
    assert_eq!(
        types,
        vec![ElementType::DataElementGroup, ElementType::DescribedValueDomain]
    );
    assert!(roots
        .iter()
        .all(|r| r.namespace_identifier == target_ns.identifier && r.status == Status::Draft));
}

#[tokio::test]
async fn export_status_is_private_to_its_creator() {
    let (_, svc) = setup();
    let (ns, _) = seeded(&svc).await;
    let job = svc.submit_export(&admin(), &[ns], false).await.unwrap();
    wait_export(&svc, job).await;

    let other = Principal::in_process("bob", vec!["viewer".into()]);
    let err = svc.export_status(&other, job).await.unwrap_err();
    assert!(matches!(err, MdrError::Unauthorized(_)));
}

#[tokio::test]
async fn bundles_need_read_access() {
    let (_, svc) = setup();
    let (ns, _) = seeded(&svc).await;
    let job = svc.submit_export(&admin(), &[ns], false).await.unwrap();
    let location = wait_export(&svc, job).await.location.unwrap();

    let stranger = Principal::in_process("mallory", vec![]);
    let err = svc.load_bundle(&stranger, &location).await.unwrap_err();
    assert!(matches!(err, MdrError::Unauthorized(_)));

    let viewer = Principal::in_process("bob", vec!["viewer".into()]);
    assert_eq!(svc.load_bundle(&viewer, &location).await.unwrap().len(), 3);
}

#[tokio::test]
async fn export_needs_roots() {
    let (_, svc) = setup();
    let err = svc.submit_export(&admin(), &[], true).await.unwrap_err();
    assert!(matches!(err, MdrError::InvalidInput(_)));
}
