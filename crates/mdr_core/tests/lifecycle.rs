//! Registry behaviour end to end over the in-memory adapter: versioning,
//! lifecycle rules, containment, membership and cross-namespace imports.

use mdr_core::content::{Content, Datatype, ElementBody, ValueDomainBody};
use mdr_core::in_memory::InMemoryRegistry;
use mdr_core::registry::DeleteOutcome;
use mdr_core::types::{ElementType, RelationKind, Status};
use mdr_core::{MdrError, Principal, RegistryService, RegistryServiceImpl, Urn};

// ── Fixtures ───────────────────────────────────────────────────

fn admin() -> Principal {
    Principal::admin("alice")
}

fn namespace_content(name: &str) -> Content {
    Content::new(ElementBody::Namespace { hidden: false }).with_definition("en", name, "")
}

fn value_domain(name: &str) -> Content {
    Content::new(ElementBody::DescribedValueDomain {
        domain: ValueDomainBody::new(Datatype::Integer),
    })
    .with_definition("en", name, "")
}

fn data_element(name: &str, value_domain: &Urn) -> Content {
    Content::new(ElementBody::DataElement {
        value_domain: value_domain.clone(),
    })
    .with_definition("en", name, "")
    .with_slot("source", "test")
}

fn group(name: &str, members: &[&Urn]) -> Content {
    Content::new(ElementBody::DataElementGroup {
        members: members.iter().map(|u| (*u).clone()).collect(),
    })
    .with_definition("en", name, "")
}

fn service() -> RegistryServiceImpl {
    InMemoryRegistry::new().service()
}

async fn namespace(svc: &RegistryServiceImpl, status: Status) -> Urn {
    svc.create_namespace(&admin(), namespace_content("Study"), status)
        .await
        .unwrap()
        .urn()
}

async fn create(svc: &RegistryServiceImpl, ns: &Urn, content: Content, status: Status) -> Urn {
    svc.create_element(&admin(), ns, content, status)
        .await
        .unwrap()
        .urn()
}

// ── URN and versions ───────────────────────────────────────────

#[tokio::test]
async fn released_data_element_is_outdated_not_removed_on_delete() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    assert_eq!(ns.to_string(), "urn:1:namespace:1:1");

    let vd = create(&svc, &ns, value_domain("Age in years"), Status::Released).await;
    let de = create(&svc, &ns, data_element("Age", &vd), Status::Released).await;
    assert_eq!(vd.to_string(), "urn:1:describedvaluedomain:1:1");
    assert_eq!(de.to_string(), "urn:1:dataelement:1:1");

    let outcome = svc.delete_element(&p, &de).await.unwrap();
    assert!(matches!(outcome, DeleteOutcome::Outdated(ref i) if i.status == Status::Outdated));

    let again = svc.resolve(&p, &de).await.unwrap();
    assert_eq!(again.status, Status::Outdated);

    let err = svc.delete_element(&p, &de).await.unwrap_err();
    assert!(matches!(err, MdrError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn revising_released_element_bumps_version_and_keeps_old_row() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &ns, value_domain("Count"), Status::Released).await;
    let v1 = create(&svc, &ns, data_element("Visits", &vd), Status::Released).await;

    let v2 = svc
        .update_element(&p, &v1, data_element("Visit count", &vd), None)
        .await
        .unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(v2.identifier, v1.identifier);
    assert_eq!(v2.status, Status::Released);

    let old = svc.resolve(&p, &v1).await.unwrap();
    assert_eq!(old.status, Status::Outdated);
    let old_view = svc.describe(&p, &v1).await.unwrap();
    assert_eq!(old_view.designation.as_deref(), Some("Visits"));

    // A revision may start over as DRAFT inside a released namespace.
    let v3 = svc
        .update_element(&p, &v2.urn(), data_element("Visits (total)", &vd), Some(Status::Draft))
        .await
        .unwrap();
    assert_eq!(v3.version, 3);
    assert_eq!(v3.status, Status::Draft);

    let versions: Vec<i32> = svc
        .history(&p, &v1)
        .await
        .unwrap()
        .iter()
        .map(|i| i.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(svc.resolve_latest(&p, &v1).await.unwrap().version, 3);
}

#[tokio::test]
async fn draft_update_is_in_place() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let vd = create(&svc, &ns, value_domain("Weight"), Status::Draft).await;

    let updated = svc
        .update_element(&p, &vd, value_domain("Weight in kg"), None)
        .await
        .unwrap();
    assert_eq!(updated.urn(), vd);
    let view = svc.describe(&p, &vd).await.unwrap();
    assert_eq!(view.designation.as_deref(), Some("Weight in kg"));
    assert_eq!(svc.history(&p, &vd).await.unwrap().len(), 1);
}

#[tokio::test]
async fn outdated_cannot_be_updated() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &ns, value_domain("Height"), Status::Released).await;
    svc.delete_element(&p, &vd).await.unwrap();
    let err = svc
        .update_element(&p, &vd, value_domain("Height cm"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MdrError::InvalidStateTransition { .. }));
}

// ── Lifecycle rules ────────────────────────────────────────────

#[tokio::test]
async fn namespace_containment() {
    let svc = service();
    let draft_ns = namespace(&svc, Status::Draft).await;
    let err = svc
        .create_element(&admin(), &draft_ns, value_domain("x"), Status::Released)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MdrError::StatusMismatch {
            namespace: Status::Draft,
            element: Status::Released
        }
    ));

    let released_ns = namespace(&svc, Status::Released).await;
    let draft = create(&svc, &released_ns, value_domain("y"), Status::Draft).await;
    assert_eq!(draft.namespace, released_ns.identifier);
}

#[tokio::test]
async fn namespace_revision_keeps_containment() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &ns, value_domain("Released"), Status::Released).await;

    let err = svc
        .update_element(&p, &ns, namespace_content("Study v2"), Some(Status::Draft))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MdrError::StatusMismatch {
            namespace: Status::Draft,
            element: Status::Released
        }
    ));
    let head = svc.resolve_latest(&p, &ns).await.unwrap();
    assert_eq!(head.version, 1);
    assert_eq!(head.status, Status::Released);

    let revised = svc
        .update_element(&p, &ns, namespace_content("Study v2"), None)
        .await
        .unwrap();
    assert_eq!(revised.version, 2);
    assert_eq!(revised.status, Status::Released);
    assert_eq!(svc.resolve(&p, &vd).await.unwrap().status, Status::Released);

    // Only drafts inside: the revision may start over as DRAFT.
    let other = svc
        .create_namespace(&p, namespace_content("Scratch"), Status::Released)
        .await
        .unwrap()
        .urn();
    create(&svc, &other, value_domain("Draft"), Status::Draft).await;
    let reopened = svc
        .update_element(&p, &other, namespace_content("Scratch"), Some(Status::Draft))
        .await
        .unwrap();
    assert_eq!(reopened.status, Status::Draft);
}

#[tokio::test]
async fn release_requires_transitively_released_members() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &ns, value_domain("Score"), Status::Released).await;
    let de = create(&svc, &ns, data_element("Score", &vd), Status::Draft).await;
    let inner = create(&svc, &ns, group("Inner", &[&de]), Status::Draft).await;
    let outer = create(&svc, &ns, group("Outer", &[&inner]), Status::Draft).await;

    svc.release_element(&p, &inner).await.unwrap_err();
    let err = svc.release_element(&p, &outer).await.unwrap_err();
    match err {
        MdrError::IncompleteMembers(urns) => {
            assert!(urns.contains(&inner.to_string()));
            assert!(urns.contains(&de.to_string()));
        }
        other => panic!("expected IncompleteMembers, got {other:?}"),
    }

    svc.release_element(&p, &de).await.unwrap();
    svc.release_element(&p, &inner).await.unwrap();
    let released = svc.release_element(&p, &outer).await.unwrap();
    assert_eq!(released.status, Status::Released);
}

#[tokio::test]
async fn data_element_release_needs_released_value_domain_and_namespace() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let vd = create(&svc, &ns, value_domain("Dose"), Status::Draft).await;
    let de = create(&svc, &ns, data_element("Dose", &vd), Status::Draft).await;

    let err = svc.release_element(&p, &de).await.unwrap_err();
    assert!(matches!(err, MdrError::IncompleteMembers(ref u) if u == &vec![vd.to_string()]));

    let err = svc.release_element(&p, &vd).await.unwrap_err();
    assert!(matches!(err, MdrError::NamespaceNotReleased(_)));

    svc.release_element(&p, &ns).await.unwrap();
    svc.release_element(&p, &vd).await.unwrap();
    svc.release_element(&p, &de).await.unwrap();
}

#[tokio::test]
async fn stage_then_release() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &ns, value_domain("Flag"), Status::Draft).await;
    assert_eq!(svc.stage_element(&p, &vd).await.unwrap().status, Status::Staged);
    assert!(svc.stage_element(&p, &vd).await.is_err());
    assert_eq!(
        svc.release_element(&p, &vd).await.unwrap().status,
        Status::Released
    );
}

#[tokio::test]
async fn draft_delete_is_hard_and_guarded() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let vd = create(&svc, &ns, value_domain("Unit"), Status::Draft).await;
    let de = create(&svc, &ns, data_element("Unit", &vd), Status::Draft).await;
    let grp = create(&svc, &ns, group("Units", &[&de]), Status::Draft).await;

    let err = svc.delete_element(&p, &de).await.unwrap_err();
    assert!(matches!(err, MdrError::Conflict(_)));
    let err = svc.delete_element(&p, &ns).await.unwrap_err();
    assert!(matches!(err, MdrError::Conflict(_)));

    assert_eq!(
        svc.delete_element(&p, &grp).await.unwrap(),
        DeleteOutcome::Deleted(grp.clone())
    );
    // The data element still points at its value domain.
    let err = svc.delete_element(&p, &vd).await.unwrap_err();
    assert!(matches!(err, MdrError::Conflict(ref m) if m.contains(&de.to_string())));

    svc.delete_element(&p, &de).await.unwrap();
    assert!(matches!(
        svc.resolve(&p, &de).await,
        Err(MdrError::NotFound(_))
    ));
    svc.delete_element(&p, &vd).await.unwrap();
}

#[tokio::test]
async fn referenced_value_domain_survives_until_release() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &ns, value_domain("Pending"), Status::Draft).await;
    let de = create(&svc, &ns, data_element("Uses pending", &vd), Status::Draft).await;

    assert!(matches!(
        svc.delete_element(&p, &vd).await,
        Err(MdrError::Conflict(_))
    ));
    let err = svc.release_element(&p, &de).await.unwrap_err();
    assert!(matches!(err, MdrError::IncompleteMembers(ref urns) if urns == &vec![vd.to_string()]));
}

// ── Membership ─────────────────────────────────────────────────

#[tokio::test]
async fn members_keep_body_order() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let vd = create(&svc, &ns, value_domain("v"), Status::Draft).await;
    let a = create(&svc, &ns, data_element("a", &vd), Status::Draft).await;
    let b = create(&svc, &ns, data_element("b", &vd), Status::Draft).await;
    let rec = create(
        &svc,
        &ns,
        Content::new(ElementBody::Record {
            members: vec![b.clone(), a.clone()],
        })
        .with_definition("en", "rec", ""),
        Status::Draft,
    )
    .await;
    let members: Vec<Urn> = svc
        .members(&p, &rec)
        .await
        .unwrap()
        .iter()
        .map(|i| i.urn())
        .collect();
    assert_eq!(members, vec![b, a]);
}

#[tokio::test]
async fn update_cannot_close_a_cycle() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let inner = create(&svc, &ns, group("inner", &[]), Status::Draft).await;
    let outer = create(&svc, &ns, group("outer", &[&inner]), Status::Draft).await;

    let err = svc
        .update_element(&p, &inner, group("inner", &[&outer]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MdrError::CyclicMembership(_)));

    let err = svc
        .update_element(&p, &inner, group("inner", &[&inner]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MdrError::CyclicMembership(_)));
}

#[tokio::test]
async fn visible_roots_hide_nested_members() {
    let svc = service();
    let p = admin();
    let ns = namespace(&svc, Status::Draft).await;
    let vd = create(&svc, &ns, value_domain("v"), Status::Draft).await;
    let nested = create(&svc, &ns, data_element("nested", &vd), Status::Draft).await;
    let loose = create(&svc, &ns, data_element("loose", &vd), Status::Draft).await;
    let grp = create(&svc, &ns, group("g", &[&nested]), Status::Draft).await;

    let types = [ElementType::DataElement, ElementType::DataElementGroup];
    let roots: Vec<Urn> = svc
        .visible_roots(&p, &ns, &types, true)
        .await
        .unwrap()
        .iter()
        .map(|i| i.urn())
        .collect();
    assert_eq!(roots, vec![loose.clone(), grp.clone()]);

    let all = svc.visible_roots(&p, &ns, &types, false).await.unwrap();
    assert_eq!(all.len(), 3);
}

// ── Imports and access ─────────────────────────────────────────

#[tokio::test]
async fn foreign_value_domain_is_imported_with_provenance() {
    let svc = service();
    let p = admin();
    let shared = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &shared, value_domain("ISO date"), Status::Released).await;

    let study = namespace(&svc, Status::Draft).await;
    let de = svc
        .create_element(&p, &study, data_element("Visit date", &vd), Status::Draft)
        .await
        .unwrap();
    let view = svc.describe(&p, &de.urn()).await.unwrap();
    let ElementBody::DataElement { value_domain } = view.content.body else {
        panic!("expected a data element body");
    };
    assert_eq!(value_domain.namespace, study.identifier);
    assert_eq!(value_domain.version, 1);

    let copy = svc.resolve(&p, &value_domain).await.unwrap();
    assert_eq!(copy.status, Status::Draft);
    let relations = svc.relations(&p, &value_domain).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].kind, RelationKind::Equal);
    assert_eq!(relations[0].left, copy.id);
    assert_eq!(relations[0].right, svc.resolve(&p, &vd).await.unwrap().id);
}

#[tokio::test]
async fn import_element_copies_members_once() {
    let svc = service();
    let p = admin();
    let shared = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &shared, value_domain("v"), Status::Released).await;
    let a = create(&svc, &shared, data_element("a", &vd), Status::Released).await;
    let b = create(&svc, &shared, data_element("b", &vd), Status::Released).await;
    let grp = create(&svc, &shared, group("g", &[&a, &b]), Status::Released).await;

    let target = namespace(&svc, Status::Released).await;
    let imported = svc.import_element(&p, &grp, &target).await.unwrap();
    assert_eq!(imported.status, Status::Released);
    assert_eq!(imported.namespace_identifier, target.identifier);

    let members = svc.members(&p, &imported.urn()).await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.namespace_identifier == target.identifier));

    // Both data elements share one imported value domain.
    let roots = svc
        .visible_roots(&p, &target, &[ElementType::DescribedValueDomain], false)
        .await
        .unwrap();
    assert_eq!(roots.len(), 1);
}

#[tokio::test]
async fn outdated_source_is_not_imported() {
    let svc = service();
    let p = admin();
    let shared = namespace(&svc, Status::Released).await;
    let vd = create(&svc, &shared, value_domain("old"), Status::Released).await;
    svc.delete_element(&p, &vd).await.unwrap();

    let target = namespace(&svc, Status::Draft).await;
    let err = svc.import_element(&p, &vd, &target).await.unwrap_err();
    assert!(matches!(err, MdrError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn viewers_cannot_write() {
    let svc = service();
    let ns = namespace(&svc, Status::Draft).await;
    let viewer = Principal::in_process("vic", vec!["viewer".into()]);

    let err = svc
        .create_element(&viewer, &ns, value_domain("v"), Status::Draft)
        .await
        .unwrap_err();
    assert!(matches!(err, MdrError::Unauthorized(_)));
    assert!(svc.resolve(&viewer, &ns).await.is_ok());

    let steward = Principal::in_process("sam", vec!["steward".into()]);
    let err = svc
        .create_namespace(&steward, namespace_content("Other"), Status::Draft)
        .await
        .unwrap_err();
    assert!(matches!(err, MdrError::Unauthorized(_)));
}

#[tokio::test]
async fn malformed_urn_is_rejected_before_lookup() {
    let err = Urn::parse("urn:1:dataelement:2").unwrap_err();
    assert!(matches!(err, MdrError::MalformedUrn(_)));
    let err = Urn::parse("urn:1:catalog:2:1").unwrap_err();
    assert!(matches!(err, MdrError::UnsupportedElementType(_)));
}
