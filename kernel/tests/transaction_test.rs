use std::sync::{Arc, Once};

use mesh_kernel::{
    ChangeEvent, ChangeSet, ChangeSetListener, DataType, EntityType, MemoryStore, MeshBase,
    MeshError, MeshObjectIdentifier, ModelBase, MutationGuard, NetMeshBaseIdentifier,
    OwnerAccessManager, PropertyType, PropertyValue, RelationshipType, TypeIdentifier,
};
use parking_lot::Mutex;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

fn model() -> Arc<ModelBase> {
    Arc::new(
        ModelBase::new()
            .with_entity_type(
                EntityType::new("Agent")
                    .abstract_type()
                    .with_property(PropertyType::new("Name", DataType::String)),
            )
            .with_entity_type(
                EntityType::new("Person")
                    .with_supertype("Agent")
                    .with_property(
                        PropertyType::new("Age", DataType::Integer)
                            .mandatory(PropertyValue::Integer(0)),
                    ),
            )
            .with_entity_type(EntityType::new("Document"))
            .with_relationship_type(RelationshipType::new("Authored", Some("Person"), Some("Document")))
            .with_relationship_type(RelationshipType::new("Knows", Some("Person"), Some("Person"))),
    )
}

fn base_named(name: &str) -> Arc<MeshBase> {
    let id = NetMeshBaseIdentifier::from_external_form(&format!("mesh://{name}")).unwrap();
    MeshBase::builder(id, model()).build()
}

fn oid(s: &str) -> MeshObjectIdentifier {
    MeshObjectIdentifier::new(s)
}

fn t(s: &str) -> TypeIdentifier {
    TypeIdentifier::new(s)
}

#[derive(Default)]
struct Recorder {
    sets: Mutex<Vec<ChangeSet>>,
}

impl ChangeSetListener for Recorder {
    fn transaction_committed(&self, _base: &MeshBase, changes: &ChangeSet) {
        self.sets.lock().push(changes.clone());
    }
}

#[test]
fn test_create_and_relate_produces_one_change_set() {
    init_test_logging();
    let base = base_named("a");
    {
        let mut tx = base.begin_transaction();
        tx.create(Some(oid("b")), &[t("Document")]).unwrap();
        tx.commit();
    }

    let recorder = Arc::new(Recorder::default());
    base.add_listener(recorder.clone());

    let mut tx = base.begin_transaction();
    tx.create(Some(oid("a")), &[t("Person")]).unwrap();
    tx.relate_and_bless(&oid("a"), &oid("b"), &[t("Authored-S")])
        .unwrap();
    let changes = tx.commit();

    assert_eq!(changes.len(), 2);
    assert!(matches!(changes.changes()[0].event, ChangeEvent::Created { .. }));
    assert!(matches!(changes.changes()[1].event, ChangeEvent::RolesAdded { .. }));

    let sets = recorder.sets.lock();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0], changes);

    let docs = base.traverse(&oid("a"), &t("Authored-S")).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].identifier(), &oid("b"));
    let authors = base.traverse(&oid("b"), &t("Authored-D")).unwrap();
    assert_eq!(authors[0].identifier(), &oid("a"));
}

#[test]
fn test_blessing_rules_are_enforced() {
    init_test_logging();
    let base = base_named("rules");
    let mut tx = base.begin_transaction();

    let err = tx.create(Some(oid("x")), &[t("Agent")]).unwrap_err();
    assert!(matches!(err, MeshError::EntityTypeAbstract(_)));

    tx.create(Some(oid("p")), &[t("Person")]).unwrap();
    tx.create(Some(oid("d")), &[t("Document")]).unwrap();
    assert!(matches!(
        tx.create(Some(oid("p")), &[]).unwrap_err(),
        MeshError::IdentifierNotUnique(_)
    ));
    assert!(matches!(
        tx.bless(&oid("p"), &[t("Person")]).unwrap_err(),
        MeshError::BlessedAlready { .. }
    ));

    // a Document cannot play the Person end of Authored
    assert!(matches!(
        tx.relate_and_bless(&oid("d"), &oid("p"), &[t("Authored-S")])
            .unwrap_err(),
        MeshError::IncompatibleRole { .. }
    ));

    tx.relate_and_bless(&oid("p"), &oid("d"), &[t("Authored-S")])
        .unwrap();
    assert!(matches!(
        tx.bless_relationship(&oid("p"), &oid("d"), &[t("Authored-S")])
            .unwrap_err(),
        MeshError::RoleBlessedAlready { .. }
    ));
    assert!(matches!(
        tx.unbless(&oid("p"), &[t("Person")]).unwrap_err(),
        MeshError::RoleRequiresEntityType { .. }
    ));
    assert!(matches!(
        tx.relate(&oid("p"), &oid("p")).unwrap_err(),
        MeshError::CannotRelateToItself(_)
    ));
    tx.commit();
}

#[test]
fn test_property_rules_and_defaults() {
    init_test_logging();
    let base = base_named("props");
    let mut tx = base.begin_transaction();
    let person = tx.create(Some(oid("p")), &[t("Person")]).unwrap();
    assert_eq!(person.property(&t("Age")), Some(&PropertyValue::Integer(0)));

    tx.set_property(&oid("p"), &t("Name"), Some("Ada".into()))
        .unwrap();
    assert!(matches!(
        tx.set_property(&oid("p"), &t("Name"), Some(PropertyValue::Integer(1)))
            .unwrap_err(),
        MeshError::IllegalPropertyValue { .. }
    ));
    assert!(matches!(
        tx.set_property(&oid("p"), &t("Age"), None).unwrap_err(),
        MeshError::MandatoryProperty { .. }
    ));
    assert!(matches!(
        tx.set_property(&oid("p"), &t("Title"), Some("x".into()))
            .unwrap_err(),
        MeshError::IllegalProperty { .. }
    ));
    // setting the same value again records nothing
    let before = tx.changes().len();
    tx.set_property(&oid("p"), &t("Name"), Some("Ada".into()))
        .unwrap();
    assert_eq!(tx.changes().len(), before);
    tx.commit();

    assert_eq!(
        base.property(&oid("p"), &t("Name")).unwrap(),
        Some(PropertyValue::String("Ada".into()))
    );
}

#[test]
fn test_dropped_transaction_rolls_back() {
    init_test_logging();
    let base = base_named("rollback");
    {
        let mut tx = base.begin_transaction();
        tx.create(Some(oid("p")), &[t("Person")]).unwrap();
        tx.commit();
    }
    {
        let mut tx = base.begin_transaction();
        tx.create(Some(oid("q")), &[t("Person")]).unwrap();
        tx.set_property(&oid("p"), &t("Name"), Some("changed".into()))
            .unwrap();
        tx.relate(&oid("p"), &oid("q")).unwrap();
        // dropped without commit
    }
    assert_eq!(base.size(), 1);
    let p = base.get(&oid("p")).unwrap();
    assert!(p.property(&t("Name")).is_none());
    assert_eq!(p.neighbors().count(), 0);
}

#[test]
fn test_change_sets_replay_to_equivalent_graph() {
    init_test_logging();
    let source = base_named("source");
    let mut recorded = Vec::new();

    {
        let mut tx = source.begin_transaction();
        tx.create(Some(oid("p")), &[t("Person")]).unwrap();
        tx.create(Some(oid("q")), &[t("Person")]).unwrap();
        tx.create(Some(oid("d")), &[t("Document")]).unwrap();
        tx.set_property(&oid("p"), &t("Name"), Some("Ada".into()))
            .unwrap();
        tx.relate_and_bless(&oid("p"), &oid("d"), &[t("Authored-S")])
            .unwrap();
        tx.relate(&oid("p"), &oid("q")).unwrap();
        tx.bless_relationship(&oid("p"), &oid("q"), &[t("Knows-S")])
            .unwrap();
        tx.add_equivalent(&oid("q"), &oid("d")).unwrap();
        recorded.push(tx.commit());
    }
    {
        let mut tx = source.begin_transaction();
        tx.create(Some(oid("tmp")), &[t("Document")]).unwrap();
        tx.set_property(&oid("q"), &t("Age"), Some(PropertyValue::Integer(41)))
            .unwrap();
        tx.unbless_relationship(&oid("p"), &oid("q"), &[t("Knows-S")])
            .unwrap();
        tx.delete(&oid("tmp")).unwrap();
        recorded.push(tx.commit());
    }

    let wire = serde_json::to_string(&recorded).unwrap();
    let replayed: Vec<ChangeSet> = serde_json::from_str(&wire).unwrap();

    let target = base_named("target");
    for set in &replayed {
        let mut tx = target.begin_transaction_from(source.identifier().clone());
        for change in set {
            tx.apply_change(&change.event).unwrap();
        }
        tx.commit();
    }

    let expected = source.objects();
    let actual = target.objects();
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.iter().zip(actual.iter()) {
        assert!(e.same_content(a), "{e:?} != {a:?}");
    }
}

#[test]
fn test_owner_access_manager_and_sudo() {
    init_test_logging();
    let id = NetMeshBaseIdentifier::from_external_form("mesh://owned").unwrap();
    let base = MeshBase::builder(id, model())
        .access_manager(Arc::new(OwnerAccessManager))
        .build();
    {
        let mut tx = base.begin_transaction();
        tx.set_caller(Some(oid("alice")));
        tx.create(Some(oid("doc")), &[t("Document")]).unwrap();
        tx.commit();
    }

    let mut tx = base.begin_transaction();
    tx.set_caller(Some(oid("mallory")));
    let err = tx.delete(&oid("doc")).unwrap_err();
    assert!(err.is_permission_error());

    let result = tx.with_sudo(|tx| tx.delete(&oid("doc")));
    assert!(result.is_ok());
    assert!(!tx.is_sudo());
    tx.commit();
    assert!(!base.contains(&oid("doc")));
}

#[test]
fn test_sudo_is_revoked_when_the_closure_panics() {
    init_test_logging();
    let id = NetMeshBaseIdentifier::from_external_form("mesh://owned").unwrap();
    let base = MeshBase::builder(id, model())
        .access_manager(Arc::new(OwnerAccessManager))
        .build();
    {
        let mut tx = base.begin_transaction();
        tx.set_caller(Some(oid("alice")));
        tx.create(Some(oid("doc")), &[t("Document")]).unwrap();
        tx.commit();
    }

    let mut tx = base.begin_transaction();
    tx.set_caller(Some(oid("mallory")));
    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        tx.with_sudo(|_| panic!("interrupted"));
    }));
    assert!(panicked.is_err());
    assert!(!tx.is_sudo());
    assert!(tx.delete(&oid("doc")).unwrap_err().is_permission_error());
}

#[test]
fn test_transaction_time_applies_to_that_transaction_only() {
    init_test_logging();
    let base = base_named("clocked");
    let origin = NetMeshBaseIdentifier::from_external_form("http://source.example.com/").unwrap();
    {
        let mut tx = base.begin_transaction_at(origin, 1_000);
        assert_eq!(tx.time(), 1_000);
        tx.create(Some(oid("fetched")), &[t("Document")]).unwrap();
        tx.commit();
    }
    {
        let mut tx = base.begin_transaction();
        assert!(tx.time() > 1_000);
        tx.create(Some(oid("local")), &[t("Document")]).unwrap();
        tx.commit();
    }

    assert_eq!(base.get(&oid("fetched")).unwrap().time_created(), 1_000);
    assert!(base.get(&oid("local")).unwrap().time_created() > 1_000);
}

#[test]
fn test_deleting_an_absent_object_detaches_its_neighbors() {
    init_test_logging();
    let source = base_named("source");
    {
        let mut tx = source.begin_transaction();
        tx.create(Some(oid("p")), &[t("Person")]).unwrap();
        tx.create(Some(oid("d")), &[t("Document")]).unwrap();
        tx.relate_and_bless(&oid("p"), &oid("d"), &[t("Authored-S")])
            .unwrap();
        tx.commit();
    }

    // the target holds "d" but never saw "p"
    let target = base_named("target");
    {
        let mut tx = target.begin_transaction_from(source.identifier().clone());
        tx.create_replica(source.get(&oid("d")).unwrap()).unwrap();
        tx.commit();
    }
    assert!(target.get(&oid("d")).unwrap().is_related_to(&oid("p")));
    assert!(!target.contains(&oid("p")));

    let deleted = {
        let mut tx = source.begin_transaction();
        tx.delete(&oid("p")).unwrap();
        tx.commit()
    };

    let mut tx = target.begin_transaction_from(source.identifier().clone());
    for change in &deleted {
        tx.apply_change(&change.event).unwrap();
    }
    let applied = tx.commit();
    assert!(applied.iter().any(|c| matches!(
        &c.event,
        ChangeEvent::NeighborRemoved { identifier, neighbor }
            if identifier == &oid("d") && neighbor == &oid("p")
    )));
    assert_eq!(target.get(&oid("d")).unwrap().neighbors().count(), 0);
    assert!(!target.contains(&oid("p")));

    // nothing left to detach
    let mut tx = target.begin_transaction_from(source.identifier().clone());
    for change in &deleted {
        assert!(tx.apply_change(&change.event).is_err());
    }
}

struct FrozenGuard(MeshObjectIdentifier);

impl MutationGuard for FrozenGuard {
    fn check_may_mutate(
        &self,
        object: &MeshObjectIdentifier,
        origin: Option<&NetMeshBaseIdentifier>,
    ) -> mesh_kernel::MeshResult<()> {
        if origin.is_none() && object == &self.0 {
            return Err(MeshError::not_permitted("mutate", object, "frozen"));
        }
        Ok(())
    }
}

#[test]
fn test_mutation_guard_applies_to_local_changes_only() {
    init_test_logging();
    let base = base_named("guarded");
    {
        let mut tx = base.begin_transaction();
        tx.create(Some(oid("p")), &[t("Person")]).unwrap();
        tx.commit();
    }
    base.set_mutation_guard(Some(Arc::new(FrozenGuard(oid("p")))));

    let mut tx = base.begin_transaction();
    assert!(tx
        .set_property(&oid("p"), &t("Name"), Some("x".into()))
        .unwrap_err()
        .is_permission_error());
    drop(tx);

    let remote = NetMeshBaseIdentifier::from_external_form("mesh://remote").unwrap();
    let mut tx = base.begin_transaction_from(remote);
    tx.set_property(&oid("p"), &t("Name"), Some("x".into()))
        .unwrap();
    tx.commit();
}

#[tokio::test]
async fn test_flush_and_restore_through_store() {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    let id = NetMeshBaseIdentifier::from_external_form("mesh://persisted").unwrap();
    let base = MeshBase::builder(id.clone(), model())
        .store(store.clone())
        .build();
    {
        let mut tx = base.begin_transaction();
        tx.create(Some(oid("p")), &[t("Person")]).unwrap();
        tx.create(Some(oid("d")), &[t("Document")]).unwrap();
        tx.relate_and_bless(&oid("p"), &oid("d"), &[t("Authored-S")])
            .unwrap();
        tx.commit();
    }
    assert!(base.is_dirty());
    assert_eq!(base.flush().await.unwrap(), 2);
    assert!(!base.is_dirty());
    assert_eq!(store.len(), 2);

    {
        let mut tx = base.begin_transaction();
        tx.delete(&oid("d")).unwrap();
        tx.commit();
    }
    base.flush().await.unwrap();
    assert_eq!(store.len(), 1);

    let restored = MeshBase::builder(id, model()).store(store).build();
    assert_eq!(restored.restore().await.unwrap(), 1);
    let p = restored.get(&oid("p")).unwrap();
    assert!(p.same_content(&base.get(&oid("p")).unwrap()));
}
