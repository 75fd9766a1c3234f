use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use mesh_comm::{MessageEndpointListener, RetryPolicy};
use mesh_kernel::{
    AccessManager, CallerContext, DataType, EntityType, MeshBase, MeshError, MeshObject,
    MeshObjectIdentifier, MeshResult, ModelBase, NetMeshBaseIdentifier, PropertyType,
    PropertyValue, RelationshipType, SweepDecision, SweepPolicy, Sweeper, TokioScheduler,
    TypeIdentifier,
};
use mesh_net::{
    link_in_memory, AccessPath, MemoryMeshNetwork, NetError, NetMeshBase, ProxyPolicy, ProxyState,
    XprisoMessage,
};
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
                EntityType::new("Item")
                    .with_property(PropertyType::new("Title", DataType::String))
                    .with_property(PropertyType::new("Note", DataType::String)),
            )
            .with_relationship_type(RelationshipType::new("Contains", Some("Item"), Some("Item"))),
    )
}

fn nid(name: &str) -> NetMeshBaseIdentifier {
    NetMeshBaseIdentifier::from_external_form(&format!("mesh://{name}")).unwrap()
}

fn oid(s: &str) -> MeshObjectIdentifier {
    MeshObjectIdentifier::new(s)
}

fn t(s: &str) -> TypeIdentifier {
    TypeIdentifier::new(s)
}

fn network() -> Arc<MemoryMeshNetwork> {
    MemoryMeshNetwork::new(RetryPolicy::fixed(2, Duration::from_millis(10)))
}

fn fast_policy() -> ProxyPolicy {
    ProxyPolicy {
        rpc_timeout_ms: 1000,
        ..ProxyPolicy::default()
    }
}

fn node(name: &str, network: &Arc<MemoryMeshNetwork>, policy: ProxyPolicy) -> Arc<NetMeshBase> {
    node_with(MeshBase::builder(nid(name), model()).build(), network, policy)
}

fn node_with(
    base: Arc<MeshBase>,
    network: &Arc<MemoryMeshNetwork>,
    policy: ProxyPolicy,
) -> Arc<NetMeshBase> {
    let net = NetMeshBase::new(base, policy);
    network.register(&net);
    net
}

fn create_item(net: &NetMeshBase, id: &str, title: &str) {
    let mut tx = net.mesh_base().begin_transaction();
    tx.create(Some(oid(id)), &[t("Item")]).unwrap();
    tx.set_property(&oid(id), &t("Title"), Some(title.into()))
        .unwrap();
    tx.commit();
}

fn set_title(net: &NetMeshBase, id: &str, title: &str) -> MeshResult<()> {
    let mut tx = net.mesh_base().begin_transaction();
    tx.set_property(&oid(id), &t("Title"), Some(title.into()))?;
    tx.commit();
    Ok(())
}

fn text(net: &NetMeshBase, id: &str, property: &str) -> Option<String> {
    match net.mesh_base().find(&oid(id))?.property(&t(property)) {
        Some(PropertyValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_replica_follows_changes_at_the_lock_holder() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");

    let replica = b.access_locally(a.identifier(), &oid("doc")).await.unwrap();
    assert_eq!(
        replica.property(&t("Title")),
        Some(&PropertyValue::String("v1".into()))
    );
    assert!(!b.replicas().has_lock(&oid("doc")));
    assert!(!b.replicas().is_home(&oid("doc")));
    assert!(a.replicas().is_replicated_with(&oid("doc"), b.identifier()));

    set_title(&a, "doc", "v2").unwrap();
    assert!(eventually(|| text(&b, "doc", "Title").as_deref() == Some("v2")).await);

    let err = set_title(&b, "doc", "mine").unwrap_err();
    assert!(err.is_permission_error());
    assert_eq!(text(&b, "doc", "Title").as_deref(), Some("v2"));
}

#[derive(Default)]
struct ReceivedCounter {
    received: AtomicUsize,
}

impl MessageEndpointListener<XprisoMessage> for ReceivedCounter {
    fn message_received(&self, _endpoint: &str, _message: XprisoMessage) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_incoming_changes_are_not_echoed() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");

    let (towards_b, _control) =
        link_in_memory(a.identifier(), &b, RetryPolicy::fixed(2, Duration::from_millis(10)));
    let counter = Arc::new(ReceivedCounter::default());
    let _subscription = towards_b.add_listener(counter.clone());
    a.connect_with(b.identifier(), towards_b);

    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();
    assert_eq!(counter.received.load(Ordering::SeqCst), 1);

    set_title(&a, "doc", "v2").unwrap();
    assert!(eventually(|| text(&b, "doc", "Title").as_deref() == Some("v2")).await);
    // give an echo time to arrive
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_deleting_an_unshared_neighbor_reaches_replicas() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");
    create_item(&a, "note", "aside");
    {
        let mut tx = a.mesh_base().begin_transaction();
        tx.relate_and_bless(&oid("doc"), &oid("note"), &[t("Contains-S")])
            .unwrap();
        tx.commit();
    }

    let replica = b.access_locally(a.identifier(), &oid("doc")).await.unwrap();
    assert!(replica.is_related_to(&oid("note")));
    assert!(!a.replicas().is_replicated_with(&oid("note"), b.identifier()));

    {
        let mut tx = a.mesh_base().begin_transaction();
        tx.delete(&oid("note")).unwrap();
        tx.commit();
    }

    assert!(
        eventually(|| b
            .mesh_base()
            .find(&oid("doc"))
            .is_some_and(|o| o.neighbors().count() == 0))
        .await
    );
    assert!(!b.mesh_base().contains(&oid("note")));
    assert_eq!(text(&b, "doc", "Title").as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_lock_and_home_replica_migrate() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");
    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();

    let locked = b.try_to_obtain_locks(&[oid("doc")]).await.unwrap();
    assert_eq!(locked, vec![oid("doc")]);
    assert!(b.replicas().has_lock(&oid("doc")));
    assert!(!a.replicas().has_lock(&oid("doc")));

    set_title(&b, "doc", "from-b").unwrap();
    assert!(eventually(|| text(&a, "doc", "Title").as_deref() == Some("from-b")).await);
    assert!(set_title(&a, "doc", "from-a").unwrap_err().is_permission_error());

    let homed = b.try_to_obtain_home_replicas(&[oid("doc")]).await.unwrap();
    assert_eq!(homed, vec![oid("doc")]);
    assert!(b.replicas().is_home(&oid("doc")));
    assert!(!a.replicas().is_home(&oid("doc")));

    let err = a.force_obtain_locks(&[oid("doc")]).await.unwrap_err();
    assert!(matches!(err, NetError::NotHomeReplica(_)));
}

#[tokio::test]
async fn test_lock_request_refused_by_policy() {
    init_test_logging();
    let network = network();
    let a = node(
        "a",
        &network,
        ProxyPolicy {
            will_give_up_lock: false,
            ..fast_policy()
        },
    );
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");
    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();

    let locked = b.try_to_obtain_locks(&[oid("doc")]).await.unwrap();
    assert!(locked.is_empty());
    assert!(a.replicas().has_lock(&oid("doc")));
    assert!(!b.replicas().has_lock(&oid("doc")));
}

#[tokio::test]
async fn test_lock_is_held_by_one_replica_at_a_time() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    let c = node("c", &network, fast_policy());
    create_item(&a, "doc", "v1");
    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();
    c.access_locally(a.identifier(), &oid("doc")).await.unwrap();

    let holders = |nets: &[&Arc<NetMeshBase>]| {
        nets.iter()
            .filter(|n| n.replicas().has_lock(&oid("doc")))
            .count()
    };

    b.try_to_obtain_locks(&[oid("doc")]).await.unwrap();
    assert_eq!(holders(&[&a, &b, &c]), 1);
    assert!(b.replicas().has_lock(&oid("doc")));

    // c asks a, which fetches the lock back from b on c's behalf
    let locked = c.try_to_obtain_locks(&[oid("doc")]).await.unwrap();
    assert_eq!(locked, vec![oid("doc")]);
    assert_eq!(holders(&[&a, &b, &c]), 1);

    // the home replica takes it back by force
    let reclaimed = a.force_obtain_locks(&[oid("doc")]).await.unwrap();
    assert_eq!(reclaimed, vec![oid("doc")]);
    assert_eq!(holders(&[&a, &b, &c]), 1);
    assert!(a.replicas().has_lock(&oid("doc")));
}

#[tokio::test]
async fn test_relating_to_an_unshared_object_conveys_it() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "folder", "Folder");
    b.access_locally(a.identifier(), &oid("folder")).await.unwrap();

    {
        let mut tx = a.mesh_base().begin_transaction();
        tx.create(Some(oid("note")), &[t("Item")]).unwrap();
        tx.set_property(&oid("note"), &t("Title"), Some("Note".into()))
            .unwrap();
        tx.relate_and_bless(&oid("folder"), &oid("note"), &[t("Contains-S")])
            .unwrap();
        tx.commit();
    }

    assert!(eventually(|| text(&b, "note", "Title").as_deref() == Some("Note")).await);
    let folder = b.mesh_base().get(&oid("folder")).unwrap();
    assert!(folder.is_related_to(&oid("note")));
    assert!(a.replicas().is_replicated_with(&oid("note"), b.identifier()));
}

#[tokio::test]
async fn test_forward_references_resolve_on_traversal() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "folder", "Folder");
    create_item(&a, "file", "File");
    {
        let mut tx = a.mesh_base().begin_transaction();
        tx.relate_and_bless(&oid("folder"), &oid("file"), &[t("Contains-S")])
            .unwrap();
        tx.commit();
    }

    b.access_locally(a.identifier(), &oid("folder")).await.unwrap();
    assert!(b.replicas().is_forward_reference(&oid("file")));
    assert_eq!(text(&b, "file", "Title"), None);

    let found = b.traverse(&oid("folder"), &t("Contains-S")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identifier(), &oid("file"));
    assert!(!b.replicas().is_forward_reference(&oid("file")));
    assert_eq!(text(&b, "file", "Title").as_deref(), Some("File"));
}

#[tokio::test]
async fn test_unreachable_forward_reference_is_skipped() {
    init_test_logging();
    let network = network();
    let b = node("b", &network, fast_policy());
    create_item(&b, "folder", "Folder");
    b.create_forward_reference(&oid("elsewhere"), AccessPath::to(nid("nowhere")))
        .unwrap();
    {
        let mut tx = b.mesh_base().begin_transaction_from(nid("nowhere"));
        tx.relate(&oid("folder"), &oid("elsewhere")).unwrap();
        tx.bless_relationship(&oid("folder"), &oid("elsewhere"), &[t("Contains-S")])
            .unwrap();
        tx.commit();
    }

    let found = b.traverse(&oid("folder"), &t("Contains-S")).await.unwrap();
    assert!(found.is_empty());
    assert!(b
        .create_forward_reference(&oid("elsewhere"), AccessPath::to(nid("nowhere")))
        .is_err());
}

/// Refuses every change to the "Note" property.
struct NoNotes;

impl AccessManager for NoNotes {
    fn check_permitted_set_property(
        &self,
        _ctx: &CallerContext,
        object: &MeshObject,
        property: &TypeIdentifier,
        _value: Option<&PropertyValue>,
    ) -> MeshResult<()> {
        if property.as_str() == "Note" {
            return Err(MeshError::not_permitted(
                "set_property",
                object.identifier(),
                "notes are read-only here",
            ));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_refused_incoming_change_is_skipped_alone() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node_with(
        MeshBase::builder(nid("b"), model())
            .access_manager(Arc::new(NoNotes))
            .build(),
        &network,
        fast_policy(),
    );
    create_item(&a, "doc", "v1");
    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();

    {
        let mut tx = a.mesh_base().begin_transaction();
        tx.set_property(&oid("doc"), &t("Note"), Some("secret".into()))
            .unwrap();
        tx.set_property(&oid("doc"), &t("Title"), Some("v2".into()))
            .unwrap();
        tx.commit();
    }

    assert!(eventually(|| text(&b, "doc", "Title").as_deref() == Some("v2")).await);
    assert_eq!(text(&b, "doc", "Note"), None);
    assert_eq!(text(&a, "doc", "Note").as_deref(), Some("secret"));
}

#[tokio::test]
async fn test_cease_communications_stops_updates() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");
    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();

    b.die();
    let towards_b = a.proxy(b.identifier()).unwrap();
    assert!(eventually(|| towards_b.state() == ProxyState::Ceased).await);
    assert!(!a.replicas().is_replicated_with(&oid("doc"), b.identifier()));

    set_title(&a, "doc", "v2").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(text(&b, "doc", "Title").as_deref(), Some("v1"));

    let err = b.connect(a.identifier()).await.unwrap_err();
    assert!(matches!(err, NetError::Dead(_)));
}

struct PurgeEverything;

impl SweepPolicy for PurgeEverything {
    fn decide(&self, _object: &MeshObject, _now: i64) -> SweepDecision {
        SweepDecision::Purge
    }
}

#[tokio::test]
async fn test_sweeper_purges_replicas_back_to_forward_references() {
    init_test_logging();
    let network = network();
    let a = node("a", &network, fast_policy());
    let b = node("b", &network, fast_policy());
    create_item(&a, "doc", "v1");
    create_item(&b, "own", "Mine");
    b.access_locally(a.identifier(), &oid("doc")).await.unwrap();

    let sweeper = Sweeper::new(
        b.mesh_base().clone(),
        Arc::new(PurgeEverything),
        Arc::new(TokioScheduler::current()),
        Duration::from_secs(60),
    )
    .with_purger(b.clone());
    let report = sweeper.sweep_once();
    assert_eq!(report.purged, 1);

    assert!(b.replicas().is_forward_reference(&oid("doc")));
    assert_eq!(text(&b, "doc", "Title"), None);
    assert_eq!(text(&b, "own", "Title").as_deref(), Some("Mine"));
    assert!(eventually(|| !a.replicas().is_replicated_with(&oid("doc"), b.identifier())).await);

    let doc = b.resolve(&oid("doc")).await.unwrap();
    assert_eq!(
        doc.property(&t("Title")),
        Some(&PropertyValue::String("v1".into()))
    );
    assert!(!b.replicas().is_forward_reference(&oid("doc")));
}
