use super::testing::TestBroker;
use super::*;

#[tokio::test]
async fn empty_registry_lists_only_local() {
    let registry = BrokerRegistry::empty();
    let infos = registry.available();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, LOCAL_BROKER_ID);
    assert!(registry.contains(LOCAL_BROKER_ID));
    assert!(registry.remote_infos().is_empty());
}

#[tokio::test]
async fn local_broker_is_listed_first() {
    let broker = Arc::new(TestBroker::new("remote1"));
    let registry = BrokerRegistry::empty().with_broker(broker.info(), broker.clone());

    let infos = registry.available();
    assert_eq!(infos[0].id, LOCAL_BROKER_ID);
    assert_eq!(infos[1].id, "remote1");
    assert_eq!(registry.remote_infos().len(), 1);
}

#[tokio::test]
async fn unknown_broker_fails_routing() {
    let registry = BrokerRegistry::empty();
    let err = registry.broker("ghost").unwrap_err();
    assert!(matches!(err, DaemonError::UnknownBroker(_)));
}

#[tokio::test]
async fn local_broker_refuses_sessions() {
    let registry = BrokerRegistry::empty();
    let local = registry.broker(LOCAL_BROKER_ID).unwrap();
    assert!(local.new_session("sid", "alice", "en_US").await.is_err());
    assert!(local.user_pre_check("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn first_claiming_broker_wins() {
    let one = Arc::new(TestBroker::new("one"));
    let mut two = TestBroker::new("two");
    two.known_users.push("alice".to_owned());
    let two = Arc::new(two);

    let registry = BrokerRegistry::empty()
        .with_broker(one.info(), one)
        .with_broker(two.info(), two);

    assert_eq!(
        registry.broker_claiming_user("alice").await.as_deref(),
        Some("two")
    );
    assert!(registry.broker_claiming_user("bob").await.is_none());
}

#[tokio::test]
async fn load_skips_brokers_without_transport() {
    use tempfile::TempDir;

    let conf_dir = TempDir::new().unwrap();
    std::fs::write(
        conf_dir.path().join("one.conf"),
        "id = one\nname = One\ndbus.name = o\ndbus.object = /o\ndbus.interface = o.v1\n",
    )
    .unwrap();

    // Runtime dir has no socket for "one", so the dialer reports it down.
    let runtime_dir = TempDir::new().unwrap();
    let dialer = remote::SocketBrokerDialer::new(runtime_dir.path());
    let registry = BrokerRegistry::load(conf_dir.path(), &dialer);

    assert!(!registry.contains("one"));
    assert_eq!(registry.available().len(), 1);

    // Touching the socket path makes it dial on the next load.
    std::fs::write(runtime_dir.path().join("one.sock"), b"").unwrap();
    let registry = BrokerRegistry::load(conf_dir.path(), &dialer);
    assert!(registry.contains("one"));
    assert_eq!(registry.remote_infos().len(), 1);
}

#[test]
fn shared_registry_swaps_whole() {
    let shared = shared(BrokerRegistry::empty());
    assert_eq!(current(&shared).available().len(), 1);

    let broker = Arc::new(TestBroker::new("remote1"));
    let replacement = BrokerRegistry::empty().with_broker(broker.info(), broker);
    *shared.write() = Arc::new(replacement);

    assert_eq!(current(&shared).available().len(), 2);
}
