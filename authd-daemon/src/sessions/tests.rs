use super::*;
use crate::brokers::testing::{granted_user_info, TestBroker};
use crate::brokers::{BrokerAuthReply, BrokerRegistry, NewSessionReply};
use crate::users::{UserManager, UserManagerConfig};
use async_trait::async_trait;
use authd_protocol::protocol::ServerMessage;
use authd_protocol::server::EventSender;
use chrono::Duration as ChronoDuration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

struct Fixture {
    _root: TempDir,
    users: Arc<UserManager>,
    broker: Arc<TestBroker>,
    manager: Arc<SessionManager>,
    events_rx: mpsc::Receiver<ServerMessage>,
    events: EventSender,
}

impl Fixture {
    fn new() -> Self {
        Self::with_broker(Arc::new(TestBroker::new("remote1")))
    }

    fn with_broker(broker: Arc<TestBroker>) -> Self {
        let root = TempDir::new().unwrap();
        let config = UserManagerConfig {
            state_dir: root.path().join("state"),
            group_file: root.path().join("group"),
            passwd_file: root.path().join("passwd"),
            proc_dir: root.path().join("proc"),
            expiration: ChronoDuration::days(180),
            clean_on_startup: false,
        };
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(&config.group_file, "root:x:0:\nadm:x:4:\n").unwrap();
        std::fs::write(&config.passwd_file, "root:x:0:0:root:/root:/bin/bash\n").unwrap();
        std::fs::create_dir_all(&config.proc_dir).unwrap();

        let users = Arc::new(UserManager::new(config).unwrap());
        let registry = crate::brokers::shared(
            BrokerRegistry::empty().with_broker(broker.info(), broker.clone()),
        );
        let manager = Arc::new(SessionManager::new(registry, users.clone()));
        let (events, events_rx) = EventSender::channel(8);

        Self {
            _root: root,
            users,
            broker,
            manager,
            events_rx,
            events,
        }
    }

    async fn open_session(&self, username: &str) -> String {
        let (session_id, key) = self
            .manager
            .select_broker("remote1", username, "en_US", self.events.clone())
            .await
            .unwrap();
        assert!(!key.is_empty());
        session_id
    }

    async fn to_auth_mode(&self, session_id: &str) {
        let modes = self
            .manager
            .authentication_modes(session_id, &[])
            .await
            .unwrap();
        assert!(!modes.is_empty());
        let layout = self
            .manager
            .select_authentication_mode(session_id, &modes[0].id)
            .await
            .unwrap();
        assert!(!layout.is_empty());
    }
}

// =========================================================================
// Session opening
// =========================================================================

#[tokio::test]
async fn first_login_walks_to_a_persisted_user() {
    let mut f = Fixture::new();
    f.broker.push_reply("granted", granted_user_info("alice", &["adm"]));

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    let reply = f
        .manager
        .is_authenticated(&session_id, "sealed(hunter2)")
        .await
        .unwrap();
    assert_eq!(reply.access, AccessResult::Granted);
    assert_eq!(
        f.manager.session_state(&session_id).await,
        Some(SessionState::Granted)
    );

    f.manager.end_session(&session_id).await.unwrap();

    let entry = f.users.passwd_by_name("alice").unwrap();
    assert!(entry.uid >= crate::idgen::ID_MIN);
    assert_eq!(f.users.broker_for_user("alice").unwrap(), "remote1");
    assert!(f.broker.ended_sessions.lock().contains(&session_id));
    let _ = f.events_rx.try_recv(); // no event expected; drain defensively
}

#[tokio::test]
async fn unknown_broker_is_refused() {
    let f = Fixture::new();
    let err = f
        .manager
        .select_broker("ghost", "alice", "en_US", f.events.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::UnknownBroker(_)));
}

#[tokio::test]
async fn empty_session_id_from_broker_is_internal() {
    let mut broker = TestBroker::new("remote1");
    broker.session_id_override = Some(String::new());
    let f = Fixture::with_broker(Arc::new(broker));

    let err = f
        .manager
        .select_broker("remote1", "alice", "en_US", f.events.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::NoSessionId));
}

#[tokio::test]
async fn empty_encryption_key_from_broker_is_internal() {
    let mut broker = TestBroker::new("remote1");
    broker.encryption_key = String::new();
    let f = Fixture::with_broker(Arc::new(broker));

    let err = f
        .manager
        .select_broker("remote1", "alice", "en_US", f.events.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::NoEncryptionKey));
}

#[tokio::test]
async fn disabled_users_cannot_open_sessions() {
    let f = Fixture::new();
    f.broker.push_reply("granted", granted_user_info("alice", &[]));

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;
    f.manager.is_authenticated(&session_id, "sealed").await.unwrap();
    f.manager.end_session(&session_id).await.unwrap();

    f.users.set_user_enabled("alice", false).unwrap();
    let err = f
        .manager
        .select_broker("remote1", "alice", "en_US", f.events.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::UserDisabled(_)));
}

#[tokio::test]
async fn session_ids_are_unique_and_unguessable_shape() {
    let f = Fixture::new();
    let a = f.open_session("alice").await;
    let b = f.open_session("bob").await;
    assert_ne!(a, b);
    // broker id prefix + 64 hex chars of entropy
    assert!(a.starts_with("remote1-"));
    assert_eq!(a.len(), "remote1-".len() + 64);
}

// =========================================================================
// Mode selection
// =========================================================================

#[tokio::test]
async fn reselecting_the_same_mode_returns_the_same_layout() {
    let f = Fixture::new();
    let session_id = f.open_session("alice").await;

    let first = f
        .manager
        .select_authentication_mode(&session_id, "password")
        .await
        .unwrap();
    let second = f
        .manager
        .select_authentication_mode(&session_id, "password")
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn authenticating_without_a_mode_is_refused() {
    let f = Fixture::new();
    let session_id = f.open_session("alice").await;

    let err = f
        .manager
        .is_authenticated(&session_id, "sealed")
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::InvalidSessionState(_)));
}

// =========================================================================
// Verdicts
// =========================================================================

#[tokio::test]
async fn denied_then_granted_retries_cleanly() {
    let f = Fixture::new();
    f.broker.push_reply("denied", "wrong password");
    f.broker.push_reply("granted", granted_user_info("alice", &[]));

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    let denied = f
        .manager
        .is_authenticated(&session_id, "sealed(bad)")
        .await
        .unwrap();
    assert_eq!(denied.access, AccessResult::Denied);
    assert_eq!(denied.message.as_deref(), Some("wrong password"));
    assert_eq!(
        f.manager.session_state(&session_id).await,
        Some(SessionState::Retrying)
    );
    // The denial was already reported on the challenge reply; an auxiliary
    // echo must be swallowed.
    assert!(!f.manager.report_denied(&session_id).await.unwrap());

    let granted = f
        .manager
        .is_authenticated(&session_id, "sealed(good)")
        .await
        .unwrap();
    assert_eq!(granted.access, AccessResult::Granted);

    f.manager.end_session(&session_id).await.unwrap();
    assert!(f.users.passwd_by_name("alice").is_ok());
}

#[tokio::test]
async fn denial_becomes_final_after_three_attempts() {
    let f = Fixture::new();
    for _ in 0..3 {
        f.broker.push_reply("denied", "");
    }

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    for _ in 0..2 {
        f.manager.is_authenticated(&session_id, "sealed").await.unwrap();
        assert_eq!(
            f.manager.session_state(&session_id).await,
            Some(SessionState::Retrying)
        );
    }
    f.manager.is_authenticated(&session_id, "sealed").await.unwrap();
    assert_eq!(
        f.manager.session_state(&session_id).await,
        Some(SessionState::Denied)
    );

    let err = f
        .manager
        .is_authenticated(&session_id, "sealed")
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::InvalidSessionState(_)));
}

#[tokio::test]
async fn unknown_verdicts_deny_with_a_diagnostic() {
    let f = Fixture::new();
    f.broker.push_reply("allowed-maybe", "");

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    let reply = f
        .manager
        .is_authenticated(&session_id, "sealed")
        .await
        .unwrap();
    assert_eq!(reply.access, AccessResult::Denied);
    assert!(reply.message.unwrap().contains("allowed-maybe"));
}

#[tokio::test]
async fn next_verdict_restarts_mode_selection_and_notifies() {
    let mut f = Fixture::new();
    f.broker.push_reply("next", "");

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    let reply = f
        .manager
        .is_authenticated(&session_id, "sealed")
        .await
        .unwrap();
    assert_eq!(reply.access, AccessResult::Next);
    assert_eq!(
        f.manager.session_state(&session_id).await,
        Some(SessionState::BrokerSelected)
    );
    match f.events_rx.try_recv() {
        Ok(ServerMessage::Event { .. }) => {}
        other => panic!("Expected a reselect event, got {other:?}"),
    }
}

#[tokio::test]
async fn granted_with_garbage_user_info_is_denied_internal() {
    let f = Fixture::new();
    f.broker.push_reply("granted", "not json");

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    let err = f
        .manager
        .is_authenticated(&session_id, "sealed")
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::InvalidUserInfo(_)));
    assert_eq!(
        f.manager.session_state(&session_id).await,
        Some(SessionState::Denied)
    );

    // Ending the session must not materialize anything.
    f.manager.end_session(&session_id).await.unwrap();
    assert!(f.users.passwd_by_name("alice").is_err());
}

// =========================================================================
// Pending authentication and cancellation
// =========================================================================

/// Broker whose authentication replies are gated on a semaphore, to keep an
/// exchange pending for as long as the test needs.
struct GatedBroker {
    inner: TestBroker,
    gate: Semaphore,
}

#[async_trait]
impl crate::brokers::Broker for GatedBroker {
    async fn new_session(
        &self,
        session_id: &str,
        username: &str,
        lang: &str,
    ) -> crate::errors::Result<NewSessionReply> {
        self.inner.new_session(session_id, username, lang).await
    }

    async fn authentication_modes(
        &self,
        session_id: &str,
        layouts: &[UiLayout],
    ) -> crate::errors::Result<Vec<AuthMode>> {
        self.inner.authentication_modes(session_id, layouts).await
    }

    async fn select_authentication_mode(
        &self,
        session_id: &str,
        mode: &str,
    ) -> crate::errors::Result<UiLayout> {
        self.inner.select_authentication_mode(session_id, mode).await
    }

    async fn is_authenticated(
        &self,
        session_id: &str,
        data: &str,
    ) -> crate::errors::Result<BrokerAuthReply> {
        let permit = self.gate.acquire().await.map_err(|_| {
            crate::errors::DaemonError::Internal("gate closed".into())
        })?;
        permit.forget();
        self.inner.is_authenticated(session_id, data).await
    }

    async fn cancel_is_authenticated(&self, session_id: &str) {
        self.inner.cancel_is_authenticated(session_id).await;
    }

    async fn end_session(&self, session_id: &str) -> crate::errors::Result<()> {
        self.inner.end_session(session_id).await
    }

    async fn user_pre_check(
        &self,
        username: &str,
    ) -> crate::errors::Result<Option<crate::brokers::BrokerUserInfo>> {
        self.inner.user_pre_check(username).await
    }
}

fn gated_fixture() -> (Fixture, Arc<GatedBroker>) {
    let gated = Arc::new(GatedBroker {
        inner: TestBroker::new("remote1"),
        gate: Semaphore::new(0),
    });

    // Build the fixture manually around the gated broker.
    let root = TempDir::new().unwrap();
    let config = UserManagerConfig {
        state_dir: root.path().join("state"),
        group_file: root.path().join("group"),
        passwd_file: root.path().join("passwd"),
        proc_dir: root.path().join("proc"),
        expiration: ChronoDuration::days(180),
        clean_on_startup: false,
    };
    std::fs::create_dir_all(&config.state_dir).unwrap();
    std::fs::write(&config.group_file, "root:x:0:\n").unwrap();
    std::fs::write(&config.passwd_file, "root:x:0:0:root:/root:/bin/bash\n").unwrap();
    std::fs::create_dir_all(&config.proc_dir).unwrap();

    let users = Arc::new(UserManager::new(config).unwrap());
    let registry = crate::brokers::shared(
        BrokerRegistry::empty().with_broker(gated.inner.info(), gated.clone()),
    );
    let manager = Arc::new(SessionManager::new(registry, users.clone()));
    let (events, events_rx) = EventSender::channel(8);

    (
        Fixture {
            _root: root,
            users,
            broker: Arc::new(TestBroker::new("unused")),
            manager,
            events_rx,
            events,
        },
        gated,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_authentication_while_pending_is_rejected() {
    let (f, gated) = gated_fixture();
    gated.inner.push_reply("cancelled", "");

    let session_id = f.open_session("alice").await;
    f.to_auth_mode(&session_id).await;

    let manager = f.manager.clone();
    let pending_id = session_id.clone();
    let pending =
        tokio::spawn(async move { manager.is_authenticated(&pending_id, "sealed").await });

    // Give the pending call time to reach the broker.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = f
        .manager
        .is_authenticated(&session_id, "sealed-again")
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::AuthAlreadyInFlight));

    // Duplicate cancels collapse into a single forward to the broker.
    f.manager.cancel_is_authenticated(&session_id).await.unwrap();
    f.manager.cancel_is_authenticated(&session_id).await.unwrap();
    assert_eq!(gated.inner.cancel_count(), 1);

    gated.gate.add_permits(1);
    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.access, AccessResult::Cancelled);
    assert_eq!(
        f.manager.session_state(&session_id).await,
        Some(SessionState::Cancelled)
    );
}

#[tokio::test]
async fn cancel_without_pending_authentication_is_a_noop() {
    let f = Fixture::new();
    let session_id = f.open_session("alice").await;

    f.manager.cancel_is_authenticated(&session_id).await.unwrap();
    f.manager.cancel_is_authenticated(&session_id).await.unwrap();
    assert_eq!(f.broker.cancel_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_timeout_is_transient_and_recoverable() {
    let (f, gated) = gated_fixture();
    let manager = Arc::new(
        SessionManager::new(
            crate::brokers::shared(
                BrokerRegistry::empty().with_broker(gated.inner.info(), gated.clone()),
            ),
            f.users.clone(),
        )
        .with_broker_timeout(std::time::Duration::from_millis(50)),
    );

    let (session_id, _) = manager
        .select_broker("remote1", "alice", "en_US", f.events.clone())
        .await
        .unwrap();
    manager
        .select_authentication_mode(&session_id, "password")
        .await
        .unwrap();

    let err = manager
        .is_authenticated(&session_id, "sealed")
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::BrokerTimeout(_)));
    // The session recovered into a state accepting a fresh attempt.
    assert_eq!(
        manager.session_state(&session_id).await,
        Some(SessionState::AuthModeSelected)
    );
}

// =========================================================================
// Throttling and reaping
// =========================================================================

#[tokio::test]
async fn reselect_events_are_throttled_per_session() {
    let mut f = Fixture::new();
    let session_id = f.open_session("alice").await;

    assert!(f
        .manager
        .request_auth_mode_reselection(&session_id)
        .await
        .unwrap());
    // Within the window: dropped, not queued.
    assert!(!f
        .manager
        .request_auth_mode_reselection(&session_id)
        .await
        .unwrap());

    assert!(f.events_rx.try_recv().is_ok());
    assert!(f.events_rx.try_recv().is_err());
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    let f = Fixture::new();
    let session_id = f.open_session("alice").await;

    // Nothing is idle yet under the real timeout.
    assert!(f.manager.reap_idle().await.is_empty());

    // With a zero idle window every session qualifies.
    let reaped = f.manager.reap_idle_after(std::time::Duration::ZERO).await;
    assert_eq!(reaped, vec![session_id.clone()]);
    assert!(f.manager.session_state(&session_id).await.is_none());
    assert!(f.broker.ended_sessions.lock().contains(&session_id));
}

#[tokio::test]
async fn ending_an_unknown_session_is_not_found() {
    let f = Fixture::new();
    let err = f.manager.end_session("ghost").await.unwrap_err();
    assert!(matches!(err, DaemonError::UnknownSession(_)));
}
