//! Per-session authentication state machine.
//!
//! One session per connected PAM client: broker selection, authentication
//! mode selection, challenge exchange, and termination. The daemon only
//! transports the encrypted challenge payloads; the broker-supplied
//! encryption key is handed to the client at selection time and never used
//! here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use authd_protocol::protocol::{AccessResult, AuthMode, AuthReply, ServerEvent, UiLayout};
use authd_protocol::server::EventSender;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::brokers::{self, Broker, BrokerUserInfo, SharedRegistry};
use crate::errors::{DaemonError, Result};
use crate::token::SecretToken;
use crate::users::UserManager;

/// One RPC to a broker times out after this long.
pub const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sessions with no client activity for this long are reaped.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Minimum gap between reselect-auth-mode events pushed to one client.
pub const RESELECT_THROTTLE: Duration = Duration::from_millis(250);

/// Denied verdicts allowed before the denial becomes final.
const MAX_AUTH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    BrokerSelected,
    AuthModeSelected,
    Authenticating,
    Granted,
    Denied,
    Retrying,
    Cancelled,
    Ended,
}

pub struct Session {
    pub id: String,
    pub broker_id: String,
    /// The PAM user, frozen at broker selection.
    pub username: String,
    pub lang: String,
    /// Broker-supplied symmetric key material, transported verbatim.
    pub encryption_key: String,
    pub state: SessionState,
    pub selected_auth_mode: Option<String>,
    pub ui_layout: Option<UiLayout>,
    pub attempts_remaining: u32,
    auth_in_flight: bool,
    cancel_requested: bool,
    /// A denial is reported to the client exactly once per attempt, even if
    /// the broker echoes the outcome on an auxiliary event.
    denied_reported: bool,
    pending_user: Option<BrokerUserInfo>,
    last_reselect: Option<Instant>,
    last_activity: Instant,
    broker: Arc<dyn Broker>,
    events: EventSender,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    registry: SharedRegistry,
    users: Arc<UserManager>,
    broker_timeout: Duration,
}

impl SessionManager {
    pub fn new(registry: SharedRegistry, users: Arc<UserManager>) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            users,
            broker_timeout: BROKER_CALL_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_broker_timeout(mut self, timeout: Duration) -> Self {
        self.broker_timeout = timeout;
        self
    }

    async fn broker_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.broker_timeout, fut)
            .await
            .map_err(|_| DaemonError::BrokerTimeout(self.broker_timeout.as_secs()))?
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| DaemonError::UnknownSession(session_id.to_owned()))
    }

    /// Select a broker for `username` and open a session with it.
    ///
    /// The daemon proposes a fresh unguessable session id; the broker must
    /// answer with a session id and an encryption key, both non-empty.
    pub async fn select_broker(
        &self,
        broker_id: &str,
        username: &str,
        lang: &str,
        events: EventSender,
    ) -> Result<(String, String)> {
        if !self.users.is_user_enabled(username)? {
            return Err(DaemonError::UserDisabled(username.to_owned()));
        }

        let broker = brokers::current(&self.registry).broker(broker_id)?;

        let proposed = format!(
            "{broker_id}-{}",
            SecretToken::generate()
                .map_err(|e| DaemonError::Internal(format!("CSPRNG unavailable: {e}")))?
                .to_hex()
        );
        let reply = self
            .broker_call(broker.new_session(&proposed, username, lang))
            .await?;
        if reply.session_id.is_empty() {
            return Err(DaemonError::NoSessionId);
        }
        if reply.encryption_key.is_empty() {
            return Err(DaemonError::NoEncryptionKey);
        }

        let session = Session {
            id: reply.session_id.clone(),
            broker_id: broker_id.to_owned(),
            username: username.to_owned(),
            lang: lang.to_owned(),
            encryption_key: reply.encryption_key.clone(),
            state: SessionState::BrokerSelected,
            selected_auth_mode: None,
            ui_layout: None,
            attempts_remaining: MAX_AUTH_ATTEMPTS,
            auth_in_flight: false,
            cancel_requested: false,
            denied_reported: false,
            pending_user: None,
            last_reselect: None,
            last_activity: Instant::now(),
            broker,
            events,
        };
        info!(
            "Session {:?} opened with broker {broker_id:?} for user {username:?}",
            reply.session_id
        );
        self.sessions
            .insert(reply.session_id.clone(), Arc::new(Mutex::new(session)));

        Ok((reply.session_id, reply.encryption_key))
    }

    /// The ordered list of modes the broker offers given the client's UI
    /// capabilities. Leaves the session in its current pre-authentication
    /// state, so the client may query repeatedly.
    pub async fn authentication_modes(
        &self,
        session_id: &str,
        supported_ui_layouts: &[UiLayout],
    ) -> Result<Vec<AuthMode>> {
        let session = self.session(session_id)?;
        let broker = {
            let mut session = session.lock().await;
            session.last_activity = Instant::now();
            match session.state {
                SessionState::BrokerSelected
                | SessionState::AuthModeSelected
                | SessionState::Retrying => {}
                _ => return Err(DaemonError::InvalidSessionState("authentication modes")),
            }
            session.broker.clone()
        };

        self.broker_call(broker.authentication_modes(session_id, supported_ui_layouts))
            .await
    }

    /// Select one mode and cache its UI layout. Reselecting the same mode
    /// returns the same layout.
    pub async fn select_authentication_mode(
        &self,
        session_id: &str,
        auth_mode_id: &str,
    ) -> Result<UiLayout> {
        let session = self.session(session_id)?;
        let broker = {
            let mut session = session.lock().await;
            session.last_activity = Instant::now();
            match session.state {
                SessionState::BrokerSelected
                | SessionState::AuthModeSelected
                | SessionState::Retrying => {}
                _ => return Err(DaemonError::InvalidSessionState("authentication mode selection")),
            }
            session.broker.clone()
        };

        let layout = self
            .broker_call(broker.select_authentication_mode(session_id, auth_mode_id))
            .await?;
        if layout.is_empty() {
            return Err(DaemonError::EmptyUiLayout);
        }

        let mut session = session.lock().await;
        session.selected_auth_mode = Some(auth_mode_id.to_owned());
        session.ui_layout = Some(layout.clone());
        session.state = SessionState::AuthModeSelected;
        Ok(layout)
    }

    /// Run one challenge exchange. The payload is already encrypted under
    /// the session key; it is carried to the broker untouched.
    ///
    /// At most one exchange is in flight per session; a second call while
    /// one is pending is rejected without disturbing it.
    pub async fn is_authenticated(
        &self,
        session_id: &str,
        authentication_data: &str,
    ) -> Result<AuthReply> {
        let session = self.session(session_id)?;

        let broker = {
            let mut session = session.lock().await;
            session.last_activity = Instant::now();
            match session.state {
                SessionState::AuthModeSelected | SessionState::Retrying => {}
                SessionState::Authenticating => return Err(DaemonError::AuthAlreadyInFlight),
                _ => return Err(DaemonError::InvalidSessionState("authentication")),
            }
            if session.auth_in_flight {
                return Err(DaemonError::AuthAlreadyInFlight);
            }
            session.auth_in_flight = true;
            session.cancel_requested = false;
            session.denied_reported = false;
            session.state = SessionState::Authenticating;
            session.broker.clone()
        };

        // The broker exchange happens without holding the session lock so
        // cancellation can be forwarded while it is pending.
        let reply = self
            .broker_call(broker.is_authenticated(session_id, authentication_data))
            .await;

        let mut session = session.lock().await;
        session.auth_in_flight = false;
        session.last_activity = Instant::now();

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                // The exchange never concluded; let the client try again.
                session.state = SessionState::AuthModeSelected;
                return Err(e);
            }
        };

        let (access, diagnostic) = parse_access(&reply.access);
        let message = diagnostic.or_else(|| {
            if reply.data.is_empty() || access == AccessResult::Granted {
                None
            } else {
                Some(reply.data.clone())
            }
        });

        match access {
            AccessResult::Granted => {
                let info: BrokerUserInfo = serde_json::from_str(&reply.data).map_err(|e| {
                    session.state = SessionState::Denied;
                    DaemonError::InvalidUserInfo(e.to_string())
                })?;
                session.pending_user = Some(info);
                session.state = SessionState::Granted;
            }
            AccessResult::Denied => {
                session.attempts_remaining = session.attempts_remaining.saturating_sub(1);
                session.state = if session.attempts_remaining > 0 {
                    SessionState::Retrying
                } else {
                    SessionState::Denied
                };
                session.denied_reported = true;
            }
            AccessResult::Cancelled => {
                session.state = SessionState::Cancelled;
            }
            AccessResult::Retry => {
                session.state = SessionState::Retrying;
            }
            AccessResult::Next => {
                // The broker chained another mode; mode selection starts over.
                session.selected_auth_mode = None;
                session.ui_layout = None;
                session.state = SessionState::BrokerSelected;
                notify_reselect(&mut session);
            }
        }

        Ok(AuthReply { access, message })
    }

    /// Forward a client-side cancellation to the broker.
    ///
    /// Idempotent: duplicates, and cancels with nothing in flight, are
    /// no-ops and never cascade into additional cancels on the broker.
    pub async fn cancel_is_authenticated(&self, session_id: &str) -> Result<()> {
        let session = self.session(session_id)?;
        let broker = {
            let mut session = session.lock().await;
            session.last_activity = Instant::now();
            if !session.auth_in_flight || session.cancel_requested {
                return Ok(());
            }
            session.cancel_requested = true;
            session.broker.clone()
        };

        broker.cancel_is_authenticated(session_id).await;
        Ok(())
    }

    /// A broker-driven request to re-run mode selection, throttled per
    /// session with drop-if-within-window semantics.
    pub async fn request_auth_mode_reselection(&self, session_id: &str) -> Result<bool> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        Ok(notify_reselect(&mut session))
    }

    /// Report a denial on an auxiliary path. Swallowed if the challenge
    /// reply already carried it.
    pub async fn report_denied(&self, session_id: &str) -> Result<bool> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        if session.denied_reported {
            return Ok(false);
        }
        session.denied_reported = true;
        Ok(true)
    }

    /// Terminate the session: inform the broker, release the slot, and
    /// promote or discard the temporary entries for its user.
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| DaemonError::UnknownSession(session_id.to_owned()))?;
        let mut session = session.lock().await;

        if let Err(e) = self
            .broker_call(session.broker.end_session(session_id))
            .await
        {
            warn!("Could not end session {session_id:?} with broker: {e}");
        }

        let result = match (session.state, session.pending_user.take()) {
            (SessionState::Granted, Some(info)) => {
                self.users
                    .materialize_user(&session.username, &info, &session.broker_id)
            }
            _ => {
                self.users.discard_temp_user(&session.username);
                Ok(())
            }
        };

        session.state = SessionState::Ended;
        info!("Session {session_id:?} ended");
        result
    }

    /// Client went away: cancel whatever is pending and end the session.
    pub async fn abandon(&self, session_id: &str) {
        let in_flight = {
            let Ok(session) = self.session(session_id) else {
                return;
            };
            let session = session.lock().await;
            session.auth_in_flight && !session.cancel_requested
        };
        if in_flight {
            let _ = self.cancel_is_authenticated(session_id).await;
        }
        if let Err(e) = self.end_session(session_id).await {
            debug!("Abandoning session {session_id:?}: {e}");
        }
    }

    /// Reap sessions idle past the timeout. Returns the reaped ids.
    pub async fn reap_idle(&self) -> Vec<String> {
        self.reap_idle_after(SESSION_IDLE_TIMEOUT).await
    }

    async fn reap_idle_after(&self, max_idle: Duration) -> Vec<String> {
        // Snapshot under the table lock, inspect per-session.
        let candidates: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut reaped = Vec::new();
        for (id, session) in candidates {
            let idle = {
                let session = session.lock().await;
                session.last_activity.elapsed() >= max_idle
            };
            if idle {
                info!("Reaping idle session {id:?}");
                self.abandon(&id).await;
                reaped.push(id);
            }
        }
        reaped
    }

    /// Background task ending sessions with no client activity.
    pub fn spawn_reaper(manager: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_idle().await;
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let session = self.session(session_id).ok()?;
        let state = session.lock().await.state;
        Some(state)
    }

}

/// Map a broker verdict string onto the closed verdict set. Unknown
/// verdicts deny with a diagnostic rather than trusting the broker.
fn parse_access(raw: &str) -> (AccessResult, Option<String>) {
    match raw {
        "granted" => (AccessResult::Granted, None),
        "denied" => (AccessResult::Denied, None),
        "cancelled" => (AccessResult::Cancelled, None),
        "retry" => (AccessResult::Retry, None),
        "next" => (AccessResult::Next, None),
        unknown => (
            AccessResult::Denied,
            Some(format!("unknown broker verdict {unknown:?}")),
        ),
    }
}

/// Push a reselect event unless one was pushed within the throttle window.
/// Dropped events are not queued.
fn notify_reselect(session: &mut Session) -> bool {
    if session
        .last_reselect
        .is_some_and(|at| at.elapsed() < RESELECT_THROTTLE)
    {
        debug!("Dropping reselect event for session {:?}", session.id);
        return false;
    }
    session.last_reselect = Some(Instant::now());
    session.events.send(ServerEvent::ReselectAuthMode {
        session_id: session.id.clone(),
    })
}

#[cfg(test)]
mod tests;
