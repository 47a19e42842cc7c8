//! Request routing for both RPC surfaces.
//!
//! Maps wire requests onto the user manager, the broker registry, and the
//! session manager, and normalizes every error into the wire envelope.
//! Also enforces the per-connection security contracts: a connection drives
//! only the session it opened, and the PAM user is frozen once a broker is
//! selected.

use std::sync::Arc;

use async_trait::async_trait;
use authd_protocol::protocol::{
    NssRequest, PamRequest, Payload, Request, SessionOrigin, WireError,
};
use authd_protocol::server::{Connection, RequestHandler};
use tracing::{debug, info};

use crate::brokers::{self, SharedRegistry, LOCAL_BROKER_ID};
use crate::errors::{DaemonError, Result};
use crate::sessions::{SessionManager, BROKER_CALL_TIMEOUT};
use crate::token::ct_str_eq;
use crate::users::UserManager;

pub struct AuthdHandler {
    users: Arc<UserManager>,
    sessions: Arc<SessionManager>,
    registry: SharedRegistry,
}

impl AuthdHandler {
    pub fn new(
        users: Arc<UserManager>,
        sessions: Arc<SessionManager>,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            users,
            sessions,
            registry,
        }
    }

    async fn handle_nss(&self, request: NssRequest, conn: &Connection) -> Result<Payload> {
        match request {
            NssRequest::PasswdByName {
                name,
                should_pre_check,
            } => match self.users.passwd_by_name(&name) {
                Ok(entry) => Ok(Payload::Passwd(entry)),
                Err(DaemonError::UnknownUser(_)) if should_pre_check => {
                    self.pre_check_user(&name).await
                }
                Err(e) => Err(e),
            },
            NssRequest::PasswdByUid { uid } => {
                Ok(Payload::Passwd(self.users.passwd_by_uid(uid)?))
            }
            NssRequest::AllPasswds => Ok(Payload::Passwds(self.users.all_passwds()?)),
            NssRequest::GroupByName { name } => {
                Ok(Payload::Group(self.users.group_by_name(&name)?))
            }
            NssRequest::GroupByGid { gid } => Ok(Payload::Group(self.users.group_by_gid(gid)?)),
            NssRequest::AllGroups => Ok(Payload::Groups(self.users.all_groups()?)),
            NssRequest::ShadowByName { name } => {
                Ok(Payload::Shadow(self.users.shadow_by_name(&name)?))
            }
            NssRequest::AllShadows => Ok(Payload::Shadows(self.users.all_shadows()?)),
            NssRequest::EnableUser { name } => {
                info!(
                    "User {name:?} enabled by uid {}",
                    conn.peer.uid
                );
                self.users.set_user_enabled(&name, true)?;
                Ok(Payload::Done)
            }
            NssRequest::DisableUser { name } => {
                info!(
                    "User {name:?} disabled by uid {}",
                    conn.peer.uid
                );
                self.users.set_user_enabled(&name, false)?;
                Ok(Payload::Done)
            }
        }
    }

    /// NSS miss during PAM pre-check: ask the brokers, and synthesize a
    /// temporary entry if one claims the user.
    async fn pre_check_user(&self, name: &str) -> Result<Payload> {
        let registry = brokers::current(&self.registry);
        let claiming = tokio::time::timeout(
            BROKER_CALL_TIMEOUT,
            registry.broker_claiming_user(name),
        )
        .await
        .unwrap_or(None);

        match claiming {
            Some(broker_id) => {
                debug!("Pre-check: broker {broker_id:?} claims {name:?}");
                Ok(Payload::Passwd(self.users.register_temp_user(name)?))
            }
            None => Err(DaemonError::UnknownUser(name.to_owned())),
        }
    }

    async fn handle_pam(&self, request: PamRequest, conn: &mut Connection) -> Result<Payload> {
        self.enforce_user_immutability(&request, conn).await?;

        match request {
            PamRequest::AvailableBrokers => Ok(Payload::Brokers(
                brokers::current(&self.registry).available(),
            )),
            PamRequest::PreviousBroker { username, origin } => Ok(Payload::PreviousBroker(
                self.autoselect_broker(&username, origin).await?,
            )),
            PamRequest::SelectBroker {
                broker_id,
                username,
                lang,
                origin: _,
            } => {
                // A connection re-selecting replaces its previous session.
                if let Some(old) = conn.session_id.take() {
                    self.sessions.abandon(&old).await;
                }

                let (session_id, encryption_key) = self
                    .sessions
                    .select_broker(&broker_id, &username, &lang, conn.event_sender())
                    .await?;
                conn.session_id = Some(session_id.clone());
                conn.pam_user = Some(username);
                Ok(Payload::SessionStarted {
                    session_id,
                    encryption_key,
                })
            }
            PamRequest::AuthenticationModes {
                session_id,
                supported_ui_layouts,
            } => {
                self.enforce_session_ownership(&session_id, conn)?;
                Ok(Payload::AuthModes(
                    self.sessions
                        .authentication_modes(&session_id, &supported_ui_layouts)
                        .await?,
                ))
            }
            PamRequest::SelectAuthenticationMode {
                session_id,
                auth_mode_id,
            } => {
                self.enforce_session_ownership(&session_id, conn)?;
                Ok(Payload::UiLayout(
                    self.sessions
                        .select_authentication_mode(&session_id, &auth_mode_id)
                        .await?,
                ))
            }
            PamRequest::IsAuthenticated {
                session_id,
                authentication_data,
            } => {
                self.enforce_session_ownership(&session_id, conn)?;
                Ok(Payload::AuthResult(
                    self.sessions
                        .is_authenticated(&session_id, &authentication_data)
                        .await?,
                ))
            }
            PamRequest::CancelIsAuthenticated { session_id } => {
                self.enforce_session_ownership(&session_id, conn)?;
                self.sessions.cancel_is_authenticated(&session_id).await?;
                Ok(Payload::Done)
            }
            PamRequest::SetDefaultBrokerForUser {
                username,
                broker_id,
            } => {
                if !brokers::current(&self.registry).contains(&broker_id) {
                    return Err(DaemonError::UnknownBroker(broker_id));
                }
                self.users.set_broker_for_user(&username, &broker_id)?;
                Ok(Payload::Done)
            }
            PamRequest::EndSession { session_id } => {
                self.enforce_session_ownership(&session_id, conn)?;
                self.sessions.end_session(&session_id).await?;
                conn.session_id = None;
                conn.pam_user = None;
                Ok(Payload::Done)
            }
        }
    }

    /// Route a returning user to its bound broker, or apply the
    /// autoselection rules for users without a usable binding.
    pub async fn autoselect_broker(
        &self,
        username: &str,
        origin: SessionOrigin,
    ) -> Result<Option<String>> {
        let registry = brokers::current(&self.registry);

        match self.users.broker_for_user(username) {
            Ok(broker_id) if registry.contains(&broker_id) => return Ok(Some(broker_id)),
            Ok(broker_id) => {
                debug!("User {username:?} bound to unavailable broker {broker_id:?}");
            }
            Err(DaemonError::NoBrokerForUser(_)) => {}
            Err(e) => return Err(e),
        }

        let claiming = tokio::time::timeout(
            BROKER_CALL_TIMEOUT,
            registry.broker_claiming_user(username),
        )
        .await
        .unwrap_or(None);

        // SSH logins of users no broker knows fall back to host identity.
        if origin == SessionOrigin::Ssh && claiming.is_none() {
            return Ok(Some(LOCAL_BROKER_ID.to_owned()));
        }

        // A single configured broker that knows the user needs no prompt.
        let remotes = registry.remote_infos();
        if remotes.len() == 1 && claiming.as_deref() == Some(remotes[0].id.as_str()) {
            return Ok(Some(remotes[0].id.clone()));
        }

        Ok(None)
    }

    /// Once a session fixed its PAM user, any call declaring another user
    /// terminates the session and fails.
    async fn enforce_user_immutability(
        &self,
        request: &PamRequest,
        conn: &mut Connection,
    ) -> Result<()> {
        let declared = match request {
            PamRequest::PreviousBroker { username, .. }
            | PamRequest::SelectBroker { username, .. }
            | PamRequest::SetDefaultBrokerForUser { username, .. } => username,
            _ => return Ok(()),
        };

        let mismatch = conn
            .pam_user
            .as_deref()
            .is_some_and(|current| !declared.eq_ignore_ascii_case(current));
        if !mismatch {
            return Ok(());
        }

        let expected = conn.pam_user.take().unwrap_or_default();
        if let Some(session_id) = conn.session_id.take() {
            info!(
                "Connection {} changed user mid-session; terminating {session_id:?}",
                conn.peer.connection_id
            );
            self.sessions.abandon(&session_id).await;
        }
        Err(DaemonError::UserMismatch {
            expected,
            declared: declared.clone(),
        })
    }

    /// A connection may only drive the session it opened. Unknown ids get
    /// the same answer as foreign ones.
    fn enforce_session_ownership(&self, session_id: &str, conn: &Connection) -> Result<()> {
        let owned = conn
            .session_id
            .as_deref()
            .is_some_and(|own| ct_str_eq(own, session_id));
        if owned {
            Ok(())
        } else {
            Err(DaemonError::UnknownSession(session_id.to_owned()))
        }
    }
}

#[async_trait]
impl RequestHandler for AuthdHandler {
    async fn handle(
        &self,
        request: Request,
        conn: &mut Connection,
    ) -> std::result::Result<Payload, WireError> {
        let result = match request {
            Request::Nss(request) => self.handle_nss(request, conn).await,
            Request::Pam(request) => self.handle_pam(request, conn).await,
        };
        result.map_err(|e| e.to_wire())
    }

    async fn disconnected(&self, conn: Connection) {
        if let Some(session_id) = conn.session_id {
            debug!(
                "Connection {} disconnected with live session {session_id:?}",
                conn.peer.connection_id
            );
            self.sessions.abandon(&session_id).await;
        }
    }
}
