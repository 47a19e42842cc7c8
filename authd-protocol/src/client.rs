use std::collections::VecDeque;
use std::path::Path;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::{
    errors::ClientError,
    protocol::{
        decode_server_message, encode_envelope, AuthMode, AuthReply, BrokerInfo, GroupEntry,
        NssRequest, PamRequest, PasswdEntry, Payload, Request, RequestEnvelope, ServerEvent,
        ServerMessage, SessionOrigin, ShadowEntry, UiLayout, MAX_MESSAGE_SIZE,
    },
};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Async client for the daemon socket, shared by the PAM session driver,
/// the NSS shared library, and `authctl`.
///
/// One request is in flight at a time; events pushed by the server while a
/// response is awaited are buffered and drained via [`Client::take_event`].
pub struct Client {
    stream: UnixStream,
    next_id: u64,
    events: VecDeque<ServerEvent>,
}

impl Client {
    /// Connect to the daemon at the given socket path
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;
        Ok(Self {
            stream,
            next_id: 1,
            events: VecDeque::new(),
        })
    }

    /// Pop the oldest buffered server-pushed event, if any.
    pub fn take_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Send a request and wait for its correlated response.
    pub async fn call(&mut self, request: Request) -> Result<Payload> {
        let request_type = request.variant_name();
        let id = self.next_id;
        self.next_id += 1;

        let frame = encode_envelope(&RequestEnvelope { id, request })?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| ClientError::Send {
                request_type,
                source: e,
            })?;

        loop {
            match self.read_message(request_type).await? {
                ServerMessage::Response { id: got, result } if got == id => {
                    return result.map_err(ClientError::Daemon);
                }
                ServerMessage::Response { .. } => {
                    // Stale response from an abandoned request; skip it.
                    continue;
                }
                ServerMessage::Event { event } => {
                    self.events.push_back(event);
                }
            }
        }
    }

    async fn read_message(&mut self, request_type: &'static str) -> Result<ServerMessage> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ClientError::Disconnected,
                _ => ClientError::Receive {
                    request_type,
                    source: e,
                },
            })?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ClientError::MessageTooLarge);
        }

        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| ClientError::Receive {
                request_type,
                source: e,
            })?;

        Ok(decode_server_message(&buf)?)
    }

    // =========================================================================
    // NSS surface
    // =========================================================================

    pub async fn passwd_by_name(&mut self, name: &str, should_pre_check: bool) -> Result<PasswdEntry> {
        match self
            .call(Request::Nss(NssRequest::PasswdByName {
                name: name.to_owned(),
                should_pre_check,
            }))
            .await?
        {
            Payload::Passwd(entry) => Ok(entry),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "PasswdByName",
            }),
        }
    }

    pub async fn passwd_by_uid(&mut self, uid: u32) -> Result<PasswdEntry> {
        match self.call(Request::Nss(NssRequest::PasswdByUid { uid })).await? {
            Payload::Passwd(entry) => Ok(entry),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "PasswdByUid",
            }),
        }
    }

    pub async fn all_passwds(&mut self) -> Result<Vec<PasswdEntry>> {
        match self.call(Request::Nss(NssRequest::AllPasswds)).await? {
            Payload::Passwds(entries) => Ok(entries),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "AllPasswds",
            }),
        }
    }

    pub async fn group_by_name(&mut self, name: &str) -> Result<GroupEntry> {
        match self
            .call(Request::Nss(NssRequest::GroupByName {
                name: name.to_owned(),
            }))
            .await?
        {
            Payload::Group(entry) => Ok(entry),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "GroupByName",
            }),
        }
    }

    pub async fn group_by_gid(&mut self, gid: u32) -> Result<GroupEntry> {
        match self.call(Request::Nss(NssRequest::GroupByGid { gid })).await? {
            Payload::Group(entry) => Ok(entry),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "GroupByGid",
            }),
        }
    }

    pub async fn all_groups(&mut self) -> Result<Vec<GroupEntry>> {
        match self.call(Request::Nss(NssRequest::AllGroups)).await? {
            Payload::Groups(entries) => Ok(entries),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "AllGroups",
            }),
        }
    }

    pub async fn shadow_by_name(&mut self, name: &str) -> Result<ShadowEntry> {
        match self
            .call(Request::Nss(NssRequest::ShadowByName {
                name: name.to_owned(),
            }))
            .await?
        {
            Payload::Shadow(entry) => Ok(entry),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "ShadowByName",
            }),
        }
    }

    pub async fn all_shadows(&mut self) -> Result<Vec<ShadowEntry>> {
        match self.call(Request::Nss(NssRequest::AllShadows)).await? {
            Payload::Shadows(entries) => Ok(entries),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "AllShadows",
            }),
        }
    }

    pub async fn enable_user(&mut self, name: &str) -> Result<()> {
        self.call(Request::Nss(NssRequest::EnableUser {
            name: name.to_owned(),
        }))
        .await?;
        Ok(())
    }

    pub async fn disable_user(&mut self, name: &str) -> Result<()> {
        self.call(Request::Nss(NssRequest::DisableUser {
            name: name.to_owned(),
        }))
        .await?;
        Ok(())
    }

    // =========================================================================
    // PAM surface
    // =========================================================================

    pub async fn available_brokers(&mut self) -> Result<Vec<BrokerInfo>> {
        match self.call(Request::Pam(PamRequest::AvailableBrokers)).await? {
            Payload::Brokers(brokers) => Ok(brokers),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "AvailableBrokers",
            }),
        }
    }

    pub async fn previous_broker(
        &mut self,
        username: &str,
        origin: SessionOrigin,
    ) -> Result<Option<String>> {
        match self
            .call(Request::Pam(PamRequest::PreviousBroker {
                username: username.to_owned(),
                origin,
            }))
            .await?
        {
            Payload::PreviousBroker(broker_id) => Ok(broker_id),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "PreviousBroker",
            }),
        }
    }

    /// Returns `(session_id, encryption_key)`.
    pub async fn select_broker(
        &mut self,
        broker_id: &str,
        username: &str,
        lang: &str,
        origin: SessionOrigin,
    ) -> Result<(String, String)> {
        match self
            .call(Request::Pam(PamRequest::SelectBroker {
                broker_id: broker_id.to_owned(),
                username: username.to_owned(),
                lang: lang.to_owned(),
                origin,
            }))
            .await?
        {
            Payload::SessionStarted {
                session_id,
                encryption_key,
            } => Ok((session_id, encryption_key)),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "SelectBroker",
            }),
        }
    }

    pub async fn authentication_modes(
        &mut self,
        session_id: &str,
        supported_ui_layouts: Vec<UiLayout>,
    ) -> Result<Vec<AuthMode>> {
        match self
            .call(Request::Pam(PamRequest::AuthenticationModes {
                session_id: session_id.to_owned(),
                supported_ui_layouts,
            }))
            .await?
        {
            Payload::AuthModes(modes) => Ok(modes),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "AuthenticationModes",
            }),
        }
    }

    pub async fn select_authentication_mode(
        &mut self,
        session_id: &str,
        auth_mode_id: &str,
    ) -> Result<UiLayout> {
        match self
            .call(Request::Pam(PamRequest::SelectAuthenticationMode {
                session_id: session_id.to_owned(),
                auth_mode_id: auth_mode_id.to_owned(),
            }))
            .await?
        {
            Payload::UiLayout(layout) => Ok(layout),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "SelectAuthenticationMode",
            }),
        }
    }

    pub async fn is_authenticated(
        &mut self,
        session_id: &str,
        authentication_data: &str,
    ) -> Result<AuthReply> {
        match self
            .call(Request::Pam(PamRequest::IsAuthenticated {
                session_id: session_id.to_owned(),
                authentication_data: authentication_data.to_owned(),
            }))
            .await?
        {
            Payload::AuthResult(reply) => Ok(reply),
            _ => Err(ClientError::UnexpectedPayload {
                request_type: "IsAuthenticated",
            }),
        }
    }

    pub async fn cancel_is_authenticated(&mut self, session_id: &str) -> Result<()> {
        self.call(Request::Pam(PamRequest::CancelIsAuthenticated {
            session_id: session_id.to_owned(),
        }))
        .await?;
        Ok(())
    }

    pub async fn set_default_broker_for_user(
        &mut self,
        username: &str,
        broker_id: &str,
    ) -> Result<()> {
        self.call(Request::Pam(PamRequest::SetDefaultBrokerForUser {
            username: username.to_owned(),
            broker_id: broker_id.to_owned(),
        }))
        .await?;
        Ok(())
    }

    pub async fn end_session(&mut self, session_id: &str) -> Result<()> {
        self.call(Request::Pam(PamRequest::EndSession {
            session_id: session_id.to_owned(),
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
