//! Remote brokers reached over their management socket.
//!
//! Every declared broker listens on a framed stream socket under the broker
//! runtime directory, named after its manifest id. Frames are 4-byte
//! big-endian length prefixes followed by bincode, one request and one
//! reply per call. The display-manager and bus-activation plumbing around
//! brokers lives outside the daemon; this client only carries session
//! traffic.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use authd_protocol::protocol::{AuthMode, UiLayout};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use super::{
    Broker, BrokerAuthReply, BrokerDialer, BrokerManifest, BrokerUserInfo, NewSessionReply,
};
use crate::errors::{DaemonError, Result};

/// Frames larger than this are broker bugs.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Daemon-to-broker request. Public so broker implementations can speak
/// the management protocol.
#[derive(Debug, Serialize, Deserialize)]
pub enum BrokerRequest {
    NewSession {
        session_id: String,
        username: String,
        lang: String,
    },
    AuthenticationModes {
        session_id: String,
        supported_ui_layouts: Vec<UiLayout>,
    },
    SelectAuthenticationMode {
        session_id: String,
        auth_mode_id: String,
    },
    IsAuthenticated {
        session_id: String,
        authentication_data: String,
    },
    CancelIsAuthenticated {
        session_id: String,
    },
    EndSession {
        session_id: String,
    },
    UserPreCheck {
        username: String,
    },
}

/// Broker-to-daemon reply.
#[derive(Debug, Serialize, Deserialize)]
pub enum BrokerReply {
    Session {
        session_id: String,
        encryption_key: String,
    },
    AuthModes(Vec<AuthMode>),
    UiLayout(UiLayout),
    AuthResult {
        access: String,
        data: String,
    },
    UserInfo(Option<BrokerUserInfo>),
    Done,
    Error(String),
}

/// Path of a broker's management socket under the runtime directory.
pub fn broker_socket_path(runtime_dir: &Path, broker_id: &str) -> PathBuf {
    runtime_dir.join(format!("{broker_id}.sock"))
}

pub struct SocketBroker {
    id: String,
    socket_path: PathBuf,
}

impl SocketBroker {
    pub fn new(id: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            socket_path: socket_path.into(),
        }
    }

    fn unavailable(&self, message: impl Into<String>) -> DaemonError {
        DaemonError::BrokerUnavailable {
            broker_id: self.id.clone(),
            message: message.into(),
        }
    }

    async fn call(&self, request: &BrokerRequest) -> Result<BrokerReply> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let payload = bincode::serialize(request)
            .map_err(|e| DaemonError::Internal(format!("can't encode broker request: {e}")))?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        stream
            .write_all(&frame)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(self.unavailable("oversized reply frame"));
        }
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let reply: BrokerReply = bincode::deserialize(&buf)
            .map_err(|e| self.unavailable(format!("undecodable reply: {e}")))?;

        match reply {
            BrokerReply::Error(message) => Err(self.unavailable(message)),
            reply => Ok(reply),
        }
    }

    fn unexpected<T>(&self, wanted: &str) -> Result<T> {
        Err(self.unavailable(format!("unexpected reply, wanted {wanted}")))
    }
}

#[async_trait]
impl Broker for SocketBroker {
    async fn new_session(
        &self,
        session_id: &str,
        username: &str,
        lang: &str,
    ) -> Result<NewSessionReply> {
        match self
            .call(&BrokerRequest::NewSession {
                session_id: session_id.to_owned(),
                username: username.to_owned(),
                lang: lang.to_owned(),
            })
            .await?
        {
            BrokerReply::Session {
                session_id,
                encryption_key,
            } => Ok(NewSessionReply {
                session_id,
                encryption_key,
            }),
            _ => self.unexpected("Session"),
        }
    }

    async fn authentication_modes(
        &self,
        session_id: &str,
        supported_ui_layouts: &[UiLayout],
    ) -> Result<Vec<AuthMode>> {
        match self
            .call(&BrokerRequest::AuthenticationModes {
                session_id: session_id.to_owned(),
                supported_ui_layouts: supported_ui_layouts.to_vec(),
            })
            .await?
        {
            BrokerReply::AuthModes(modes) => Ok(modes),
            _ => self.unexpected("AuthModes"),
        }
    }

    async fn select_authentication_mode(
        &self,
        session_id: &str,
        auth_mode_id: &str,
    ) -> Result<UiLayout> {
        match self
            .call(&BrokerRequest::SelectAuthenticationMode {
                session_id: session_id.to_owned(),
                auth_mode_id: auth_mode_id.to_owned(),
            })
            .await?
        {
            BrokerReply::UiLayout(layout) => Ok(layout),
            _ => self.unexpected("UiLayout"),
        }
    }

    async fn is_authenticated(
        &self,
        session_id: &str,
        authentication_data: &str,
    ) -> Result<BrokerAuthReply> {
        match self
            .call(&BrokerRequest::IsAuthenticated {
                session_id: session_id.to_owned(),
                authentication_data: authentication_data.to_owned(),
            })
            .await?
        {
            BrokerReply::AuthResult { access, data } => Ok(BrokerAuthReply { access, data }),
            _ => self.unexpected("AuthResult"),
        }
    }

    async fn cancel_is_authenticated(&self, session_id: &str) {
        if let Err(e) = self
            .call(&BrokerRequest::CancelIsAuthenticated {
                session_id: session_id.to_owned(),
            })
            .await
        {
            debug!("Cancel forwarding to broker {:?} failed: {e}", self.id);
        }
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        match self
            .call(&BrokerRequest::EndSession {
                session_id: session_id.to_owned(),
            })
            .await?
        {
            BrokerReply::Done => Ok(()),
            _ => self.unexpected("Done"),
        }
    }

    async fn user_pre_check(&self, username: &str) -> Result<Option<BrokerUserInfo>> {
        match self
            .call(&BrokerRequest::UserPreCheck {
                username: username.to_owned(),
            })
            .await?
        {
            BrokerReply::UserInfo(info) => Ok(info),
            _ => self.unexpected("UserInfo"),
        }
    }
}

/// Dialer for socket-reachable brokers: a broker is available when its
/// socket exists under the runtime directory.
pub struct SocketBrokerDialer {
    runtime_dir: PathBuf,
}

impl SocketBrokerDialer {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }
}

impl BrokerDialer for SocketBrokerDialer {
    fn dial(&self, manifest: &BrokerManifest) -> Option<Arc<dyn Broker>> {
        let socket_path = broker_socket_path(&self.runtime_dir, &manifest.id);
        if !socket_path.exists() {
            return None;
        }
        Some(Arc::new(SocketBroker::new(manifest.id.clone(), socket_path)))
    }
}
