use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ProtocolError;

/// Maximum message size (1MB) — identity payloads on a local Unix socket
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Stable, wire-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown user, group, broker, or session.
    NotFound,
    /// Authentication refused; final for this attempt.
    Denied,
    /// UID/GID clash or mid-session user change attempt. Do not retry with
    /// the same arguments.
    UserConflict,
    /// Broker unavailable or timed out; the caller may retry.
    Transient,
    /// Database integrity lost; the daemon self-heals, do not retry.
    Corruption,
    /// Unclassified programmer error.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Denied => "denied",
            Self::UserConflict => "user_conflict",
            Self::Transient => "transient",
            Self::Corruption => "corruption",
            Self::Internal => "internal",
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound => 1,
            Self::Denied => 2,
            Self::UserConflict => 3,
            Self::Transient => 4,
            Self::Corruption => 5,
            Self::Internal => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error envelope returned in place of a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: u32,
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WireError {}

/// Where the PAM conversation was initiated from. Drives broker
/// autoselection for SSH logins of users unknown to every broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionOrigin {
    #[default]
    Interactive,
    Ssh,
}

/// passwd(5)-shaped user entry served to NSS clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

/// shadow(5)-shaped entry served to NSS clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowEntry {
    pub name: String,
    pub last_pwd_change: i64,
    pub min_pwd_age: i64,
    pub max_pwd_age: i64,
    pub pwd_warn_period: i64,
    pub pwd_inactivity: i64,
    pub expiration_date: i64,
}

/// group(5)-shaped entry served to NSS clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub passwd: String,
    pub members: Vec<String>,
}

/// A configured broker, as presented to broker-selection UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: String,
    pub name: String,
    pub brand_icon: Option<String>,
}

/// An authentication mode offered by a broker (password, QR, device code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMode {
    pub id: String,
    pub label: String,
}

/// Broker-supplied description of the widgets for one authentication mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiLayout {
    /// Layout family ("form", "qrcode", "newpassword", ...).
    pub kind: String,
    pub label: Option<String>,
    pub entry: Option<String>,
    pub button: Option<String>,
    pub wait: Option<String>,
    pub content: Option<String>,
}

impl UiLayout {
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty()
    }
}

/// Broker verdict on one authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessResult {
    Granted,
    Denied,
    Cancelled,
    /// Re-prompt with the same mode.
    Retry,
    /// Advance to a chained mode; the client must select again.
    Next,
}

/// Outcome of an `IsAuthenticated` round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    pub access: AccessResult,
    pub message: Option<String>,
}

/// Read-only identity resolution plus user administration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NssRequest {
    PasswdByName {
        name: String,
        /// Ask brokers about unknown users and synthesize a temporary entry.
        /// Only the PAM pre-check sets this.
        #[serde(default)]
        should_pre_check: bool,
    },
    PasswdByUid {
        uid: u32,
    },
    AllPasswds,
    GroupByName {
        name: String,
    },
    GroupByGid {
        gid: u32,
    },
    AllGroups,
    ShadowByName {
        name: String,
    },
    AllShadows,
    EnableUser {
        name: String,
    },
    DisableUser {
        name: String,
    },
}

/// Mutating session orchestration for PAM clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PamRequest {
    AvailableBrokers,
    /// Returns the broker a returning user should be routed to, applying
    /// the autoselection rules for unknown users.
    PreviousBroker {
        username: String,
        #[serde(default)]
        origin: SessionOrigin,
    },
    SelectBroker {
        broker_id: String,
        username: String,
        lang: String,
        #[serde(default)]
        origin: SessionOrigin,
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
        /// Challenge payload, already encrypted under the session's key.
        /// Opaque to the daemon.
        authentication_data: String,
    },
    CancelIsAuthenticated {
        session_id: String,
    },
    SetDefaultBrokerForUser {
        username: String,
        broker_id: String,
    },
    EndSession {
        session_id: String,
    },
}

/// A request on one of the two service surfaces. The variant is the
/// declared message kind of the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Nss(NssRequest),
    Pam(PamRequest),
}

impl Request {
    /// Return the variant name as a static string (for lightweight error reporting)
    pub fn variant_name(&self) -> &'static str {
        match self {
            Request::Nss(r) => match r {
                NssRequest::PasswdByName { .. } => "PasswdByName",
                NssRequest::PasswdByUid { .. } => "PasswdByUid",
                NssRequest::AllPasswds => "AllPasswds",
                NssRequest::GroupByName { .. } => "GroupByName",
                NssRequest::GroupByGid { .. } => "GroupByGid",
                NssRequest::AllGroups => "AllGroups",
                NssRequest::ShadowByName { .. } => "ShadowByName",
                NssRequest::AllShadows => "AllShadows",
                NssRequest::EnableUser { .. } => "EnableUser",
                NssRequest::DisableUser { .. } => "DisableUser",
            },
            Request::Pam(r) => match r {
                PamRequest::AvailableBrokers => "AvailableBrokers",
                PamRequest::PreviousBroker { .. } => "PreviousBroker",
                PamRequest::SelectBroker { .. } => "SelectBroker",
                PamRequest::AuthenticationModes { .. } => "AuthenticationModes",
                PamRequest::SelectAuthenticationMode { .. } => "SelectAuthenticationMode",
                PamRequest::IsAuthenticated { .. } => "IsAuthenticated",
                PamRequest::CancelIsAuthenticated { .. } => "CancelIsAuthenticated",
                PamRequest::SetDefaultBrokerForUser { .. } => "SetDefaultBrokerForUser",
                PamRequest::EndSession { .. } => "EndSession",
            },
        }
    }
}

/// Successful response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Operation completed, nothing to return.
    Done,
    Passwd(PasswdEntry),
    Passwds(Vec<PasswdEntry>),
    Group(GroupEntry),
    Groups(Vec<GroupEntry>),
    Shadow(ShadowEntry),
    Shadows(Vec<ShadowEntry>),
    Brokers(Vec<BrokerInfo>),
    PreviousBroker(Option<String>),
    SessionStarted {
        session_id: String,
        encryption_key: String,
    },
    AuthModes(Vec<AuthMode>),
    UiLayout(UiLayout),
    AuthResult(AuthReply),
}

/// Client-to-server message with request ID for correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

/// Server-to-client message: either a response to a request, or a pushed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Response {
        id: u64,
        result: std::result::Result<Payload, WireError>,
    },
    Event {
        event: ServerEvent,
    },
}

/// Server-pushed events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    /// The broker invalidated the selected authentication mode; the client
    /// should re-run mode selection. Throttled per session.
    ReselectAuthMode { session_id: String },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Encode a request envelope to length-prefixed bincode bytes
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    let size = bincode::serialized_size(envelope).map_err(ProtocolError::Encode)?;
    if size > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::MessageTooLarge);
    }
    let len = size as u32;
    let mut frame = Vec::with_capacity(4 + size as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    bincode::serialize_into(&mut frame, envelope).map_err(ProtocolError::Encode)?;
    Ok(frame)
}

/// Decode a request envelope from raw bincode payload (framing already stripped)
pub fn decode_envelope(bytes: &[u8]) -> Result<RequestEnvelope> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}

/// Encode a server message to length-prefixed bincode bytes
pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>> {
    let size = bincode::serialized_size(msg).map_err(ProtocolError::Encode)?;
    if size > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::MessageTooLarge);
    }
    let len = size as u32;
    let mut frame = Vec::with_capacity(4 + size as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    bincode::serialize_into(&mut frame, msg).map_err(ProtocolError::Encode)?;
    Ok(frame)
}

/// Decode a server message from raw bincode payload (framing already stripped)
pub fn decode_server_message(bytes: &[u8]) -> Result<ServerMessage> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}
