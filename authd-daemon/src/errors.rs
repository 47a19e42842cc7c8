use authd_protocol::protocol::{ErrorKind, WireError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("user {0:?} not found")]
    UnknownUser(String),

    #[error("user with ID {0} not found")]
    UnknownUid(u32),

    #[error("group {0:?} not found")]
    UnknownGroup(String),

    #[error("group with ID {0} not found")]
    UnknownGid(u32),

    #[error("session {0:?} not found")]
    UnknownSession(String),

    #[error("broker {0:?} not found")]
    UnknownBroker(String),

    #[error("no broker assigned to user {0:?}")]
    NoBrokerForUser(String),

    #[error("authentication denied: {0}")]
    Denied(String),

    #[error("user {0:?} is disabled")]
    UserDisabled(String),

    #[error("session user is {expected:?}, request declared {declared:?}")]
    UserMismatch { expected: String, declared: String },

    #[error("temporary user {0:?} would shadow an existing record")]
    TempUserShadows(String),

    #[error("could not find a free ID for {0:?}")]
    IdSpaceExhausted(String),

    #[error("broker {broker_id:?} unavailable: {message}")]
    BrokerUnavailable { broker_id: String, message: String },

    #[error("broker call timed out after {0} seconds")]
    BrokerTimeout(u64),

    #[error("an authentication request is already in flight for this session")]
    AuthAlreadyInFlight,

    #[error("session does not accept {0} in its current state")]
    InvalidSessionState(&'static str),

    #[error("database integrity lost: {0}")]
    Corruption(String),

    #[error("empty username")]
    EmptyUsername,

    #[error("no group provided for user {0:?}")]
    NoGroups(String),

    #[error("no GID provided for default group {0:?}")]
    NoGidForPrimaryGroup(String),

    #[error("empty group name for user {0:?}")]
    EmptyGroupName(String),

    #[error("broker returned no session ID")]
    NoSessionId,

    #[error("broker returned no encryption key")]
    NoEncryptionKey,

    #[error("broker returned an empty UI layout")]
    EmptyUiLayout,

    #[error("invalid user information from broker: {0}")]
    InvalidUserInfo(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Wire-visible classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownUser(_)
            | Self::UnknownUid(_)
            | Self::UnknownGroup(_)
            | Self::UnknownGid(_)
            | Self::UnknownSession(_)
            | Self::UnknownBroker(_)
            | Self::NoBrokerForUser(_) => ErrorKind::NotFound,

            Self::Denied(_) | Self::UserDisabled(_) => ErrorKind::Denied,

            Self::UserMismatch { .. } | Self::TempUserShadows(_) => ErrorKind::UserConflict,

            Self::BrokerUnavailable { .. } | Self::BrokerTimeout(_) | Self::AuthAlreadyInFlight => {
                ErrorKind::Transient
            }

            Self::Corruption(_) => ErrorKind::Corruption,

            Self::IdSpaceExhausted(_)
            | Self::InvalidSessionState(_)
            | Self::EmptyUsername
            | Self::NoGroups(_)
            | Self::NoGidForPrimaryGroup(_)
            | Self::EmptyGroupName(_)
            | Self::NoSessionId
            | Self::NoEncryptionKey
            | Self::EmptyUiLayout
            | Self::InvalidUserInfo(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Normalize into the wire envelope.
    pub fn to_wire(&self) -> WireError {
        WireError::new(self.kind(), self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
