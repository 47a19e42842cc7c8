//! Events flowing through the PAM adapter.
//!
//! The interactive front-ends react to a closed set of variants; each UI
//! pattern-matches the whole union so a new variant is a compile error
//! everywhere it matters.

use authd_protocol::protocol::{AccessResult, UiLayout};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The user picked (or was routed to) a broker.
    BrokerSelected { broker_id: String },
    /// The daemon opened the session and returned the key material.
    SessionStarted {
        session_id: String,
        encryption_key: String,
    },
    /// The broker described the widgets for the selected mode.
    UiLayoutReceived { layout: UiLayout },
    /// One challenge exchange concluded.
    AuthResult {
        access: AccessResult,
        message: Option<String>,
    },
    /// The broker invalidated the current mode; selection starts over.
    ReselectAuthMode,
    /// The user or the broker aborted the conversation.
    Cancelled,
    SessionEnded,
}
