//! The synthetic `local` broker.
//!
//! Selecting it means "authenticate against host identity, not a remote
//! provider": the PAM module hands control back to the rest of the stack,
//! so the daemon never runs a session against it. It still appears in the
//! availability list so clients can offer it.

use async_trait::async_trait;
use authd_protocol::protocol::{AuthMode, BrokerInfo, UiLayout};

use super::{Broker, BrokerAuthReply, BrokerUserInfo, NewSessionReply, LOCAL_BROKER_ID};
use crate::errors::{DaemonError, Result};

pub struct LocalBroker;

pub fn info() -> BrokerInfo {
    BrokerInfo {
        id: LOCAL_BROKER_ID.to_owned(),
        name: "Local account".to_owned(),
        brand_icon: None,
    }
}

fn no_sessions<T>() -> Result<T> {
    Err(DaemonError::Internal(
        "the local broker does not run authentication sessions".into(),
    ))
}

#[async_trait]
impl Broker for LocalBroker {
    async fn new_session(&self, _: &str, _: &str, _: &str) -> Result<NewSessionReply> {
        no_sessions()
    }

    async fn authentication_modes(&self, _: &str, _: &[UiLayout]) -> Result<Vec<AuthMode>> {
        no_sessions()
    }

    async fn select_authentication_mode(&self, _: &str, _: &str) -> Result<UiLayout> {
        no_sessions()
    }

    async fn is_authenticated(&self, _: &str, _: &str) -> Result<BrokerAuthReply> {
        no_sessions()
    }

    async fn cancel_is_authenticated(&self, _: &str) {}

    async fn end_session(&self, _: &str) -> Result<()> {
        Ok(())
    }

    /// Host users are resolved by the rest of the NSS stack, never here.
    async fn user_pre_check(&self, _: &str) -> Result<Option<BrokerUserInfo>> {
        Ok(None)
    }
}
