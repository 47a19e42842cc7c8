//! In-process broker double for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use authd_protocol::protocol::{AuthMode, BrokerInfo, UiLayout};
use parking_lot::Mutex;

use super::{Broker, BrokerAuthReply, BrokerGroupInfo, BrokerUserInfo, NewSessionReply};
use crate::errors::{DaemonError, Result};

pub(crate) struct TestBroker {
    pub id: String,
    /// None echoes the daemon-proposed session id.
    pub session_id_override: Option<String>,
    pub encryption_key: String,
    pub modes: Vec<AuthMode>,
    pub layout: UiLayout,
    pub auth_replies: Mutex<VecDeque<BrokerAuthReply>>,
    pub known_users: Vec<String>,
    pub cancels: AtomicUsize,
    pub ended_sessions: Mutex<Vec<String>>,
}

impl TestBroker {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            session_id_override: None,
            encryption_key: "test-encryption-key".to_owned(),
            modes: vec![AuthMode {
                id: "password".to_owned(),
                label: "Password".to_owned(),
            }],
            layout: UiLayout {
                kind: "form".to_owned(),
                label: Some("Password".to_owned()),
                entry: Some("chars_password".to_owned()),
                ..Default::default()
            },
            auth_replies: Mutex::new(VecDeque::new()),
            known_users: Vec::new(),
            cancels: AtomicUsize::new(0),
            ended_sessions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn info(&self) -> BrokerInfo {
        BrokerInfo {
            id: self.id.clone(),
            name: format!("Test broker {}", self.id),
            brand_icon: None,
        }
    }

    pub(crate) fn push_reply(&self, access: &str, data: impl Into<String>) {
        self.auth_replies.lock().push_back(BrokerAuthReply {
            access: access.to_owned(),
            data: data.into(),
        });
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

/// User info JSON a broker would attach to a granted verdict.
pub(crate) fn granted_user_info(name: &str, local_groups: &[&str]) -> String {
    let mut groups = vec![BrokerGroupInfo {
        name: name.to_owned(),
        local: false,
    }];
    groups.extend(local_groups.iter().map(|g| BrokerGroupInfo {
        name: (*g).to_owned(),
        local: true,
    }));
    serde_json::to_string(&BrokerUserInfo {
        name: name.to_owned(),
        gecos: name.to_owned(),
        home: format!("/home/{name}"),
        shell: "/bin/bash".to_owned(),
        groups,
    })
    .unwrap()
}

#[async_trait]
impl Broker for TestBroker {
    async fn new_session(
        &self,
        session_id: &str,
        _username: &str,
        _lang: &str,
    ) -> Result<NewSessionReply> {
        Ok(NewSessionReply {
            session_id: self
                .session_id_override
                .clone()
                .unwrap_or_else(|| session_id.to_owned()),
            encryption_key: self.encryption_key.clone(),
        })
    }

    async fn authentication_modes(
        &self,
        _session_id: &str,
        _supported_ui_layouts: &[UiLayout],
    ) -> Result<Vec<AuthMode>> {
        Ok(self.modes.clone())
    }

    async fn select_authentication_mode(
        &self,
        _session_id: &str,
        auth_mode_id: &str,
    ) -> Result<UiLayout> {
        if !self.modes.iter().any(|m| m.id == auth_mode_id) {
            return Err(DaemonError::Internal(format!(
                "unknown auth mode {auth_mode_id:?}"
            )));
        }
        Ok(self.layout.clone())
    }

    async fn is_authenticated(
        &self,
        _session_id: &str,
        _authentication_data: &str,
    ) -> Result<BrokerAuthReply> {
        self.auth_replies.lock().pop_front().ok_or_else(|| {
            DaemonError::Internal("test broker has no scripted auth reply".into())
        })
    }

    async fn cancel_is_authenticated(&self, _session_id: &str) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        self.ended_sessions.lock().push(session_id.to_owned());
        Ok(())
    }

    async fn user_pre_check(&self, username: &str) -> Result<Option<BrokerUserInfo>> {
        if !self.known_users.iter().any(|u| u == username) {
            return Ok(None);
        }
        Ok(Some(BrokerUserInfo {
            name: username.to_owned(),
            gecos: username.to_owned(),
            home: format!("/home/{username}"),
            shell: "/bin/bash".to_owned(),
            groups: vec![BrokerGroupInfo {
                name: username.to_owned(),
                local: false,
            }],
        }))
    }
}
