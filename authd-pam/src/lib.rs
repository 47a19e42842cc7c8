//! Reference session driver for the PAM module.
//!
//! Walks the daemon's session state machine and maps every outcome onto a
//! PAM return code. The interactive parts (broker menus, prompts, sealing
//! the challenge under the session key) live behind the [`Conversation`]
//! trait: the terminal and display-manager UIs implement it, tests script
//! it.

use authd_protocol::client::Client;
use authd_protocol::errors::ClientError;
use authd_protocol::protocol::{
    AccessResult, AuthMode, BrokerInfo, ErrorKind, ServerEvent, SessionOrigin, UiLayout,
};
use tracing::{debug, info};

pub mod events;

pub use events::Event;

/// PAM return codes the module can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PamResult {
    Success,
    AuthErr,
    CredUnavail,
    SystemErr,
    /// Hand over to the rest of the PAM stack (local broker).
    Ignore,
    Abort,
}

/// Denials tolerated before the driver gives up; matches the daemon's
/// per-session attempt limit.
const MAX_DENIALS: u32 = 3;

/// Map a daemon error onto the PAM return code.
pub fn pam_result_for_error(err: &ClientError) -> PamResult {
    let Some(wire) = err.wire_error() else {
        return PamResult::SystemErr;
    };
    match wire.kind {
        ErrorKind::Denied => PamResult::AuthErr,
        ErrorKind::UserConflict => PamResult::AuthErr,
        ErrorKind::NotFound => PamResult::CredUnavail,
        ErrorKind::Transient | ErrorKind::Corruption | ErrorKind::Internal => PamResult::SystemErr,
    }
}

/// The language selector passed to brokers: first non-empty of `LANG`,
/// `LC_MESSAGES`, `LC_ALL`, with a trailing `.UTF-8` stripped.
pub fn lang_from_env() -> String {
    let lang = ["LANG", "LC_MESSAGES", "LC_ALL"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "C".to_owned());
    lang.trim_end_matches(".UTF-8").to_owned()
}

/// Interactive surface of the PAM conversation. `None` from any prompt
/// means the user backed out.
pub trait Conversation {
    fn select_broker(&mut self, brokers: &[BrokerInfo]) -> Option<String>;

    fn select_auth_mode(&mut self, modes: &[AuthMode]) -> Option<String>;

    /// Render the layout and return the challenge, already sealed under the
    /// session's encryption key. The driver never sees the plaintext.
    fn seal_challenge(&mut self, layout: &UiLayout, encryption_key: &str) -> Option<String>;

    fn info(&mut self, _message: &str) {}
}

/// UI layouts this driver can render; advertised to brokers when listing
/// authentication modes.
pub fn supported_ui_layouts() -> Vec<UiLayout> {
    vec![
        UiLayout {
            kind: "form".to_owned(),
            label: Some("{label}".to_owned()),
            entry: Some("chars,chars_password".to_owned()),
            wait: Some("true,false".to_owned()),
            ..Default::default()
        },
        UiLayout {
            kind: "qrcode".to_owned(),
            content: Some("{content}".to_owned()),
            wait: Some("true".to_owned()),
            ..Default::default()
        },
    ]
}

pub struct SessionDriver {
    client: Client,
    origin: SessionOrigin,
}

impl SessionDriver {
    pub fn new(client: Client, origin: SessionOrigin) -> Self {
        Self { client, origin }
    }

    /// Run a whole authentication conversation for `username`.
    pub async fn authenticate(
        &mut self,
        username: &str,
        conversation: &mut impl Conversation,
    ) -> PamResult {
        match self.drive(username, conversation).await {
            Ok(result) => result,
            Err(e) => {
                debug!("Session driver failed: {e}");
                pam_result_for_error(&e)
            }
        }
    }

    async fn drive(
        &mut self,
        username: &str,
        conversation: &mut impl Conversation,
    ) -> Result<PamResult, ClientError> {
        let broker_id = match self.pick_broker(username, conversation).await? {
            Some(broker_id) => broker_id,
            None => return Ok(PamResult::Abort),
        };
        if broker_id == "local" {
            // Host identity: nothing for us to do, let the stack proceed.
            return Ok(PamResult::Ignore);
        }

        let lang = lang_from_env();
        let (session_id, encryption_key) = self
            .client
            .select_broker(&broker_id, username, &lang, self.origin)
            .await?;
        info!("Session {session_id:?} started with broker {broker_id:?}");

        let mut denials = 0;
        loop {
            let modes = self
                .client
                .authentication_modes(&session_id, supported_ui_layouts())
                .await?;
            if modes.is_empty() {
                self.finish(&session_id).await;
                return Ok(PamResult::CredUnavail);
            }

            let Some(mode_id) = conversation.select_auth_mode(&modes) else {
                self.finish(&session_id).await;
                return Ok(PamResult::Abort);
            };
            let layout = self
                .client
                .select_authentication_mode(&session_id, &mode_id)
                .await?;

            let Some(challenge) = conversation.seal_challenge(&layout, &encryption_key) else {
                self.finish(&session_id).await;
                return Ok(PamResult::Abort);
            };
            let reply = self.client.is_authenticated(&session_id, &challenge).await?;

            if let Some(message) = &reply.message {
                conversation.info(message);
            }

            match reply.access {
                AccessResult::Granted => {
                    self.client.end_session(&session_id).await?;
                    return Ok(PamResult::Success);
                }
                AccessResult::Denied => {
                    denials += 1;
                    if denials >= MAX_DENIALS {
                        self.finish(&session_id).await;
                        return Ok(PamResult::AuthErr);
                    }
                }
                AccessResult::Cancelled => {
                    self.finish(&session_id).await;
                    return Ok(PamResult::Abort);
                }
                AccessResult::Retry | AccessResult::Next => {}
            }

            // Broker-pushed reselects just loop back into mode selection.
            while let Some(event) = self.client.take_event() {
                let ServerEvent::ReselectAuthMode { .. } = event;
                debug!("Broker requested auth mode reselection");
            }
        }
    }

    async fn pick_broker(
        &mut self,
        username: &str,
        conversation: &mut impl Conversation,
    ) -> Result<Option<String>, ClientError> {
        if let Some(broker_id) = self.client.previous_broker(username, self.origin).await? {
            return Ok(Some(broker_id));
        }
        let brokers = self.client.available_brokers().await?;
        Ok(conversation.select_broker(&brokers))
    }

    /// Best-effort termination; the daemon reaps leftovers on disconnect
    /// anyway.
    async fn finish(&mut self, session_id: &str) {
        if let Err(e) = self.client.end_session(session_id).await {
            debug!("Could not end session {session_id:?}: {e}");
        }
    }
}
