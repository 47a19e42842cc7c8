//! Broker discovery and routing.
//!
//! Brokers are out-of-process identity providers declared by `.conf`
//! manifests in a configuration directory. The registry dials each declared
//! broker at load time and only lists the ones that answered, plus the
//! synthetic `local` broker ("use host identity, no remote provider").
//! Reconfiguration builds a fresh registry and swaps it in whole.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use authd_protocol::protocol::{AuthMode, BrokerInfo, UiLayout};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{DaemonError, Result};

pub mod local;
pub mod manifest;
pub mod remote;
#[cfg(test)]
pub(crate) mod testing;

pub use manifest::BrokerManifest;

/// Id of the synthetic host-identity broker.
pub const LOCAL_BROKER_ID: &str = "local";

/// Session handle returned by a broker.
#[derive(Debug, Clone)]
pub struct NewSessionReply {
    pub session_id: String,
    pub encryption_key: String,
}

/// Raw outcome of one authentication exchange. The access verdict is kept
/// as the broker sent it; the session manager maps unknown verdicts to a
/// denial with a diagnostic.
#[derive(Debug, Clone)]
pub struct BrokerAuthReply {
    pub access: String,
    /// Verdict-dependent payload: user information JSON on a grant, an
    /// optional message otherwise.
    pub data: String,
}

/// User identity as declared by a broker on a granted authentication or a
/// pre-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerUserInfo {
    pub name: String,
    #[serde(default)]
    pub gecos: String,
    pub home: String,
    pub shell: String,
    pub groups: Vec<BrokerGroupInfo>,
}

/// A group a broker declares for a user. Local groups live only in the
/// host's group file and never receive a GID from the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerGroupInfo {
    pub name: String,
    #[serde(default)]
    pub local: bool,
}

/// Capability surface of one broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a session. `session_id` is the daemon-proposed identifier; the
    /// broker echoes it or supplies its own.
    async fn new_session(
        &self,
        session_id: &str,
        username: &str,
        lang: &str,
    ) -> Result<NewSessionReply>;

    async fn authentication_modes(
        &self,
        session_id: &str,
        supported_ui_layouts: &[UiLayout],
    ) -> Result<Vec<AuthMode>>;

    async fn select_authentication_mode(
        &self,
        session_id: &str,
        auth_mode_id: &str,
    ) -> Result<UiLayout>;

    async fn is_authenticated(
        &self,
        session_id: &str,
        authentication_data: &str,
    ) -> Result<BrokerAuthReply>;

    /// Abort the pending authentication, if any. Idempotent.
    async fn cancel_is_authenticated(&self, session_id: &str);

    async fn end_session(&self, session_id: &str) -> Result<()>;

    /// Whether the broker knows this user, without starting a session.
    async fn user_pre_check(&self, username: &str) -> Result<Option<BrokerUserInfo>>;
}

impl std::fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Broker")
    }
}

/// Transport factory: turns a manifest into a live broker, or reports it
/// unavailable.
pub trait BrokerDialer: Send + Sync {
    fn dial(&self, manifest: &BrokerManifest) -> Option<Arc<dyn Broker>>;
}

pub struct BrokerRegistry {
    infos: Vec<BrokerInfo>,
    by_id: HashMap<String, Arc<dyn Broker>>,
}

impl BrokerRegistry {
    /// Scan `conf_dir` for broker manifests and dial each declared broker.
    /// Brokers that do not answer are left out of the availability list.
    pub fn load(conf_dir: &Path, dialer: &dyn BrokerDialer) -> Self {
        let mut registry = Self::empty();

        for manifest in manifest::load_manifests(conf_dir) {
            match dialer.dial(&manifest) {
                Some(broker) => {
                    info!("Broker {:?} is available", manifest.id);
                    registry.infos.push(BrokerInfo {
                        id: manifest.id.clone(),
                        name: manifest.name.clone(),
                        brand_icon: manifest.brand_icon.clone(),
                    });
                    registry.by_id.insert(manifest.id, broker);
                }
                None => {
                    warn!("Broker {:?} did not answer; leaving it out", manifest.id);
                }
            }
        }

        registry
    }

    /// Registry with only the synthetic local broker.
    pub fn empty() -> Self {
        let mut by_id: HashMap<String, Arc<dyn Broker>> = HashMap::new();
        by_id.insert(LOCAL_BROKER_ID.to_owned(), Arc::new(local::LocalBroker));
        Self {
            infos: vec![local::info()],
            by_id,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_broker(mut self, info: BrokerInfo, broker: Arc<dyn Broker>) -> Self {
        self.by_id.insert(info.id.clone(), broker);
        self.infos.push(info);
        self
    }

    /// All brokers, the synthetic `local` one first.
    pub fn available(&self) -> Vec<BrokerInfo> {
        self.infos.clone()
    }

    pub fn contains(&self, broker_id: &str) -> bool {
        self.by_id.contains_key(broker_id)
    }

    /// Route to a broker; unknown ids fail.
    pub fn broker(&self, broker_id: &str) -> Result<Arc<dyn Broker>> {
        self.by_id
            .get(broker_id)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownBroker(broker_id.to_owned()))
    }

    /// The configured non-local brokers.
    pub fn remote_infos(&self) -> Vec<BrokerInfo> {
        self.infos
            .iter()
            .filter(|i| i.id != LOCAL_BROKER_ID)
            .cloned()
            .collect()
    }

    /// Ask every remote broker whether it knows `username`; first claim
    /// wins. Pre-check failures count as "does not know".
    pub async fn broker_claiming_user(&self, username: &str) -> Option<String> {
        for info in self.remote_infos() {
            let Ok(broker) = self.broker(&info.id) else {
                continue;
            };
            match broker.user_pre_check(username).await {
                Ok(Some(_)) => return Some(info.id),
                Ok(None) => {}
                Err(e) => {
                    warn!("Pre-check with broker {:?} failed: {e}", info.id);
                }
            }
        }
        None
    }
}

/// Shared handle to the current registry. Reconfiguration replaces the
/// inner `Arc` atomically; in-flight sessions keep the broker handle they
/// resolved at selection time.
pub type SharedRegistry = Arc<RwLock<Arc<BrokerRegistry>>>;

pub fn shared(registry: BrokerRegistry) -> SharedRegistry {
    Arc::new(RwLock::new(Arc::new(registry)))
}

/// Snapshot the current registry.
pub fn current(registry: &SharedRegistry) -> Arc<BrokerRegistry> {
    registry.read().clone()
}

#[cfg(test)]
mod tests;
