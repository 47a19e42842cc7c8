use std::path::PathBuf;

pub mod brokers;
pub mod cleanup;
pub mod db;
pub mod errors;
pub mod handler;
pub mod idgen;
pub mod localgroups;
pub mod sessions;
pub mod tempentries;
pub mod token;
pub mod users;

/// Host group whose members may connect to the daemon socket.
pub const SOCKET_GROUP: &str = "authd";

const SOCKET_ENV: &str = "AUTHD_SOCKET";
const STATE_DIR_ENV: &str = "AUTHD_STATE_DIR";
const BROKERS_CONF_ENV: &str = "AUTHD_BROKERS_DIR";
const BROKERS_RUNTIME_ENV: &str = "AUTHD_BROKERS_RUNTIME_DIR";

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

pub struct Daemon {}

impl Daemon {
    /// Well-known socket the PAM and NSS clients connect to.
    pub fn socket_path() -> PathBuf {
        env_path(SOCKET_ENV, "/run/authd.sock")
    }

    /// Directory holding the identity database and the corruption marker.
    pub fn state_dir() -> PathBuf {
        env_path(STATE_DIR_ENV, "/var/lib/authd")
    }

    /// Directory scanned for broker manifests (`*.conf`).
    pub fn brokers_conf_dir() -> PathBuf {
        env_path(BROKERS_CONF_ENV, "/etc/authd/brokers.d")
    }

    /// Directory where broker management sockets live.
    pub fn brokers_runtime_dir() -> PathBuf {
        env_path(BROKERS_RUNTIME_ENV, "/run/authd/brokers")
    }

    pub fn pid_file() -> PathBuf {
        Self::state_dir().join("authd.pid")
    }
}
