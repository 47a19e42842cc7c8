use std::path::PathBuf;

use thiserror::Error;

use authd_protocol::errors::ClientError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("daemon is not running (no socket at {0})")]
    DaemonNotRunning(PathBuf),

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub type Result<T> = std::result::Result<T, CliError>;
