use std::fs;
use std::sync::Arc;

use anyhow::Result;
use authd_daemon::brokers::remote::SocketBrokerDialer;
use authd_daemon::brokers::{self, BrokerRegistry};
use authd_daemon::cleanup::{self, CleanupOptions};
use authd_daemon::handler::AuthdHandler;
use authd_daemon::sessions::SessionManager;
use authd_daemon::users::{UserManager, UserManagerConfig};
use authd_daemon::{Daemon, SOCKET_GROUP};
use authd_protocol::server::Server;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting authd");

    let state_dir = Daemon::state_dir();
    fs::create_dir_all(&state_dir)?;
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&state_dir, fs::Permissions::from_mode(0o700))?;
    }

    let pid_file = Daemon::pid_file();
    fs::write(&pid_file, std::process::id().to_string())?;

    let users = Arc::new(UserManager::new(UserManagerConfig::new(&state_dir))?);

    let dialer = SocketBrokerDialer::new(Daemon::brokers_runtime_dir());
    let registry = brokers::shared(BrokerRegistry::load(&Daemon::brokers_conf_dir(), &dialer));
    info!(
        "Loaded {} broker(s) (including the local one)",
        brokers::current(&registry).available().len()
    );

    // SIGHUP rescans the broker configuration and swaps the registry
    // whole; sessions in flight keep the broker they already resolved.
    let reload_registry = registry.clone();
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            let dialer = SocketBrokerDialer::new(Daemon::brokers_runtime_dir());
            let fresh = BrokerRegistry::load(&Daemon::brokers_conf_dir(), &dialer);
            info!(
                "Reloaded broker configuration: {} broker(s) available",
                fresh.available().len()
            );
            *reload_registry.write() = Arc::new(fresh);
        }
    });

    let sessions = Arc::new(SessionManager::new(registry.clone(), users.clone()));
    let reaper = SessionManager::spawn_reaper(sessions.clone());
    let cleanup = cleanup::spawn(users.clone(), CleanupOptions::default())?;

    let handler = AuthdHandler::new(users, sessions, registry);
    let socket_path = Daemon::socket_path();
    let server = Server::new(socket_path.clone(), handler).with_allowed_group(SOCKET_GROUP);

    // SIGTERM and SIGINT stop the accept loop; the cleanup loop is drained
    // afterwards so no database write is interrupted.
    let shutdown = server.shutdown_handle();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = shutdown.send(()).await;
    });

    info!("Daemon listening on {socket_path:?}");
    server.run().await?;

    info!("Daemon shutting down");
    reaper.abort();
    cleanup.stop().await;
    if let Err(e) = fs::remove_file(&pid_file) {
        warn!("Could not remove pid file: {e}");
    }

    Ok(())
}
