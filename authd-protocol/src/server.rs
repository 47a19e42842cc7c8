// The whole security model hangs off unix domain sockets: file-mode
// restrictions on the socket node plus kernel peer credentials.
#[cfg(not(unix))]
compile_error!("the authd socket server only works on unix targets");

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use authd_unix::credentials::PeerCredentials;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{unix::OwnedReadHalf, UnixListener, UnixStream},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::{
    errors::ServerError,
    protocol::{
        decode_envelope, encode_server_message, Payload, Request, ServerEvent, ServerMessage,
        WireError, MAX_MESSAGE_SIZE,
    },
};

pub type Result<T> = std::result::Result<T, ServerError>;

/// Per-connection outbound message capacity. Responses are serialized one at
/// a time, so this only buffers pushed events.
const OUTBOUND_QUEUE: usize = 32;

/// Handle for pushing server events to one connection.
///
/// Sends never block: a full or closed queue drops the event, which is the
/// documented semantics for the throttled reselect notifications.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ServerMessage>,
}

impl EventSender {
    /// Returns false if the event was dropped.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.try_send(ServerMessage::Event { event }).is_ok()
    }

    /// Standalone sender/receiver pair for callers outside a live
    /// connection (tests, fakes).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Per-connection state threaded through the request handler.
///
/// A connection owns at most one session; the handler records it here so
/// that a disconnect can tear the session down, and so mid-session user
/// substitution can be refused.
pub struct Connection {
    pub peer: PeerCredentials,
    pub session_id: Option<String>,
    pub pam_user: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
}

impl Connection {
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }
}

/// Request dispatcher implemented by the daemon.
///
/// `handle` is awaited to completion before the next frame of the same
/// connection is read, so requests within one session are processed
/// strictly in arrival order.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: Request,
        conn: &mut Connection,
    ) -> std::result::Result<Payload, WireError>;

    /// Called once when the client goes away, with the final connection
    /// state. A live session must be ended here.
    async fn disconnected(&self, conn: Connection);
}

pub struct Server<H: RequestHandler> {
    socket_path: PathBuf,
    handler: Arc<H>,
    /// Host group whose members may connect, besides root and the daemon's
    /// own UID.
    allowed_group: Option<String>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<H: RequestHandler> Server<H> {
    pub fn new(socket_path: PathBuf, handler: H) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            socket_path,
            handler: Arc::new(handler),
            allowed_group: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_allowed_group(mut self, group: impl Into<String>) -> Self {
        self.allowed_group = Some(group.into());
        self
    }

    /// Sender that stops the accept loop.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        // Remove stale socket file from a previous run
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                })
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ServerError::Bind {
            socket_path: self.socket_path.clone(),
            source: e,
        })?;

        // Only the authentication stack may connect: owner plus the allowed
        // group get through the filesystem check, peer credentials do the rest.
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))
                .map_err(|e| ServerError::SocketPermissions {
                    socket_path: self.socket_path.clone(),
                    source: e,
                })?;
        }

        let allowed_gid = self
            .allowed_group
            .as_deref()
            .and_then(authd_unix::groups::gid_of_group);
        if let (Some(group), None) = (self.allowed_group.as_deref(), allowed_gid) {
            warn!("Group {group:?} does not exist on this host; only root may connect");
        }

        let connection_ids = Arc::new(AtomicU64::new(1));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let handler = Arc::clone(&self.handler);
                            let connection_id = connection_ids.fetch_add(1, Ordering::Relaxed);

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_client(handler, stream, allowed_gid, connection_id).await
                                {
                                    debug!("Client handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_client<H: RequestHandler>(
    handler: Arc<H>,
    stream: UnixStream,
    allowed_gid: Option<u32>,
    connection_id: u64,
) -> Result<()> {
    let cred = stream.peer_cred().map_err(ServerError::PeerCredentials)?;
    let peer = PeerCredentials {
        uid: cred.uid(),
        gid: cred.gid(),
        connection_id,
    };

    let daemon_uid = nix::unistd::getuid().as_raw();
    let authorized = peer.is_root()
        || peer.uid == daemon_uid
        || allowed_gid.is_some_and(|gid| {
            peer.gid == gid || authd_unix::groups::uid_member_of(peer.uid, gid)
        });
    if !authorized {
        debug!("Unauthorized connection attempt from UID {}", peer.uid);
        return Err(ServerError::Unauthorized {
            client_uid: peer.uid,
        });
    }
    debug!("Peer credentials verified: UID {}", peer.uid);

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);

    // All writes (responses and pushed events) are funneled through one task
    // so frames never interleave.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match encode_server_message(&msg) {
                Ok(f) => f,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&frame).await {
                debug!("Client write failed: {}", e);
                break;
            }
        }
    });

    let mut conn = Connection {
        peer,
        session_id: None,
        pam_user: None,
        tx: tx.clone(),
    };

    let result = serve_connection(&handler, read_half, &mut conn, &tx).await;

    drop(tx);
    let _ = writer.await;
    handler.disconnected(conn).await;

    result
}

async fn serve_connection<H: RequestHandler>(
    handler: &Arc<H>,
    mut read_half: OwnedReadHalf,
    conn: &mut Connection,
    tx: &mpsc::Sender<ServerMessage>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match read_half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(ServerError::Receive(e)),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ServerError::MessageTooLarge);
        }

        let mut buf = vec![0u8; len];
        read_half
            .read_exact(&mut buf)
            .await
            .map_err(ServerError::Receive)?;

        // A client speaking garbage gets disconnected: without a frame id
        // there is nothing to correlate an error reply to.
        let envelope = decode_envelope(&buf)?;

        debug!(
            "Connection {}: handling {}",
            conn.peer.connection_id,
            envelope.request.variant_name()
        );

        let result = handler.handle(envelope.request, conn).await;
        let response = ServerMessage::Response {
            id: envelope.id,
            result,
        };
        if tx.send(response).await.is_err() {
            // Writer gone: the client disconnected mid-request.
            return Ok(());
        }
    }
}
