//! TCP listener serving typed unary calls.
//!
//! [`RpcTcpListener`] accepts sessions, negotiates each one (plaintext or
//! TLS, see [`crate::protocol::rpc::handshake`]) and then dispatches the
//! calls it carries to the bound service handlers. Every session runs in its
//! own task; inside a session every call runs in its own task as well, so a
//! slow handler delays neither other calls nor other clients.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionState, StateCell};
use crate::credentials::ServerCredential;
use crate::error::{Error, Result};
use crate::protocol::rpc::{self, handshake};
use crate::service::ServiceHandlerSet;

/// Time a client gets to complete session negotiation.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Whether an `accept` failure means the listening socket itself is unusable.
///
/// Aborted handshakes and descriptor or memory exhaustion only affect the
/// connection being accepted, so the listener keeps serving after them.
pub fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

type SessionMap = Mutex<HashMap<u64, AbortHandle>>;

/// Listener accepting sessions and serving the calls they carry.
pub struct RpcTcpListener {
    /// Released on close; `handle_forever` stops accepting once it is gone
    listener: Mutex<Option<Arc<TcpListener>>>,
    /// Address the socket is bound to
    local_addr: SocketAddr,
    /// Immutable method-to-handler mapping
    handlers: Arc<ServiceHandlerSet>,
    /// TLS material; sessions are plaintext when absent
    credential: Option<ServerCredential>,
    handshake_timeout: Duration,
    /// Active sessions, aborted on close
    sessions: Arc<SessionMap>,
    next_session: AtomicU64,
    state: StateCell,
}

/// Interface of TCP servers: where they listen and how they run.
#[async_trait]
pub trait RpcTcp: Send + Sync {
    /// Returns the actual port number on which the server is listening
    ///
    /// This is especially useful when binding to port 0, which allows the OS
    /// to assign any available port.
    fn get_listen_port(&self) -> u16;

    /// Returns the IP address on which the server is listening
    fn get_listen_ip(&self) -> IpAddr;

    /// Accepts sessions and serves them
    ///
    /// Each accepted session is negotiated and served in its own task. This
    /// method returns `Ok(())` once the listener is closed, or the error of
    /// the underlying TCP listener.
    async fn handle_forever(&self) -> io::Result<()>;
}

fn lock_sessions(sessions: &SessionMap) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a session from the listener's map when its task ends or is aborted.
struct SessionGuard {
    id: u64,
    sessions: Arc<SessionMap>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock_sessions(&self.sessions).remove(&self.id);
    }
}

/// Stops the session reader and cancels the calls still in flight.
struct ReaderGuard {
    reader: AbortHandle,
    calls: Arc<rpc::CallTracker>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.reader.abort();
        self.calls.cancel_all();
    }
}

/// Negotiates a freshly accepted socket and serves it until either side
/// closes it.
///
/// Reading happens in a dedicated task so that record reads are never
/// interrupted halfway by a reply being written. Replies from the call tasks
/// arrive over a channel and are written here, one record at a time.
async fn process_session(
    socket: TcpStream,
    context: rpc::Context,
    credential: Option<ServerCredential>,
    handshake_timeout: Duration,
) -> Result<(), anyhow::Error> {
    let _ = socket.set_nodelay(true);
    let stream = tokio::time::timeout(
        handshake_timeout,
        handshake::accept_session(socket, credential.as_ref()),
    )
    .await
    .map_err(|_| anyhow!("session negotiation timed out"))??;
    debug!("Session ready for {}", context.client_addr);

    let (reader, mut writer) = tokio::io::split(stream);
    let (mut message_handler, mut replies) = rpc::SocketMessageHandler::new(reader, &context);

    let calls = context.call_tracker.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            if let Err(e) = message_handler.read().await {
                debug!("Message loop broken due to {:?}", e);
                break;
            }
        }
        calls.cancel_all();
    });
    let _reader_guard =
        ReaderGuard { reader: reader_task.abort_handle(), calls: context.call_tracker.clone() };

    while let Some(reply) = replies.recv().await {
        match reply {
            Ok(msg) => {
                if let Err(e) = rpc::write_fragment(&mut writer, &msg).await {
                    debug!("Write error {:?}", e);
                    return Err(e);
                }
            }
            Err(e) => {
                error!("Cannot encode reply: {:?}", e);
                return Err(e);
            }
        }
    }
    Ok(())
}

impl RpcTcpListener {
    /// Binds a listener to `address`, which must be of the form `ip:port`.
    ///
    /// Port 0 lets the OS pick a free port; see [`RpcTcp::get_listen_port`].
    /// With a credential every session must negotiate TLS; without one every
    /// session is plaintext.
    pub async fn bind(
        address: &str,
        handlers: ServiceHandlerSet,
        credential: Option<ServerCredential>,
    ) -> Result<RpcTcpListener> {
        let bind_error = |source: io::Error| Error::Bind { address: address.to_string(), source };

        let (ip, port) = address.rsplit_once(':').ok_or_else(|| {
            bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address must be of form ip:port",
            ))
        })?;
        if ip.is_empty() || port.parse::<u16>().is_err() {
            return Err(bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "port not in range 0..=65535",
            )));
        }

        let state = StateCell::new();
        state.advance(ConnectionState::Connecting);
        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        state.advance(ConnectionState::Ready);
        info!(
            "Listening on {} ({})",
            local_addr,
            if credential.is_some() { "tls" } else { "plaintext" }
        );

        Ok(RpcTcpListener {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            handlers: Arc::new(handlers),
            credential,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(0),
            state,
        })
    }

    /// Sets how long a client may take to negotiate its session.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Number of sessions currently being served.
    pub fn session_count(&self) -> usize {
        lock_sessions(&self.sessions).len()
    }

    pub fn handlers(&self) -> &Arc<ServiceHandlerSet> {
        &self.handlers
    }

    /// Stops accepting, releases the listening socket and aborts every active
    /// session. Calling it again has no effect.
    pub fn close(&self) {
        if !self.state.advance(ConnectionState::Closing) {
            return;
        }
        drop(self.listener.lock().unwrap_or_else(PoisonError::into_inner).take());

        let sessions: Vec<AbortHandle> =
            lock_sessions(&self.sessions).drain().map(|(_, handle)| handle).collect();
        for session in &sessions {
            session.abort();
        }
        self.state.advance(ConnectionState::Closed);
        info!("Listener on {} closed, {} sessions aborted", self.local_addr, sessions.len());
    }

    fn accepting(&self) -> Option<Arc<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn spawn_session(&self, socket: TcpStream, client_addr: SocketAddr) {
        let context = rpc::Context {
            local_port: self.local_addr.port(),
            client_addr: client_addr.to_string(),
            handlers: self.handlers.clone(),
            call_tracker: Arc::new(rpc::CallTracker::new()),
        };
        info!("Accepting connection from {}", context.client_addr);
        debug!("Accepting socket {:?} {:?}", socket, context);

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let guard = SessionGuard { id, sessions: self.sessions.clone() };
        let credential = self.credential.clone();
        let handshake_timeout = self.handshake_timeout;

        // Registered before the task can finish and deregister itself.
        let mut sessions = lock_sessions(&self.sessions);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let client_addr = context.client_addr.clone();
            match process_session(socket, context, credential, handshake_timeout).await {
                Ok(()) => debug!("Session with {} ended", client_addr),
                Err(e) => warn!("Session with {} closed: {:#}", client_addr, e),
            }
        });
        sessions.insert(id, task.abort_handle());
    }
}

#[async_trait]
impl RpcTcp for RpcTcpListener {
    fn get_listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn get_listen_ip(&self) -> IpAddr {
        self.local_addr.ip()
    }

    async fn handle_forever(&self) -> io::Result<()> {
        let Some(listener) = self.accepting() else {
            return Ok(());
        };
        let mut state = self.state.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, client_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) if is_fatal_accept_error(&e) => {
                            error!("Listener on {} failed: {}", self.local_addr, e);
                            return Err(e);
                        }
                        Err(e) => {
                            // Mostly descriptor exhaustion, which clears as sessions end.
                            warn!("Accept on {} failed, retrying: {}", self.local_addr, e);
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                            continue;
                        }
                    };
                    if self.state.get().is_closing_or_closed() {
                        return Ok(());
                    }
                    self.spawn_session(socket, client_addr);
                }
                _ = async { state.wait_for(|s| s.is_closing_or_closed()).await.map(|_| ()) } => {
                    debug!("Listener on {} stopped accepting", self.local_addr);
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for RpcTcpListener {
    fn drop(&mut self) {
        self.close();
    }
}
