//! Client side: dialing, raw calls and typed service stubs.
//!
//! A [`ClientConnection`] multiplexes any number of concurrent calls over one
//! session. Each call gets a fresh xid; replies are matched by xid only, so
//! they may arrive in any order. A call whose deadline passes resolves with
//! [`Error::DeadlineExceeded`] and the server is sent a CANCEL frame for it;
//! the connection itself stays usable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, XdrCodec};
use crate::connection::{ConnectionState, StateCell};
use crate::credentials::ClientCredential;
use crate::error::{CodecError, DialErrorKind, Error, Result};
use crate::message::Message;
use crate::protocol::rpc::handshake::{self, BoxedStream};
use crate::protocol::rpc::{read_record, write_fragment, MAX_RPC_RECORD_LENGTH};
use crate::protocol::xdr;
use crate::protocol::xdr::rpc::{make_call, make_cancel, reply_body, rpc_body, rpc_msg};
use crate::schema::SchemaRegistry;

/// Dial timeouts.
#[derive(Copy, Clone, Debug)]
pub struct DialOptions {
    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Bound on session negotiation, TLS handshake included
    pub handshake_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

type PendingMap = HashMap<u32, oneshot::Sender<reply_body>>;

/// State shared between the connection handle and its I/O tasks.
struct Shared {
    pending: Mutex<PendingMap>,
    state: StateCell,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails every outstanding call with `ConnectionClosed`.
    ///
    /// The state is moved first and the map drained under its lock, so a call
    /// either sees the closed state or has its entry drained here.
    fn shut_down(&self) {
        self.state.advance(ConnectionState::Closing);
        let abandoned = std::mem::take(&mut *self.pending());
        if !abandoned.is_empty() {
            debug!("Failing {} in-flight calls, connection closed", abandoned.len());
        }
        drop(abandoned);
        self.state.advance(ConnectionState::Closed);
    }
}

struct Inner {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: [AbortHandle; 2],
    address: String,
    peer_addr: SocketAddr,
    next_xid: AtomicU32,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.shut_down();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Removes an unanswered call on drop and tells the server to stop working on it.
struct PendingCall<'a> {
    inner: &'a Inner,
    xid: u32,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.inner.shared.pending().remove(&self.xid).is_none() {
            return;
        }
        trace!("Cancelling xid {}", self.xid);
        if let Ok(frame) = xdr::to_bytes(&make_cancel(self.xid)) {
            let _ = self.inner.outbound.send(frame);
        }
    }
}

/// One client session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

impl ClientConnection {
    /// Dials `address` (`host:port`) with default options.
    ///
    /// With a credential the session is TLS and the server certificate must
    /// validate against it; without one the session is plaintext.
    pub async fn dial(address: &str, credential: Option<ClientCredential>) -> Result<Self> {
        Self::dial_with_options(address, credential, DialOptions::default()).await
    }

    pub async fn dial_with_options(
        address: &str,
        credential: Option<ClientCredential>,
        options: DialOptions,
    ) -> Result<Self> {
        let state = StateCell::new();
        state.advance(ConnectionState::Connecting);

        let connect = tokio::time::timeout(options.connect_timeout, TcpStream::connect(address));
        let socket = match connect.await {
            Err(_) => {
                return Err(Error::dial(address, DialErrorKind::Unreachable, "connect timed out"))
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(Error::dial(address, DialErrorKind::Refused, e))
            }
            Ok(Err(e)) => return Err(Error::dial(address, DialErrorKind::Unreachable, e)),
            Ok(Ok(socket)) => socket,
        };
        let _ = socket.set_nodelay(true);
        let peer_addr = socket
            .peer_addr()
            .map_err(|e| Error::dial(address, DialErrorKind::Unreachable, e))?;

        if credential.is_some() {
            state.advance(ConnectionState::Handshaking);
        }
        let stream = tokio::time::timeout(
            options.handshake_timeout,
            handshake::connect_session(socket, address, host_of(address), credential.as_ref()),
        )
        .await
        .map_err(|_| Error::dial(address, DialErrorKind::Handshake, "handshake timed out"))??;
        state.advance(ConnectionState::Ready);
        let mode = if credential.is_some() { "tls" } else { "plaintext" };
        info!("Connected to {} ({})", peer_addr, mode);

        Ok(Self::start(stream, state, address, peer_addr))
    }

    fn start(stream: BoxedStream, state: StateCell, address: &str, peer_addr: SocketAddr) -> Self {
        let shared = Arc::new(Shared { pending: Mutex::new(HashMap::new()), state });
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_receiver) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_replies(reader, shared.clone()));
        let writer_task = tokio::spawn(write_frames(writer, outbound_receiver, shared.clone()));

        Self {
            inner: Arc::new(Inner {
                shared,
                outbound,
                tasks: [reader_task.abort_handle(), writer_task.abort_handle()],
                address: address.to_string(),
                peer_addr,
                next_xid: AtomicU32::new(1),
            }),
        }
    }

    /// Sends one call and waits for its reply payload.
    ///
    /// `payload` must already be encoded with the method's request schema.
    /// With a deadline the call resolves with `DeadlineExceeded` once it
    /// passes; the remaining time is also sent to the server.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let inner = &*self.inner;
        let xid = inner.next_xid.fetch_add(1, Ordering::Relaxed);

        // Sub-millisecond deadlines still have to reach the server as non-zero.
        let timeout_ms =
            deadline.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1));
        let frame = xdr::to_bytes(&make_call(xid, service, method, timeout_ms, payload))?;
        // The server would drop the whole session on an oversized record.
        if frame.len() > MAX_RPC_RECORD_LENGTH {
            return Err(CodecError::RecordTooLarge {
                size: frame.len(),
                limit: MAX_RPC_RECORD_LENGTH,
            }
            .into());
        }

        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = inner.shared.pending();
            if inner.shared.state.get().is_closing_or_closed() {
                return Err(Error::ConnectionClosed);
            }
            pending.insert(xid, sender);
        }
        let guard = PendingCall { inner, xid };

        trace!("Calling {}/{} xid {}", service, method, xid);
        if inner.outbound.send(frame).is_err() {
            return Err(Error::ConnectionClosed);
        }

        let reply = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, receiver).await {
                Ok(reply) => reply,
                Err(_) => {
                    debug!("{}/{} xid {} exceeded its deadline", service, method, xid);
                    return Err(Error::DeadlineExceeded);
                }
            },
            None => receiver.await,
        };
        drop(guard);

        match reply {
            Ok(reply_body::SUCCESS(payload)) => Ok(payload),
            Ok(reply_body::FAILURE(failure)) => Err(Error::Remote(failure.into())),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Checks that the server is alive and answering.
    pub async fn ping(&self, deadline: Option<Duration>) -> Result<()> {
        self.call("", "", Vec::new(), deadline).await.map(|_| ())
    }

    /// Closes the session. In-flight calls resolve with `ConnectionClosed`.
    /// Calling it again has no effect.
    pub fn close(&self) {
        if self.inner.shared.state.get() == ConnectionState::Closed {
            return;
        }
        self.inner.shared.shut_down();
        for task in &self.inner.tasks {
            task.abort();
        }
        info!("Connection to {} closed", self.inner.address);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.get()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("in_flight", &self.inner.shared.pending().len())
            .finish()
    }
}

/// Hands each reply to the call waiting for its xid.
async fn read_replies(mut reader: ReadHalf<BoxedStream>, shared: Arc<Shared>) {
    loop {
        let record = match read_record(&mut reader).await {
            Ok(record) => record,
            Err(e) => {
                debug!("Reply loop broken due to {:?}", e);
                break;
            }
        };
        let msg = match xdr::from_bytes::<rpc_msg>(&record) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Malformed frame from server: {}", e);
                break;
            }
        };
        match msg.body {
            rpc_body::REPLY(reply) => match shared.pending().remove(&msg.xid) {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                }
                None => trace!("Dropping reply to abandoned xid {}", msg.xid),
            },
            _ => {
                warn!("Server sent a frame that is not a reply, xid {}", msg.xid);
                break;
            }
        }
    }
    shared.shut_down();
}

/// Writes queued frames, one record each.
async fn write_frames(
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_fragment(&mut writer, &frame).await {
            debug!("Write error {:?}", e);
            break;
        }
    }
    shared.shut_down();
}

/// Typed stub for one service.
///
/// Requests are encoded and responses decoded with the layouts the local
/// registry defines for the invoked method.
#[derive(Clone)]
pub struct ServiceClient {
    connection: ClientConnection,
    registry: Arc<SchemaRegistry>,
    codec: Arc<dyn Codec>,
    service: String,
}

impl ServiceClient {
    /// Fails with `UnknownService` if the registry does not define `service`.
    pub fn new(
        connection: ClientConnection,
        registry: Arc<SchemaRegistry>,
        service: &str,
    ) -> Result<Self> {
        if registry.service(service).is_none() {
            return Err(Error::UnknownService(service.to_string()));
        }
        Ok(Self {
            connection,
            codec: Arc::new(XdrCodec::new(registry.clone())),
            registry,
            service: service.to_string(),
        })
    }

    /// Replaces the default [`XdrCodec`].
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Invokes `method` with `request` and decodes the response.
    ///
    /// A method the local registry does not define fails with
    /// `UnknownMethod` before anything is sent.
    pub async fn invoke(
        &self,
        method: &str,
        request: &Message,
        deadline: Option<Duration>,
    ) -> Result<Message> {
        let (_, request_schema, response_schema) =
            self.registry.resolve_method(&self.service, method)?;
        let payload = self.codec.encode(request, &request_schema)?;
        let response = self.connection.call(&self.service, method, payload, deadline).await?;
        Ok(self.codec.decode(&response, &response_schema)?)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }
}
