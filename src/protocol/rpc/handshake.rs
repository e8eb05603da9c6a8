//! Session establishment on top of a connected TCP stream.
//!
//! The client opens with a plaintext [`session_hello`] record stating whether
//! it wants TLS; the server answers with a [`hello_stat`]. Both ends must
//! agree on the security mode, so a plaintext client never ends up talking to
//! a TLS listener (or the reverse) and both see a clear handshake failure
//! instead. When both sides use TLS the rustls handshake runs right after the
//! hello exchange.

use anyhow::{anyhow, Context as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::credentials::{ClientCredential, ServerCredential};
use crate::error::{DialErrorKind, Error, Result};
use crate::protocol::rpc::{read_record_limited, write_message};
use crate::protocol::xdr;
use crate::protocol::xdr::session::{evaluate_hello, hello_stat, security_mode, session_hello};

/// Byte stream a session runs over, plaintext TCP or TLS.
pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> RpcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn RpcStream>;

/// Cap on the hello and its reply, both a few words long.
pub const MAX_SESSION_RECORD_LENGTH: usize = 64;

fn mode_of<T>(credential: Option<&T>) -> security_mode {
    if credential.is_some() {
        security_mode::TLS
    } else {
        security_mode::INSECURE
    }
}

/// Server side of session establishment.
pub async fn accept_session(
    mut socket: TcpStream,
    credential: Option<&ServerCredential>,
) -> Result<BoxedStream, anyhow::Error> {
    let server_mode = mode_of(credential);
    let record = read_record_limited(&mut socket, MAX_SESSION_RECORD_LENGTH)
        .await
        .context("reading session hello")?;
    let stat = match xdr::from_bytes::<session_hello>(&record) {
        Ok(hello) => {
            let stat = evaluate_hello(&hello, server_mode);
            if stat != hello_stat::HELLO_OK {
                warn!(
                    "Rejecting session: {:?} (client {:?}, server {:?})",
                    stat, hello.security, server_mode
                );
            }
            stat
        }
        Err(e) => {
            warn!("First record is not a session hello: {}", e);
            hello_stat::BAD_MAGIC
        }
    };
    write_message(&mut socket, &stat).await.context("writing session reply")?;
    if stat != hello_stat::HELLO_OK {
        return Err(anyhow!("session rejected: {stat:?}"));
    }

    match credential {
        None => Ok(Box::new(socket)),
        Some(credential) => {
            let tls = credential.acceptor().accept(socket).await.context("TLS handshake")?;
            debug!("TLS session established");
            Ok(Box::new(tls))
        }
    }
}

/// Client side of session establishment.
///
/// `host` is the host part of `address`; it names the server certificate
/// unless the credential overrides it. Every failure is a handshake failure.
pub async fn connect_session(
    mut socket: TcpStream,
    address: &str,
    host: &str,
    credential: Option<&ClientCredential>,
) -> Result<BoxedStream> {
    let fail = |message: String| Error::dial(address, DialErrorKind::Handshake, message);

    let hello = session_hello::new(mode_of(credential));
    write_message(&mut socket, &hello)
        .await
        .map_err(|e| fail(format!("cannot send session hello: {e}")))?;
    let record = read_record_limited(&mut socket, MAX_SESSION_RECORD_LENGTH)
        .await
        .map_err(|e| fail(format!("no session reply from server: {e}")))?;
    let stat = xdr::from_bytes::<hello_stat>(&record)
        .map_err(|e| fail(format!("malformed session reply: {e}")))?;
    match stat {
        hello_stat::HELLO_OK => {}
        hello_stat::SECURITY_MISMATCH => {
            return Err(fail(format!(
                "server does not accept {} sessions",
                if credential.is_some() { "TLS" } else { "plaintext" }
            )))
        }
        other => return Err(fail(format!("server rejected session: {other:?}"))),
    }

    match credential {
        None => Ok(Box::new(socket)),
        Some(credential) => {
            let server_name = credential.server_name_for(host).map_err(fail)?;
            let tls = credential
                .connector()
                .connect(server_name, socket)
                .await
                .map_err(|e| fail(format!("TLS handshake: {e}")))?;
            debug!("TLS session established with {}", address);
            Ok(Box::new(tls))
        }
    }
}
