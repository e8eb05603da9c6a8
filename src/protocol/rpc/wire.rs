//! Record framing and per-session message handling.
//!
//! Frames travel over the byte stream using the record marking standard of
//! RFC 5531 section 11: each record is split into fragments, and every
//! fragment is prefixed with a 4-byte header whose lower 31 bits hold the
//! fragment length and whose top bit marks the last fragment of the record.
//!
//! [`SocketMessageHandler`] reads records from the read half of a session,
//! handles CANCEL frames inline and hands every CALL to its own task, so a
//! slow handler never holds up the calls behind it.

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::protocol::rpc::{self, dispatch};
use crate::protocol::xdr::{self, Serialize};

/// Reads a single record-marked fragment and appends it to `append_to`.
///
/// Returns true if this was the last fragment of the record.
pub async fn read_fragment<R: AsyncRead + Unpin>(
    socket: &mut R,
    append_to: &mut Vec<u8>,
) -> Result<bool, anyhow::Error> {
    read_fragment_limited(socket, append_to, rpc::MAX_RPC_RECORD_LENGTH).await
}

async fn read_fragment_limited<R: AsyncRead + Unpin>(
    socket: &mut R,
    append_to: &mut Vec<u8>,
    limit: usize,
) -> Result<bool, anyhow::Error> {
    let mut header_buf = [0_u8; 4];
    socket.read_exact(&mut header_buf).await?;
    let fragment_header = u32::from_be_bytes(header_buf);
    let is_last = (fragment_header & (1 << 31)) > 0;
    let length = (fragment_header & ((1 << 31) - 1)) as usize;
    trace!("Reading fragment length:{}, last:{}", length, is_last);
    // Checked before the buffer grows.
    if append_to.len().saturating_add(length) > limit {
        return Err(anyhow!(
            "RPC record length {} exceeds max {}",
            append_to.len().saturating_add(length),
            limit
        ));
    }
    let start_offset = append_to.len();
    append_to.resize(start_offset + length, 0);
    socket.read_exact(&mut append_to[start_offset..]).await?;
    Ok(is_last)
}

/// Reads fragments until a complete record has been assembled.
pub async fn read_record<R: AsyncRead + Unpin>(socket: &mut R) -> Result<Vec<u8>, anyhow::Error> {
    read_record_limited(socket, rpc::MAX_RPC_RECORD_LENGTH).await
}

/// Like [`read_record`], with a caller-chosen cap on the record size.
pub async fn read_record_limited<R: AsyncRead + Unpin>(
    socket: &mut R,
    limit: usize,
) -> Result<Vec<u8>, anyhow::Error> {
    let mut record = Vec::new();
    while !read_fragment_limited(socket, &mut record, limit).await? {}
    Ok(record)
}

/// Writes `buf` as one record and flushes the stream.
///
/// Records larger than the maximum fragment size (2^31 - 1 bytes) are split
/// into several fragments; only the final one carries the last-fragment bit.
pub async fn write_fragment<W: AsyncWrite + Unpin>(
    socket: &mut W,
    buf: &[u8],
) -> Result<(), anyhow::Error> {
    const MAX_FRAGMENT_SIZE: usize = (1 << 31) - 1;

    let mut offset = 0;
    loop {
        let remaining = buf.len() - offset;
        let fragment_size = std::cmp::min(remaining, MAX_FRAGMENT_SIZE);
        let is_last = offset + fragment_size >= buf.len();

        let fragment_header =
            if is_last { fragment_size as u32 + (1 << 31) } else { fragment_size as u32 };
        socket.write_all(&fragment_header.to_be_bytes()).await?;

        trace!("Writing fragment length:{}, last:{}", fragment_size, is_last);
        socket.write_all(&buf[offset..offset + fragment_size]).await?;

        offset += fragment_size;
        if is_last {
            break;
        }
    }
    socket.flush().await?;

    Ok(())
}

/// Serializes `msg` and writes it as one record.
pub async fn write_message<W, T>(socket: &mut W, msg: &T) -> Result<(), anyhow::Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let buf = xdr::to_bytes(msg)?;
    write_fragment(socket, &buf).await
}

/// Encoded reply ready to be written, or the failure that ended the session.
pub type SocketMessageType = Result<Vec<u8>, anyhow::Error>;

/// Reads frames of one session and dispatches the calls they carry.
pub struct SocketMessageHandler<R> {
    /// Read half of the session stream
    socket: R,
    /// Per-session dispatch state
    context: rpc::Context,
    /// Encoded replies, drained by the session writer
    reply_sender: mpsc::UnboundedSender<SocketMessageType>,
}

impl<R: AsyncRead + Unpin> SocketMessageHandler<R> {
    /// Creates a handler reading from `socket`.
    ///
    /// Returns the handler and the receiver of encoded replies. The receiver
    /// yields `None` once the handler is dropped and every dispatched call has
    /// answered.
    pub fn new(
        socket: R,
        context: &rpc::Context,
    ) -> (Self, mpsc::UnboundedReceiver<SocketMessageType>) {
        let (reply_sender, reply_receiver) = mpsc::unbounded_channel();
        (Self { socket, context: context.clone(), reply_sender }, reply_receiver)
    }

    /// Reads one record and acts on it.
    ///
    /// Should be called in a loop. An error means the session can no longer
    /// be read from (end of stream, oversized record, malformed frame).
    pub async fn read(&mut self) -> Result<(), anyhow::Error> {
        let record = read_record(&mut self.socket).await?;
        let msg = xdr::from_bytes::<xdr::rpc::rpc_msg>(&record).map_err(|e| {
            warn!("Malformed frame from {}: {}", self.context.client_addr, e);
            anyhow!("Malformed frame: {e}")
        })?;

        let xid = msg.xid;
        match msg.body {
            xdr::rpc::rpc_body::CALL(call) => {
                self.spawn_call(xid, call);
                Ok(())
            }
            xdr::rpc::rpc_body::CANCEL => {
                if self.context.call_tracker.cancel(xid) {
                    debug!("Client cancelled call xid: {}", xid);
                } else {
                    trace!("Cancel for unknown or finished call xid: {}", xid);
                }
                Ok(())
            }
            xdr::rpc::rpc_body::REPLY(_) => {
                error!("Unexpectedly received a Reply instead of a Call");
                Err(anyhow!("Bad RPC Call format"))
            }
        }
    }

    fn spawn_call(&self, xid: u32, call: xdr::rpc::call_body) {
        let Some(cancellation) = self.context.call_tracker.begin(xid) else {
            debug!(
                "Duplicate in-flight xid: {}, client_addr: {}, dropping call",
                xid, self.context.client_addr
            );
            return;
        };

        let context = self.context.clone();
        let reply_sender = self.reply_sender.clone();
        tokio::spawn(async move {
            let reply = dispatch::handle_call(xid, call, &context, cancellation).await;
            context.call_tracker.finish(xid);
            let encoded = encode_reply(xid, &reply);
            if reply_sender.send(encoded).is_err() {
                trace!("Session closed before reply to xid {} could be sent", xid);
            }
        });
    }
}

/// Encodes a reply, replacing one that would not fit in a record with a
/// handler failure so the session survives.
fn encode_reply(xid: u32, reply: &xdr::rpc::rpc_msg) -> SocketMessageType {
    let encoded = xdr::to_bytes(reply)?;
    if encoded.len() <= rpc::MAX_RPC_RECORD_LENGTH {
        return Ok(encoded);
    }
    warn!("Reply to xid {} is {} bytes, over the record limit", xid, encoded.len());
    let failure = xdr::rpc::make_failure_reply(
        xid,
        xdr::rpc::call_stat::HANDLER_ERROR,
        "response exceeds record limit",
    );
    Ok(xdr::to_bytes(&failure)?)
}
