//! Call layer running over an established session.
//!
//! A session carries a stream of record-marked frames (see RFC 5531 section
//! 11 for the record marking standard). Each frame is one [`rpc_msg`]: a CALL
//! sent by the client, a REPLY sent by the server, or a CANCEL the client
//! sends for a call it stopped waiting for.
//!
//! This module provides:
//!
//! 1. Record framing over any async byte stream
//! 2. Session negotiation and the optional TLS upgrade
//! 3. In-flight call tracking with per-call cancellation
//! 4. Dispatch of calls to the bound service handlers
//!
//! Calls of one session are handled concurrently and replies may be written
//! in any order; the xid pairs each reply with its call.
//!
//! [`rpc_msg`]: crate::protocol::xdr::rpc::rpc_msg

mod call_tracker;
mod context;
pub mod dispatch;
pub(crate) mod handshake;
mod wire;

pub use call_tracker::CallTracker;
pub use context::{CallContext, Context};
pub use wire::{
    read_fragment, read_record, read_record_limited, write_fragment, write_message,
    SocketMessageHandler, SocketMessageType,
};

/// Upper bound on the size of one assembled record.
pub const MAX_RPC_RECORD_LENGTH: usize = 16 * 1024 * 1024;
