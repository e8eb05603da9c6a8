//! Call frame data structures.
//!
//! Every frame begins with a correlation id (`xid`) followed by a
//! discriminated union: a CALL, a REPLY or a CANCEL. A reply always carries
//! the xid of the call it answers; a cancel names the xid of a call the client
//! stopped waiting for.

// Keep the wire naming style used by XDR definitions
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::*;
use crate::error::{RemoteError, RemoteStatus};

/// Version of the call frame layout. A server rejects any other value.
pub const RPC_VERSION: u32 = 1;

/// Failure status of an answered call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum call_stat {
    /// No handler bound for the method, or the method is unknown to the server
    #[default]
    UNIMPLEMENTED = 1,
    /// Request payload could not be decoded
    GARBAGE_ARGS = 2,
    /// Handler reported an error
    HANDLER_ERROR = 3,
    /// Handler gave up after observing cancellation
    CANCELLED = 4,
    /// Unsupported `rpcvers`
    RPC_MISMATCH = 5,
}
impl SerializeEnum for call_stat {}
impl DeserializeEnum for call_stat {}

impl From<call_stat> for RemoteStatus {
    fn from(stat: call_stat) -> Self {
        match stat {
            call_stat::UNIMPLEMENTED => RemoteStatus::UnimplementedMethod,
            call_stat::GARBAGE_ARGS => RemoteStatus::InvalidArgument,
            call_stat::HANDLER_ERROR => RemoteStatus::HandlerFailed,
            call_stat::CANCELLED => RemoteStatus::CancellationObserved,
            call_stat::RPC_MISMATCH => RemoteStatus::ProtocolMismatch,
        }
    }
}

impl From<RemoteStatus> for call_stat {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::UnimplementedMethod => call_stat::UNIMPLEMENTED,
            RemoteStatus::InvalidArgument => call_stat::GARBAGE_ARGS,
            RemoteStatus::HandlerFailed => call_stat::HANDLER_ERROR,
            RemoteStatus::CancellationObserved => call_stat::CANCELLED,
            RemoteStatus::ProtocolMismatch => call_stat::RPC_MISMATCH,
        }
    }
}

/// A frame.
///
/// The xid is not a sequence number. It only pairs replies and cancels with
/// the call they refer to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct rpc_msg {
    /// Correlation id
    pub xid: u32,
    /// The body of the frame
    pub body: rpc_body,
}
DeserializeStruct!(rpc_msg, xid, body);
SerializeStruct!(rpc_msg, xid, body);

/// The body of a frame
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, PartialEq)]
pub enum rpc_body {
    /// A call to a remote method
    CALL(call_body),
    /// The answer to a call
    REPLY(reply_body),
    /// The client abandoned the call with the same xid
    CANCEL,
}

impl Default for rpc_body {
    fn default() -> rpc_body {
        rpc_body::CALL(call_body::default())
    }
}

impl Serialize for rpc_body {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        match self {
            rpc_body::CALL(v) => {
                0_u32.serialize(dest)?;
                v.serialize(dest)?;
            }
            rpc_body::REPLY(v) => {
                1_u32.serialize(dest)?;
                v.serialize(dest)?;
            }
            rpc_body::CANCEL => {
                2_u32.serialize(dest)?;
            }
        }
        Ok(())
    }
}
impl Deserialize for rpc_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            0 => *self = rpc_body::CALL(deserialize(src)?),
            1 => *self = rpc_body::REPLY(deserialize(src)?),
            2 => *self = rpc_body::CANCEL,
            msg_type => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid message type in rpc_body: {msg_type}"),
                ))
            }
        }

        Ok(())
    }
}

/// The body of a call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct call_body {
    /// Frame layout version, must be [`RPC_VERSION`]
    pub rpcvers: u32,
    /// Service name
    pub service: String,
    /// Method name within the service
    pub method: String,
    /// Remaining client deadline in milliseconds, zero when the call has none
    pub timeout_ms: u64,
    /// Request message encoded with the method's request schema
    pub payload: Vec<u8>,
}
DeserializeStruct!(call_body, rpcvers, service, method, timeout_ms, payload);
SerializeStruct!(call_body, rpcvers, service, method, timeout_ms, payload);

impl call_body {
    /// A liveness probe: a call naming neither a service nor a method.
    pub fn is_ping(&self) -> bool {
        self.service.is_empty() && self.method.is_empty()
    }
}

/// Failure details of an answered call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct call_failure {
    pub stat: call_stat,
    pub message: String,
}
DeserializeStruct!(call_failure, stat, message);
SerializeStruct!(call_failure, stat, message);

impl From<call_failure> for RemoteError {
    fn from(failure: call_failure) -> Self {
        RemoteError::new(failure.stat.into(), failure.message)
    }
}

/// The body of a reply
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, PartialEq)]
pub enum reply_body {
    /// Response message encoded with the method's response schema
    SUCCESS(Vec<u8>),
    /// The call failed; the connection stays usable
    FAILURE(call_failure),
}

impl Default for reply_body {
    fn default() -> reply_body {
        reply_body::SUCCESS(Vec::new())
    }
}

impl Serialize for reply_body {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        match self {
            reply_body::SUCCESS(v) => {
                0_u32.serialize(dest)?;
                v.serialize(dest)?;
            }
            reply_body::FAILURE(v) => {
                1_u32.serialize(dest)?;
                v.serialize(dest)?;
            }
        }
        Ok(())
    }
}
impl Deserialize for reply_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            0 => *self = reply_body::SUCCESS(deserialize(src)?),
            1 => *self = reply_body::FAILURE(deserialize(src)?),
            reply_stat => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid reply status in reply_body: {reply_stat}"),
                ))
            }
        }

        Ok(())
    }
}

/// Creates a call frame
pub fn make_call(
    xid: u32,
    service: &str,
    method: &str,
    timeout_ms: u64,
    payload: Vec<u8>,
) -> rpc_msg {
    let call = call_body {
        rpcvers: RPC_VERSION,
        service: service.to_string(),
        method: method.to_string(),
        timeout_ms,
        payload,
    };
    rpc_msg { xid, body: rpc_body::CALL(call) }
}

/// Creates a cancel frame for an abandoned call
pub fn make_cancel(xid: u32) -> rpc_msg {
    rpc_msg { xid, body: rpc_body::CANCEL }
}

/// Creates a successful reply carrying an encoded response
pub fn make_success_reply(xid: u32, payload: Vec<u8>) -> rpc_msg {
    rpc_msg { xid, body: rpc_body::REPLY(reply_body::SUCCESS(payload)) }
}

/// Creates a failed reply
pub fn make_failure_reply(xid: u32, stat: call_stat, message: impl Into<String>) -> rpc_msg {
    let failure = call_failure { stat, message: message.into() };
    rpc_msg { xid, body: rpc_body::REPLY(reply_body::FAILURE(failure)) }
}

/// Creates a reply indicating that no handler exists for the method
pub fn unimplemented_reply_message(xid: u32, service: &str, method: &str) -> rpc_msg {
    make_failure_reply(xid, call_stat::UNIMPLEMENTED, format!("{service}/{method}"))
}

/// Creates a reply indicating that the request could not be decoded
pub fn garbage_args_reply_message(xid: u32, reason: impl Into<String>) -> rpc_msg {
    make_failure_reply(xid, call_stat::GARBAGE_ARGS, reason)
}

/// Creates a reply indicating a frame version mismatch
pub fn rpc_vers_mismatch(xid: u32, received: u32) -> rpc_msg {
    make_failure_reply(
        xid,
        call_stat::RPC_MISMATCH,
        format!("call frame version {received}, server speaks {RPC_VERSION}"),
    )
}
