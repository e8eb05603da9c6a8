//! Wire protocol.
//!
//! - `xdr`: External Data Representation (RFC 4506) primitives and the frame
//!   layouts built from them (session hello, call, reply, cancel).
//!
//! - `rpc`: record framing, session negotiation, call tracking and dispatch
//!   of incoming calls to service handlers.

pub mod rpc;
pub mod xdr;
