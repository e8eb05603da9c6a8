//! Session negotiation records.
//!
//! Right after the TCP connection is established the client sends one
//! `session_hello` record in plaintext and the server answers with one
//! `hello_stat`. Only after `HELLO_OK` does a TLS handshake (when both sides
//! asked for TLS) or call traffic (plaintext) follow.

#![allow(non_camel_case_types)]

use num_derive::{FromPrimitive, ToPrimitive};

use super::*;

/// "MRPC" in ASCII
pub const SESSION_MAGIC: u32 = 0x4d52_5043;
/// Version of the negotiation exchange
pub const SESSION_VERSION: u32 = 1;

/// Transport security the sender is configured with
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum security_mode {
    #[default]
    INSECURE = 0,
    TLS = 1,
}
impl SerializeEnum for security_mode {}
impl DeserializeEnum for security_mode {}

/// First record of every session, sent by the client
#[derive(Clone, Debug, Default, PartialEq)]
pub struct session_hello {
    pub magic: u32,
    pub version: u32,
    pub security: security_mode,
}
DeserializeStruct!(session_hello, magic, version, security);
SerializeStruct!(session_hello, magic, version, security);

impl session_hello {
    pub fn new(security: security_mode) -> Self {
        Self { magic: SESSION_MAGIC, version: SESSION_VERSION, security }
    }
}

/// Server verdict on a `session_hello`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum hello_stat {
    #[default]
    HELLO_OK = 0,
    /// Client and server disagree on plaintext versus TLS
    SECURITY_MISMATCH = 1,
    /// Unsupported negotiation version
    VERSION_MISMATCH = 2,
    /// The first record was not a session hello at all
    BAD_MAGIC = 3,
}
impl SerializeEnum for hello_stat {}
impl DeserializeEnum for hello_stat {}

/// Checks a hello against the server configuration.
pub fn evaluate_hello(hello: &session_hello, server_mode: security_mode) -> hello_stat {
    if hello.magic != SESSION_MAGIC {
        hello_stat::BAD_MAGIC
    } else if hello.version != SESSION_VERSION {
        hello_stat::VERSION_MISMATCH
    } else if hello.security != server_mode {
        hello_stat::SECURITY_MISMATCH
    } else {
        hello_stat::HELLO_OK
    }
}
