//! Mamont RPC - minimal typed unary remote procedure calls over TCP
//!
//! Services and their messages are described in a small schema language and
//! loaded into a [`SchemaRegistry`]. Servers bind [`ServiceHandler`]s to the
//! methods they implement and serve them on an [`RpcTcpListener`]; clients
//! dial a [`ClientConnection`] and invoke methods through a [`ServiceClient`].
//! Every call is a single request answered by a single response.
//!
//! ## Main Components
//!
//! - `schema`: message layouts and service definitions, with the text parser
//!   and the compatibility rules for revised definitions.
//!
//! - `codec`: conversion between dynamic [`Message`] values and bytes. The
//!   default [`XdrCodec`] tags every field with its number and wire kind, so
//!   old readers skip fields added later.
//!
//! - `credentials`: TLS material for servers and clients (rustls).
//!
//! - `tcp` and `client`: the listener and the dialing side. Each session
//!   negotiates plaintext or TLS before any call traffic; both ends must
//!   agree.
//!
//! - `protocol`: XDR primitives (RFC 4506), record marking (RFC 5531) and the
//!   call, reply and cancel frames exchanged on a session.
//!
//! - `service`: the handler trait and the immutable method-to-handler mapping.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = Arc::new(SchemaRegistry::from_source(GREETER_SCHEMA)?);
//! let handlers = ServiceHandlerSet::builder(registry.clone())
//!     .bind("Greeter", "SayHello", handler_fn(|req: Message, _ctx| async move {
//!         Ok(Message::new().with("greeting", "bar"))
//!     }))?
//!     .build();
//! let listener = RpcTcpListener::bind("127.0.0.1:0", handlers, None).await?;
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod message;
pub mod protocol;
pub mod schema;
pub mod service;
pub mod tcp;

pub use client::{ClientConnection, DialOptions, ServiceClient};
pub use codec::{Codec, XdrCodec};
pub use connection::ConnectionState;
pub use credentials::{client_credential, server_credential, ClientCredential, ServerCredential};
pub use error::{CodecError, DialErrorKind, Error, RemoteError, RemoteStatus, Result};
pub use message::{Message, Value};
pub use protocol::rpc::CallContext;
pub use protocol::xdr;
pub use schema::{
    FieldDescriptor, FieldType, MessageSchema, MethodDefinition, SchemaRegistry, ServiceDefinition,
};
pub use service::{handler_fn, HandlerError, ServiceHandler, ServiceHandlerSet};
pub use tcp::{RpcTcp, RpcTcpListener};
