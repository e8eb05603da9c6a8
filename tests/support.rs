#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempdir::TempDir;
use tokio::task::JoinHandle;

use mamont_rpc::tcp::{RpcTcp, RpcTcpListener};
use mamont_rpc::{
    handler_fn, CallContext, HandlerError, Message, SchemaRegistry, ServerCredential,
    ServiceHandlerSet, Value,
};

pub const GREETER_SCHEMA: &str = r#"
syntax = "mamont1";
package greeter;

message HelloRequest {
  string greeting = 1;
}

message HelloReply {
  string greeting = 1;
}

// Handler sleeps for `millis` unless cancelled first.
message SlowRequest {
  uint32 millis = 1;
}

service Greeter {
  rpc SayHello (HelloRequest) returns (HelloReply);
  rpc Slow (SlowRequest) returns (HelloReply);
  rpc Fail (HelloRequest) returns (HelloReply);
  rpc Unbound (HelloRequest) returns (HelloReply);
}
"#;

pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::from_source(GREETER_SCHEMA).expect("greeter schema"))
}

pub fn hello(greeting: &str) -> Message {
    Message::new().with("greeting", greeting)
}

/// Counts the slow calls that stopped because they were cancelled.
#[derive(Clone, Default)]
pub struct Observed {
    cancelled: Arc<AtomicUsize>,
}

impl Observed {
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` cancellations were observed.
    pub async fn wait_for_cancellations(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.cancelled() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never observed cancellation");
    }
}

async fn slow(
    request: Message,
    ctx: CallContext,
    observed: Observed,
) -> Result<Message, HandlerError> {
    let millis = match request.get("millis") {
        Some(Value::UInt32(millis)) => *millis,
        _ => 0,
    };
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(millis.into())) => {
            Ok(hello("done"))
        }
        _ = ctx.cancelled() => {
            observed.cancelled.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::cancelled())
        }
    }
}

/// Greeter handlers: `SayHello` maps "foo" to "bar" and echoes anything else,
/// `Slow` sleeps, `Fail` always fails. `Unbound` is left without a handler.
pub fn greeter_handlers(registry: Arc<SchemaRegistry>) -> (ServiceHandlerSet, Observed) {
    let observed = Observed::default();
    let slow_observed = observed.clone();
    let handlers = ServiceHandlerSet::builder(registry)
        .bind(
            "Greeter",
            "SayHello",
            handler_fn(|request: Message, _ctx| async move {
                match request.get_str("greeting") {
                    Some("foo") => Ok(hello("bar")),
                    Some(other) => Ok(hello(other)),
                    None => Err(HandlerError::new("missing greeting")),
                }
            }),
        )
        .expect("bind SayHello")
        .bind(
            "Greeter",
            "Slow",
            handler_fn(move |request: Message, ctx| slow(request, ctx, slow_observed.clone())),
        )
        .expect("bind Slow")
        .bind(
            "Greeter",
            "Fail",
            handler_fn(|_request: Message, _ctx| async move {
                Err::<Message, _>(HandlerError::new("nope"))
            }),
        )
        .expect("bind Fail")
        .build();
    (handlers, observed)
}

pub struct TestServer {
    pub listener: Arc<RpcTcpListener>,
    pub address: String,
    task: JoinHandle<io::Result<()>>,
}

impl TestServer {
    /// Closes the listener and waits until it stopped accepting.
    pub async fn shutdown(self) {
        self.listener.close();
        self.listener.close();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("listener did not stop")
            .expect("listener task panicked")
            .expect("listener failed");
    }
}

/// Routes library logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn start_server(
    handlers: ServiceHandlerSet,
    credential: Option<ServerCredential>,
) -> TestServer {
    init_logging();
    let listener = Arc::new(
        RpcTcpListener::bind("127.0.0.1:0", handlers, credential)
            .await
            .expect("bind listener"),
    );
    let address = format!("127.0.0.1:{}", listener.get_listen_port());
    let serving = listener.clone();
    let task = tokio::spawn(async move { serving.handle_forever().await });
    TestServer { listener, address, task }
}

pub async fn start_greeter(credential: Option<ServerCredential>) -> (TestServer, Observed) {
    let (handlers, observed) = greeter_handlers(registry());
    (start_server(handlers, credential).await, observed)
}

/// Self-signed certificate material written to a temporary directory.
pub struct TestCerts {
    _dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn generate_certs(names: &[&str]) -> TestCerts {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).expect("generate certificate");
    let cert_pem = certified.cert.pem();
    let key_pem = certified.key_pair.serialize_pem();

    let dir = TempDir::new("mamont-rpc-certs").expect("temp dir");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, &cert_pem).expect("write cert");
    std::fs::write(&key_path, &key_pem).expect("write key");

    TestCerts { _dir: dir, cert_path, key_path, cert_pem, key_pem }
}
