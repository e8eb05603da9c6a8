use std::sync::Arc;
use std::time::Duration;

use mamont_rpc::tcp::{RpcTcp, RpcTcpListener};
use mamont_rpc::{
    client_credential, handler_fn, server_credential, ClientConnection, Error, HandlerError,
    Message, SchemaRegistry, ServiceClient, ServiceHandlerSet,
};
use tracing::info;

const SCHEMA: &str = include_str!("greeter.schema");
const DEFAULT_ADDRESS: &str = "127.0.0.1:11111";

const USAGE: &str = "Usage: greeter serve [--tls CERT KEY] [ADDRESS]\n\
                     \x20      greeter call [--tls CA_CERT] [--server-name NAME] [--timeout MS]\n\
                     \x20                   [ADDRESS] [GREETING]\n\
                     \n\
                     Answers SayHello(\"foo\") with \"bar\" and echoes anything else.\n\
                     ADDRESS defaults to 127.0.0.1:11111.";

fn fail(e: Error) -> ! {
    eprintln!("{}: {}", e.kind_label(), e);
    std::process::exit(1);
}

fn usage_error(message: &str) -> ! {
    eprintln!("{message}");
    eprintln!("Run with --help for usage.");
    std::process::exit(2);
}

fn greet(request: &Message) -> Result<Message, HandlerError> {
    let greeting = request.get_str("greeting").unwrap_or_default();
    let reply = match greeting {
        "foo" => "bar".to_string(),
        "" => return Err(HandlerError::new("empty greeting")),
        other => other.to_string(),
    };
    Ok(Message::new().with("greeting", reply))
}

async fn serve(mut args: impl Iterator<Item = String>) -> Result<(), Error> {
    let mut tls: Option<(String, String)> = None;
    let mut address = DEFAULT_ADDRESS.to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tls" => {
                let (Some(cert), Some(key)) = (args.next(), args.next()) else {
                    usage_error("--tls needs CERT and KEY");
                };
                tls = Some((cert, key));
            }
            _ if arg.starts_with('-') => usage_error(&format!("Unknown flag: {arg}")),
            _ => address = arg,
        }
    }

    let credential = match tls {
        Some((cert, key)) => Some(server_credential(cert, key)?),
        None => None,
    };
    let registry = Arc::new(SchemaRegistry::from_source(SCHEMA)?);
    let handlers = ServiceHandlerSet::builder(registry)
        .bind(
            "Greeter",
            "SayHello",
            handler_fn(|request: Message, _ctx| async move { greet(&request) }),
        )?
        .build();

    let listener = Arc::new(RpcTcpListener::bind(&address, handlers, credential).await?);
    info!("Serving Greeter on port {}", listener.get_listen_port());

    let serving = listener.clone();
    let server = tokio::spawn(async move { serving.handle_forever().await });
    let _ = tokio::signal::ctrl_c().await;
    listener.close();
    match server.await {
        Ok(result) => result?,
        Err(e) => info!("Server task ended: {}", e),
    }
    Ok(())
}

async fn call(mut args: impl Iterator<Item = String>) -> Result<(), Error> {
    let mut ca_cert: Option<String> = None;
    let mut server_name: Option<String> = None;
    let mut timeout: Option<Duration> = Some(Duration::from_secs(5));
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tls" => {
                ca_cert = Some(args.next().unwrap_or_else(|| usage_error("--tls needs CA_CERT")))
            }
            "--server-name" => {
                server_name =
                    Some(args.next().unwrap_or_else(|| usage_error("--server-name needs NAME")))
            }
            "--timeout" => {
                let ms = args
                    .next()
                    .and_then(|ms| ms.parse::<u64>().ok())
                    .unwrap_or_else(|| usage_error("--timeout needs milliseconds"));
                timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            _ if arg.starts_with('-') => usage_error(&format!("Unknown flag: {arg}")),
            _ => positional.push(arg),
        }
    }
    let mut positional = positional.into_iter();
    let address = positional.next().unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    let greeting = positional.next().unwrap_or_else(|| "foo".to_string());

    let credential = match ca_cert {
        Some(path) => {
            let credential = client_credential(path)?;
            Some(match server_name {
                Some(name) => credential.with_server_name(&name)?,
                None => credential,
            })
        }
        None => None,
    };

    let registry = Arc::new(SchemaRegistry::from_source(SCHEMA)?);
    let connection = ClientConnection::dial(&address, credential).await?;
    let greeter = ServiceClient::new(connection.clone(), registry, "Greeter")?;
    let reply = greeter
        .invoke("SayHello", &Message::new().with("greeting", greeting), timeout)
        .await;
    connection.close();

    println!("{}", reply?.get_str("greeting").unwrap_or_default());
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let result = match args.next().as_deref() {
        Some("serve") => serve(args).await,
        Some("call") => call(args).await,
        Some("--help") | Some("-h") => {
            eprintln!("{USAGE}");
            return;
        }
        Some(other) => usage_error(&format!("Unknown command: {other}")),
        None => usage_error("Missing command"),
    };
    if let Err(e) = result {
        fail(e);
    }
}
