use std::time::Duration;

mod support;

use mamont_rpc::{
    client_credential, server_credential, ClientConnection, ClientCredential, ConnectionState,
    DialErrorKind, Error, ServerCredential, ServiceClient,
};

use support::{generate_certs, hello, registry, start_greeter};

fn server_tls(certs: &support::TestCerts) -> ServerCredential {
    server_credential(&certs.cert_path, &certs.key_path).expect("server credential")
}

fn client_tls(certs: &support::TestCerts) -> ClientCredential {
    client_credential(&certs.cert_path).expect("client credential")
}

#[tokio::test]
async fn tls_round_trip() {
    let certs = generate_certs(&["localhost"]);
    let (server, _) = start_greeter(Some(server_tls(&certs))).await;

    let credential = client_tls(&certs).with_server_name("localhost").expect("server name");
    let connection = ClientConnection::dial(&server.address, Some(credential)).await.expect("dial");
    assert_eq!(connection.state(), ConnectionState::Ready);

    let greeter = ServiceClient::new(connection.clone(), registry(), "Greeter").expect("stub");
    let reply = greeter
        .invoke("SayHello", &hello("foo"), Some(Duration::from_secs(5)))
        .await
        .expect("SayHello over TLS");
    assert_eq!(reply.get_str("greeting"), Some("bar"));

    connection.close();
    server.shutdown().await;
}

#[tokio::test]
async fn credentials_from_pem_in_memory() {
    let certs = generate_certs(&["localhost"]);
    let server = ServerCredential::from_pem(certs.cert_pem.as_bytes(), certs.key_pem.as_bytes())
        .expect("server credential");
    let (server, _) = start_greeter(Some(server)).await;

    let client = ClientCredential::from_pem(certs.cert_pem.as_bytes())
        .and_then(|c| c.with_server_name("localhost"))
        .expect("client credential");
    let connection = ClientConnection::dial(&server.address, Some(client)).await.expect("dial");
    connection.ping(Some(Duration::from_secs(5))).await.expect("ping over TLS");
    server.shutdown().await;
}

#[tokio::test]
async fn plaintext_client_cannot_reach_tls_listener() {
    let certs = generate_certs(&["localhost"]);
    let (server, _) = start_greeter(Some(server_tls(&certs))).await;

    let err = ClientConnection::dial(&server.address, None).await.expect_err("plaintext to TLS");
    assert_eq!(err.dial_kind(), Some(DialErrorKind::Handshake));

    // The listener keeps serving well-behaved clients.
    let credential = client_tls(&certs).with_server_name("localhost").expect("server name");
    let connection = ClientConnection::dial(&server.address, Some(credential)).await.expect("dial");
    connection.ping(None).await.expect("ping");
    server.shutdown().await;
}

#[tokio::test]
async fn tls_client_cannot_reach_plaintext_listener() {
    let certs = generate_certs(&["localhost"]);
    let (server, _) = start_greeter(None).await;

    let credential = client_tls(&certs).with_server_name("localhost").expect("server name");
    let err = ClientConnection::dial(&server.address, Some(credential))
        .await
        .expect_err("TLS to plaintext");
    assert_eq!(err.dial_kind(), Some(DialErrorKind::Handshake));
    server.shutdown().await;
}

#[tokio::test]
async fn hostname_mismatch_fails_handshake() {
    let certs = generate_certs(&["localhost"]);
    let (server, _) = start_greeter(Some(server_tls(&certs))).await;

    // The certificate names "localhost", the dial host is 127.0.0.1.
    let err = ClientConnection::dial(&server.address, Some(client_tls(&certs)))
        .await
        .expect_err("hostname mismatch");
    assert_eq!(err.dial_kind(), Some(DialErrorKind::Handshake));

    let credential = client_tls(&certs).with_server_name("example.com").expect("server name");
    let err = ClientConnection::dial(&server.address, Some(credential))
        .await
        .expect_err("hostname mismatch");
    assert_eq!(err.dial_kind(), Some(DialErrorKind::Handshake));
    server.shutdown().await;
}

#[tokio::test]
async fn untrusted_certificate_fails_handshake() {
    let served = generate_certs(&["localhost"]);
    let trusted = generate_certs(&["localhost"]);
    let (server, _) = start_greeter(Some(server_tls(&served))).await;

    let credential = client_tls(&trusted).with_server_name("localhost").expect("server name");
    let err = ClientConnection::dial(&server.address, Some(credential))
        .await
        .expect_err("untrusted certificate");
    assert_eq!(err.dial_kind(), Some(DialErrorKind::Handshake));
    server.shutdown().await;
}

#[test]
fn credential_load_failures() {
    let certs = generate_certs(&["localhost"]);
    let missing = certs.cert_path.with_file_name("missing.pem");

    let err = server_credential(&missing, &certs.key_path).err().expect("missing cert");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");
    assert_eq!(err.kind_label(), "CredentialLoadError");

    let err = server_credential(&certs.cert_path, &missing).err().expect("missing key");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");

    let err = client_credential(&missing).err().expect("missing CA");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");

    let err = ServerCredential::from_pem(b"not pem at all", certs.key_pem.as_bytes())
        .err()
        .expect("garbage cert");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");

    // A certificate where the key should be.
    let err = ServerCredential::from_pem(certs.cert_pem.as_bytes(), certs.cert_pem.as_bytes())
        .err()
        .expect("no private key");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");

    let err = ClientCredential::from_pem(b"").err().expect("empty CA");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");

    let err = client_tls(&certs).with_server_name("").err().expect("empty server name");
    assert!(matches!(err, Error::CredentialLoad(_)), "unexpected error: {err:?}");
}
