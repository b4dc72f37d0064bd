use std::time::Duration;

use nodecall_transport::{connect, Listener, TlsContext, TransportError};
use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Pki {
    ca_pem: String,
    cert_pem: String,
    key_pem: String,
}

fn mint_pki() -> Pki {
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_key = KeyPair::generate().expect("ca key");
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let mut leaf_params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("leaf params");
    leaf_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("leaf cert");

    Pki {
        ca_pem: ca_cert.pem(),
        cert_pem: leaf_cert.pem(),
        key_pem: leaf_key.serialize_pem(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_tls_echo() {
    let pki = mint_pki();
    let ctx = TlsContext::from_pem(
        pki.cert_pem.as_bytes(),
        pki.key_pem.as_bytes(),
        Some(pki.ca_pem.as_bytes()),
    )
    .expect("tls context should build");

    let listener = Listener::bind("127.0.0.1", 0, Some(&ctx))
        .expect("listener should bind");
    let port = listener.local_addr().port();

    let server = tokio::spawn(async move {
        let incoming = listener.accept().await.expect("accept");
        let mut stream = incoming.handshake(TIMEOUT).await.expect("server handshake");
        assert!(stream.is_tls());
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("server read");
        stream.write_all(&buf).await.expect("server write");
        stream.flush().await.expect("server flush");
    });

    let mut client = connect("127.0.0.1", port, Some(&ctx), TIMEOUT)
        .await
        .expect("client should connect over TLS");
    assert_eq!(client.transport_name(), "tls");
    client.write_all(b"ping").await.expect("client write");
    client.flush().await.expect("client flush");
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.expect("client read");
    assert_eq!(&echoed, b"ping");

    server.await.expect("server task");
}

#[tokio::test(flavor = "multi_thread")]
async fn untrusted_server_is_rejected() {
    let server_pki = mint_pki();
    let client_pki = mint_pki();

    let server_ctx = TlsContext::from_pem(
        server_pki.cert_pem.as_bytes(),
        server_pki.key_pem.as_bytes(),
        Some(server_pki.ca_pem.as_bytes()),
    )
    .expect("server context");
    let client_ctx = TlsContext::from_pem(
        client_pki.cert_pem.as_bytes(),
        client_pki.key_pem.as_bytes(),
        Some(client_pki.ca_pem.as_bytes()),
    )
    .expect("client context");

    let listener = Listener::bind("127.0.0.1", 0, Some(&server_ctx))
        .expect("listener should bind");
    let port = listener.local_addr().port();

    let server = tokio::spawn(async move {
        let incoming = listener.accept().await.expect("accept");
        incoming.handshake(TIMEOUT).await
    });

    let result = connect("127.0.0.1", port, Some(&client_ctx), TIMEOUT).await;
    assert!(matches!(result, Err(TransportError::Handshake { .. })));

    let server_result = server.await.expect("server task");
    assert!(server_result.is_err());
}
