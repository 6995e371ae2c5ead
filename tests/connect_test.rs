//! Connection establishment: failures, TLS, host overrides and pool limits.

mod common;

use common::{ok, reply, TestServer};
use pulsenet::base::neterror::{ErrorCategory, NetError};
use pulsenet::socket::pool::PoolConfig;
use pulsenet::{BodyHandler, Client};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::builder().retry_on_connection_failure(false).build().unwrap();
    let request = client.get(&format!("http://{addr}/")).build().unwrap();
    let err = client.send(request, BodyHandler::discarding()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connect, "{err:?}");
    assert!(client.snapshot().is_idle());
}

#[tokio::test]
async fn test_tls_against_plaintext_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    });

    let client = Client::new().unwrap();
    let request = client.get(&format!("https://{addr}/")).build().unwrap();
    let err = client.send(request, BodyHandler::discarding()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Tls, "{err:?}");
}

#[tokio::test]
async fn test_resolve_override() {
    let server = TestServer::start(|req| {
        assert_eq!(req.header("host").map(|h| h.starts_with("api.test:")), Some(true));
        reply(&ok("overridden"))
    })
    .await;
    let addr: SocketAddr = {
        let url = Url::parse(&server.url("/")).unwrap();
        format!("{}:{}", url.host_str().unwrap(), url.port().unwrap()).parse().unwrap()
    };

    let client = Client::builder().resolve("api.test", vec![addr]).build().unwrap();
    let request = client.get(&format!("http://api.test:{}/", addr.port())).build().unwrap();
    let response = client.send(request, BodyHandler::string()).await.unwrap();
    assert_eq!(response.body(), "overridden");
}

#[tokio::test]
async fn test_per_host_limit_queues_requests() {
    let server = TestServer::start(|_| reply(&ok("queued"))).await;
    let client = Client::builder()
        .pool(PoolConfig { max_connections_per_host: 1, ..PoolConfig::default() })
        .build()
        .unwrap();

    let sends = (0..4).map(|i| {
        let request = client.get(&server.url(&format!("/{i}"))).build().unwrap();
        client.send(request, BodyHandler::string())
    });
    for result in futures::future::join_all(sends).await {
        assert_eq!(result.unwrap().body(), "queued");
    }
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn test_invalid_requests_fail_before_sending() {
    let client = Client::new().unwrap();
    let err = client.get("ftp://example.com/").build().unwrap_err();
    assert!(matches!(err, NetError::UnknownUrlScheme));
    assert_eq!(err.category(), ErrorCategory::Validation);

    let err = client.get("http://example.com/").header("Connection", "close").build().unwrap_err();
    assert!(matches!(err, NetError::RestrictedHeader { .. }));
}
