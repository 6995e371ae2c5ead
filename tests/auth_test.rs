//! Server authentication round trips and the credential cache.

mod common;

use common::{ok, reply, TestServer};
use pulsenet::http::auth::{AuthChallengeInfo, AuthScheme};
use pulsenet::{BodyHandler, Client, Credentials};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// base64("user:pass")
const GOOD: &str = "Basic dXNlcjpwYXNz";

fn challenge(header: &str) -> String {
    format!("HTTP/1.1 401 Unauthorized\r\n{header}\r\nContent-Length: 6\r\n\r\ndenied")
}

type Seen = Arc<Mutex<Vec<AuthChallengeInfo>>>;

fn counting_authenticator(
    password: &'static str,
) -> (
    Arc<AtomicUsize>,
    Seen,
    impl Fn(&AuthChallengeInfo) -> Option<Credentials> + Send + Sync + 'static,
) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
    let authenticator = move |info: &AuthChallengeInfo| {
        c.fetch_add(1, Ordering::SeqCst);
        s.lock().unwrap().push(info.clone());
        Some(Credentials::new("user", password))
    };
    (calls, seen, authenticator)
}

#[tokio::test]
async fn test_basic_auth_asks_once_and_caches() {
    let server = TestServer::start(|req| {
        if req.header("authorization") == Some(GOOD) {
            reply(&ok("secret"))
        } else {
            reply(&challenge("WWW-Authenticate: Basic realm=\"vault\""))
        }
    })
    .await;
    let (calls, seen, authenticator) = counting_authenticator("pass");
    let client = Client::builder().authenticator(authenticator).build().unwrap();

    for path in ["/one", "/two"] {
        let request = client.get(&server.url(path)).build().unwrap();
        let response = client.send(request, BodyHandler::string()).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), "secret");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let info = seen.lock().unwrap()[0].clone();
    assert_eq!(info.scheme, AuthScheme::Basic);
    assert_eq!(info.realm, "vault");
    assert!(!info.is_proxy);
    assert_eq!(info.port, server.addr.port());
    // one challenge, then two authorized requests
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_supported_scheme_wins_over_earlier_unsupported() {
    let server = TestServer::start(|req| {
        if req.header("authorization") == Some(GOOD) {
            reply(&ok("in"))
        } else {
            reply(&challenge(
                "WWW-Authenticate: Negotiate\r\nWWW-Authenticate: NTLM, Basic realm=\"mixed\"",
            ))
        }
    })
    .await;
    let (calls, _, authenticator) = counting_authenticator("pass");
    let client = Client::builder().authenticator(authenticator).build().unwrap();
    let request = client.get(&server.url("/")).build().unwrap();
    let response = client.send(request, BodyHandler::string()).await.unwrap();
    assert_eq!(response.body(), "in");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_credentials_return_challenge() {
    let server = TestServer::start(|_| reply(&challenge("WWW-Authenticate: Basic realm=\"x\""))).await;
    let (calls, _, authenticator) = counting_authenticator("wrong");
    let client = Client::builder().authenticator(authenticator).build().unwrap();
    let request = client.get(&server.url("/")).build().unwrap();
    let response = client.send(request, BodyHandler::string()).await.unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.body(), "denied");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.previous().len(), 1);
}

#[tokio::test]
async fn test_stale_cache_entry_is_evicted_and_asked_again() {
    let rotated = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&rotated);
    let server = TestServer::start(move |req| {
        let accepted = !flag.load(Ordering::SeqCst) && req.header("authorization") == Some(GOOD);
        if accepted {
            reply(&ok("ok"))
        } else {
            reply(&challenge("WWW-Authenticate: Basic realm=\"rotating\""))
        }
    })
    .await;
    let (calls, _, authenticator) = counting_authenticator("pass");
    let client = Client::builder().authenticator(authenticator).build().unwrap();

    let request = client.get(&server.url("/")).build().unwrap();
    assert_eq!(client.send(request, BodyHandler::discarding()).await.unwrap().status(), 200);
    assert_eq!(client.auth_cache().len(), 1);

    rotated.store(true, Ordering::SeqCst);
    let request = client.get(&server.url("/")).build().unwrap();
    let response = client.send(request, BodyHandler::discarding()).await.unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_digest_challenge() {
    let server = TestServer::start(|req| match req.header("authorization") {
        Some(value) if value.starts_with("Digest ") => {
            assert!(value.contains("username=\"user\""));
            assert!(value.contains("realm=\"digest-realm\""));
            assert!(value.contains("nonce=\"abc123\""));
            assert!(value.contains("uri=\"/private?q=1\""));
            assert!(value.contains("qop=auth"));
            reply(&ok("digest ok"))
        }
        _ => reply(&challenge(
            "WWW-Authenticate: Digest realm=\"digest-realm\", qop=\"auth\", nonce=\"abc123\", opaque=\"xyz\"",
        )),
    })
    .await;
    let (calls, seen, authenticator) = counting_authenticator("pass");
    let client = Client::builder().authenticator(authenticator).build().unwrap();
    let request = client.get(&server.url("/private?q=1")).build().unwrap();
    let response = client.send(request, BodyHandler::string()).await.unwrap();
    assert_eq!(response.body(), "digest ok");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().unwrap()[0].scheme, AuthScheme::Digest);
}

#[tokio::test]
async fn test_no_authenticator_returns_401() {
    let server = TestServer::start(|_| reply(&challenge("WWW-Authenticate: Basic realm=\"x\""))).await;
    let client = Client::new().unwrap();
    let request = client.get(&server.url("/")).build().unwrap();
    let response = client.send(request, BodyHandler::discarding()).await.unwrap();
    assert_eq!(response.status(), 401);
}
