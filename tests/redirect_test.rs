//! Redirect following end to end.

mod common;

use common::{ok, reply, TestServer};
use pulsenet::base::neterror::{ErrorCategory, NetError};
use pulsenet::{BodyHandler, BodyPublisher, Client, RedirectPolicy};

fn redirect(status: u16, location: &str) -> String {
    format!(
        "HTTP/1.1 {status} Redirect\r\nLocation: {location}\r\nContent-Length: 5\r\n\r\nmoved"
    )
}

#[tokio::test]
async fn test_follows_relative_redirects() {
    let server = TestServer::start(|req| match req.target() {
        "/start" => reply(&redirect(302, "/middle")),
        "/middle" => reply(&redirect(301, "end?x=1")),
        _ => reply(&ok("arrived")),
    })
    .await;
    let client = Client::new().unwrap();
    let request = client.get(&server.url("/start")).build().unwrap();
    let response = client.send(request, BodyHandler::string()).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), "arrived");
    assert_eq!(response.url().path(), "/end");
    assert_eq!(response.url().query(), Some("x=1"));
    let statuses: Vec<u16> = response.previous().iter().map(|p| p.status.as_u16()).collect();
    assert_eq!(statuses, vec![302, 301]);
    // drained bodies keep the connection
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_see_other_turns_post_into_get() {
    let server = TestServer::start(|req| match req.target() {
        "/form" => reply(&redirect(303, "/result")),
        "/keep" => reply(&redirect(307, "/result")),
        _ => reply(&ok(&format!("{} {}", req.method(), req.body.len()))),
    })
    .await;
    let client = Client::new().unwrap();

    let post = client
        .request()
        .uri(&server.url("/form"))
        .post(BodyPublisher::from_text("a=1"))
        .build()
        .unwrap();
    let response = client.send(post, BodyHandler::string()).await.unwrap();
    assert_eq!(response.body(), "GET 0");

    let post = client
        .request()
        .uri(&server.url("/keep"))
        .post(BodyPublisher::from_text("a=1"))
        .build()
        .unwrap();
    let response = client.send(post, BodyHandler::string()).await.unwrap();
    assert_eq!(response.body(), "POST 3");
}

#[tokio::test]
async fn test_credentials_dropped_across_origins() {
    let target = TestServer::start(|_| reply(&ok("other"))).await;
    let location = target.url("/landing");
    let origin = TestServer::start(move |_| reply(&redirect(302, &location))).await;

    let client = Client::new().unwrap();
    let request = client
        .get(&origin.url("/"))
        .header("Authorization", "Bearer secret")
        .header("X-Trace", "1")
        .build()
        .unwrap();
    client.send(request, BodyHandler::discarding()).await.unwrap();

    let seen = &target.requests()[0];
    assert_eq!(seen.header("authorization"), None);
    assert_eq!(seen.header("x-trace"), Some("1"));
}

#[tokio::test]
async fn test_cycles_and_limits() {
    let server = TestServer::start(|req| match req.target() {
        "/a" => reply(&redirect(302, "/b")),
        "/b" => reply(&redirect(302, "/a")),
        path => {
            let n: u32 = path.trim_start_matches("/n").parse().unwrap_or(0);
            reply(&redirect(302, &format!("/n{}", n + 1)))
        }
    })
    .await;

    let client = Client::new().unwrap();
    let cycle = client.get(&server.url("/a")).build().unwrap();
    let err = client.send(cycle, BodyHandler::discarding()).await.unwrap_err();
    assert!(matches!(err, NetError::RedirectCycleDetected));
    assert_eq!(err.category(), ErrorCategory::Redirect);

    let limited = Client::builder().max_redirects(3).build().unwrap();
    let endless = limited.get(&server.url("/n0")).build().unwrap();
    let err = limited.send(endless, BodyHandler::discarding()).await.unwrap_err();
    assert!(matches!(err, NetError::TooManyRedirects));
}

#[tokio::test]
async fn test_never_policy_returns_redirect() {
    let server = TestServer::start(|_| reply(&redirect(301, "/elsewhere"))).await;
    let client = Client::builder().redirect_policy(RedirectPolicy::Never).build().unwrap();
    let request = client.get(&server.url("/")).build().unwrap();
    let response = client.send(request, BodyHandler::string()).await.unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(response.body(), "moved");
    assert_eq!(response.headers().first_value("location"), Some("/elsewhere"));
}
