//! Raw HTTP/1.1 fixture servers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Install a log subscriber once; `RUST_LOG=pulsenet=trace` shows the stack.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    /// Index of the connection it arrived on, in accept order.
    pub conn: usize,
    pub head: String,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn method(&self) -> &str {
        self.request_line().split(' ').next().unwrap_or_default()
    }

    pub fn target(&self) -> &str {
        self.request_line().split(' ').nth(1).unwrap_or_default()
    }

    /// Every value of `name`, in wire order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.head
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .filter(|(n, _)| n.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }
}

pub enum Reply {
    Send(Vec<u8>),
    /// Write the bytes, then close the connection.
    SendAndClose(Vec<u8>),
    /// Close without answering.
    Close,
}

pub fn reply(text: &str) -> Reply {
    Reply::Send(text.as_bytes().to_vec())
}

type Responder = dyn Fn(&Recorded) -> Reply + Send + Sync;

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    /// Serve every connection with `respond`, keeping connections open
    /// between requests.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let respond: Arc<Responder> = Arc::new(respond);

        let (reqs, conns) = (Arc::clone(&requests), Arc::clone(&connections));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = conns.fetch_add(1, Ordering::SeqCst);
                let (reqs, respond) = (Arc::clone(&reqs), Arc::clone(&respond));
                tokio::spawn(serve_connection(stream, conn, reqs, respond));
            }
        });
        Self { addr, requests, connections }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    conn: usize,
    requests: Arc<Mutex<Vec<Recorded>>>,
    respond: Arc<Responder>,
) {
    let mut buf = Vec::new();
    loop {
        let Some(head) = read_head(&mut stream, &mut buf).await else {
            return;
        };
        let body = read_body(&mut stream, &mut buf, &head).await;
        let recorded = Recorded { conn, head, body };
        requests.lock().unwrap().push(recorded.clone());
        match respond(&recorded) {
            Reply::Send(bytes) => {
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Reply::SendAndClose(bytes) => {
                let _ = stream.write_all(&bytes).await;
                let _ = stream.shutdown().await;
                return;
            }
            Reply::Close => return,
        }
    }
}

/// Read up to the end of a request head. Bytes past it stay in `buf`.
pub async fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(end) = find(buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            buf.drain(..end + 4);
            return Some(head);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read the body announced by `head` (Content-Length or chunked).
pub async fn read_body(stream: &mut TcpStream, buf: &mut Vec<u8>, head: &str) -> Vec<u8> {
    let lower = head.to_ascii_lowercase();
    if lower.contains("expect: 100-continue") {
        return Vec::new();
    }
    let length = lower
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    if let Some(length) = length {
        fill(stream, buf, length).await;
        let n = length.min(buf.len());
        return buf.drain(..n).collect();
    }
    if lower.contains("transfer-encoding: chunked") {
        let mut body = Vec::new();
        loop {
            while find(buf, b"\r\n").is_none() {
                if !read_more(stream, buf).await {
                    return body;
                }
            }
            let line_end = find(buf, b"\r\n").unwrap_or_default();
            let size_line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
            buf.drain(..line_end + 2);
            fill(stream, buf, size + 2).await;
            if size == 0 {
                buf.drain(..2.min(buf.len()));
                return body;
            }
            body.extend(buf.drain(..size));
            buf.drain(..2);
        }
    }
    Vec::new()
}

async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>, want: usize) {
    while buf.len() < want {
        if !read_more(stream, buf).await {
            return;
        }
    }
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match stream.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `200 OK` with a text body.
pub fn ok(body: &str) -> String {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body)
}
