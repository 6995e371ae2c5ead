use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::{AddressList, Name, Resolve};
use crate::socket::client::{SocketOptions, SocketType};
use crate::socket::proxy::{ProxySettings, ProxyType};
use crate::socket::tls::{handshake_error, TlsConfig, ALPN_H2, ALPN_HTTP11};
use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use url::Url;

const MAX_TUNNEL_RESPONSE: usize = 64 * 1024;

/// Which protocols to offer over ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnOffer {
    Http11Only,
    PreferH2,
}

impl AlpnOffer {
    fn protocols(self) -> &'static [&'static [u8]] {
        match self {
            AlpnOffer::Http11Only => &[ALPN_HTTP11],
            AlpnOffer::PreferH2 => &[ALPN_H2, ALPN_HTTP11],
        }
    }
}

/// Shared connection settings: resolver, TLS and socket options.
#[derive(Clone)]
pub struct Connector {
    pub resolver: Arc<dyn Resolve>,
    pub tls: TlsConfig,
    pub options: SocketOptions,
    pub connect_timeout: Duration,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.tls)
            .field("options", &self.options)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// What a single connect attempt is for.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub target: &'a Url,
    pub proxy: Option<&'a ProxySettings>,
    /// `Proxy-Authorization` for the CONNECT request.
    pub proxy_authorization: Option<&'a str>,
    pub alpn: AlpnOffer,
}

/// Manages the connection process: DNS -> TCP -> tunnel -> TLS.
/// Roughly equivalent to net::ConnectJob.
pub struct ConnectJob;

impl ConnectJob {
    pub async fn connect(connector: &Connector, req: ConnectRequest<'_>) -> Result<SocketType, NetError> {
        let target_host = req.target.host_str().ok_or(NetError::InvalidUrl)?;
        let target_port = req.target.port_or_known_default().ok_or(NetError::InvalidUrl)?;

        let (host, port) = match req.proxy {
            Some(p) => {
                if p.proxy_type() != ProxyType::Http {
                    debug!(proxy = %p.identity(), "unsupported proxy type");
                    return Err(NetError::ProxyConnectionFailed);
                }
                p.host_port().ok_or(NetError::InvalidUrl)?
            }
            None => (target_host, target_port),
        };

        let deadline = Instant::now() + connector.connect_timeout;
        let addrs = resolve(connector.resolver.as_ref(), host, port, deadline).await?;
        let mut stream = connect_any(&addrs, host, port, deadline).await?;
        connector.options.apply(&stream).connection_context(host, port)?;

        if let Some(p) = req.proxy {
            if req.target.scheme() == "https" {
                let authority = format!("{target_host}:{target_port}");
                let fresh_auth = p.auth_header();
                let auth = req.proxy_authorization.or(fresh_auth.as_deref().map(String::as_str));
                timeout_at(deadline, establish_tunnel(&mut stream, &authority, auth))
                    .await
                    .map_err(|_| NetError::ConnectionTimedOut)??;
                debug!(proxy = %p.identity(), target = %authority, "CONNECT tunnel established");
            }
        }

        if req.target.scheme() != "https" {
            return Ok(SocketType::Tcp(stream));
        }

        let sni_host = target_host.trim_start_matches('[').trim_end_matches(']');
        let config = connector.tls.configure(sni_host, req.alpn.protocols())?;
        let tls = timeout_at(deadline, tokio_boring::connect(config, sni_host, stream))
            .await
            .map_err(|_| NetError::ConnectionTimedOut)?
            .map_err(|e| {
                debug!(host = %sni_host, error = %e, "TLS handshake failed");
                handshake_error(sni_host, e.to_string())
            })?;
        let socket = SocketType::Ssl(tls);
        debug!(
            host = %sni_host,
            alpn = ?socket.alpn_protocol().map(String::from_utf8_lossy),
            "TLS established"
        );
        Ok(socket)
    }
}

async fn resolve(
    resolver: &dyn Resolve,
    host: &str,
    port: u16,
    deadline: Instant,
) -> Result<Vec<SocketAddr>, NetError> {
    let name = Name::new(host);
    let addrs = timeout_at(deadline, resolver.resolve(name.clone()))
        .await
        .map_err(|_| NetError::ConnectionTimedOut)??;
    let addrs = AddressList::new(addrs).with_port(port).interleaved();
    if addrs.is_empty() {
        return Err(NetError::NameNotResolved);
    }
    trace!(host = %name, count = addrs.len(), "resolved");
    Ok(addrs.into_iter().collect())
}

/// Try each address in order; the last failure is reported.
async fn connect_any(
    addrs: &[SocketAddr],
    host: &str,
    port: u16,
    deadline: Instant,
) -> Result<TcpStream, NetError> {
    let mut last = NetError::ConnectionFailed;
    for addr in addrs {
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                trace!(%addr, "TCP connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "TCP connect failed");
                last = NetError::connection_failed_to(host, port, e);
            }
            Err(_) => return Err(NetError::ConnectionTimedOut),
        }
    }
    Err(last)
}

/// Send CONNECT and read the proxy's answer.
///
/// A `407` carries every `Proxy-Authenticate` value back to the caller.
async fn establish_tunnel(
    stream: &mut TcpStream,
    authority: &str,
    proxy_authorization: Option<&str>,
) -> Result<(), NetError> {
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = proxy_authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.map_err(NetError::from_io)?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await.map_err(NetError::from_io)? == 0 {
            return Err(NetError::TunnelConnectionFailed);
        }
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let code = response.code.unwrap_or(0);
                return match code {
                    200..=299 => Ok(()),
                    407 => {
                        let challenges = response
                            .headers
                            .iter()
                            .filter(|h| h.name.eq_ignore_ascii_case("proxy-authenticate"))
                            .map(|h| String::from_utf8_lossy(h.value).into_owned())
                            .collect();
                        Err(NetError::ProxyAuthRequested { challenges })
                    }
                    _ => {
                        debug!(status = code, "proxy refused CONNECT");
                        Err(NetError::TunnelConnectionFailed)
                    }
                };
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_TUNNEL_RESPONSE => continue,
            Ok(httparse::Status::Partial) => return Err(NetError::ResponseHeadersTooBig),
            Err(_) => return Err(NetError::TunnelConnectionFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::GaiResolver;
    use tokio::net::TcpListener;

    fn connector() -> Connector {
        Connector {
            resolver: Arc::new(GaiResolver::new()),
            tls: TlsConfig::default(),
            options: SocketOptions::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    async fn proxy_answering(answer: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = s.read(&mut buf).await.unwrap();
            s.write_all(answer.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_tunnel_407_carries_challenges() {
        let (proxy_url, server) = proxy_answering(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             Proxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let proxy = ProxySettings::new(proxy_url.as_str()).unwrap();
        let target = Url::parse("https://example.com/").unwrap();
        let req = ConnectRequest {
            target: &target,
            proxy: Some(&proxy),
            proxy_authorization: None,
            alpn: AlpnOffer::PreferH2,
        };
        let err = ConnectJob::connect(&connector(), req).await.unwrap_err();
        match err {
            NetError::ProxyAuthRequested { challenges } => {
                assert_eq!(challenges, vec!["Basic realm=\"proxy\"".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let sent = server.await.unwrap();
        assert!(sent.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_sends_credentials() {
        let (proxy_url, server) = proxy_answering("HTTP/1.1 500 Nope\r\n\r\n").await;
        let proxy = ProxySettings::new(proxy_url.as_str()).unwrap().with_auth("user", "pass");
        let target = Url::parse("https://example.com:8443/").unwrap();
        let req = ConnectRequest {
            target: &target,
            proxy: Some(&proxy),
            proxy_authorization: None,
            alpn: AlpnOffer::Http11Only,
        };
        let err = ConnectJob::connect(&connector(), req).await.unwrap_err();
        assert!(matches!(err, NetError::TunnelConnectionFailed));
        assert!(err.is_connect());
        let sent = server.await.unwrap();
        assert!(sent.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target = Url::parse(&format!("http://{addr}/")).unwrap();
        let req = ConnectRequest { target: &target, proxy: None, proxy_authorization: None, alpn: AlpnOffer::PreferH2 };
        let err = ConnectJob::connect(&connector(), req).await.unwrap_err();
        assert!(err.is_connect(), "{err:?}");
    }

    #[tokio::test]
    async fn test_handshake_failure_is_tls_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let _ = s.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });
        let target = Url::parse(&format!("https://{addr}/")).unwrap();
        let req = ConnectRequest { target: &target, proxy: None, proxy_authorization: None, alpn: AlpnOffer::PreferH2 };
        let err = ConnectJob::connect(&connector(), req).await.unwrap_err();
        assert!(err.is_tls(), "{err:?}");
    }
}
