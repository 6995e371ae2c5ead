//! Protocol selection for a request: pooled HTTP/2 session, ALPN result,
//! prior knowledge or an `h2c` upgrade offer on a fresh plaintext
//! connection.

use crate::base::neterror::NetError;
use crate::http::h1::H1Connection;
use crate::http::h2::connection::H2Stream;
use crate::http::h2::{H2Config, H2Connection};
use crate::http::request::RequestHead;
use crate::http::retry::{AttemptError, Progress};
use crate::socket::client::SocketType;
use crate::socket::connectjob::AlpnOffer;
use crate::socket::pool::{ClientSocketPool, H2Checkout, PoolKey, PoolLease, SocketRequest};
use base64::{engine::general_purpose, Engine as _};
use bytes::BytesMut;
use http::header::{self, HeaderName, HeaderValue};
use tracing::{debug, trace};

/// Progress of an `h2c` upgrade on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    NotAttempted,
    /// The request carries the upgrade headers.
    Offered,
    /// `101` received; the connection now speaks HTTP/2.
    Switched,
    /// The server answered over HTTP/1.1.
    Declined,
}

impl UpgradeState {
    /// Transition on the response status of an offered upgrade.
    pub fn on_response(self, switched: bool) -> Self {
        match (self, switched) {
            (UpgradeState::Offered, true) => UpgradeState::Switched,
            (UpgradeState::Offered, false) => UpgradeState::Declined,
            (other, _) => other,
        }
    }
}

/// How this client wants to talk to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionPolicy {
    /// HTTP/2 requested for plaintext destinations.
    pub h2_plaintext: bool,
    /// Skip the upgrade dance and start with the preface.
    pub prior_knowledge: bool,
    /// Only HTTP/1.1 on TLS (ALPN offers `http/1.1` alone).
    pub http11_only: bool,
}

impl VersionPolicy {
    pub fn alpn(&self, scheme: &str) -> AlpnOffer {
        let h2 = if scheme == "https" { !self.http11_only } else { self.h2_plaintext };
        if h2 {
            AlpnOffer::PreferH2
        } else {
            AlpnOffer::Http11Only
        }
    }
}

/// A connection ready for one exchange.
pub(crate) enum Negotiated {
    Http1 { conn: H1Connection, upgrade: UpgradeState },
    Http2 { session: H2Connection, reused: bool },
}

/// Obtain a connection for `key`, reusing a live HTTP/2 session when one
/// exists. Concurrent first requests to a destination expected to speak
/// HTTP/2 share the one connection the first of them opens.
pub(crate) async fn negotiate(
    pool: &ClientSocketPool,
    request: SocketRequest<'_>,
    policy: VersionPolicy,
    config: &H2Config,
    has_body: bool,
) -> Result<Negotiated, AttemptError> {
    let key = request.key;
    let mut _opening = None;
    if key.alpn == AlpnOffer::PreferH2 {
        let expects_h2 = key.scheme == "https" || (policy.prior_knowledge && key.proxy.is_none());
        let checkout = if expects_h2 {
            pool.checkout_h2(key).await
        } else {
            pool.h2_session(key).map_or(H2Checkout::Direct, H2Checkout::Reuse)
        };
        match checkout {
            H2Checkout::Reuse(session) => {
                trace!(host = %key.host, "reusing h2 session");
                return Ok(Negotiated::Http2 { session, reused: true });
            }
            // held until this call settles the protocol
            H2Checkout::Open(opening) => _opening = Some(opening),
            H2Checkout::Direct => {}
        }
    }

    let lease = pool.acquire(request).await.map_err(AttemptError::early)?;
    let connected = Progress { connected: true, reused: lease.is_reused(), ..Progress::default() };
    let socket =
        lease.socket().ok_or_else(|| AttemptError::new(NetError::SocketNotConnected, connected))?;

    if socket.negotiated_h2() {
        debug!(host = %key.host, "ALPN selected h2");
        let session = start_session(pool, key, lease, config)
            .await
            .map_err(|e| AttemptError::new(e, connected))?;
        return Ok(Negotiated::Http2 { session, reused: false });
    }

    if socket.is_tls() && key.alpn == AlpnOffer::PreferH2 {
        debug!(host = %key.host, "ALPN selected http/1.1");
        pool.mark_http11(key);
    }

    let plaintext_h2 = !socket.is_tls() && key.alpn == AlpnOffer::PreferH2 && key.proxy.is_none();
    if plaintext_h2 && policy.prior_knowledge {
        debug!(host = %key.host, "h2 prior knowledge");
        let session = start_session(pool, key, lease, config)
            .await
            .map_err(|e| AttemptError::new(e, connected))?;
        return Ok(Negotiated::Http2 { session, reused: false });
    }

    let upgrade = if plaintext_h2 && !lease.is_reused() && !has_body && !pool.h2c_declined(key) {
        UpgradeState::Offered
    } else {
        UpgradeState::NotAttempted
    };
    Ok(Negotiated::Http1 { conn: H1Connection::new(lease), upgrade })
}

async fn start_session(
    pool: &ClientSocketPool,
    key: &PoolKey,
    lease: PoolLease,
    config: &H2Config,
) -> Result<H2Connection, NetError> {
    let (socket, _connection) = lease.detach()?;
    let tls = socket.tls_info();
    let session = H2Connection::handshake(socket, config, pool.tracker().cloned()).await?;
    if let Some(tls) = tls {
        session.set_tls_info(tls);
    }
    pool.insert_h2_session(key, session.clone());
    Ok(session)
}

/// Add the `h2c` upgrade headers to an HTTP/1.1 request head.
pub(crate) fn offer_upgrade(head: &mut RequestHead, config: &H2Config) -> Result<(), NetError> {
    let mut payload = BytesMut::new();
    config.local_settings().encode(&mut payload);
    let encoded = general_purpose::URL_SAFE_NO_PAD.encode(&payload);
    let settings = HeaderValue::from_str(&encoded)
        .map_err(|_| NetError::InvalidHeader { name: "http2-settings".into() })?;
    head.headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade, HTTP2-Settings"));
    head.headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
    head.headers.insert(HeaderName::from_static("http2-settings"), settings);
    Ok(())
}

/// Continue on HTTP/2 after `101 Switching Protocols`. The response to the
/// upgraded request arrives on stream 1.
pub(crate) fn complete_upgrade(
    pool: &ClientSocketPool,
    key: &PoolKey,
    socket: SocketType,
    buffered: BytesMut,
    config: &H2Config,
) -> (H2Connection, H2Stream) {
    debug!(host = %key.host, "h2c upgrade accepted");
    let (session, stream) = H2Connection::upgraded(socket, buffered, config, pool.tracker().cloned());
    pool.insert_h2_session(key, session.clone());
    (session, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::Settings;
    use http::Method;
    use url::Url;

    #[test]
    fn test_upgrade_transitions() {
        assert_eq!(UpgradeState::Offered.on_response(true), UpgradeState::Switched);
        assert_eq!(UpgradeState::Offered.on_response(false), UpgradeState::Declined);
        assert_eq!(UpgradeState::NotAttempted.on_response(true), UpgradeState::NotAttempted);
    }

    #[test]
    fn test_alpn_choice() {
        let default = VersionPolicy { h2_plaintext: false, prior_knowledge: false, http11_only: false };
        assert_eq!(default.alpn("https"), AlpnOffer::PreferH2);
        assert_eq!(default.alpn("http"), AlpnOffer::Http11Only);
        let h2 = VersionPolicy { h2_plaintext: true, ..default };
        assert_eq!(h2.alpn("http"), AlpnOffer::PreferH2);
        let h1 = VersionPolicy { http11_only: true, ..default };
        assert_eq!(h1.alpn("https"), AlpnOffer::Http11Only);
    }

    #[test]
    fn test_upgrade_headers() {
        let mut head = RequestHead {
            method: Method::GET,
            url: Url::parse("http://example.com/").unwrap(),
            headers: Default::default(),
        };
        let config = H2Config::default();
        offer_upgrade(&mut head, &config).unwrap();
        assert_eq!(head.headers[header::UPGRADE], "h2c");
        assert_eq!(head.headers[header::CONNECTION], "Upgrade, HTTP2-Settings");

        let encoded = head.headers["http2-settings"].to_str().unwrap();
        assert!(!encoded.contains('=') && !encoded.contains('+') && !encoded.contains('/'));
        let raw = general_purpose::URL_SAFE_NO_PAD.decode(encoded).unwrap();
        assert_eq!(Settings::decode(&raw).unwrap(), config.local_settings());
    }
}
