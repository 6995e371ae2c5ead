//! TLS client configuration on BoringSSL.

use crate::base::neterror::NetError;
use boring::ssl::{ConnectConfiguration, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use tracing::trace;

/// ALPN identifiers, in wire order of preference.
pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS settings shared by every connection of a client.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    /// Accept any certificate. Only for tests against self-signed servers.
    pub danger_accept_invalid_certs: bool,
    /// Extra trust anchors, PEM encoded, added to the system store.
    pub root_certificates: Vec<Vec<u8>>,
    pub enable_sni: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            danger_accept_invalid_certs: false,
            root_certificates: Vec::new(),
            enable_sni: true,
        }
    }
}

impl TlsConfig {
    /// Build a per-connection configuration offering `alpn` in order.
    pub(crate) fn configure(&self, host: &str, alpn: &[&[u8]]) -> Result<ConnectConfiguration, NetError> {
        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_setup_error)?;
        builder.set_min_proto_version(self.min_version).map_err(tls_setup_error)?;
        builder.set_max_proto_version(self.max_version).map_err(tls_setup_error)?;

        if !alpn.is_empty() {
            builder.set_alpn_protos(&alpn_wire(alpn)?).map_err(tls_setup_error)?;
        }

        for pem in &self.root_certificates {
            let cert = X509::from_pem(pem).map_err(|e| NetError::CertificateInvalid {
                reason: format!("bad root certificate: {e}"),
            })?;
            builder.cert_store_mut().add_cert(cert).map_err(tls_setup_error)?;
        }

        if self.danger_accept_invalid_certs {
            builder.set_verify(SslVerifyMode::NONE);
        } else {
            builder.set_verify(SslVerifyMode::PEER);
        }

        let mut config = builder.build().configure().map_err(tls_setup_error)?;
        config.set_use_server_name_indication(self.enable_sni && Self::should_set_sni(host));
        if self.danger_accept_invalid_certs {
            config.set_verify_hostname(false);
        }
        trace!(host, alpn_len = alpn.len(), "TLS configuration ready");
        Ok(config)
    }

    /// SNI must not carry IP literals (RFC 6066 section 3).
    pub fn should_set_sni(host: &str) -> bool {
        host.trim_start_matches('[').trim_end_matches(']').parse::<std::net::IpAddr>().is_err()
    }
}

fn alpn_wire(protocols: &[&[u8]]) -> Result<Vec<u8>, NetError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len()).map_err(|_| NetError::AlpnNegotiationFailed)?;
        wire.push(len);
        wire.extend_from_slice(proto);
    }
    Ok(wire)
}

fn tls_setup_error(e: boring::error::ErrorStack) -> NetError {
    tracing::debug!(error = %e, "TLS setup failed");
    NetError::SslProtocolError
}

/// Map a failed handshake to a certificate or handshake error.
pub(crate) fn handshake_error(host: &str, reason: String) -> NetError {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("certificate") && (lower.contains("verify") || lower.contains("expired")) {
        NetError::CertificateInvalid { reason }
    } else {
        NetError::SslHandshakeFailed { host: host.to_string(), reason }
    }
}

/// Negotiated session parameters, exposed on responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// e.g. `TLSv1.3`
    pub protocol: String,
    pub cipher: String,
}
