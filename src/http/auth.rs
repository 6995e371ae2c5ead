//! HTTP authentication: challenge parsing and the Basic and Digest schemes.
//!
//! Mirrors Chromium's `net/http/http_auth*.cc`. Each `WWW-Authenticate` or
//! `Proxy-Authenticate` header occurrence is parsed on its own; a single
//! occurrence may carry several comma separated challenges.

use crate::base::neterror::NetError;
use base64::{engine::general_purpose, Engine as _};
use boring::hash::{hash, MessageDigest};
use std::fmt::{self, Write};
use url::Url;
use zeroize::Zeroizing;

/// Authentication schemes this crate can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    Basic,
    Digest,
}

impl AuthScheme {
    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("basic") {
            Some(Self::Basic)
        } else if token.eq_ignore_ascii_case("digest") {
            Some(Self::Digest)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Digest => "Digest",
        }
    }
}

/// One parsed challenge: a scheme followed by either auth-params or a
/// token68 blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    scheme: String,
    params: Vec<(String, String)>,
    token68: Option<String>,
}

impl AuthChallenge {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Parameter lookup, case-insensitive on the name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn token68(&self) -> Option<&str> {
        self.token68.as_deref()
    }

    /// The `realm` parameter, empty when absent.
    pub fn realm(&self) -> &str {
        self.param("realm").unwrap_or_default()
    }

    pub fn supported_scheme(&self) -> Option<AuthScheme> {
        AuthScheme::from_token(&self.scheme)
    }
}

/// Parse one header value into its challenges.
pub fn parse_challenges(value: &str) -> Vec<AuthChallenge> {
    let mut challenges: Vec<AuthChallenge> = Vec::new();
    for item in split_list(value) {
        if let Some((name, val)) = as_param(item) {
            if let Some(current) = challenges.last_mut() {
                current.params.push((name.to_string(), unquote(val)));
            }
            continue;
        }
        let (scheme, rest) = match item.find(char::is_whitespace) {
            Some(pos) => (&item[..pos], item[pos..].trim()),
            None => (item, ""),
        };
        if !is_token(scheme) {
            continue;
        }
        let mut challenge =
            AuthChallenge { scheme: scheme.to_string(), params: Vec::new(), token68: None };
        if !rest.is_empty() {
            match as_param(rest) {
                Some((name, val)) => challenge.params.push((name.to_string(), unquote(val))),
                None => challenge.token68 = Some(rest.to_string()),
            }
        }
        challenges.push(challenge);
    }
    challenges
}

/// The first supported challenge across all header occurrences, even when
/// an unsupported scheme is listed first.
pub fn select_challenge<'a, I>(values: I) -> Option<(AuthScheme, AuthChallenge)>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .flat_map(parse_challenges)
        .find_map(|c| c.supported_scheme().map(|s| (s, c)))
}

/// Split on commas outside quoted strings.
fn split_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                let part = value[start..i].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let part = value[start..].trim();
    if !part.is_empty() {
        parts.push(part);
    }
    parts
}

/// `name=value` with a token name. A value made only of `=` padding is
/// token68, not a parameter.
fn as_param(item: &str) -> Option<(&str, &str)> {
    let eq = item.find('=')?;
    let name = item[..eq].trim();
    let value = item[eq + 1..].trim();
    if !is_token(name) || value.is_empty() || value.bytes().all(|b| b == b'=') {
        return None;
    }
    Some((name, value))
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A username and password. The password is wiped from memory on drop.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: Zeroizing::new(password.into()) }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// `Basic <base64(user:pass)>`.
    pub fn basic_header(&self) -> Zeroizing<String> {
        let raw = Zeroizing::new(format!("{}:{}", self.username, self.password.as_str()));
        Zeroizing::new(format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes())))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What an [`Authenticator`] is told about a challenge.
#[derive(Debug, Clone)]
pub struct AuthChallengeInfo {
    pub scheme: AuthScheme,
    pub realm: String,
    pub host: String,
    pub port: u16,
    pub is_proxy: bool,
    pub url: Url,
}

/// Supplies credentials for server and proxy challenges. Returning `None`
/// hands the 401/407 response back to the caller.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, info: &AuthChallengeInfo) -> Option<Credentials>;
}

impl<F> Authenticator for F
where
    F: Fn(&AuthChallengeInfo) -> Option<Credentials> + Send + Sync,
{
    fn authenticate(&self, info: &AuthChallengeInfo) -> Option<Credentials> {
        self(info)
    }
}

/// Answers every challenge with the same credentials.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    credentials: Credentials,
}

impl StaticAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { credentials: Credentials::new(username, password) }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, _info: &AuthChallengeInfo) -> Option<Credentials> {
        Some(self.credentials.clone())
    }
}

/// Digest authentication algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    /// Unspecified - defaults to MD5
    #[default]
    Unspecified,
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "md5-sess" => Some(Self::Md5Sess),
            "sha-256" => Some(Self::Sha256),
            "sha-256-sess" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "",
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }
}

/// Digest state for one realm and nonce (RFC 7616). Only `qop=auth` is
/// answered; a challenge offering `auth-int` alone falls back to the
/// RFC 2069 form.
#[derive(Debug, Clone)]
pub struct DigestAuthHandler {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
    qop_auth: bool,
    userhash: bool,
    nonce_count: u32,
}

impl DigestAuthHandler {
    pub fn from_challenge(challenge: &AuthChallenge) -> Result<Self, NetError> {
        let nonce = challenge.param("nonce").filter(|n| !n.is_empty());
        let nonce = nonce.ok_or(NetError::InvalidResponse)?;
        let algorithm = match challenge.param("algorithm") {
            Some(a) => DigestAlgorithm::from_str(a).ok_or(NetError::UnsupportedAuthScheme)?,
            None => DigestAlgorithm::Unspecified,
        };
        let qop_auth = challenge
            .param("qop")
            .map_or(false, |q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")));
        let flag = |name| challenge.param(name).map_or(false, |v| v.eq_ignore_ascii_case("true"));
        Ok(Self {
            realm: challenge.realm().to_string(),
            nonce: nonce.to_string(),
            opaque: challenge.param("opaque").map(str::to_string),
            algorithm,
            qop_auth,
            userhash: flag("userhash"),
            nonce_count: 0,
        })
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Build the `Authorization` value for `method` and request-target `uri`.
    pub fn generate_auth_token(
        &mut self,
        method: &str,
        uri: &str,
        credentials: &Credentials,
    ) -> Result<String, NetError> {
        self.nonce_count = self.nonce_count.wrapping_add(1);
        let nc = format!("{:08x}", self.nonce_count);
        let cnonce = generate_cnonce()?;

        let username = if self.userhash {
            self.hex_hash(&format!("{}:{}", credentials.username(), self.realm))?
        } else {
            credentials.username().to_string()
        };

        let secret = Zeroizing::new(format!(
            "{}:{}:{}",
            credentials.username(),
            self.realm,
            credentials.password()
        ));
        let mut ha1 = self.hex_hash(&secret)?;
        if self.algorithm.is_session() {
            ha1 = self.hex_hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce))?;
        }
        let ha2 = self.hex_hash(&format!("{method}:{uri}"))?;
        let response = if self.qop_auth {
            self.hex_hash(&format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))?
        } else {
            self.hex_hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))?
        };

        let mut auth = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            username, self.realm, self.nonce, uri
        );
        if self.algorithm != DigestAlgorithm::Unspecified {
            let _ = write!(auth, ", algorithm={}", self.algorithm.as_str());
        }
        let _ = write!(auth, ", response=\"{response}\"");
        if let Some(opaque) = &self.opaque {
            let _ = write!(auth, ", opaque=\"{opaque}\"");
        }
        if self.qop_auth {
            let _ = write!(auth, ", qop=auth, nc={nc}, cnonce=\"{cnonce}\"");
        }
        if self.userhash {
            auth.push_str(", userhash=true");
        }
        Ok(auth)
    }

    fn hex_hash(&self, input: &str) -> Result<String, NetError> {
        let md = match self.algorithm {
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => MessageDigest::sha256(),
            _ => MessageDigest::md5(),
        };
        let digest = hash(md, input.as_bytes()).map_err(|_| NetError::InvalidAuthCredentials)?;
        Ok(hex(&digest))
    }
}

fn generate_cnonce() -> Result<String, NetError> {
    let mut raw = [0u8; 8];
    boring::rand::rand_bytes(&mut raw).map_err(|_| NetError::InvalidAuthCredentials)?;
    Ok(hex(&raw))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_basic() {
        let challenges = parse_challenges(r#"Basic realm="simple""#);
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].scheme(), "Basic");
        assert_eq!(challenges[0].realm(), "simple");
    }

    #[test]
    fn test_parse_several_challenges_in_one_value() {
        let challenges = parse_challenges(
            r#"Newauth realm="apps", type=1, title="Login to \"apps\"", Basic realm="simple""#,
        );
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme(), "Newauth");
        assert_eq!(challenges[0].param("TYPE"), Some("1"));
        assert_eq!(challenges[0].param("title"), Some(r#"Login to "apps""#));
        assert_eq!(challenges[1].supported_scheme(), Some(AuthScheme::Basic));
    }

    #[test]
    fn test_quoted_comma_stays_in_param() {
        let challenges =
            parse_challenges(r#"Digest realm="r", qop="auth,auth-int", nonce="n1""#);
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].param("qop"), Some("auth,auth-int"));
        assert_eq!(challenges[0].param("nonce"), Some("n1"));
    }

    #[test]
    fn test_token68() {
        let challenges = parse_challenges("Negotiate abc123==, Basic realm=x");
        assert_eq!(challenges[0].token68(), Some("abc123=="));
        assert_eq!(challenges[1].realm(), "x");
    }

    #[test]
    fn test_first_supported_scheme_wins() {
        let values = [r#"Bearer realm="api""#, r#"Digest realm="d", nonce="n""#, "Basic realm=b"];
        let (scheme, challenge) = select_challenge(values).unwrap();
        assert_eq!(scheme, AuthScheme::Digest);
        assert_eq!(challenge.realm(), "d");
        assert!(select_challenge(["Bearer realm=x"]).is_none());
    }

    #[test]
    fn test_basic_header() {
        // base64("user:pass") = "dXNlcjpwYXNz"
        let creds = Credentials::new("user", "pass");
        assert_eq!(creds.basic_header().as_str(), "Basic dXNlcjpwYXNz");
        assert!(!format!("{creds:?}").contains("pass\""));
    }

    #[test]
    fn test_digest_token() {
        let challenge =
            &parse_challenges(r#"Digest realm="test", nonce="abc123", qop="auth", opaque="xyz""#)[0];
        let mut handler = DigestAuthHandler::from_challenge(challenge).unwrap();
        let creds = Credentials::new("user", "pass");

        let first = handler.generate_auth_token("GET", "/path", &creds).unwrap();
        assert!(first.starts_with("Digest username=\"user\""));
        assert!(first.contains("uri=\"/path\""));
        assert!(first.contains("opaque=\"xyz\""));
        assert!(first.contains("nc=00000001"));

        let second = handler.generate_auth_token("GET", "/path", &creds).unwrap();
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn test_digest_rfc2069_response() {
        // RFC 2069 example values
        let challenge = &parse_challenges(
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093""#,
        )[0];
        let mut handler = DigestAuthHandler::from_challenge(challenge).unwrap();
        let creds = Credentials::new("Mufasa", "CircleOfLife");
        let token = handler.generate_auth_token("GET", "/dir/index.html", &creds).unwrap();
        assert!(token.contains("response=\"1949323746fe6a43ef61f9606e7febea\""), "{token}");
    }

    #[test]
    fn test_digest_requires_nonce() {
        let challenge = &parse_challenges(r#"Digest realm="test""#)[0];
        assert!(DigestAuthHandler::from_challenge(challenge).is_err());
        let bad_alg = &parse_challenges(r#"Digest realm="t", nonce="n", algorithm=SHA-512"#)[0];
        assert!(matches!(
            DigestAuthHandler::from_challenge(bad_alg),
            Err(NetError::UnsupportedAuthScheme)
        ));
    }
}
