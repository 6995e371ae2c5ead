//! Immutable request/response header collections.
//!
//! [`HttpHeaders`] is a case-insensitive multimap: names differing only in
//! letter case share one bucket, and each bucket keeps its values in the
//! order they were added. Equality compares buckets by name (order of
//! different names does not matter) and values within a bucket by order.

use crate::base::neterror::NetError;
use http::header::{self, HeaderName, HeaderValue};
use http::HeaderMap;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Header names the caller may not set unless explicitly allowed.
pub const RESTRICTED_HEADERS: [HeaderName; 5] =
    [header::CONNECTION, header::CONTENT_LENGTH, header::EXPECT, header::HOST, header::UPGRADE];

#[derive(Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    map: HeaderMap,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HeaderMap) -> Self {
        Self { map }
    }

    /// Build from name/value pairs, appending in iteration order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, NetError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            let (name, value) = parse_pair(name.as_ref(), value.as_ref())?;
            map.append(name, value);
        }
        Ok(Self { map })
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn first_value_as_u64(&self, name: &str) -> Option<u64> {
        self.first_value(name).and_then(|v| v.trim().parse().ok())
    }

    /// All values for `name`, in the order they were added.
    pub fn all_values(&self, name: &str) -> Vec<&str> {
        self.map.get_all(name).iter().filter_map(|v| v.to_str().ok()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// True if any comma-separated element of any `name` value equals
    /// `token` (ASCII case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.all_values(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.map.keys_len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &HeaderName> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.map.iter()
    }

    /// Read-only view of the underlying map.
    pub fn as_map(&self) -> &HeaderMap {
        &self.map
    }

    pub fn into_map(self) -> HeaderMap {
        self.map
    }
}

impl fmt::Debug for HttpHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for name in self.map.keys() {
            let values: Vec<_> = self.map.get_all(name).iter().collect();
            dbg.entry(&name.as_str(), &values);
        }
        dbg.finish()
    }
}

impl From<HeaderMap> for HttpHeaders {
    fn from(map: HeaderMap) -> Self {
        Self::from_map(map)
    }
}

pub(crate) fn parse_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), NetError> {
    let name =
        HeaderName::from_str(name).map_err(|_| NetError::InvalidHeader { name: name.to_string() })?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| NetError::InvalidHeader { name: name.as_str().to_string() })?;
    Ok((name, value))
}

/// Which restricted header names the caller is allowed to set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPolicy {
    allowed: HashSet<HeaderName>,
}

impl HeaderPolicy {
    /// Policy allowing the given subset of [`RESTRICTED_HEADERS`] (plus
    /// `proxy-authorization`). Any other name is a configuration error.
    pub fn allowing<I, S>(names: I) -> Result<Self, NetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = HashSet::new();
        for name in names {
            let raw = name.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let parsed = HeaderName::from_str(raw)
                .map_err(|_| NetError::InvalidHeader { name: raw.to_string() })?;
            if !is_restricted(&parsed) && parsed != header::PROXY_AUTHORIZATION {
                return Err(NetError::InvalidArgument {
                    reason: format!("{} is not a restricted header", parsed),
                });
            }
            allowed.insert(parsed);
        }
        Ok(Self { allowed })
    }

    pub fn is_allowed(&self, name: &HeaderName) -> bool {
        self.allowed.contains(name)
    }

    /// Reject a caller-set header that is restricted and not allowed.
    pub fn check(&self, name: &HeaderName) -> Result<(), NetError> {
        if is_restricted(name) && !self.is_allowed(name) {
            return Err(NetError::RestrictedHeader { name: name.as_str().to_string() });
        }
        Ok(())
    }
}

pub fn is_restricted(name: &HeaderName) -> bool {
    RESTRICTED_HEADERS.contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_bucket_keeps_order() {
        let headers =
            HttpHeaders::from_pairs([("X-Bar", "foo1"), ("x-bar", "foo2"), ("X-BAR", "foo3")])
                .unwrap();
        assert_eq!(headers.all_values("x-bar"), vec!["foo1", "foo2", "foo3"]);
        assert_eq!(headers.all_values("X-Bar"), vec!["foo1", "foo2", "foo3"]);
        assert_eq!(headers.first_value("X-BAR"), Some("foo1"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_equality_ignores_name_order_and_case() {
        let a = HttpHeaders::from_pairs([
            ("Name1", "v1"),
            ("Name1", "v2"),
            ("name1", "v3"),
            ("Other", "x"),
        ])
        .unwrap();
        let b = HttpHeaders::from_pairs([
            ("OTHER", "x"),
            ("name1", "v1"),
            ("NAME1", "v2"),
            ("Name1", "v3"),
        ])
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_is_value_order_sensitive() {
        let a = HttpHeaders::from_pairs([("Name1", "v1"), ("Name1", "v2"), ("name1", "v3")]).unwrap();
        let missing = HttpHeaders::from_pairs([("Name1", "v1"), ("Name1", "v2")]).unwrap();
        let reordered =
            HttpHeaders::from_pairs([("Name1", "v2"), ("Name1", "v1"), ("name1", "v3")]).unwrap();
        assert_ne!(a, missing);
        assert_ne!(a, reordered);
    }

    #[test]
    fn test_first_value_as_u64() {
        let headers = HttpHeaders::from_pairs([("Content-Length", " 42 ")]).unwrap();
        assert_eq!(headers.first_value_as_u64("content-length"), Some(42));
        assert_eq!(headers.first_value_as_u64("missing"), None);
    }

    #[test]
    fn test_has_token() {
        let headers = HttpHeaders::from_pairs([("Connection", "keep-alive, Upgrade")]).unwrap();
        assert!(headers.has_token("connection", "upgrade"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn test_invalid_header_name() {
        let result = HttpHeaders::from_pairs([("Invalid Header", "value")]);
        assert!(matches!(result, Err(NetError::InvalidHeader { .. })));
    }

    #[test]
    fn test_invalid_header_value() {
        let result = HttpHeaders::from_pairs([("Valid", "invalid\nvalue")]);
        assert!(matches!(result, Err(NetError::InvalidHeader { .. })));
    }

    #[test]
    fn test_default_policy_rejects_all_restricted() {
        let policy = HeaderPolicy::default();
        for name in RESTRICTED_HEADERS.iter() {
            assert!(matches!(policy.check(name), Err(NetError::RestrictedHeader { .. })));
        }
        assert!(policy.check(&HeaderName::from_static("x-custom")).is_ok());
    }

    #[test]
    fn test_policy_allows_exactly_the_subset() {
        let policy = HeaderPolicy::allowing(["Host", "upgrade"]).unwrap();
        assert!(policy.check(&header::HOST).is_ok());
        assert!(policy.check(&header::UPGRADE).is_ok());
        assert!(policy.check(&header::CONNECTION).is_err());
        assert!(policy.check(&header::CONTENT_LENGTH).is_err());
        assert!(policy.check(&header::EXPECT).is_err());
    }

    #[test]
    fn test_policy_rejects_unrestricted_names() {
        assert!(HeaderPolicy::allowing(["x-custom"]).is_err());
    }
}
