//! Descriptor key generation and handling.
//!
//! A key is the domain followed by every `(name, value)` entry of the
//! descriptor, each field terminated by `_`. Entry order is significant and is
//! not normalized: callers that want reordered descriptors to share a key must
//! send entries in a canonical order.

use std::borrow::Borrow;
use std::fmt;

use super::state::LimitConfig;

/// Terminator written after every field of an encoded key.
pub const KEY_SEPARATOR: u8 = b'_';

/// Opaque key identifying one rate limit counter in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(Vec<u8>);

impl RateLimitKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RateLimitKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RateLimitKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for RateLimitKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl AsRef<[u8]> for RateLimitKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for RateLimitKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A descriptor as submitted by a client: ordered entries plus the hits to apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDescriptor {
    /// Ordered `(name, value)` pairs
    pub entries: Vec<(String, String)>,
    /// Hits to apply; zero only queries the current state
    pub hits: u64,
    /// Explicit limit; the node default applies when absent
    pub limit: Option<LimitConfig>,
}

impl RateLimitDescriptor {
    pub fn new<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            hits: 1,
            limit: None,
        }
    }

    pub fn with_hits(mut self, hits: u64) -> Self {
        self.hits = hits;
        self
    }

    pub fn with_limit(mut self, limit: LimitConfig) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Serializes `(domain, entries)` into a [`RateLimitKey`].
pub struct KeyCodec;

impl KeyCodec {
    /// Exact number of bytes [`KeyCodec::encode_into`] writes.
    pub fn encoded_len<K, V>(domain: &str, entries: &[(K, V)]) -> usize
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        entries.iter().fold(domain.len() + 1, |acc, (k, v)| {
            acc + k.as_ref().len() + v.as_ref().len() + 2
        })
    }

    /// Encode into a caller-owned scratch buffer, replacing its contents.
    pub fn encode_into<K, V>(buf: &mut Vec<u8>, domain: &str, entries: &[(K, V)])
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        buf.clear();
        buf.reserve(Self::encoded_len(domain, entries));

        buf.extend_from_slice(domain.as_bytes());
        buf.push(KEY_SEPARATOR);
        for (name, value) in entries {
            buf.extend_from_slice(name.as_ref().as_bytes());
            buf.push(KEY_SEPARATOR);
            buf.extend_from_slice(value.as_ref().as_bytes());
            buf.push(KEY_SEPARATOR);
        }
    }

    /// Encode into a freshly allocated key sized exactly once.
    pub fn encode<K, V>(domain: &str, entries: &[(K, V)]) -> RateLimitKey
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut buf = Vec::with_capacity(Self::encoded_len(domain, entries));
        Self::encode_into(&mut buf, domain, entries);
        RateLimitKey(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let entries = [("source", "client_a"), ("dest", "svc_b")];
        let key = KeyCodec::encode("domain", &entries);
        assert_eq!(key.as_bytes(), b"domain_source_client_a_dest_svc_b_");
        assert_eq!(key.len(), KeyCodec::encoded_len("domain", &entries));
    }

    #[test]
    fn test_key_is_deterministic() {
        let entries = vec![("user".to_string(), "123".to_string())];
        let key1 = KeyCodec::encode("api", &entries);
        let key2 = KeyCodec::encode("api", &entries);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_entry_order_is_significant() {
        let key1 = KeyCodec::encode("api", &[("a", "1"), ("b", "2")]);
        let key2 = KeyCodec::encode("api", &[("b", "2"), ("a", "1")]);
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_scratch_buffer_is_reset() {
        let mut buf = Vec::new();
        KeyCodec::encode_into(&mut buf, "first_domain", &[("k", "a long value")]);
        KeyCodec::encode_into(&mut buf, "d", &[("k", "v")]);
        assert_eq!(buf, b"d_k_v_");
    }

    #[test]
    fn test_domain_only_key() {
        let key = KeyCodec::encode::<&str, &str>("domain", &[]);
        assert_eq!(key.to_string(), "domain_");
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = RateLimitDescriptor::new([("remote_address", "10.0.0.1")]).with_hits(3);
        assert_eq!(
            descriptor.entries,
            vec![("remote_address".to_string(), "10.0.0.1".to_string())]
        );
        assert_eq!(descriptor.hits, 3);
        assert!(descriptor.limit.is_none());
    }
}
