//! Conditional caching: fingerprints for `ETag` revalidation and a TTL cache
//! for collaborator fetches.

mod fingerprint;
mod ttl;

pub use fingerprint::{
    batch_hash_values, etag_header, etag_matches, fingerprint, hash_value, history_marker,
    merged_marker, suggestion_marker,
};
pub use ttl::TtlCache;

/// Outcome of comparing a collection against a client-supplied fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<T> {
    NotModified { fingerprint: String },
    Modified { fingerprint: String, body: T },
}

impl<T> Conditional<T> {
    /// Compare `fingerprint` with the client's `If-None-Match` value.
    pub fn evaluate(known: Option<&str>, fingerprint: String, body: T) -> Self {
        match known {
            Some(k) if etag_matches(k, &fingerprint) => Conditional::NotModified { fingerprint },
            _ => Conditional::Modified { fingerprint, body },
        }
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            Conditional::NotModified { fingerprint } => fingerprint,
            Conditional::Modified { fingerprint, .. } => fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_fingerprint_is_not_modified() {
        let c = Conditional::evaluate(Some("\"abc\""), "abc".to_string(), vec![1, 2]);
        assert_eq!(
            c,
            Conditional::NotModified {
                fingerprint: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_missing_or_stale_fingerprint_returns_body() {
        let c = Conditional::evaluate(None, "abc".to_string(), vec![1]);
        assert!(matches!(c, Conditional::Modified { ref body, .. } if body == &vec![1]));

        let c = Conditional::evaluate(Some("\"old\""), "abc".to_string(), vec![1]);
        assert_eq!(c.fingerprint(), "abc");
        assert!(matches!(c, Conditional::Modified { .. }));
    }
}
