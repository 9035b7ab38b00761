use subtle::ConstantTimeEq;

/// Constant-time string comparison for API keys and other shared secrets.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Check a presented API key against the configured one.
/// With no key configured every request passes.
pub fn api_key_allows(configured: Option<&str>, presented: Option<&str>) -> bool {
    match (configured, presented) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(expected), Some(given)) => constant_time_compare(expected, given),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret123", "secret123"));
        assert!(!constant_time_compare("secret123", "secret124"));
        assert!(!constant_time_compare("secret123", "secret12"));
        assert!(!constant_time_compare("", "secret"));
    }

    #[test]
    fn test_api_key_allows() {
        assert!(api_key_allows(None, None));
        assert!(api_key_allows(None, Some("anything")));
        assert!(!api_key_allows(Some("k3y"), None));
        assert!(!api_key_allows(Some("k3y"), Some("key")));
        assert!(api_key_allows(Some("k3y"), Some("k3y")));
    }
}
