/// Hostname normalization for domain lookups.
///
/// Every lookup key in the daemon is a lowercase hostname with the port
/// stripped, so `Resolve(host)` and `Resolve(toLower(host))` hit the
/// same entry.
pub fn normalize(host: &str) -> String {
    strip_port(host).to_ascii_lowercase()
}

/// Strip an optional `:port` suffix. IPv6 literals keep their brackets'
/// contents intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [::1]:8080 → ::1
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }

    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// A hostname is valid when it is non-empty, has no whitespace or
/// slashes, and every label is non-empty. Mirrors what the disk source
/// accepts from `config.json`.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.starts_with('.') || host.ends_with('.') {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_strips_port() {
        assert_eq!(normalize("Group.Pages.Test:8080"), "group.pages.test");
        assert_eq!(normalize("EXAMPLE.COM"), "example.com");
    }

    #[test]
    fn strip_port_leaves_bare_hosts() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:443"), "example.com");
    }

    #[test]
    fn strip_port_handles_ipv6() {
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
    }

    #[test]
    fn strip_port_ignores_non_numeric_suffix() {
        // not a port, leave untouched
        assert_eq!(strip_port("weird:host"), "weird:host");
    }

    #[test]
    fn hostname_validation() {
        assert!(is_valid_hostname("group.pages.test"));
        assert!(is_valid_hostname("x.example"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname(".leading.dot"));
        assert!(!is_valid_hostname("trailing.dot."));
        assert!(!is_valid_hostname("sp ace.example"));
        assert!(!is_valid_hostname("slash/example.com"));
    }
}
