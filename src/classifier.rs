use std::collections::BTreeSet;
use std::net::SocketAddrV4;

/// Immutable watch-list of lowercase domains, fixed at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDomainSet {
    domains: BTreeSet<String>,
}

impl TargetDomainSet {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize(d.as_ref()))
            .collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    /// True when `hostname` is a member or a subdomain of one.
    pub fn matches(&self, hostname: &str) -> bool {
        let host = hostname.to_ascii_lowercase();
        let host = host.strip_suffix('.').unwrap_or(&host);
        self.domains.iter().any(|domain| host_matches_suffix(host, domain))
    }
}

fn normalize(domain: &str) -> Option<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

/// Exact match, or `suffix` preceded by a label boundary. Never a bare substring.
fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    let host_len = host.len();
    let suffix_len = suffix.len();
    if host_len <= suffix_len {
        return false;
    }
    if !host.ends_with(suffix) {
        return false;
    }
    let dot_index = host_len - suffix_len - 1;
    host.as_bytes().get(dot_index) == Some(&b'.')
}

pub fn is_target_domain(hostname: &str, targets: &TargetDomainSet) -> bool {
    targets.matches(hostname)
}

/// Outcome of inspecting one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not IPv4/TCP to port 443, malformed, or no complete ClientHello.
    NotInteresting,
    /// A ClientHello whose SNI is outside the watch-list.
    Unmatched(String),
    /// A ClientHello whose SNI is on the watch-list.
    Matched(String),
}

impl Classification {
    pub fn from_hostname(hostname: &str, targets: &TargetDomainSet) -> Self {
        if targets.matches(hostname) {
            Classification::Matched(hostname.to_string())
        } else {
            Classification::Unmatched(hostname.to_string())
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Classification::Matched(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Classification::NotInteresting => None,
            Classification::Unmatched(host) | Classification::Matched(host) => Some(host.as_str()),
        }
    }
}

/// A matched flow, handed to whatever terminates intercepted sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interception {
    pub hostname: String,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_and_exact_matches() {
        let targets = TargetDomainSet::new(["apple.com"]);
        assert!(is_target_domain("gs-loc.apple.com", &targets));
        assert!(is_target_domain("apple.com", &targets));
        assert!(is_target_domain("APPLE.COM", &targets));
        assert!(!is_target_domain("notapple.com", &targets));
        assert!(!is_target_domain("apple.com.evil.net", &targets));
        assert!(!is_target_domain("com", &targets));
        assert!(!is_target_domain("", &targets));
    }

    #[test]
    fn location_service_hosts() {
        let targets = TargetDomainSet::new(["gs-loc.apple.com", "ls.apple.com"]);
        assert!(targets.matches("gs-loc.apple.com"));
        assert!(targets.matches("ls.apple.com"));
        assert!(targets.matches("sub.ls.apple.com"));
        assert!(!targets.matches("other.apple.com"));
        assert!(!targets.matches("google.com"));
        assert!(!targets.matches("als.apple.com"));
    }

    #[test]
    fn members_are_normalized() {
        let targets = TargetDomainSet::new(["  Example.COM. ", "", "example.com"]);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.iter().collect::<Vec<_>>(), vec!["example.com"]);
        assert!(targets.matches("www.example.com."));
    }

    #[test]
    fn classification_from_hostname() {
        let targets = TargetDomainSet::new(["ls.apple.com"]);
        let matched = Classification::from_hostname("ls.apple.com", &targets);
        assert!(matched.is_match());
        assert_eq!(matched.hostname(), Some("ls.apple.com"));

        let other = Classification::from_hostname("example.org", &targets);
        assert_eq!(other, Classification::Unmatched("example.org".to_string()));
        assert_eq!(Classification::NotInteresting.hostname(), None);
    }
}
