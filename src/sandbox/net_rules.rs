//! Network Allow-List Rules
//!
//! Host/port rules for NET_CONNECT checks. A rule is `host` or `host:port`;
//! `*` as the port matches any port, and a leading `*.` in the host matches
//! any single-level subdomain. Matching is case-insensitive on the host.

/// One parsed allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRule {
    host: String,
    /// None matches any port
    port: Option<u16>,
    wildcard_subdomain: bool,
}

impl HostRule {
    /// Parse `host`, `host:port` or `host:*`. `*.example.com` allows any
    /// single-level subdomain of example.com (but not example.com itself).
    pub fn parse(entry: &str) -> Result<Self, String> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err("empty allow-list entry".to_string());
        }
        let (host_part, port_part) = match entry.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (entry, None),
        };
        let port = match port_part {
            None | Some("*") => None,
            Some(p) => Some(
                p.parse::<u16>()
                    .map_err(|_| format!("invalid port in allow-list entry \"{}\"", entry))?,
            ),
        };
        let (host, wildcard_subdomain) = match host_part.strip_prefix("*.") {
            Some(rest) => (rest, true),
            None => (host_part, false),
        };
        if host.is_empty() {
            return Err(format!("allow-list entry must include a hostname: \"{}\"", entry));
        }
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
            wildcard_subdomain,
        })
    }

    /// Check one host:port pair against this rule.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        if let Some(allowed_port) = self.port {
            if port != allowed_port {
                return false;
            }
        }
        let host = host.to_ascii_lowercase();
        if self.wildcard_subdomain {
            match host.strip_suffix(&self.host) {
                Some(prefix) => {
                    // Exactly one label: "api." but not "a.b." or "".
                    prefix.ends_with('.')
                        && prefix.len() > 1
                        && prefix[..prefix.len() - 1].chars().all(|c| c != '.')
                }
                None => false,
            }
        } else {
            host == self.host
        }
    }
}

/// Check a host:port pair against every rule in an allow list.
pub fn is_endpoint_allowed(rules: &[HostRule], host: &str, port: u16) -> bool {
    rules.iter().any(|rule| rule.matches(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_host_any_port() {
        let rule = HostRule::parse("api.example.com").unwrap();
        assert!(rule.matches("api.example.com", 443));
        assert!(rule.matches("API.EXAMPLE.COM", 80));
        assert!(!rule.matches("example.com", 443));
    }

    #[test]
    fn test_host_with_port() {
        let rule = HostRule::parse("db.internal:5432").unwrap();
        assert!(rule.matches("db.internal", 5432));
        assert!(!rule.matches("db.internal", 5433));
    }

    #[test]
    fn test_wildcard_port() {
        let rule = HostRule::parse("cache.internal:*").unwrap();
        assert!(rule.matches("cache.internal", 1));
        assert!(rule.matches("cache.internal", 65535));
    }

    #[test]
    fn test_wildcard_subdomain() {
        let rule = HostRule::parse("*.example.com").unwrap();
        assert!(rule.matches("api.example.com", 443));
        assert!(!rule.matches("example.com", 443));
        assert!(!rule.matches("a.b.example.com", 443));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(HostRule::parse("").is_err());
        assert!(HostRule::parse("host:notaport").is_err());
        assert!(HostRule::parse("*.:80").is_err());
    }

    #[test]
    fn test_endpoint_allowed_any_rule() {
        let rules = vec![
            HostRule::parse("a.test:80").unwrap(),
            HostRule::parse("b.test").unwrap(),
        ];
        assert!(is_endpoint_allowed(&rules, "b.test", 9999));
        assert!(!is_endpoint_allowed(&rules, "a.test", 81));
        assert!(!is_endpoint_allowed(&rules, "c.test", 80));
    }
}
