// SSRF Guard - Pre-flight checks for outbound webhook targets

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use url::{Host, Url};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SsrfError {
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("scheme '{0}' is not allowed, only http and https are permitted")]
    Scheme(String),
    #[error("webhook URL has no host")]
    MissingHost,
    #[error("host '{0}' is internal and not allowed")]
    BlockedHost(String),
    #[error("address {0} is in a restricted range")]
    RestrictedAddress(IpAddr),
    #[error("host '{host}' resolves to restricted address {addr}")]
    ResolvesToRestricted { host: String, addr: IpAddr },
    #[error("DNS resolution failed for '{host}': {reason}")]
    Resolution { host: String, reason: String },
}

/// A URL that passed every check. `pinned` carries the vetted address for
/// domain targets so the request goes exactly where the check looked.
#[derive(Debug, Clone)]
pub struct ValidatedTarget {
    pub url: Url,
    pub pinned: Option<(String, SocketAddr)>,
}

#[derive(Debug, Clone, Default)]
pub struct SsrfGuard {
    allowed_hosts: Vec<String>,
}

enum StaticVerdict {
    Allowed,
    NeedsResolution(String),
}

impl SsrfGuard {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.trim().trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_allow_listed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|h| h == host)
    }

    /// Scheme, host-name and literal-address rules. No network access.
    fn check_static(&self, url: &Url) -> Result<StaticVerdict, SsrfError> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(SsrfError::Scheme(other.to_string())),
        }

        match url.host() {
            None => Err(SsrfError::MissingHost),
            Some(Host::Ipv4(v4)) => {
                let ip = IpAddr::V4(v4);
                if !self.is_allow_listed(&v4.to_string()) && is_restricted_ip(&ip) {
                    return Err(SsrfError::RestrictedAddress(ip));
                }
                Ok(StaticVerdict::Allowed)
            }
            Some(Host::Ipv6(v6)) => {
                let ip = IpAddr::V6(v6);
                if !self.is_allow_listed(&v6.to_string()) && is_restricted_ip(&ip) {
                    return Err(SsrfError::RestrictedAddress(ip));
                }
                Ok(StaticVerdict::Allowed)
            }
            Some(Host::Domain(domain)) => {
                let host = domain.trim_end_matches('.').to_ascii_lowercase();
                if self.is_allow_listed(&host) {
                    return Ok(StaticVerdict::Allowed);
                }
                if is_internal_hostname(&host) {
                    return Err(SsrfError::BlockedHost(host));
                }
                Ok(StaticVerdict::NeedsResolution(host))
            }
        }
    }

    /// Full validation: static rules, then every DNS answer must be public.
    pub async fn check(&self, raw: &str) -> Result<ValidatedTarget, SsrfError> {
        let url = Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

        let host = match self.check_static(&url)? {
            StaticVerdict::Allowed => return Ok(ValidatedTarget { url, pinned: None }),
            StaticVerdict::NeedsResolution(host) => host,
        };

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| SsrfError::Resolution {
                host: host.clone(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(SsrfError::Resolution {
                host,
                reason: "no addresses returned".to_string(),
            });
        }

        if let Some(bad) = addrs.iter().find(|a| is_restricted_ip(&a.ip())) {
            return Err(SsrfError::ResolvesToRestricted {
                host,
                addr: bad.ip(),
            });
        }

        let pinned = addrs[0];
        Ok(ValidatedTarget {
            url,
            pinned: Some((host, pinned)),
        })
    }
}

fn is_internal_hostname(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".internal")
        || host.ends_with(".local")
}

pub fn is_restricted_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_restricted_v4(v4),
        IpAddr::V6(v6) => is_restricted_v6(v6),
    }
}

fn is_restricted_v4(v4: &Ipv4Addr) -> bool {
    let octets = v4.octets();

    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_multicast()
        // 0.0.0.0/8
        || octets[0] == 0
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        // 240.0.0.0/4
        || octets[0] >= 240
}

fn is_restricted_v6(v6: &Ipv6Addr) -> bool {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_restricted_v4(&mapped);
    }

    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        || v6.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
