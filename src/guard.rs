//! SSRF guard for subscriber URLs.
//!
//! A webhook URL is attacker-supplied: anyone who can register a config
//! chooses where the engine sends POST requests. The guard refuses
//! destinations that resolve into private, loopback, link-local, multicast
//! or cloud-metadata address space.
//!
//! The check runs at config intake and, when enabled, again before every
//! delivery attempt to narrow the DNS-rebinding window.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use url::{Host, Url};

use crate::error::ValidationError;

pub const MAX_URL_LENGTH: usize = 2048;

/// Hostnames that serve instance metadata on the major clouds.
const METADATA_HOSTS: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "metadata",
    "metadata.azure.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

/// Resolves a hostname to the set of addresses a connection could reach.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Clone)]
pub struct UrlGuard {
    resolver: Arc<dyn HostResolver>,
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlGuard {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn HostResolver>) -> Self {
        Self { resolver }
    }

    /// Validate a candidate webhook URL.
    ///
    /// Scheme and length are always enforced. With `override_enabled`, the
    /// network-derived checks are skipped and a warning is logged every time.
    pub async fn validate(&self, raw: &str, override_enabled: bool) -> Result<Url, ValidationError> {
        let url = parse_webhook_url(raw)?;

        if override_enabled {
            warn!(
                url = %raw,
                "SSRF guard bypassed: private/internal webhook destinations are allowed; never enable this in production"
            );
            return Ok(url);
        }

        let host = url
            .host()
            .ok_or_else(|| ValidationError::InvalidUrl(format!("missing host in {raw}")))?;

        match host {
            Host::Ipv4(ip) => check_ip(&ip.to_string(), IpAddr::V4(ip))?,
            Host::Ipv6(ip) => check_ip(&ip.to_string(), IpAddr::V6(ip))?,
            Host::Domain(domain) => self.check_domain(domain, &url).await?,
        }

        Ok(url)
    }

    async fn check_domain(&self, domain: &str, url: &Url) -> Result<(), ValidationError> {
        let normalized = domain.trim_end_matches('.').to_ascii_lowercase();

        if METADATA_HOSTS.contains(&normalized.as_str()) {
            return Err(ValidationError::BlockedHost {
                host: domain.to_string(),
                reason: "cloud metadata service".to_string(),
            });
        }
        if normalized == "localhost" || normalized.ends_with(".localhost") {
            return Err(ValidationError::BlockedHost {
                host: domain.to_string(),
                reason: "loopback address".to_string(),
            });
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = self
            .resolver
            .resolve(&normalized, port)
            .await
            .map_err(|err| ValidationError::UnresolvableHost {
                host: domain.to_string(),
                reason: err.to_string(),
            })?;

        if addrs.is_empty() {
            return Err(ValidationError::UnresolvableHost {
                host: domain.to_string(),
                reason: "no addresses returned".to_string(),
            });
        }

        // Any single internal address is enough for a request to land inside.
        for ip in addrs {
            check_ip(domain, ip)?;
        }
        Ok(())
    }
}

/// Syntactic checks shared by every validation path.
fn parse_webhook_url(raw: &str) -> Result<Url, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(ValidationError::UrlTooLong {
            len: raw.len(),
            max: MAX_URL_LENGTH,
        });
    }

    let url = Url::parse(raw).map_err(|err| ValidationError::InvalidUrl(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ValidationError::UnsupportedScheme(other.to_string())),
    }
}

fn check_ip(host: &str, ip: IpAddr) -> Result<(), ValidationError> {
    match blocked_reason(ip) {
        Some(reason) => Err(ValidationError::BlockedHost {
            host: host.to_string(),
            reason: format!("{ip} is a {reason}"),
        }),
        None => Ok(()),
    }
}

/// Classify an address the engine must never deliver to.
pub fn blocked_reason(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => blocked_v6(v6),
    }
}

fn blocked_v4(ip: Ipv4Addr) -> Option<&'static str> {
    let [a, b, c, d] = ip.octets();
    if is_metadata_v4(a, b, c, d) {
        return Some("cloud metadata address");
    }
    if ip.is_loopback() {
        return Some("loopback address");
    }
    if ip.is_private() {
        return Some("private address");
    }
    if ip.is_link_local() {
        return Some("link-local address");
    }
    if ip.is_multicast() {
        return Some("multicast address");
    }
    if ip.is_unspecified() || a == 0 {
        return Some("unspecified address");
    }
    if ip.is_broadcast() {
        return Some("broadcast address");
    }
    // 100.64.0.0/10, carrier-grade NAT
    if a == 100 && (b & 0xc0) == 64 {
        return Some("shared address");
    }
    None
}

fn is_metadata_v4(a: u8, b: u8, c: u8, d: u8) -> bool {
    matches!(
        (a, b, c, d),
        (169, 254, 169, 254) | (169, 254, 170, 2) | (100, 100, 100, 200)
    )
}

/// IPv4 address carried inside an IPv6 one: mapped, NAT64, IPv4-compatible
/// or 6to4.
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let segments = ip.segments();
    let [a, b] = segments[6].to_be_bytes();
    let [c, d] = segments[7].to_be_bytes();
    match segments {
        // 64:ff9b::/96
        [0x0064, 0xff9b, 0, 0, 0, 0, _, _] => Some(Ipv4Addr::new(a, b, c, d)),
        // ::/96, without :: and ::1
        [0, 0, 0, 0, 0, 0, _, _] if !ip.is_unspecified() && !ip.is_loopback() => {
            Some(Ipv4Addr::new(a, b, c, d))
        }
        // 2002::/16
        [0x2002, high, low, ..] => {
            let [a, b] = high.to_be_bytes();
            let [c, d] = low.to_be_bytes();
            Some(Ipv4Addr::new(a, b, c, d))
        }
        _ => None,
    }
}

fn blocked_v6(ip: Ipv6Addr) -> Option<&'static str> {
    if let Some(reason) = embedded_v4(ip).and_then(blocked_v4) {
        return Some(reason);
    }
    let segments = ip.segments();
    // fd00:ec2::254, AWS metadata over IPv6
    if segments == [0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254] {
        return Some("cloud metadata address");
    }
    if ip.is_loopback() {
        return Some("loopback address");
    }
    if ip.is_unspecified() {
        return Some("unspecified address");
    }
    if ip.is_multicast() {
        return Some("multicast address");
    }
    if (segments[0] & 0xfe00) == 0xfc00 {
        return Some("private address");
    }
    if (segments[0] & 0xffc0) == 0xfe80 {
        return Some("link-local address");
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Resolver answering from a fixed table.
    pub(crate) struct StaticResolver(pub HashMap<String, Vec<IpAddr>>);

    impl StaticResolver {
        pub(crate) fn with(entries: &[(&str, &str)]) -> Arc<Self> {
            let mut map: HashMap<String, Vec<IpAddr>> = HashMap::new();
            for (host, ip) in entries {
                map.entry(host.to_string())
                    .or_default()
                    .push(ip.parse().unwrap());
            }
            Arc::new(Self(map))
        }
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown host"))
        }
    }

    fn guard() -> UrlGuard {
        UrlGuard::with_resolver(StaticResolver::with(&[
            ("hooks.example.com", "93.184.216.34"),
            ("rebind.example.com", "93.184.216.35"),
            ("rebind.example.com", "10.1.2.3"),
            ("v6.example.com", "::ffff:127.0.0.1"),
        ]))
    }

    #[tokio::test]
    async fn rejects_internal_ip_literals() {
        let guard = guard();
        for url in [
            "http://169.254.169.254/x",
            "http://10.0.0.5/x",
            "http://127.0.0.1/x",
            "http://192.168.1.10:8080/x",
            "http://172.20.0.1/x",
            "http://[::1]/x",
            "http://[fe80::1]/x",
            "http://[fd12::1]/x",
            "http://224.0.0.1/x",
            "http://0.0.0.0/x",
            "http://100.64.1.1/x",
            "http://[::ffff:a9fe:a9fe]/x",
            "http://[64:ff9b::a9fe:a9fe]/x",
            "http://[::a9fe:a9fe]/x",
            "http://[::7f00:1]/x",
            "http://[2002:a9fe:a9fe::]/x",
            "http://[2002:0a00:0001::1]/x",
        ] {
            let result = guard.validate(url, false).await;
            assert!(
                matches!(result, Err(ValidationError::BlockedHost { .. })),
                "{url} should be blocked, got {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn override_skips_network_checks() {
        let guard = guard();
        assert!(guard.validate("http://169.254.169.254/x", true).await.is_ok());
        assert!(guard.validate("http://127.0.0.1:9000/hook", true).await.is_ok());
    }

    #[tokio::test]
    async fn override_still_enforces_scheme_and_length() {
        let guard = guard();
        assert!(matches!(
            guard.validate("ftp://10.0.0.5/x", true).await,
            Err(ValidationError::UnsupportedScheme(_))
        ));
        let long = format!("https://hooks.example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            guard.validate(&long, true).await,
            Err(ValidationError::UrlTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn accepts_public_https_host() {
        let url = guard()
            .validate("https://hooks.example.com/whatsapp", false)
            .await
            .unwrap();
        assert_eq!(url.host_str(), Some("hooks.example.com"));
    }

    #[tokio::test]
    async fn rejects_metadata_hostnames() {
        let guard = guard();
        for url in [
            "http://metadata.google.internal/computeMetadata/v1/",
            "http://METADATA.GOOGLE.INTERNAL./x",
            "http://localhost:8080/hook",
        ] {
            assert!(
                matches!(guard.validate(url, false).await, Err(ValidationError::BlockedHost { .. })),
                "{url} should be blocked"
            );
        }
    }

    #[tokio::test]
    async fn any_internal_resolution_blocks_the_host() {
        let guard = guard();
        assert!(matches!(
            guard.validate("https://rebind.example.com/x", false).await,
            Err(ValidationError::BlockedHost { .. })
        ));
        assert!(matches!(
            guard.validate("https://v6.example.com/x", false).await,
            Err(ValidationError::BlockedHost { .. })
        ));
    }

    #[tokio::test]
    async fn unresolvable_host_is_rejected() {
        assert!(matches!(
            guard().validate("https://nowhere.invalid/x", false).await,
            Err(ValidationError::UnresolvableHost { .. })
        ));
    }

    #[test]
    fn public_addresses_are_not_blocked() {
        assert_eq!(blocked_reason("8.8.8.8".parse().unwrap()), None);
        assert_eq!(blocked_reason("2606:4700::1111".parse().unwrap()), None);
        assert_eq!(
            blocked_reason("fd00:ec2::254".parse().unwrap()),
            Some("cloud metadata address")
        );
    }

    #[test]
    fn embedded_ipv4_is_classified() {
        assert_eq!(
            blocked_reason("64:ff9b::a9fe:a9fe".parse().unwrap()),
            Some("cloud metadata address")
        );
        assert_eq!(
            blocked_reason("::7f00:1".parse().unwrap()),
            Some("loopback address")
        );
        assert_eq!(
            blocked_reason("2002:c0a8:0101::1".parse().unwrap()),
            Some("private address")
        );
        assert_eq!(blocked_reason("64:ff9b::808:808".parse().unwrap()), None);
        assert_eq!(blocked_reason("2002:5db8:d822::1".parse().unwrap()), None);
        assert_eq!(blocked_reason("::1".parse().unwrap()), Some("loopback address"));
    }
}
