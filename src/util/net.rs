// src/util/net.rs
// Remote-address normalization, loopback checks, SSRF validation

use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::LazyLock;
use url::Url;

/// Strip port and IPv6 brackets from a remote address, yielding a bare
/// host/IP string for rate limiting, audit, and trusted-network checks.
pub fn normalize_remote_addr(addr: &str) -> String {
    let addr = addr.trim();

    // Bracketed IPv6, possibly with a port: [::1]:8080
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
        return rest.to_string();
    }

    // Bare IPv6 has multiple colons and no port to strip
    if addr.matches(':').count() > 1 {
        return addr.to_string();
    }

    // host:port or plain host
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => addr.to_string(),
    }
}

/// Whether a normalized client address is the local machine
pub fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Address ranges the SSRF validator refuses to fetch from
static BLOCKED_RANGES: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "0.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|cidr| cidr.parse().expect("static CIDR parses"))
    .collect()
});

/// Hostnames that are always internal regardless of resolution
const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "metadata.google.internal"];

/// Validate a URL for outbound fetching. Rejects non-http(s) schemes,
/// internal hostnames, and hosts that are (or resolve to) private,
/// loopback, or link-local addresses.
pub fn validate_outbound_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|_| "invalid URL".to_string())?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("scheme '{}' not allowed", other)),
    }

    let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;
    let host_lower = host.to_ascii_lowercase();

    if BLOCKED_HOSTNAMES.contains(&host_lower.as_str()) {
        return Err(format!("host '{}' is internal", host));
    }

    // Literal IP in the URL: check directly
    if let Ok(ip) = host_lower.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_blocked_ip(&ip) {
            return Err(format!("address {} is in a blocked range", ip));
        }
        return Ok(url);
    }

    // Hostname: resolve and check every address it maps to
    let port = url.port_or_known_default().unwrap_or(443);
    let resolved = std::net::ToSocketAddrs::to_socket_addrs(&(host_lower.as_str(), port))
        .map_err(|_| format!("host '{}' did not resolve", host))?;
    for addr in resolved {
        if is_blocked_ip(&addr.ip()) {
            return Err(format!(
                "host '{}' resolves to blocked address {}",
                host,
                addr.ip()
            ));
        }
    }

    Ok(url)
}

fn is_blocked_ip(ip: &IpAddr) -> bool {
    BLOCKED_RANGES.iter().any(|net| net.contains(ip))
}
