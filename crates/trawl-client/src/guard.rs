use std::net::IpAddr;

use trawl_core::AppError;
use url::Url;

/// Reject URLs that would make the scraper reach into private networks.
///
/// Only `http`/`https` are allowed, and every address the host resolves to
/// must be public. Job boards are public sites, so a definition or a
/// listing page pointing at `127.0.0.1` or a cloud metadata address is
/// treated as hostile.
pub(crate) async fn check_public_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::Blocked(format!("Invalid URL '{url}': {e}")))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(AppError::Blocked(format!(
            "URL scheme '{scheme}' is not allowed (only http/https)"
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Blocked(format!("URL '{url}' has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return reject_private(host, ip);
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let mut resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::Network(format!("DNS resolution failed for {host}: {e}")))?
        .peekable();
    if resolved.peek().is_none() {
        return Err(AppError::Network(format!("No addresses found for {host}")));
    }
    resolved.try_for_each(|addr| reject_private(host, addr.ip()))
}

fn reject_private(host: &str, ip: IpAddr) -> Result<(), AppError> {
    if is_private_ip(ip) {
        return Err(AppError::Blocked(format!(
            "{host} resolves to {ip}, a private or reserved address"
        )));
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // 100.64.0.0/10 carrier-grade NAT
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
