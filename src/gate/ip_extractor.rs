//! Visitor IP extraction from HTTP headers with trust validation
//!
//! - Cloudflare mode reads CF-Connecting-IP
//! - Standard mode reads Forwarded, then X-Forwarded-For, walking the chain
//!   right to left past trusted proxies
//! - Otherwise, and whenever headers are missing or unusable, the socket
//!   peer address is used

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{ProxyConfig, TrustedProxyMode};

/// Extract the visitor IP address according to the proxy trust configuration
pub fn extract_client_ip(headers: &HeaderMap, socket_addr: IpAddr, config: &ProxyConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => extract_standard_ip(headers, config).unwrap_or(socket_addr),
        TrustedProxyMode::None => socket_addr,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

fn extract_standard_ip(headers: &HeaderMap, config: &ProxyConfig) -> Option<IpAddr> {
    // Prefer RFC 7239 Forwarded header
    let chain = forwarded_chain(headers);
    if !chain.is_empty() {
        return select_from_chain(&chain, config);
    }

    let chain = x_forwarded_for_chain(headers);
    if !chain.is_empty() {
        return select_from_chain(&chain, config);
    }

    None
}

/// `for=` addresses of every Forwarded element, in header order
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("forwarded")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|element| {
            element.split(';').find_map(|param| {
                let param = param.trim();
                let (key, value) = param.split_once('=')?;
                if key.trim().eq_ignore_ascii_case("for") {
                    parse_forwarded_node(value)
                } else {
                    None
                }
            })
        })
        .collect()
}

/// Parse a Forwarded node: `192.0.2.60`, `"192.0.2.60:8080"`, `"[2001:db8::1]:4711"`.
/// Obfuscated identifiers and `unknown` yield None.
fn parse_forwarded_node(value: &str) -> Option<IpAddr> {
    let node = value.trim().trim_matches('"');

    if let Some(rest) = node.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }

    if let Ok(ip) = node.parse::<IpAddr>() {
        return Some(ip);
    }

    let (host, _port) = node.rsplit_once(':')?;
    host.parse().ok()
}

fn x_forwarded_for_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect()
}

/// Pick the visitor from a proxy chain (leftmost = original client)
fn select_from_chain(ips: &[IpAddr], config: &ProxyConfig) -> Option<IpAddr> {
    // If num_trusted_proxies is specified, skip that many from the right
    if let Some(num_trusted) = config.num_trusted_proxies {
        if ips.len() > num_trusted {
            return Some(ips[ips.len() - num_trusted - 1]);
        }
        // Not enough hops in the chain, return the leftmost
        return ips.first().copied();
    }

    // Walk right to left, skipping addresses owned by trusted proxies
    if !config.trusted_proxies.is_empty() {
        return ips
            .iter()
            .rev()
            .find(|ip| !config.trusted_proxies.iter().any(|net| net.contains(*ip)))
            .or_else(|| ips.first())
            .copied();
    }

    // No trust configuration, return the rightmost IP
    ips.last().copied()
}
