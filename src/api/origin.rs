// WebSocket origin validation.

use std::net::{IpAddr, Ipv4Addr};

use axum::{extract::Request, middleware::Next, response::Response};
use ipnet::Ipv4Net;

use super::error::ApiError;
use crate::sanitize;

/// True iff `addr` is a dotted-quad IPv4 address inside the shared address
/// space (RFC 6598, 100.64.0.0/10), where Tailscale assigns node addresses.
fn is_cgnat_address(addr: &str) -> bool {
    let Ok(ip) = addr.parse::<Ipv4Addr>() else {
        return false;
    };
    Ipv4Net::new(Ipv4Addr::new(100, 64, 0, 0), 10).is_ok_and(|net| net.contains(&ip))
}

/// Extract the host from an `Origin` value (`scheme://host[:port][/...]`).
fn origin_host(origin: &str) -> Option<&str> {
    let (_, rest) = origin.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.contains('@') {
        return None;
    }
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, _) = bracketed.split_once(']')?;
        return Some(host);
    }
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        Some(_) => return None,
        None => authority,
    };
    (!host.is_empty()).then_some(host)
}

/// Accept only loopback origins and the CGNAT private range.
pub fn is_allowed_origin(origin: &str) -> bool {
    let Some(host) = origin_host(origin) else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") || is_cgnat_address(host) {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Reject WebSocket upgrades whose `Origin` is missing or not allowed.
///
/// Runs before the upgrade completes, so a rejected client never gets a
/// session.
pub async fn check_ws_origin(req: Request, next: Next) -> Result<Response, ApiError> {
    let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());

    match origin {
        Some(origin) if is_allowed_origin(origin) => Ok(next.run(req).await),
        Some(origin) => {
            tracing::warn!(origin = %sanitize::for_log(origin), "WebSocket origin rejected");
            Err(ApiError::OriginNotAllowed)
        }
        None => {
            tracing::warn!("WebSocket upgrade without Origin rejected");
            Err(ApiError::OriginNotAllowed)
        }
    }
}
