// middleware/callback_origin.rs
//
// The STK callback URL is public by necessity. In production only
// Safaricom's published ranges may reach it; everywhere else the check is
// skipped so sandbox tunnels and local testing work.
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::warn;

use crate::errors::AppError;
use crate::state::AppState;

const SAFARICOM_CIDRS: &[(Ipv4Addr, u32)] = &[
    (Ipv4Addr::new(196, 201, 212, 0), 24),
    (Ipv4Addr::new(196, 201, 213, 0), 24),
    (Ipv4Addr::new(196, 201, 214, 0), 24),
];

pub async fn callback_origin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if state.config.is_production() {
        let ip = client_ip(&headers).unwrap_or_else(|| addr.ip());
        if !ip_allowed(ip) {
            warn!("Callback from untrusted origin {} rejected", ip);
            return Err(AppError::CallbackOrigin);
        }
    }

    Ok(next.run(request).await)
}

/// Behind the load balancer the peer address is the proxy; trust its
/// X-Forwarded-For and take the originating client entry.
fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}

fn ip_allowed(ip: IpAddr) -> bool {
    let IpAddr::V4(ip) = ip else {
        return false;
    };
    let ip_bits = u32::from(ip);
    SAFARICOM_CIDRS.iter().any(|(network, prefix)| {
        let shift = 32 - prefix;
        (ip_bits >> shift) == (u32::from(*network) >> shift)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn safaricom_ranges_allowed() {
        assert!(ip_allowed("196.201.214.200".parse().unwrap()));
        assert!(ip_allowed("196.201.213.44".parse().unwrap()));
        assert!(ip_allowed("196.201.212.127".parse().unwrap()));
    }

    #[test]
    fn other_sources_rejected() {
        assert!(!ip_allowed("196.201.215.1".parse().unwrap()));
        assert!(!ip_allowed("10.0.0.1".parse().unwrap()));
        assert!(!ip_allowed("127.0.0.1".parse().unwrap()));
        assert!(!ip_allowed("::1".parse().unwrap()));
    }

    #[test]
    fn forwarded_for_takes_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("196.201.214.200, 10.0.0.2"),
        );
        assert_eq!(
            client_ip(&headers),
            Some("196.201.214.200".parse().unwrap())
        );
    }

    #[test]
    fn missing_header_yields_none() {
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }
}
