//! Client address extraction.
//!
//! The TCP peer is the client unless it is a trusted reverse proxy, in which
//! case the proxy's forwarding headers name the client.

use std::net::IpAddr;

use http::HeaderMap;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Determine the client address of a request.
///
/// For a trusted peer the first `X-Forwarded-For` entry wins, then
/// `X-Real-IP`. Unparseable headers fall back to the peer address.
pub fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    let peer = peer.to_canonical();
    if !trusted_proxies.iter().any(|p| p.to_canonical() == peer) {
        return peer;
    }

    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(parse_ip);
    let real_ip = || {
        headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_ip)
    };

    forwarded.or_else(real_ip).unwrap_or(peer)
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_untrusted_peer_ignores_headers() {
        let h = headers(&[("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(client_ip(ip("192.0.2.5"), &h, &[]), ip("192.0.2.5"));
    }

    #[test]
    fn test_trusted_proxy_uses_first_forwarded_entry() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(
            client_ip(ip("127.0.0.1"), &h, &[ip("127.0.0.1")]),
            ip("203.0.113.7")
        );
    }

    #[test]
    fn test_trusted_proxy_falls_back_to_real_ip_then_peer() {
        let trusted = [ip("127.0.0.1")];
        let h = headers(&[("x-forwarded-for", "garbage"), ("x-real-ip", "203.0.113.9")]);
        assert_eq!(client_ip(ip("127.0.0.1"), &h, &trusted), ip("203.0.113.9"));

        assert_eq!(
            client_ip(ip("127.0.0.1"), &HeaderMap::new(), &trusted),
            ip("127.0.0.1")
        );
    }

    #[test]
    fn test_mapped_peer_is_normalized() {
        assert_eq!(
            client_ip(ip("::ffff:192.0.2.5"), &HeaderMap::new(), &[]),
            ip("192.0.2.5")
        );
    }
}
