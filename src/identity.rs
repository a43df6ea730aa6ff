//! Derives the stable identity a request is counted under.
//!
//! For IP scopes the forwarded-for chain is only believed when the directly
//! connected peer is a configured trusted proxy; otherwise the peer address
//! itself is used, so a client cannot evade limits (or frame another identity)
//! by injecting headers.

use crate::config::ConfigError;
use crate::policy::Scope;
use crate::service::RequestInfo;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The policy scope requires an authenticated user and none was resolved.
    #[error("policy requires an authenticated user but none was resolved")]
    NoAuthenticatedUser,
}

/// CIDR ranges (or single addresses) of proxies in front of this service.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNet>,
}

impl TrustedProxies {
    /// Parses entries as CIDR ranges, or single addresses as host networks.
    pub fn new(entries: &[String]) -> Result<Self, ConfigError> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let network = entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::InvalidTrustedProxy {
                    entry: entry.clone(),
                })?;
            networks.push(network);
        }
        Ok(Self { networks })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|n| n.contains(&ip))
    }
}

/// Resolves the identity string for a request under the given scope.
///
/// Per-user scope fails with [IdentityError::NoAuthenticatedUser] when no user
/// id is attached; the caller is expected to degrade to per-ip counting rather
/// than exempting the request.
pub fn identity_for(
    request: &RequestInfo,
    scope: Scope,
    proxies: &TrustedProxies,
) -> Result<String, IdentityError> {
    match scope {
        Scope::PerIp => Ok(format!("ip:{}", ip_identity(request, proxies))),
        Scope::PerUser => match &request.user_id {
            Some(user) => Ok(format!("user:{user}")),
            None => Err(IdentityError::NoAuthenticatedUser),
        },
        Scope::PerIpAndPath => Ok(format!(
            "ip:{}:{}",
            ip_identity(request, proxies),
            request.path
        )),
    }
}

/// The normalized client IP fragment for a request.
///
/// Requests with no peer address at all (unix sockets, some test rigs) share
/// the literal `unknown` key: they stay rate limited as one bucket instead of
/// being silently exempted.
pub fn ip_identity(request: &RequestInfo, proxies: &TrustedProxies) -> String {
    match client_ip(request, proxies) {
        Some(ip) => ip_key(ip),
        None => "unknown".to_owned(),
    }
}

/// The client address a request should be attributed to.
///
/// The left-most forwarded-for entry is used only when the connecting peer is
/// a trusted proxy and the entry parses as an address; anything else falls
/// back to the peer address.
fn client_ip(request: &RequestInfo, proxies: &TrustedProxies) -> Option<IpAddr> {
    let peer = request.peer;
    if let Some(peer_ip) = peer {
        if proxies.contains(peer_ip) {
            if let Some(forwarded) = forwarded_client(request.forwarded_for.as_deref()) {
                return Some(forwarded);
            }
        }
    }
    peer
}

fn forwarded_client(chain: Option<&str>) -> Option<IpAddr> {
    chain?.split(',').next()?.trim().parse().ok()
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
// https://support.cloudflare.com/hc/en-us/articles/115001635128-Configuring-Cloudflare-Rate-Limiting
fn ip_key(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4() {
                return v4.to_string();
            }
            let zeroes = [0u16; 4];
            let concat = [&v6.segments()[0..4], &zeroes].concat();
            let concat: [u16; 8] = concat.try_into().expect("eight segments");
            let subnet = Ipv6Addr::from(concat);
            format!("{subnet}/64")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::Method;

    fn request(peer: Option<&str>, forwarded: Option<&str>, user: Option<&str>) -> RequestInfo {
        RequestInfo {
            method: Method::GET,
            path: "/api/vehicles".to_owned(),
            peer: peer.map(|p| p.parse().unwrap()),
            forwarded_for: forwarded.map(ToOwned::to_owned),
            user_id: user.map(ToOwned::to_owned),
        }
    }

    fn proxies(entries: &[&str]) -> TrustedProxies {
        let entries: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        TrustedProxies::new(&entries).unwrap()
    }

    #[test]
    fn test_ip_key() {
        // Check that IPv4 addresses are preserved
        assert_eq!(ip_key("142.250.187.206".parse().unwrap()), "142.250.187.206");
        // Check that IPv4 mapped addresses are preserved
        assert_eq!(
            ip_key("::FFFF:142.250.187.206".parse().unwrap()),
            "142.250.187.206"
        );
        // Check that IPv6 addresses are grouped into /64 subnets
        assert_eq!(
            ip_key("2a00:1450:4009:81f::200e".parse().unwrap()),
            "2a00:1450:4009:81f::/64"
        );
    }

    #[test]
    fn test_forwarded_header_ignored_from_untrusted_peer() {
        let req = request(Some("203.0.113.9"), Some("1.2.3.4"), None);
        let identity = identity_for(&req, Scope::PerIp, &proxies(&["10.0.0.0/8"])).unwrap();
        assert_eq!(identity, "ip:203.0.113.9");
    }

    #[test]
    fn test_forwarded_header_trusted_from_proxy_peer() {
        let req = request(Some("10.1.2.3"), Some("1.2.3.4, 10.1.2.3"), None);
        let identity = identity_for(&req, Scope::PerIp, &proxies(&["10.0.0.0/8"])).unwrap();
        assert_eq!(identity, "ip:1.2.3.4");
    }

    #[test]
    fn test_garbage_forwarded_header_falls_back_to_peer() {
        let req = request(Some("10.1.2.3"), Some("not-an-address"), None);
        let identity = identity_for(&req, Scope::PerIp, &proxies(&["10.0.0.0/8"])).unwrap();
        assert_eq!(identity, "ip:10.1.2.3");
    }

    #[test]
    fn test_single_address_proxy_entry() {
        let req = request(Some("192.168.1.1"), Some("1.2.3.4"), None);
        let identity = identity_for(&req, Scope::PerIp, &proxies(&["192.168.1.1"])).unwrap();
        assert_eq!(identity, "ip:1.2.3.4");
    }

    #[test]
    fn test_missing_peer_shares_unknown_key() {
        let req = request(None, Some("1.2.3.4"), None);
        let identity = identity_for(&req, Scope::PerIp, &TrustedProxies::default()).unwrap();
        assert_eq!(identity, "ip:unknown");
    }

    #[test]
    fn test_per_user_requires_authentication() {
        let authed = request(Some("1.2.3.4"), None, Some("user-17"));
        assert_eq!(
            identity_for(&authed, Scope::PerUser, &TrustedProxies::default()).unwrap(),
            "user:user-17"
        );
        let anonymous = request(Some("1.2.3.4"), None, None);
        assert_eq!(
            identity_for(&anonymous, Scope::PerUser, &TrustedProxies::default()),
            Err(IdentityError::NoAuthenticatedUser)
        );
    }

    #[test]
    fn test_per_ip_and_path_includes_path() {
        let req = request(Some("1.2.3.4"), None, None);
        let identity = identity_for(&req, Scope::PerIpAndPath, &TrustedProxies::default()).unwrap();
        assert_eq!(identity, "ip:1.2.3.4:/api/vehicles");
    }
}
