//! Client identity and per-client limiter state.

use crate::domain::bucket::{Decision, Quota, TokenBucket};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Identity of a rate-limited client.
///
/// Derived from the network source address of the connection, never from
/// request headers a client could forge. The port is dropped so that all
/// connections from one host share a bucket.
///
/// # Example
/// ```
/// use serve_throttle::ClientId;
/// use std::net::SocketAddr;
///
/// let a: SocketAddr = "203.0.113.7:51000".parse().unwrap();
/// let b: SocketAddr = "203.0.113.7:51001".parse().unwrap();
/// assert_eq!(ClientId::from_socket_addr(a), ClientId::from_socket_addr(b));
/// assert_eq!(ClientId::from_socket_addr(a).as_str(), "203.0.113.7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Identity used when the source address is not known.
    pub const UNKNOWN: &'static str = "unknown";

    /// Create an identity from an arbitrary string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Identity of the peer behind a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }

    /// Identity of an IP address. IPv4-mapped IPv6 addresses collapse to IPv4.
    pub fn from_ip(ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self(ip.to_string().into())
    }

    /// The shared identity for requests without a known source address.
    pub fn unknown() -> Self {
        Self(Arc::from(Self::UNKNOWN))
    }

    /// String form of the identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for ClientId {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// State tracked for each client known to the store.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// The client's token bucket
    pub bucket: TokenBucket,
    /// When the client was last checked, allowed or denied
    pub last_seen: Instant,
}

impl ClientEntry {
    /// Create an entry with a full bucket, first seen at `now`.
    pub fn new(quota: Quota, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::full(quota, now),
            last_seen: now,
        }
    }

    /// Record a check at `now` and consume a token if one is available.
    ///
    /// `last_seen` never moves backwards.
    pub fn check(&mut self, now: Instant) -> Decision {
        if now > self.last_seen {
            self.last_seen = now;
        }
        self.bucket.try_acquire(now)
    }

    /// Whether the entry has been idle for longer than `idle_threshold` at `now`.
    pub fn is_idle(&self, now: Instant, idle_threshold: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > idle_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    #[test]
    fn test_client_id_ignores_port() {
        let a: SocketAddr = "192.168.1.10:1000".parse().unwrap();
        let b: SocketAddr = "192.168.1.10:2000".parse().unwrap();
        let c: SocketAddr = "192.168.1.11:1000".parse().unwrap();

        assert_eq!(ClientId::from(a), ClientId::from(b));
        assert_ne!(ClientId::from(a), ClientId::from(c));
    }

    #[test]
    fn test_client_id_collapses_ipv4_mapped() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());
        assert_eq!(ClientId::from_ip(mapped).as_str(), "10.0.0.1");

        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(ClientId::from_ip(v6).as_str(), "::1");
    }

    #[test]
    fn test_unknown_client() {
        assert_eq!(ClientId::unknown().as_str(), ClientId::UNKNOWN);
        assert_eq!(ClientId::unknown().to_string(), "unknown");
    }

    #[test]
    fn test_entry_last_seen_updates_on_denied() {
        let now = Instant::now();
        let mut entry = ClientEntry::new(Quota::new(1.0, 1).unwrap(), now);

        let t1 = now + Duration::from_millis(10);
        assert!(entry.check(t1).is_allowed());
        assert_eq!(entry.last_seen, t1);

        let t2 = t1 + Duration::from_millis(10);
        assert!(entry.check(t2).is_denied());
        assert_eq!(entry.last_seen, t2);

        // Out-of-order instant does not rewind
        entry.check(t1);
        assert_eq!(entry.last_seen, t2);
    }

    #[test]
    fn test_entry_idle() {
        let now = Instant::now();
        let entry = ClientEntry::new(Quota::new(1.0, 1).unwrap(), now);
        let threshold = Duration::from_secs(180);

        assert!(!entry.is_idle(now + Duration::from_secs(180), threshold));
        assert!(entry.is_idle(now + Duration::from_secs(181), threshold));
    }
}
