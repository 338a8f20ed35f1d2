//! Address normalization: rewriting unroutable advertised hosts using
//! overlay connection evidence (§4.A).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use multiaddr::{Multiaddr, Protocol};
use tracing::debug;

use crate::metadata::PeerMetadata;
use crate::overlay::{OverlayHost, PeerId};

/// Outcome of [`rewrite_advertised`]: whether anything changed, and the
/// stale `node_id` to evict from `knownPeers`/`peerHealth` if the rewrite
/// also changed the node's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Whether either address field was rewritten.
    pub changed: bool,
    /// The pre-rewrite `node_id`, present only if it actually changed.
    pub stale_node_id: Option<String>,
}

/// True iff `host` is empty, case-insensitively `localhost`, or parses as a
/// loopback or unspecified IP — i.e. unroutable from another host.
#[must_use]
pub fn should_replace_host(host: &str) -> bool {
    if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

/// Coarse reachability classification used to rank candidate IPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpClass {
    Unroutable,
    Private,
    Public,
}

fn classify(ip: IpAddr) -> IpClass {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return IpClass::Unroutable;
    }
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_link_local() {
                IpClass::Private
            } else {
                IpClass::Public
            }
        }
        IpAddr::V6(v6) => {
            if is_unique_local(v6) || is_link_local_v6(v6) {
                IpClass::Private
            } else {
                IpClass::Public
            }
        }
    }
}

/// `fc00::/7` — IPv6 unique local addresses; the private-range analogue of
/// RFC 1918. Not yet stabilized as `Ipv6Addr::is_unique_local`.
fn is_unique_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// `fe80::/10` — IPv6 link-local addresses.
fn is_link_local_v6(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

fn extract_ip(addr: &Multiaddr) -> Option<IpAddr> {
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(v4) => return Some(IpAddr::V4(Ipv4Addr::from(v4))),
            Protocol::Ip6(v6) => return Some(IpAddr::V6(Ipv6Addr::from(v6))),
            _ => {}
        }
    }
    None
}

/// Scan a set of candidate multiaddresses and return the best IP: the
/// first public address if any, else the first non-replaceable private
/// address, else `None`.
fn best_ip(candidates: impl IntoIterator<Item = Multiaddr>) -> Option<IpAddr> {
    let mut best_private: Option<IpAddr> = None;
    for addr in candidates {
        let Some(ip) = extract_ip(&addr) else {
            continue;
        };
        match classify(ip) {
            IpClass::Public => return Some(ip),
            IpClass::Private if best_private.is_none() => best_private = Some(ip),
            _ => {}
        }
    }
    best_private
}

/// Scan active connections to `peer`, then its address book, for the best
/// publicly-reachable IP (§4.A `select_peer_ip`).
pub async fn select_peer_ip(overlay: &dyn OverlayHost, peer: &PeerId) -> Option<IpAddr> {
    let connections = overlay.connections_to(peer).await;
    if let Some(ip) = best_ip(connections) {
        return Some(ip);
    }
    let book = overlay.address_book(peer).await;
    best_ip(book)
}

/// The overlay host's own listen addresses, scanned the same way
/// (§4.A `select_self_ip`).
pub async fn select_self_ip(overlay: &dyn OverlayHost) -> Option<IpAddr> {
    best_ip(overlay.listen_addresses().await)
}

fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    addr.rsplit_once(':')
}

fn rewrite_one(addr: &mut String, new_host: &str) -> bool {
    let Some((host, port)) = split_host_port(addr) else {
        return false;
    };
    if !should_replace_host(host) {
        return false;
    }
    *addr = format!("{new_host}:{port}");
    true
}

/// Rewrite `meta`'s `raft_address`/`http_address` in place, replacing any
/// unroutable host with `new_host`. If `allow_node_id_rewrite` and the
/// `node_id` was empty, equal to the pre-rewrite `raft_address`, or itself
/// had a replaceable host, set `node_id := raft_address` after the
/// rewrite (§4.A `rewrite_advertised`).
#[must_use]
pub fn rewrite_advertised(
    meta: &mut PeerMetadata,
    new_host: &str,
    allow_node_id_rewrite: bool,
) -> RewriteOutcome {
    let pre_rewrite_raft_address = meta.raft_address.clone();
    let node_id_was_stale = meta.node_id.is_empty()
        || meta.node_id == pre_rewrite_raft_address
        || split_host_port(&meta.node_id)
            .map(|(h, _)| should_replace_host(h))
            .unwrap_or(true);

    let raft_changed = rewrite_one(&mut meta.raft_address, new_host);
    let http_changed = rewrite_one(&mut meta.http_address, new_host);
    let changed = raft_changed || http_changed;

    let mut stale_node_id = None;
    if allow_node_id_rewrite && node_id_was_stale && meta.node_id != meta.raft_address {
        stale_node_id = Some(std::mem::replace(&mut meta.node_id, meta.raft_address.clone()));
        debug!(
            old_node_id = %stale_node_id.as_deref().unwrap_or_default(),
            new_node_id = %meta.node_id,
            "rewrote stale node id after address normalization"
        );
    }

    RewriteOutcome {
        changed,
        stale_node_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NodeType;
    use std::str::FromStr;

    fn maddr(s: &str) -> Multiaddr {
        Multiaddr::from_str(s).unwrap()
    }

    #[test]
    fn should_replace_covers_loopback_unspecified_and_localhost() {
        assert!(should_replace_host(""));
        assert!(should_replace_host("localhost"));
        assert!(should_replace_host("LOCALHOST"));
        assert!(should_replace_host("127.0.0.1"));
        assert!(should_replace_host("0.0.0.0"));
        assert!(should_replace_host("::1"));
        assert!(should_replace_host("::"));
        assert!(!should_replace_host("10.0.0.5"));
        assert!(!should_replace_host("203.0.113.5"));
    }

    #[test]
    fn best_ip_prefers_public_over_private() {
        let addrs = vec![maddr("/ip4/10.0.0.5/tcp/9000"), maddr("/ip4/203.0.113.5/tcp/9000")];
        assert_eq!(best_ip(addrs), Some("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn best_ip_falls_back_to_private_when_no_public_present() {
        let addrs = vec![maddr("/ip4/127.0.0.1/tcp/9000"), maddr("/ip4/10.0.0.5/tcp/9000")];
        assert_eq!(best_ip(addrs), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn rewrite_advertised_replaces_loopback_and_rewrites_node_id() {
        let mut meta = PeerMetadata {
            node_id: "localhost:4002".into(),
            raft_address: "127.0.0.1:4002".into(),
            http_address: "127.0.0.1:4001".into(),
            node_type: NodeType::Worker,
            raft_log_index: 0,
            last_seen: chrono::Utc::now(),
            cluster_version: crate::metadata::CLUSTER_VERSION.into(),
        };

        let outcome = rewrite_advertised(&mut meta, "203.0.113.5", true);

        assert!(outcome.changed);
        assert_eq!(outcome.stale_node_id.as_deref(), Some("localhost:4002"));
        assert_eq!(meta.raft_address, "203.0.113.5:4002");
        assert_eq!(meta.http_address, "203.0.113.5:4001");
        assert_eq!(meta.node_id, "203.0.113.5:4002");
    }

    #[test]
    fn rewrite_advertised_twice_is_a_no_op_second_time() {
        let mut meta = PeerMetadata {
            node_id: "127.0.0.1:4002".into(),
            raft_address: "127.0.0.1:4002".into(),
            http_address: "127.0.0.1:4001".into(),
            node_type: NodeType::Worker,
            raft_log_index: 0,
            last_seen: chrono::Utc::now(),
            cluster_version: crate::metadata::CLUSTER_VERSION.into(),
        };

        let first = rewrite_advertised(&mut meta, "203.0.113.5", true);
        assert!(first.changed);

        let second = rewrite_advertised(&mut meta, "203.0.113.5", true);
        assert!(!second.changed);
        assert!(second.stale_node_id.is_none());
    }

    #[test]
    fn rewrite_advertised_leaves_routable_hosts_untouched() {
        let mut meta = PeerMetadata {
            node_id: "10.0.0.2:4002".into(),
            raft_address: "10.0.0.2:4002".into(),
            http_address: "10.0.0.2:4001".into(),
            node_type: NodeType::Worker,
            raft_log_index: 0,
            last_seen: chrono::Utc::now(),
            cluster_version: crate::metadata::CLUSTER_VERSION.into(),
        };

        let outcome = rewrite_advertised(&mut meta, "203.0.113.5", true);
        assert!(!outcome.changed);
        assert_eq!(meta.raft_address, "10.0.0.2:4002");
    }
}
