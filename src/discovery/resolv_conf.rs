use std::net::{IpAddr, SocketAddr};

use crate::constants::DNS_PORT;

/// Extracts `nameserver` entries from resolv.conf text.
///
/// Scoped IPv6 addresses (`fe80::1%eth0`) are skipped since the scope cannot be
/// carried in a plain socket address.
pub(super) fn parse_nameservers(text: &str) -> Vec<SocketAddr> {
    text.lines()
        .map(|line| {
            let end = line.find(['#', ';']).unwrap_or(line.len());
            &line[..end]
        })
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse::<IpAddr>().ok(),
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .collect()
}
