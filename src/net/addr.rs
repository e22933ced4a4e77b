//! Source address selection
//!
//! Draws a uniformly-random address from a configured network range so that
//! consecutive requests leave from different source addresses. With no range
//! configured the pool is a no-op and requests use the default egress address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::Rng;

/// Pool of candidate source addresses.
///
/// Selection is pure: no state is carried between calls, and every address in
/// the range is eligible, network and broadcast addresses included.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressPool {
    network: Option<IpNet>,
}

impl AddressPool {
    pub fn new(network: Option<IpNet>) -> Self {
        Self { network }
    }

    /// Picks a random address from the range, or `None` when no range is
    /// configured (meaning: bind nothing, use the system default).
    pub fn pick(&self) -> Option<IpAddr> {
        let network = self.network?;
        let mut rng = rand::thread_rng();

        Some(match network {
            IpNet::V4(net) => {
                let span = 1u64 << (32 - net.prefix_len());
                let offset = rng.gen_range(0..span) as u32;
                IpAddr::V4(Ipv4Addr::from(u32::from(net.network()) + offset))
            }
            IpNet::V6(net) => {
                let host_bits = 128 - net.prefix_len();
                let offset = if host_bits == 128 {
                    rng.gen::<u128>()
                } else {
                    rng.gen_range(0..1u128 << host_bits)
                };
                IpAddr::V6(Ipv6Addr::from(u128::from(net.network()) + offset))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::str::FromStr;

    #[test]
    fn no_range_yields_no_address() {
        let pool = AddressPool::new(None);
        assert_eq!(pool.pick(), None);
    }

    #[test]
    fn slash_30_covers_all_four_addresses() {
        let pool = AddressPool::new(Some(IpNet::from_str("192.0.2.0/30").unwrap()));
        let network = IpNet::from_str("192.0.2.0/30").unwrap();

        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let addr = pool.pick().expect("range is configured");
            assert!(network.contains(&addr), "{addr} outside range");
            seen.insert(addr);
        }

        // network and broadcast addresses are not excluded
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn host_route_always_yields_itself() {
        let pool = AddressPool::new(Some(IpNet::from_str("198.51.100.7/32").unwrap()));
        for _ in 0..10 {
            assert_eq!(pool.pick(), Some("198.51.100.7".parse().unwrap()));
        }
    }

    #[test]
    fn v6_range_stays_in_network() {
        let network = IpNet::from_str("2001:db8::/64").unwrap();
        let pool = AddressPool::new(Some(network));
        for _ in 0..100 {
            let addr = pool.pick().expect("range is configured");
            assert!(network.contains(&addr), "{addr} outside range");
        }
    }
}
