// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use rand::Rng;

use crate::{
    msg::DhcpV4Message,
    option::{
        ClasslessRoute, OPT_CLASSLESS_STATIC_ROUTE, OPT_DOMAIN_NAME,
        OPT_DOMAIN_NAME_SERVER, OPT_IP_ADDRESS_LEASE_TIME,
        OPT_REBINDING_TIME, OPT_RENEWAL_TIME, OPT_ROUTER, OPT_SUBNET_MASK,
    },
};

/// Network parameters delivered by a DHCPACK. Timeouts are absolute
/// wall-clock seconds, anchored at the owning transaction's start time.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DhcpV4Lease {
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub domain: Option<String>,
    pub dns_srvs: Vec<Ipv4Addr>,
    pub static_routes: Vec<ClasslessRoute>,
    pub lease_timeout: Option<u64>,
    pub renewal_timeout: Option<u64>,
    pub rebinding_timeout: Option<u64>,
}

impl DhcpV4Lease {
    /// Extract the lease from an ACK. Missing options yield `None` fields
    /// rather than errors; callers decide what is mandatory for them.
    pub(crate) fn parse_from_ack(
        msg: &DhcpV4Message,
        start_time: u64,
    ) -> Self {
        let opts = &msg.options;
        let mut gateway = opts.get_ipv4(OPT_ROUTER);
        let mut static_routes = Vec::new();

        if let Some(data) = opts.get(OPT_CLASSLESS_STATIC_ROUTE) {
            match ClasslessRoute::parse_list(data) {
                Ok(routes) => {
                    // RFC 3442: the router option MUST be ignored when
                    // classless static routes are present. A default route
                    // in the list becomes the gateway instead.
                    gateway = None;
                    for route in routes {
                        if route.is_default() {
                            gateway = Some(route.gateway);
                        } else {
                            static_routes.push(route);
                        }
                    }
                }
                Err(e) => {
                    log::debug!(
                        "Ignoring malformed classless static route \
                         option: {e}"
                    );
                }
            }
        }

        let lease_delta = opts.get_u32(OPT_IP_ADDRESS_LEASE_TIME);
        let renewal_delta = opts.get_u32(OPT_RENEWAL_TIME).or_else(|| {
            // RFC 2131 default T1, jittered so a fleet of clients does
            // not renew in the same second.
            lease_delta.map(|d| jittered(u64::from(d) / 2))
        });
        let rebinding_delta = opts.get_u32(OPT_REBINDING_TIME).or_else(|| {
            lease_delta.map(|d| jittered(u64::from(d) * 875 / 1000))
        });

        Self {
            ip_address: msg.yiaddr,
            subnet_mask: opts.get_ipv4(OPT_SUBNET_MASK),
            gateway,
            domain: opts.get_string(OPT_DOMAIN_NAME),
            dns_srvs: opts.get_ipv4_list(OPT_DOMAIN_NAME_SERVER),
            static_routes,
            lease_timeout: lease_delta.map(|d| start_time + u64::from(d)),
            renewal_timeout: renewal_delta
                .map(|d| start_time + u64::from(d)),
            rebinding_timeout: rebinding_delta
                .map(|d| start_time + u64::from(d)),
        }
    }

    pub(crate) fn has_address(&self) -> bool {
        self.subnet_mask.is_some()
    }

    pub(crate) fn has_lease_times(&self) -> bool {
        self.lease_timeout.is_some() && self.rebinding_timeout.is_some()
    }
}

fn jittered(base: u64) -> u32 {
    let jitter: i64 = rand::rng().random_range(-5..=5);
    let val = (base as i64 + jitter).max(0);
    u32::try_from(val).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::DhcpV4MessageType;
    use crate::option::OPT_MESSAGE_TYPE;

    const START: u64 = 1_580_000_000;

    fn ack() -> DhcpV4Message {
        let mut msg = DhcpV4Message {
            op: 2,
            xid: 77,
            yiaddr: Ipv4Addr::new(10, 1, 2, 3),
            ..Default::default()
        };
        msg.options
            .insert(OPT_MESSAGE_TYPE, vec![DhcpV4MessageType::Ack as u8]);
        msg.options
            .insert(OPT_SUBNET_MASK, vec![255, 255, 255, 0]);
        msg.options.insert(OPT_ROUTER, vec![10, 1, 2, 1]);
        msg.options.insert(
            OPT_DOMAIN_NAME_SERVER,
            vec![1, 1, 1, 1, 8, 8, 8, 8],
        );
        msg.options
            .insert(OPT_DOMAIN_NAME, b"example.net".to_vec());
        msg.options.insert(
            OPT_IP_ADDRESS_LEASE_TIME,
            9000u32.to_be_bytes().to_vec(),
        );
        msg
    }

    #[test]
    fn test_full_ack_parsing() {
        let mut msg = ack();
        msg.options
            .insert(OPT_RENEWAL_TIME, 300u32.to_be_bytes().to_vec());
        msg.options
            .insert(OPT_REBINDING_TIME, 7000u32.to_be_bytes().to_vec());

        let lease = DhcpV4Lease::parse_from_ack(&msg, START);
        assert_eq!(lease.ip_address.to_string(), "10.1.2.3");
        assert_eq!(
            lease.subnet_mask,
            Some(Ipv4Addr::new(255, 255, 255, 0))
        );
        assert_eq!(lease.gateway, Some(Ipv4Addr::new(10, 1, 2, 1)));
        assert_eq!(lease.domain.as_deref(), Some("example.net"));
        assert_eq!(
            lease.dns_srvs,
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
        );
        assert_eq!(lease.lease_timeout, Some(START + 9000));
        assert_eq!(lease.renewal_timeout, Some(START + 300));
        assert_eq!(lease.rebinding_timeout, Some(START + 7000));
        assert!(lease.has_address());
        assert!(lease.has_lease_times());
    }

    #[test]
    fn test_derived_renew_rebind_are_ordered() {
        let lease = DhcpV4Lease::parse_from_ack(&ack(), START);
        let renewal = lease.renewal_timeout.unwrap();
        let rebinding = lease.rebinding_timeout.unwrap();
        let expiry = lease.lease_timeout.unwrap();
        // 0.5 and 0.875 of the lease time, each jittered by at most 5s.
        assert!(renewal.abs_diff(START + 4500) <= 5);
        assert!(rebinding.abs_diff(START + 7875) <= 5);
        assert!(renewal <= rebinding);
        assert!(rebinding <= expiry);
    }

    #[test]
    fn test_classless_routes_override_router() {
        let mut msg = ack();
        msg.options.insert(
            OPT_CLASSLESS_STATIC_ROUTE,
            vec![0, 4, 0, 0, 0, 16, 10, 12, 5, 0, 0, 0],
        );
        let lease = DhcpV4Lease::parse_from_ack(&msg, START);
        assert_eq!(lease.gateway, Some(Ipv4Addr::new(4, 0, 0, 0)));
        assert_eq!(lease.static_routes.len(), 1);
        let route = &lease.static_routes[0];
        assert_eq!(route.network.to_string(), "10.12.0.0");
        assert_eq!(route.netmask().to_string(), "255.255.0.0");
        assert_eq!(route.gateway.to_string(), "5.0.0.0");
    }

    #[test]
    fn test_classless_routes_without_default_still_drop_router() {
        let mut msg = ack();
        msg.options.insert(
            OPT_CLASSLESS_STATIC_ROUTE,
            vec![16, 10, 12, 5, 0, 0, 0],
        );
        let lease = DhcpV4Lease::parse_from_ack(&msg, START);
        assert_eq!(lease.gateway, None);
        assert_eq!(lease.static_routes.len(), 1);
    }

    #[test]
    fn test_malformed_classless_routes_keep_router() {
        let mut msg = ack();
        // Trailing byte after a valid entry.
        msg.options.insert(
            OPT_CLASSLESS_STATIC_ROUTE,
            vec![0, 4, 0, 0, 0, 16, 10, 12, 5, 0, 0, 0, 1],
        );
        let lease = DhcpV4Lease::parse_from_ack(&msg, START);
        assert_eq!(lease.gateway, Some(Ipv4Addr::new(10, 1, 2, 1)));
        assert!(lease.static_routes.is_empty());
    }

    #[test]
    fn test_ack_without_lease_time() {
        let mut msg = DhcpV4Message {
            op: 2,
            xid: 77,
            yiaddr: Ipv4Addr::new(10, 1, 2, 3),
            ..Default::default()
        };
        msg.options
            .insert(OPT_MESSAGE_TYPE, vec![DhcpV4MessageType::Ack as u8]);
        msg.options
            .insert(OPT_SUBNET_MASK, vec![255, 255, 255, 0]);
        let lease = DhcpV4Lease::parse_from_ack(&msg, START);
        assert_eq!(lease.lease_timeout, None);
        assert_eq!(lease.renewal_timeout, None);
        assert_eq!(lease.rebinding_timeout, None);
        assert!(!lease.has_lease_times());
    }
}
