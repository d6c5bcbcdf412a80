// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use sha2::{Digest, Sha256};

use crate::{lease::DhcpV4Lease, realm::Realm};

/// Escape one config token: backslashes are doubled, and a token with
/// whitespace is double-quoted with embedded quotes escaped.
fn config_escape(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\");
    if escaped.chars().any(char::is_whitespace) {
        format!("\"{}\"", escaped.replace('"', "\\\""))
    } else {
        escaped
    }
}

fn make_config_line(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| config_escape(v))
        .collect::<Vec<String>>()
        .join(" ")
}

/// Line-oriented concentrator config under construction.
#[derive(Debug, Default)]
struct ConfigFragment {
    lines: Vec<String>,
}

impl ConfigFragment {
    fn add(&mut self, values: &[&str]) {
        self.lines.push(make_config_line(values));
    }

    // Pushed payloads are always quoted, matching the concentrator's
    // own config examples.
    fn push(&mut self, values: &[&str]) {
        let payload = values
            .join(" ")
            .replace('\\', "\\\\")
            .replace('"', "\\\"");
        self.lines.push(format!("push \"{payload}\""));
    }

    fn push_dhcp_option(&mut self, option: &str, value: &str) {
        self.push(&["dhcp-option", option, value]);
    }

    fn to_text(&self) -> String {
        let mut ret = self.lines.join("\n");
        ret.push('\n');
        ret
    }
}

/// Render the per-client config fragment for a freshly acquired lease.
///
/// The caller guarantees the lease carries an address and subnet mask;
/// `date` is today as `YYYY-MM-DD` and only drives the rotating IPv6
/// assignment.
pub(crate) fn build_client_config(
    realm: &Realm,
    lease: &DhcpV4Lease,
    full_username: &str,
    secret: &str,
    date: &str,
) -> String {
    let mut conf = ConfigFragment::default();

    let subnet_mask = lease
        .subnet_mask
        .map(|m| m.to_string())
        .unwrap_or_default();
    conf.add(&[
        "ifconfig-push",
        &lease.ip_address.to_string(),
        &subnet_mask,
    ]);

    if let Some(prefix) = realm.subnet_ipv6 {
        let address = assign_ipv6(prefix, full_username, date, secret);
        let gateway = realm
            .default_gateway_ipv6
            .unwrap_or_else(|| first_host(prefix));
        conf.add(&[
            "ifconfig-ipv6-push",
            &address.to_string(),
            &gateway.to_string(),
        ]);
    }

    if let Some(vid) = realm.vid {
        conf.add(&["vlan-pvid", &vid.to_string()]);
    }

    let gateway = realm.default_gateway_ipv4.or(lease.gateway);
    match gateway {
        Some(gateway) => {
            conf.push(&["route-gateway", &gateway.to_string()]);
        }
        None => {
            log::debug!(
                "DHCP request for {full_username} provided no gateway \
                 information"
            );
        }
    }

    if realm.provide_default_route {
        if realm.default_gateway_ipv6.is_some() {
            conf.push(&["route-ipv6", "2000::/3"]);
            conf.push(&["redirect-gateway", "def1"]);
        } else if gateway.is_some() {
            conf.push(&["redirect-gateway", "def1"]);
        }
    } else {
        for route in realm
            .static_routes_ipv4
            .iter()
            .chain(lease.static_routes.iter())
        {
            conf.push(&[
                "route",
                &route.network.to_string(),
                &route.netmask().to_string(),
                &route.gateway.to_string(),
            ]);
        }
        if realm.subnet_ipv6.is_some() {
            for route in &realm.static_routes_ipv6 {
                conf.push(&[
                    "route-ipv6",
                    &route.prefix.to_string(),
                    &route.gateway.to_string(),
                ]);
            }
        }
    }

    conf.push(&["redirect-private"]);

    for dns_ip in &lease.dns_srvs {
        conf.push_dhcp_option("DNS", &dns_ip.to_string());
    }
    if let Some(domain) = lease.domain.as_deref() {
        if !domain.is_empty() {
            conf.push_dhcp_option("DOMAIN", domain);
        }
    }

    conf.to_text()
}

/// Deterministic per-client IPv6 address within the realm prefix,
/// rotating daily: the first 64 bits of
/// SHA-256(username + date + secret) added to the network address.
pub(crate) fn assign_ipv6(
    prefix: Ipv6Net,
    full_username: &str,
    date: &str,
    secret: &str,
) -> Ipv6Addr {
    let mut hasher = Sha256::new();
    hasher.update(full_username.as_bytes());
    hasher.update(date.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut host = [0u8; 8];
    host.copy_from_slice(&digest[..8]);
    let network = u128::from(prefix.network());
    Ipv6Addr::from(network.wrapping_add(u128::from(u64::from_be_bytes(host))))
}

fn first_host(prefix: Ipv6Net) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(prefix.network()).wrapping_add(1))
}

pub(crate) fn today_string() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::ClasslessRoute;
    use std::net::Ipv4Addr;

    #[test]
    fn test_config_escape() {
        // unchanged
        assert_eq!(config_escape("test"), "test");
        // quote if contains spaces
        assert_eq!(config_escape("test 123"), "\"test 123\"");
        // escape quotes if quoting
        assert_eq!(config_escape("test \" 123"), "\"test \\\" 123\"");
        // escape backslash always
        assert_eq!(config_escape("te\\st"), "te\\\\st");
        assert_eq!(config_escape("test te\\st"), "\"test te\\\\st\"");
    }

    #[test]
    fn test_simple_fragment() {
        let mut conf = ConfigFragment::default();
        conf.add(&["test", "1", "2"]);
        conf.push(&["test", "1", "2"]);
        assert_eq!(conf.to_text(), "test 1 2\npush \"test 1 2\"\n");
    }

    fn realm() -> Realm {
        Realm {
            name: "corp".to_string(),
            vid: None,
            dhcp_local_port: 67,
            dhcp_listen_device: None,
            dhcp_listen_ip: Ipv4Addr::new(10, 0, 0, 2),
            provide_default_route: true,
            default_gateway_ipv4: None,
            subnet_ipv4: None,
            subnet_ipv6: None,
            default_gateway_ipv6: None,
            static_routes_ipv4: Vec::new(),
            static_routes_ipv6: Vec::new(),
            dhcp_server_ips: vec![Ipv4Addr::new(10, 0, 0, 1)],
            expected_dhcp_lease_time: None,
        }
    }

    fn lease() -> DhcpV4Lease {
        DhcpV4Lease {
            ip_address: Ipv4Addr::new(10, 1, 2, 3),
            subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: Some(Ipv4Addr::new(10, 1, 2, 1)),
            domain: Some("example.net".to_string()),
            dns_srvs: vec![
                Ipv4Addr::new(1, 1, 1, 1),
                Ipv4Addr::new(8, 8, 8, 8),
            ],
            static_routes: Vec::new(),
            lease_timeout: Some(1_580_009_000),
            renewal_timeout: Some(1_580_000_300),
            rebinding_timeout: Some(1_580_007_000),
        }
    }

    #[test]
    fn test_default_route_fragment() {
        let text = build_client_config(
            &realm(),
            &lease(),
            "alice@corp",
            "s3cret",
            "2026-08-01",
        );
        assert_eq!(
            text,
            "ifconfig-push 10.1.2.3 255.255.255.0\n\
             push \"route-gateway 10.1.2.1\"\n\
             push \"redirect-gateway def1\"\n\
             push \"redirect-private\"\n\
             push \"dhcp-option DNS 1.1.1.1\"\n\
             push \"dhcp-option DNS 8.8.8.8\"\n\
             push \"dhcp-option DOMAIN example.net\"\n"
        );
    }

    #[test]
    fn test_static_routes_fragment() {
        let mut realm = realm();
        realm.provide_default_route = false;
        realm.vid = Some(17);
        realm.static_routes_ipv4 = vec![ClasslessRoute {
            network: Ipv4Addr::new(10, 0, 97, 0),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 0, 98, 121),
        }];
        let mut lease = lease();
        lease.static_routes = vec![ClasslessRoute {
            network: Ipv4Addr::new(10, 12, 0, 0),
            prefix_len: 16,
            gateway: Ipv4Addr::new(5, 0, 0, 0),
        }];
        lease.domain = None;

        let text = build_client_config(
            &realm,
            &lease,
            "alice@corp",
            "s3cret",
            "2026-08-01",
        );
        assert_eq!(
            text,
            "ifconfig-push 10.1.2.3 255.255.255.0\n\
             vlan-pvid 17\n\
             push \"route-gateway 10.1.2.1\"\n\
             push \"route 10.0.97.0 255.255.255.0 10.0.98.121\"\n\
             push \"route 10.12.0.0 255.255.0.0 5.0.0.0\"\n\
             push \"redirect-private\"\n\
             push \"dhcp-option DNS 1.1.1.1\"\n\
             push \"dhcp-option DNS 8.8.8.8\"\n"
        );
    }

    #[test]
    fn test_ipv6_fragment_lines() {
        let mut realm = realm();
        realm.subnet_ipv6 = Some("fd00:1::/64".parse().unwrap());
        realm.default_gateway_ipv6 = Some("fd00:1::1".parse().unwrap());
        let text = build_client_config(
            &realm,
            &lease(),
            "alice@corp",
            "s3cret",
            "2026-08-01",
        );
        assert!(text.contains("ifconfig-ipv6-push "));
        assert!(text.contains(" fd00:1::1\n"));
        assert!(text.contains("push \"route-ipv6 2000::/3\"\n"));
        assert!(text.contains("push \"redirect-gateway def1\"\n"));
    }

    #[test]
    fn test_ipv6_assignment_is_deterministic() {
        let prefix: Ipv6Net = "fd00:1::/64".parse().unwrap();
        let a = assign_ipv6(prefix, "alice@corp", "2026-08-01", "s3cret");
        let b = assign_ipv6(prefix, "alice@corp", "2026-08-01", "s3cret");
        assert_eq!(a, b);
        assert!(prefix.contains(&a));

        // Rotates daily, differs per user and per secret.
        let c = assign_ipv6(prefix, "alice@corp", "2026-08-02", "s3cret");
        assert_ne!(a, c);
        let d = assign_ipv6(prefix, "bob@corp", "2026-08-01", "s3cret");
        assert_ne!(a, d);
        let e = assign_ipv6(prefix, "alice@corp", "2026-08-01", "other");
        assert_ne!(a, e);
    }

    #[test]
    fn test_ipv6_gateway_defaults_to_first_host() {
        let prefix: Ipv6Net = "fd00:1::/64".parse().unwrap();
        assert_eq!(
            first_host(prefix),
            "fd00:1::1".parse::<Ipv6Addr>().unwrap()
        );
    }
}
