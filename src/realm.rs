// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::rc::Rc;

use ipnet::{Ipv4Net, Ipv6Net};

use crate::{
    config::RealmConfig, option::ClasslessRoute, ErrorKind, VleaseError,
};

const DEFAULT_DHCP_LOCAL_PORT: u16 = 67;

/// An IPv6 static route pushed to clients of a realm.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StaticRouteV6 {
    pub prefix: Ipv6Net,
    pub gateway: Ipv6Addr,
}

/// Everything the daemon knows about one realm, fully resolved and
/// immutable after load.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Realm {
    pub name: String,
    pub vid: Option<u16>,
    pub dhcp_local_port: u16,
    pub dhcp_listen_device: Option<String>,
    pub dhcp_listen_ip: Ipv4Addr,
    pub provide_default_route: bool,
    pub default_gateway_ipv4: Option<Ipv4Addr>,
    pub subnet_ipv4: Option<Ipv4Net>,
    pub subnet_ipv6: Option<Ipv6Net>,
    pub default_gateway_ipv6: Option<Ipv6Addr>,
    pub static_routes_ipv4: Vec<ClasslessRoute>,
    pub static_routes_ipv6: Vec<StaticRouteV6>,
    pub dhcp_server_ips: Vec<Ipv4Addr>,
    pub expected_dhcp_lease_time: Option<u32>,
}

impl Realm {
    /// Network address for the RFC 3527 link-selection sub-option, when
    /// the realm requests addresses for a foreign subnet.
    pub fn target_addr(&self) -> Option<Ipv4Addr> {
        self.subnet_ipv4.map(|net| net.network())
    }
}

// While resolving, a realm inherited from its parent may still miss the
// fields a usable realm must have.
#[derive(Debug, Clone, Default)]
struct PartialRealm {
    vid: Option<u16>,
    dhcp_local_port: Option<u16>,
    dhcp_listen_device: Option<String>,
    dhcp_listen_ip: Option<Ipv4Addr>,
    provide_default_route: Option<bool>,
    default_gateway_ipv4: Option<Ipv4Addr>,
    subnet_ipv4: Option<Ipv4Net>,
    subnet_ipv6: Option<Ipv6Net>,
    default_gateway_ipv6: Option<Ipv6Addr>,
    static_routes_ipv4: Vec<ClasslessRoute>,
    static_routes_ipv6: Vec<StaticRouteV6>,
    dhcp_server_ips: Vec<Ipv4Addr>,
    expected_dhcp_lease_time: Option<u32>,
}

impl From<&Realm> for PartialRealm {
    fn from(parent: &Realm) -> Self {
        Self {
            vid: parent.vid,
            dhcp_local_port: Some(parent.dhcp_local_port),
            dhcp_listen_device: parent.dhcp_listen_device.clone(),
            dhcp_listen_ip: Some(parent.dhcp_listen_ip),
            provide_default_route: Some(parent.provide_default_route),
            default_gateway_ipv4: parent.default_gateway_ipv4,
            subnet_ipv4: parent.subnet_ipv4,
            subnet_ipv6: parent.subnet_ipv6,
            default_gateway_ipv6: parent.default_gateway_ipv6,
            static_routes_ipv4: parent.static_routes_ipv4.clone(),
            static_routes_ipv6: parent.static_routes_ipv6.clone(),
            dhcp_server_ips: parent.dhcp_server_ips.clone(),
            expected_dhcp_lease_time: parent.expected_dhcp_lease_time,
        }
    }
}

/// Resolve realm declarations into usable realms. Children inherit from
/// their parent and are deferred until the parent is loaded; a round that
/// makes no progress means the `include_realm` relations form a cycle,
/// which is fatal.
pub fn resolve_realms(
    configs: &BTreeMap<String, RealmConfig>,
) -> Result<HashMap<String, Rc<Realm>>, VleaseError> {
    let mut realms: HashMap<String, Rc<Realm>> = HashMap::new();
    let mut pending: Vec<(&String, &RealmConfig)> =
        configs.iter().collect();

    while !pending.is_empty() {
        let mut deferred = Vec::new();
        for (name, config) in pending.iter().copied() {
            match process_realm(name, config, &realms)? {
                Some(realm) => {
                    realms.insert(name.clone(), Rc::new(realm));
                }
                None => {
                    log::debug!(
                        "Processing of realm \"{}\" delayed, waiting \
                         for \"{}\"",
                        name,
                        config.include_realm.as_deref().unwrap_or(""),
                    );
                    deferred.push((name, config));
                }
            }
        }
        if deferred.len() == pending.len() {
            let names: Vec<&str> =
                deferred.iter().map(|(n, _)| n.as_str()).collect();
            return Err(VleaseError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "Recursive include relationships between realms: {}",
                    names.join(", ")
                ),
            ));
        }
        pending = deferred;
    }
    Ok(realms)
}

// Ok(None) means the parent realm is not resolved yet.
fn process_realm(
    name: &str,
    config: &RealmConfig,
    realms: &HashMap<String, Rc<Realm>>,
) -> Result<Option<Realm>, VleaseError> {
    log::debug!("Processing realm \"{name}\"");
    let mut partial = match config.include_realm.as_deref() {
        Some(parent_name) => match realms.get(parent_name) {
            Some(parent) => PartialRealm::from(parent.as_ref()),
            None => return Ok(None),
        },
        None => PartialRealm::default(),
    };

    if let Some(vid) = config.vid {
        partial.vid = Some(vid);
    }
    if let Some(port) = config.dhcp_local_port {
        partial.dhcp_local_port = Some(port);
    }
    if let Some(device) = config.dhcp_listen_device.as_ref() {
        partial.dhcp_listen_device = Some(device.clone());
        // An explicitly chosen device invalidates an inherited listen
        // IP; it has to be set again or re-detected on the new device.
        partial.dhcp_listen_ip = None;
    }
    if let Some(ip) = config.dhcp_listen_ip {
        partial.dhcp_listen_ip = Some(ip);
    }
    if let Some(provide) = config.provide_default_route {
        partial.provide_default_route = Some(provide);
    }
    if let Some(gw) = config.default_gateway_ipv4 {
        partial.default_gateway_ipv4 = Some(gw);
    }
    if let Some(subnet) = config.subnet_ipv4.as_deref() {
        partial.subnet_ipv4 = Some(parse_net_v4(name, subnet)?);
    }
    if let Some(subnet) = config.subnet_ipv6.as_deref() {
        partial.subnet_ipv6 = Some(parse_net_v6(name, subnet)?);
    }
    if let Some(gw) = config.default_gateway_ipv6 {
        partial.default_gateway_ipv6 = Some(gw);
    }
    if let Some(routes) = config.static_routes_ipv4.as_deref() {
        partial.static_routes_ipv4 = parse_static_routes_ipv4(routes)?;
    }
    if let Some(routes) = config.static_routes_ipv6.as_deref() {
        partial.static_routes_ipv6 = parse_static_routes_ipv6(routes)?;
    }
    if let Some(servers) = config.dhcp_server_ips.as_ref() {
        partial.dhcp_server_ips = resolve_server_ips(name, servers)?;
    }
    if let Some(lease_time) = config.expected_dhcp_lease_time {
        partial.expected_dhcp_lease_time = Some(lease_time);
    }

    let dhcp_listen_ip = match partial.dhcp_listen_ip {
        Some(ip) => ip,
        None => match partial.dhcp_listen_device.as_deref() {
            Some(device) => get_ip_for_iface(device)?,
            None => {
                return Err(VleaseError::new(
                    ErrorKind::InvalidConfig,
                    format!(
                        "Realm \"{name}\" defines neither a DHCP \
                         listening IP nor a device to detect one on"
                    ),
                ));
            }
        },
    };

    if partial.dhcp_server_ips.is_empty() {
        return Err(VleaseError::new(
            ErrorKind::InvalidConfig,
            format!("Realm \"{name}\" defines no DHCP servers"),
        ));
    }

    Ok(Some(Realm {
        name: name.to_string(),
        vid: partial.vid,
        dhcp_local_port: partial
            .dhcp_local_port
            .unwrap_or(DEFAULT_DHCP_LOCAL_PORT),
        dhcp_listen_device: partial.dhcp_listen_device,
        dhcp_listen_ip,
        provide_default_route: partial.provide_default_route.unwrap_or(true),
        default_gateway_ipv4: partial.default_gateway_ipv4,
        subnet_ipv4: partial.subnet_ipv4,
        subnet_ipv6: partial.subnet_ipv6,
        default_gateway_ipv6: partial.default_gateway_ipv6,
        static_routes_ipv4: partial.static_routes_ipv4,
        static_routes_ipv6: partial.static_routes_ipv6,
        dhcp_server_ips: partial.dhcp_server_ips,
        expected_dhcp_lease_time: partial.expected_dhcp_lease_time,
    }))
}

fn parse_net_v4(realm: &str, value: &str) -> Result<Ipv4Net, VleaseError> {
    value.trim().parse().map_err(|e| {
        VleaseError::new(
            ErrorKind::InvalidConfig,
            format!("Realm \"{realm}\": invalid IPv4 subnet \"{value}\": {e}"),
        )
    })
}

fn parse_net_v6(realm: &str, value: &str) -> Result<Ipv6Net, VleaseError> {
    value.trim().parse().map_err(|e| {
        VleaseError::new(
            ErrorKind::InvalidConfig,
            format!("Realm \"{realm}\": invalid IPv6 prefix \"{value}\": {e}"),
        )
    })
}

/// Parses a route list of the form
/// `0.0.0.0/0 via 10.0.98.120, 10.0.97.0/24 via 10.0.98.121`.
fn parse_static_routes_ipv4(
    value: &str,
) -> Result<Vec<ClasslessRoute>, VleaseError> {
    let mut ret = Vec::new();
    for route_str in split_list(value) {
        let (net, gateway) = parse_via(route_str)?;
        let net: Ipv4Net = net.parse().map_err(|e| {
            invalid_route(route_str, &format!("bad network: {e}"))
        })?;
        let gateway: Ipv4Addr = gateway.parse().map_err(|e| {
            invalid_route(route_str, &format!("bad gateway: {e}"))
        })?;
        ret.push(ClasslessRoute {
            network: net.network(),
            prefix_len: net.prefix_len(),
            gateway,
        });
    }
    Ok(ret)
}

/// Parses a route list of the form `::/0 via fd00::1, fd01::/64 via fd00::1`.
fn parse_static_routes_ipv6(
    value: &str,
) -> Result<Vec<StaticRouteV6>, VleaseError> {
    let mut ret = Vec::new();
    for route_str in split_list(value) {
        let (net, gateway) = parse_via(route_str)?;
        let prefix: Ipv6Net = net.parse().map_err(|e| {
            invalid_route(route_str, &format!("bad prefix: {e}"))
        })?;
        let gateway: Ipv6Addr = gateway.parse().map_err(|e| {
            invalid_route(route_str, &format!("bad gateway: {e}"))
        })?;
        ret.push(StaticRouteV6 { prefix, gateway });
    }
    Ok(ret)
}

fn parse_via(route_str: &str) -> Result<(&str, &str), VleaseError> {
    let fields: Vec<&str> = route_str.split_whitespace().collect();
    match fields.as_slice() {
        [net, "via", gateway] => Ok((net, gateway)),
        _ => Err(invalid_route(route_str, "expected \"<net> via <gw>\"")),
    }
}

fn invalid_route(route_str: &str, reason: &str) -> VleaseError {
    VleaseError::new(
        ErrorKind::InvalidConfig,
        format!("Invalid static route \"{route_str}\": {reason}"),
    )
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn resolve_server_ips(
    realm: &str,
    servers: &[String],
) -> Result<Vec<Ipv4Addr>, VleaseError> {
    let mut ret = Vec::new();
    for server in servers {
        let server = server.trim();
        if let Ok(ip) = server.parse::<Ipv4Addr>() {
            ret.push(ip);
            continue;
        }
        // Startup-only hostname lookup.
        let addrs = (server, 0u16).to_socket_addrs().map_err(|e| {
            VleaseError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "Realm \"{realm}\": could not resolve DHCP server \
                     \"{server}\": {e}"
                ),
            )
        })?;
        match addrs.filter_map(|a| match a {
            std::net::SocketAddr::V4(a) => Some(*a.ip()),
            std::net::SocketAddr::V6(_) => None,
        }).next()
        {
            Some(ip) => ret.push(ip),
            None => {
                return Err(VleaseError::new(
                    ErrorKind::InvalidConfig,
                    format!(
                        "Realm \"{realm}\": DHCP server \"{server}\" \
                         has no IPv4 address"
                    ),
                ));
            }
        }
    }
    Ok(ret)
}

/// First IPv4 address on the given interface; used when a realm names a
/// listen device but no listen IP.
fn get_ip_for_iface(iface: &str) -> Result<Ipv4Addr, VleaseError> {
    let addrs = nix::ifaddrs::getifaddrs()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != iface {
            continue;
        }
        if let Some(addr) = ifaddr
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
        {
            return Ok(addr.ip());
        }
    }
    Err(VleaseError::new(
        ErrorKind::InvalidConfig,
        format!("Could not detect IPv4 address on interface \"{iface}\""),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RealmConfig {
        RealmConfig {
            dhcp_listen_ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
            dhcp_server_ips: Some(vec!["10.0.0.1".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_realm_resolves_with_defaults() {
        let mut configs = BTreeMap::new();
        configs.insert("corp".to_string(), base_config());
        let realms = resolve_realms(&configs).unwrap();
        let realm = realms.get("corp").unwrap();
        assert_eq!(realm.dhcp_local_port, 67);
        assert!(realm.provide_default_route);
        assert_eq!(realm.dhcp_listen_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            realm.dhcp_server_ips,
            vec![Ipv4Addr::new(10, 0, 0, 1)]
        );
        assert_eq!(realm.target_addr(), None);
    }

    #[test]
    fn test_child_inherits_and_overrides() {
        let mut configs = BTreeMap::new();
        // Declared in an order that forces deferral: children sort
        // before their parent.
        configs.insert(
            "a-child".to_string(),
            RealmConfig {
                include_realm: Some("z-parent".to_string()),
                vid: Some(42),
                subnet_ipv4: Some("10.0.98.0/24".to_string()),
                ..Default::default()
            },
        );
        let mut parent = base_config();
        parent.expected_dhcp_lease_time = Some(3600);
        configs.insert("z-parent".to_string(), parent);

        let realms = resolve_realms(&configs).unwrap();
        let child = realms.get("a-child").unwrap();
        assert_eq!(child.vid, Some(42));
        assert_eq!(child.dhcp_listen_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(child.expected_dhcp_lease_time, Some(3600));
        assert_eq!(
            child.target_addr(),
            Some(Ipv4Addr::new(10, 0, 98, 0))
        );
        let parent = realms.get("z-parent").unwrap();
        assert_eq!(parent.vid, None);
    }

    #[test]
    fn test_include_cycle_is_fatal() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "a".to_string(),
            RealmConfig {
                include_realm: Some("b".to_string()),
                ..base_config()
            },
        );
        configs.insert(
            "b".to_string(),
            RealmConfig {
                include_realm: Some("a".to_string()),
                ..base_config()
            },
        );
        let err = resolve_realms(&configs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.msg().contains("a, b"));
    }

    #[test]
    fn test_realm_without_servers_is_fatal() {
        let mut configs = BTreeMap::new();
        let mut config = base_config();
        config.dhcp_server_ips = None;
        configs.insert("corp".to_string(), config);
        assert!(resolve_realms(&configs).is_err());
    }

    #[test]
    fn test_static_route_parsing() {
        let routes = parse_static_routes_ipv4(
            "0.0.0.0/0 via 10.0.98.120, 10.0.97.0/24 via 10.0.98.121",
        )
        .unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].network, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(routes[0].gateway, Ipv4Addr::new(10, 0, 98, 120));
        assert_eq!(routes[1].netmask(), Ipv4Addr::new(255, 255, 255, 0));

        let routes =
            parse_static_routes_ipv6("fd01:1234::/64 via fd00::1").unwrap();
        assert_eq!(routes[0].gateway, "fd00::1".parse::<Ipv6Addr>().unwrap());

        assert!(parse_static_routes_ipv4("10.0.0.0/8 10.0.0.1").is_err());
    }
}
