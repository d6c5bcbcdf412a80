// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{ErrorKind, VleaseError};

const DEFAULT_SYNC_INTERVAL: u64 = 60;
const DEFAULT_CMD_SOCKET_PERMS: &str = "0666";

/// One realm as declared in the configuration file. Everything is
/// optional here; [crate::realm::resolve_realms] applies inheritance and
/// decides what is mandatory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealmConfig {
    pub include_realm: Option<String>,
    pub vid: Option<u16>,
    pub dhcp_local_port: Option<u16>,
    pub dhcp_listen_device: Option<String>,
    pub dhcp_listen_ip: Option<Ipv4Addr>,
    pub provide_default_route: Option<bool>,
    pub default_gateway_ipv4: Option<Ipv4Addr>,
    pub subnet_ipv4: Option<String>,
    pub subnet_ipv6: Option<String>,
    pub default_gateway_ipv6: Option<Ipv6Addr>,
    pub static_routes_ipv4: Option<String>,
    pub static_routes_ipv6: Option<String>,
    pub dhcp_server_ips: Option<Vec<String>>,
    pub expected_dhcp_lease_time: Option<u32>,
}

/// One VPN concentrator instance and its management channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub mgmt_socket: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub default_realm: Option<String>,
    /// Shared secret feeding the deterministic IPv6 assignment.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default)]
    pub cmd_sockets: Vec<PathBuf>,
    #[serde(default)]
    pub cmd_socket_uids: Vec<u32>,
    #[serde(default)]
    pub cmd_socket_gids: Vec<u32>,
    /// Octal file mode for the command sockets, e.g. "0660".
    #[serde(default = "default_cmd_socket_perms")]
    pub cmd_socket_perms: String,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub realms: BTreeMap<String, RealmConfig>,
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL
}

fn default_cmd_socket_perms() -> String {
    DEFAULT_CMD_SOCKET_PERMS.to_string()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, VleaseError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VleaseError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "Failed to read config file {}: {e}",
                    path.display()
                ),
            )
        })?;
        serde_json::from_str(&content).map_err(|e| {
            VleaseError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "Failed to parse config file {}: {e}",
                    path.display()
                ),
            )
        })
    }

    pub fn cmd_socket_mode(&self) -> Result<u32, VleaseError> {
        u32::from_str_radix(&self.cmd_socket_perms, 8).map_err(|e| {
            VleaseError::new(
                ErrorKind::InvalidConfig,
                format!(
                    "Invalid cmd_socket_perms \"{}\": {e}",
                    self.cmd_socket_perms
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"{
            "default_realm": "corp",
            "secret": "s3cret",
            "cmd_sockets": ["/run/vlease/cmd.sock"],
            "cmd_socket_uids": [0],
            "cmd_socket_gids": [117],
            "cmd_socket_perms": "0660",
            "servers": {
                "vpn1": {"mgmt_socket": "/run/openvpn/vpn1.mgmt"}
            },
            "realms": {
                "corp": {
                    "dhcp_listen_ip": "10.0.0.2",
                    "dhcp_server_ips": ["10.0.0.1", "10.0.0.7"],
                    "subnet_ipv6": "fd00:1::/64",
                    "provide_default_route": false,
                    "static_routes_ipv4": "10.0.97.0/24 via 10.0.98.121"
                },
                "lab": {
                    "include_realm": "corp",
                    "vid": 12
                }
            }
        }"#;
        let config: DaemonConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.default_realm.as_deref(), Some("corp"));
        assert_eq!(config.sync_interval, 60);
        assert_eq!(config.cmd_socket_mode().unwrap(), 0o660);
        assert_eq!(config.servers.len(), 1);
        let corp = config.realms.get("corp").unwrap();
        assert_eq!(
            corp.dhcp_listen_ip,
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(
            config.realms.get("lab").unwrap().include_realm.as_deref(),
            Some("corp")
        );
    }

    #[test]
    fn test_bad_socket_perms_rejected() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{"cmd_socket_perms": "worldwritable"}"#,
        )
        .unwrap();
        assert!(config.cmd_socket_mode().is_err());
    }
}
