// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;

use crate::{
    daemon::{wall_clock_now, Dispatch},
    event::{EventLoop, TimerHandle},
    ovpn::{ClientEntry, ServerId, VpnServer},
    realm::Realm,
    username::UsernameParser,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub(crate) struct ClientId(pub(crate) u64);

/// One connected VPN client whose lease we keep alive. The id is a
/// generation counter: a late callback for a killed-and-replaced
/// username fails the id comparison instead of touching the successor.
#[derive(Debug)]
pub(crate) struct VpnClient {
    pub(crate) id: ClientId,
    pub(crate) full_username: String,
    pub(crate) server: ServerId,
    pub(crate) realm: Rc<Realm>,
    pub(crate) leased_ip: Ipv4Addr,
    pub(crate) rebinding_time: u64,
    pub(crate) lease_expiry: Option<u64>,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) zombie: bool,
}

/// All tracked clients, indexed by full username and by concentrator.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    next_id: u64,
    by_username: HashMap<String, VpnClient>,
    by_server: HashMap<ServerId, HashSet<String>>,
}

/// Borrowed surroundings for the reconciliation pass.
pub(crate) struct SyncCtx<'a> {
    pub(crate) evl: &'a mut EventLoop<Dispatch>,
    pub(crate) servers: &'a mut Vec<VpnServer>,
    pub(crate) realms: &'a HashMap<String, Rc<Realm>>,
    pub(crate) parser: &'a UsernameParser,
}

impl ClientRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The record for a renewal callback, or `None` when the callback is
    /// stale: record gone, username re-used by a successor, or killed.
    pub(crate) fn get_current_mut(
        &mut self,
        full_username: &str,
        id: ClientId,
    ) -> Option<&mut VpnClient> {
        self.by_username
            .get_mut(full_username)
            .filter(|c| c.id == id && !c.zombie)
    }

    /// Track a freshly leased client and arm its rebind timer. An
    /// existing record under the same username is replaced.
    pub(crate) fn create(
        &mut self,
        evl: &mut EventLoop<Dispatch>,
        realm: Rc<Realm>,
        server: ServerId,
        full_username: &str,
        leased_ip: Ipv4Addr,
        rebinding_time: u64,
        lease_expiry: Option<u64>,
    ) -> ClientId {
        if self.by_username.contains_key(full_username) {
            log::warn!(
                "Replacing client connection in client list with \
                 freshly connected client instance: {full_username}"
            );
            self.kill(full_username, evl);
        } else {
            log::debug!("Adding new client instance: {full_username}");
        }

        self.next_id += 1;
        let id = ClientId(self.next_id);
        let delay = rebinding_time.saturating_sub(wall_clock_now());
        let timer = evl.schedule_in(
            Duration::from_secs(delay),
            Dispatch::ClientRebind {
                username: full_username.to_string(),
                client: id,
            },
        );
        let client = VpnClient {
            id,
            full_username: full_username.to_string(),
            server,
            realm,
            leased_ip,
            rebinding_time,
            lease_expiry,
            timer: Some(timer),
            zombie: false,
        };
        self.by_username.insert(full_username.to_string(), client);
        self.by_server
            .entry(server)
            .or_default()
            .insert(full_username.to_string());
        id
    }

    /// Re-arm the rebind timer after a successful refresh.
    pub(crate) fn lease_refreshed(
        &mut self,
        evl: &mut EventLoop<Dispatch>,
        full_username: &str,
        id: ClientId,
        leased_ip: Ipv4Addr,
        rebinding_time: u64,
        lease_expiry: Option<u64>,
    ) {
        let client = match self.get_current_mut(full_username, id) {
            Some(client) => client,
            None => return,
        };
        client.leased_ip = leased_ip;
        client.rebinding_time = rebinding_time;
        client.lease_expiry = lease_expiry;
        let delay = rebinding_time.saturating_sub(wall_clock_now());
        let timer = evl.schedule_in(
            Duration::from_secs(delay),
            Dispatch::ClientRebind {
                username: full_username.to_string(),
                client: id,
            },
        );
        if let Some(old) = client.timer.replace(timer) {
            evl.cancel(old);
        }
    }

    /// Kill and unindex. Idempotent: reaping an already-gone record is
    /// a no-op.
    pub(crate) fn kill(
        &mut self,
        full_username: &str,
        evl: &mut EventLoop<Dispatch>,
    ) {
        let mut client = match self.by_username.remove(full_username) {
            Some(client) => client,
            None => return,
        };
        client.zombie = true;
        if let Some(timer) = client.timer.take() {
            evl.cancel(timer);
        }
        if let Some(usernames) = self.by_server.get_mut(&client.server) {
            usernames.remove(full_username);
        }
    }

    /// The concentrator reported this client gone.
    pub(crate) fn client_disconnected(
        &mut self,
        full_username: &str,
        server: ServerId,
        evl: &mut EventLoop<Dispatch>,
    ) {
        let known = self
            .by_server
            .get(&server)
            .map(|s| s.contains(full_username))
            .unwrap_or(false);
        if !known {
            log::debug!(
                "Attempted to disconnect unknown client \
                 \"{full_username}\""
            );
            return;
        }
        log::debug!("Disconnected {full_username}");
        self.kill(full_username, evl);
    }

    /// Reconcile against one concentrator's authoritative client list.
    pub(crate) fn sync_with(
        &mut self,
        server: ServerId,
        entries: &[ClientEntry],
        ctx: &mut SyncCtx,
    ) {
        let mut listed: HashSet<&str> = HashSet::new();
        for entry in entries {
            log::debug!(
                "client_data: \"{}\" with \"{:?}\"",
                entry.common_name,
                entry.virtual_address
            );
            let virtual_address = match entry.virtual_address {
                Some(addr) => addr,
                // Connection not fully established yet. Skip it.
                None => continue,
            };
            listed.insert(entry.common_name.as_str());

            if let Some(client) = self.by_username.get(&entry.common_name)
            {
                if client.server != server {
                    // The client has jumped servers; our record is
                    // stale.
                    log::debug!(
                        "Cleaning up: client {} has moved servers",
                        entry.common_name
                    );
                    self.kill(&entry.common_name, ctx.evl);
                }
            }
            if !self.by_username.contains_key(&entry.common_name) {
                self.create_detected(
                    &entry.common_name,
                    server,
                    virtual_address,
                    ctx,
                );
            }
        }

        let unlisted: Vec<String> = self
            .by_server
            .get(&server)
            .map(|usernames| {
                usernames
                    .iter()
                    .filter(|u| !listed.contains(u.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for full_username in unlisted {
            log::debug!(
                "Cleaning up: client {full_username} was disconnected \
                 in the meanwhile"
            );
            self.kill(&full_username, ctx.evl);
        }
    }

    // A client the concentrator knows but we do not; probably a daemon
    // restart. The last refresh time is unknown, so the next one is
    // scheduled almost immediately, spread out to avoid a thundering
    // herd.
    fn create_detected(
        &mut self,
        full_username: &str,
        server: ServerId,
        leased_ip: Ipv4Addr,
        ctx: &mut SyncCtx,
    ) {
        log::debug!("Detected client \"{full_username}\"");
        let realm_name =
            match ctx.parser.parse(full_username).map(|p| p.realm) {
                Some(realm) => realm,
                None => {
                    log::warn!(
                        "Parsing username \"{full_username}\" failed"
                    );
                    disconnect_at(ctx, server, full_username);
                    return;
                }
            };
        let realm = match ctx.realms.get(&realm_name) {
            Some(realm) => Rc::clone(realm),
            None => {
                log::warn!(
                    "Unknown realm \"{realm_name}\" for user \
                     \"{full_username}\""
                );
                disconnect_at(ctx, server, full_username);
                return;
            }
        };

        let rebinding_time =
            wall_clock_now() + rand::rng().random_range(0..=10);
        self.create(
            ctx.evl,
            realm,
            server,
            full_username,
            leased_ip,
            rebinding_time,
            None,
        );
    }

    #[cfg(test)]
    fn get(&self, full_username: &str) -> Option<&VpnClient> {
        self.by_username.get(full_username)
    }

    #[cfg(test)]
    fn contains(&self, full_username: &str) -> bool {
        self.by_username.contains_key(full_username)
    }
}

fn disconnect_at(ctx: &mut SyncCtx, server: ServerId, username: &str) {
    if let Some(server) = ctx.servers.get_mut(server.0) {
        server.disconnect_client(username, ctx.evl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn realm() -> Rc<Realm> {
        Rc::new(Realm {
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
        })
    }

    fn test_setup() -> (
        EventLoop<Dispatch>,
        ClientRegistry,
        Vec<VpnServer>,
        HashMap<String, Rc<Realm>>,
        UsernameParser,
    ) {
        let evl = EventLoop::new().unwrap();
        let registry = ClientRegistry::new();
        let servers = vec![
            VpnServer::new(ServerId(0), "vpn1", PathBuf::from("/no.sock")),
            VpnServer::new(ServerId(1), "vpn2", PathBuf::from("/no.sock")),
        ];
        let mut realms = HashMap::new();
        realms.insert("corp".to_string(), realm());
        let parser = UsernameParser::new(None);
        (evl, registry, servers, realms, parser)
    }

    fn entry(name: &str, addr: Option<Ipv4Addr>) -> ClientEntry {
        ClientEntry {
            common_name: name.to_string(),
            virtual_address: addr,
        }
    }

    #[test]
    fn test_create_replaces_existing_record() {
        let (mut evl, mut registry, ..) = test_setup();
        let now = wall_clock_now();
        let first = registry.create(
            &mut evl,
            realm(),
            ServerId(0),
            "alice@corp",
            Ipv4Addr::new(10, 1, 2, 3),
            now + 100,
            Some(now + 200),
        );
        let second = registry.create(
            &mut evl,
            realm(),
            ServerId(0),
            "alice@corp",
            Ipv4Addr::new(10, 1, 2, 4),
            now + 100,
            Some(now + 200),
        );
        assert_ne!(first, second);
        let client = registry.get("alice@corp").unwrap();
        assert_eq!(client.id, second);
        assert_eq!(client.leased_ip, Ipv4Addr::new(10, 1, 2, 4));
        // A stale callback carrying the first generation is ignored.
        assert!(registry
            .get_current_mut("alice@corp", first)
            .is_none());
        assert!(registry
            .get_current_mut("alice@corp", second)
            .is_some());
    }

    #[test]
    fn test_kill_is_idempotent() {
        let (mut evl, mut registry, ..) = test_setup();
        let now = wall_clock_now();
        registry.create(
            &mut evl,
            realm(),
            ServerId(0),
            "alice@corp",
            Ipv4Addr::new(10, 1, 2, 3),
            now + 100,
            None,
        );
        registry.kill("alice@corp", &mut evl);
        assert!(!registry.contains("alice@corp"));
        registry.kill("alice@corp", &mut evl);
        registry.client_disconnected("alice@corp", ServerId(0), &mut evl);
    }

    #[test]
    fn test_sync_detects_new_clients() {
        let (mut evl, mut registry, mut servers, realms, parser) =
            test_setup();
        let before = wall_clock_now();
        let entries = vec![
            entry("alice@corp", Some(Ipv4Addr::new(10, 1, 2, 3))),
            // Not fully connected yet; skipped.
            entry("bob@corp", None),
            // Realm unknown; disconnect is requested (and swallowed,
            // the test server is not connected).
            entry("eve@nowhere", Some(Ipv4Addr::new(10, 1, 2, 9))),
        ];
        let mut ctx = SyncCtx {
            evl: &mut evl,
            servers: &mut servers,
            realms: &realms,
            parser: &parser,
        };
        registry.sync_with(ServerId(0), &entries, &mut ctx);

        assert!(registry.contains("alice@corp"));
        assert!(!registry.contains("bob@corp"));
        assert!(!registry.contains("eve@nowhere"));
        let alice = registry.get("alice@corp").unwrap();
        assert_eq!(alice.lease_expiry, None);
        // Pessimistic rebind in [now, now + 10].
        assert!(alice.rebinding_time >= before);
        assert!(alice.rebinding_time <= wall_clock_now() + 10);
    }

    #[test]
    fn test_sync_reaps_unlisted_and_server_jumpers() {
        let (mut evl, mut registry, mut servers, realms, parser) =
            test_setup();
        let now = wall_clock_now();
        registry.create(
            &mut evl,
            realm(),
            ServerId(0),
            "alice@corp",
            Ipv4Addr::new(10, 1, 2, 3),
            now + 100,
            None,
        );
        registry.create(
            &mut evl,
            realm(),
            ServerId(0),
            "carol@corp",
            Ipv4Addr::new(10, 1, 2, 5),
            now + 100,
            None,
        );

        // vpn2 now lists alice: our vpn1 record is stale, and a fresh
        // record is created on vpn2. carol is listed nowhere and is
        // reaped when vpn1 reports its (empty) list.
        let mut ctx = SyncCtx {
            evl: &mut evl,
            servers: &mut servers,
            realms: &realms,
            parser: &parser,
        };
        registry.sync_with(
            ServerId(1),
            &[entry("alice@corp", Some(Ipv4Addr::new(10, 1, 2, 3)))],
            &mut ctx,
        );
        assert_eq!(
            registry.get("alice@corp").unwrap().server,
            ServerId(1)
        );

        let mut ctx = SyncCtx {
            evl: &mut evl,
            servers: &mut servers,
            realms: &realms,
            parser: &parser,
        };
        registry.sync_with(ServerId(0), &[], &mut ctx);
        assert!(!registry.contains("carol@corp"));
        assert!(registry.contains("alice@corp"));
    }
}
