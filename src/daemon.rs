// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::{
    clients::{ClientId, ClientRegistry, SyncCtx},
    command::{
        CommandConnection, CommandListener, CommandMessage, CommandRead,
        ConnId, DeferredStatusFile, PeerFilter, PendingRequest,
    },
    config::DaemonConfig,
    event::EventLoop,
    lease::DhcpV4Lease,
    ovpn::{MgmtEvent, ServerId, VpnServer, RECONNECT_INTERVAL},
    realm::{resolve_realms, Realm},
    requestor::{DhcpRequestor, RequestorId, RequestorRegistry},
    transaction::{DhcpTransaction, TxOutcome, TxOwner, TxParams},
    username::UsernameParser,
    vpn_config::{build_client_config, today_string},
    ErrorKind, VleaseError,
};

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Ask the daemon loop to finish the current poll round and exit.
/// Async-signal-safe.
pub fn request_stop() {
    RUNNING.store(false, Ordering::SeqCst);
}

pub(crate) fn wall_clock_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Every wakeup the event loop can hand back to the daemon. Timers and
/// fd readiness both route through here; stale tokens (for finished
/// transactions, killed clients, closed connections) fail their lookup
/// and fall through as no-ops.
#[derive(Debug, Clone)]
pub(crate) enum Dispatch {
    DhcpPacket(RequestorId),
    TransactionTimeout { requestor: RequestorId, xid: u32 },
    CommandAccept(usize),
    CommandRead(ConnId),
    MgmtRead(ServerId),
    MgmtReconnect(ServerId),
    ClientRebind { username: String, client: ClientId },
    SyncClients,
}

/// The daemon: one event loop driving the DHCP requestors, the command
/// endpoint, the concentrator channels and the lease tracker.
pub struct Daemon {
    evl: EventLoop<Dispatch>,
    realms: HashMap<String, Rc<Realm>>,
    parser: UsernameParser,
    secret: String,
    sync_interval: Duration,
    requestors: RequestorRegistry,
    servers: Vec<VpnServer>,
    server_ids: HashMap<String, ServerId>,
    clients: ClientRegistry,
    listeners: Vec<CommandListener>,
    peer_filter: PeerFilter,
    conns: HashMap<ConnId, CommandConnection>,
    next_conn_id: u64,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self, VleaseError> {
        let realms = resolve_realms(&config.realms)?;
        let socket_mode = config.cmd_socket_mode()?;
        let mut evl = EventLoop::new()?;

        let mut servers = Vec::new();
        let mut server_ids = HashMap::new();
        for (name, server_config) in &config.servers {
            let id = ServerId(servers.len());
            let mut server = VpnServer::new(
                id,
                name,
                server_config.mgmt_socket.clone(),
            );
            if let Err(e) = server.connect(&mut evl) {
                // Not fatal; the supervisor keeps retrying.
                log::error!("{e}");
            }
            evl.schedule_in(
                RECONNECT_INTERVAL,
                Dispatch::MgmtReconnect(id),
            );
            server_ids.insert(name.clone(), id);
            servers.push(server);
        }

        let mut listeners = Vec::new();
        for path in &config.cmd_sockets {
            let listener = CommandListener::new(path, socket_mode)?;
            evl.register_fd(
                listener.as_raw_fd(),
                Dispatch::CommandAccept(listeners.len()),
            )?;
            listeners.push(listener);
        }

        let mut requestors = RequestorRegistry::new();
        for realm in realms.values() {
            if requestors
                .has(realm.dhcp_listen_device.as_deref(), realm.dhcp_listen_ip)
            {
                // A previous realm already listens there.
                continue;
            }
            let requestor = DhcpRequestor::new(
                realm.dhcp_listen_device.as_deref(),
                realm.dhcp_listen_ip,
                realm.dhcp_local_port,
            )?;
            let fd = requestor.as_raw_fd();
            let id = requestors.add(requestor)?;
            evl.register_fd(fd, Dispatch::DhcpPacket(id))?;
        }

        // First reconciliation runs right away; a restarted daemon picks
        // its clients back up from the concentrators.
        evl.schedule_in(Duration::from_secs(0), Dispatch::SyncClients);

        Ok(Self {
            evl,
            realms,
            parser: UsernameParser::new(config.default_realm.clone()),
            secret: config.secret.clone().unwrap_or_default(),
            sync_interval: Duration::from_secs(config.sync_interval),
            requestors,
            servers,
            server_ids,
            clients: ClientRegistry::new(),
            listeners,
            peer_filter: PeerFilter::new(
                config.cmd_socket_uids.clone(),
                config.cmd_socket_gids.clone(),
            ),
            conns: HashMap::new(),
            next_conn_id: 0,
        })
    }

    /// Run until [request_stop] is called.
    pub fn run(&mut self) -> Result<(), VleaseError> {
        while RUNNING.load(Ordering::SeqCst) {
            let events = self.evl.poll()?;
            for event in events {
                self.dispatch(event);
            }
        }
        log::info!("Exiting on stop request");
        Ok(())
    }

    // One bad packet, command or peer must never take the daemon down;
    // each arm owns its own error handling and only logs.
    fn dispatch(&mut self, event: Dispatch) {
        match event {
            Dispatch::DhcpPacket(id) => {
                let Self {
                    evl, requestors, ..
                } = self;
                let outcome = requestors
                    .get_mut(id)
                    .and_then(|r| r.handle_readable(evl, id));
                if let Some(outcome) = outcome {
                    self.route_outcome(outcome);
                }
            }
            Dispatch::TransactionTimeout { requestor, xid } => {
                let Self {
                    evl, requestors, ..
                } = self;
                let outcome = requestors
                    .get_mut(requestor)
                    .and_then(|r| r.handle_timeout(xid, evl, requestor));
                if let Some(outcome) = outcome {
                    self.route_outcome(outcome);
                }
            }
            Dispatch::CommandAccept(listener) => {
                self.accept_connections(listener);
            }
            Dispatch::CommandRead(conn) => {
                self.handle_command_readable(conn);
            }
            Dispatch::MgmtRead(server) => {
                self.handle_mgmt_readable(server);
            }
            Dispatch::MgmtReconnect(server) => {
                self.handle_mgmt_reconnect(server);
            }
            Dispatch::ClientRebind { username, client } => {
                self.handle_client_rebind(&username, client);
            }
            Dispatch::SyncClients => {
                self.handle_sync_clients();
            }
        }
    }

    fn route_outcome(&mut self, outcome: TxOutcome) {
        match outcome.owner {
            TxOwner::Connect { conn } => {
                self.finish_connect_request(conn, outcome.result);
            }
            TxOwner::Renewal { username, client } => {
                self.finish_renewal(&username, client, outcome.result);
            }
        }
    }

    fn accept_connections(&mut self, listener: usize) {
        loop {
            let stream = match self
                .listeners
                .get(listener)
                .and_then(|l| l.accept())
            {
                Some(stream) => stream,
                None => return,
            };
            if !self.peer_filter.allows(&stream) {
                // Rejection already logged; close without reading.
                continue;
            }
            self.next_conn_id += 1;
            let id = ConnId(self.next_conn_id);
            let conn = match CommandConnection::new(stream) {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!(
                        "Failed to set up command connection: {e}"
                    );
                    continue;
                }
            };
            if let Some(fd) = conn.raw_fd() {
                if let Err(e) =
                    self.evl.register_fd(fd, Dispatch::CommandRead(id))
                {
                    log::error!("{e}");
                    continue;
                }
            }
            self.conns.insert(id, conn);
        }
    }

    fn handle_command_readable(&mut self, id: ConnId) {
        let read = match self.conns.get_mut(&id) {
            Some(conn) => conn.recv(),
            None => return,
        };
        match read {
            CommandRead::Nothing => (),
            CommandRead::Closed => self.connection_closed(id),
            CommandRead::Malformed => self.reply(id, "FAIL"),
            CommandRead::Message(msg, files) => {
                self.process_command(id, msg, files);
            }
        }
    }

    fn connection_closed(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if let Some(stream) = conn.take_stream() {
                if let Err(e) =
                    self.evl.unregister_fd(stream.as_raw_fd())
                {
                    log::debug!("{e}");
                }
            }
            // With a request still in flight the record stays; the
            // outcome handler releases the descriptors (and the status
            // file falls back to FAILED if nothing was written).
            if conn.pending.is_none() {
                self.conns.remove(&id);
            }
        }
    }

    fn reply(&mut self, id: ConnId, status: &str) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.send_reply(status);
        }
    }

    fn process_command(
        &mut self,
        id: ConnId,
        msg: CommandMessage,
        files: Vec<File>,
    ) {
        match msg.cmd.as_str() {
            "request" => self.handle_request_cmd(id, msg, files),
            "disconnect" => self.handle_disconnect_cmd(id, msg),
            other => {
                log::warn!("Received unknown command \"{other}\"");
                self.reply(id, "FAIL");
            }
        }
    }

    fn handle_request_cmd(
        &mut self,
        id: ConnId,
        msg: CommandMessage,
        files: Vec<File>,
    ) {
        let (full_username, ret_idx, config_idx, daemon_name) = match (
            msg.full_username,
            msg.ret_file_idx,
            msg.config_file_idx,
            msg.daemon_name,
        ) {
            (Some(u), Some(r), Some(c), Some(d)) => (u, r, c, d),
            _ => {
                log::warn!(
                    "Command \"request\" is missing a parameter"
                );
                self.reply(id, "FAIL");
                return;
            }
        };

        let mut files: Vec<Option<File>> =
            files.into_iter().map(Some).collect();
        let (ret_file, config_file) =
            match (take_file(&mut files, &ret_idx), take_file(&mut files, &config_idx))
            {
                (Some(ret), Some(config)) => (ret, config),
                _ => {
                    log::warn!(
                        "File descriptor index invalid or out of range"
                    );
                    self.reply(id, "FAIL");
                    return;
                }
            };

        let parsed = match self.parser.parse(&full_username) {
            Some(parsed) => parsed,
            None => {
                log::warn!(
                    "Parsing username failed: \"{full_username}\""
                );
                self.reply(id, "FAIL");
                return;
            }
        };
        let realm = match self.realms.get(&parsed.realm) {
            Some(realm) => Rc::clone(realm),
            None => {
                log::error!("Unknown realm \"{}\"", parsed.realm);
                self.reply(id, "FAIL");
                return;
            }
        };
        let server = match self.server_ids.get(&daemon_name) {
            Some(server) => *server,
            None => {
                log::error!("Unknown server \"{daemon_name}\"");
                self.reply(id, "FAIL");
                return;
            }
        };

        // OK means accepted; the eventual outcome travels through the
        // deferred status file.
        self.reply(id, "OK");
        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.pending.is_some() {
                log::warn!(
                    "Connection already has a request in flight; \
                     dropping the previous one"
                );
            }
            conn.pending = Some(PendingRequest {
                full_username: full_username.clone(),
                realm: Rc::clone(&realm),
                server,
                status_file: DeferredStatusFile::new(ret_file),
                config_file,
            });
        } else {
            return;
        }

        if let Err(e) = self.start_initial_request(id, &realm, &full_username)
        {
            log::error!("Adding a new DHCP request failed: {e}");
            self.finish_connect_request(id, Err(e));
        }
    }

    fn start_initial_request(
        &mut self,
        conn: ConnId,
        realm: &Realm,
        full_username: &str,
    ) -> Result<(), VleaseError> {
        let requestor_id = self
            .requestors
            .get_id(
                realm.dhcp_listen_device.as_deref(),
                realm.dhcp_listen_ip,
            )
            .ok_or_else(|| {
                VleaseError::new(
                    ErrorKind::Bug,
                    format!(
                        "No requestor for realm \"{}\"",
                        realm.name
                    ),
                )
            })?;
        let Self {
            evl, requestors, ..
        } = self;
        let requestor = requestors.get_mut(requestor_id).ok_or_else(|| {
            VleaseError::new(
                ErrorKind::Bug,
                "Requestor id without requestor".to_string(),
            )
        })?;
        let params = TxParams {
            xid: requestor.alloc_xid(),
            owner: TxOwner::Connect { conn },
            local_ip: realm.dhcp_listen_ip,
            server_ips: realm.dhcp_server_ips.clone(),
            client_identifier: full_username.as_bytes().to_vec(),
            target_addr: realm.target_addr(),
            lease_time: realm.expected_dhcp_lease_time,
            start_time: wall_clock_now(),
        };
        requestor.submit(
            DhcpTransaction::new_initial(params),
            evl,
            requestor_id,
        )
    }

    fn handle_disconnect_cmd(&mut self, id: ConnId, msg: CommandMessage) {
        let (full_username, daemon_name) =
            match (msg.full_username, msg.daemon_name) {
                (Some(u), Some(d)) => (u, d),
                _ => {
                    log::warn!(
                        "Command \"disconnect\" is missing a parameter"
                    );
                    self.reply(id, "FAIL");
                    return;
                }
            };
        let server = match self.server_ids.get(&daemon_name) {
            Some(server) => *server,
            None => {
                log::error!("Unknown server \"{daemon_name}\"");
                self.reply(id, "FAIL");
                return;
            }
        };
        self.reply(id, "OK");
        self.clients.client_disconnected(
            &full_username,
            server,
            &mut self.evl,
        );
    }

    /// A connect-time DHCP transaction terminated; settle the hook.
    fn finish_connect_request(
        &mut self,
        conn: ConnId,
        result: Result<DhcpV4Lease, VleaseError>,
    ) {
        let mut pending = match self
            .conns
            .get_mut(&conn)
            .and_then(|c| c.pending.take())
        {
            Some(pending) => pending,
            None => {
                log::debug!(
                    "Dropping DHCP outcome for vanished request"
                );
                return;
            }
        };

        match result {
            Ok(lease) => {
                log::debug!(
                    "DHCP request succeeded for {}",
                    pending.full_username
                );
                if !lease.has_address() {
                    log::error!(
                        "DHCP request failed to provide a valid IP \
                         address for {}",
                        pending.full_username
                    );
                    write_failed(&mut pending);
                } else if !lease.has_lease_times() {
                    log::error!(
                        "DHCP request without lease indication for {}",
                        pending.full_username
                    );
                    write_failed(&mut pending);
                } else {
                    self.settle_successful_request(&mut pending, &lease);
                }
            }
            Err(e) => {
                log::debug!(
                    "DHCP request for {} failed: {e}",
                    pending.full_username
                );
                write_failed(&mut pending);
            }
        }
        drop(pending);

        let idle = self
            .conns
            .get(&conn)
            .map(|c| c.is_idle())
            .unwrap_or(false);
        if idle {
            self.conns.remove(&conn);
        }
    }

    // Config fragment first, fsynced, then the status byte; the hook
    // reads the config only after it sees SUCCEEDED.
    fn settle_successful_request(
        &mut self,
        pending: &mut PendingRequest,
        lease: &DhcpV4Lease,
    ) {
        log::debug!(
            "Writing VPN client configuration for {}",
            pending.full_username
        );
        let text = build_client_config(
            &pending.realm,
            lease,
            &pending.full_username,
            &self.secret,
            &today_string(),
        );
        if let Err(e) = write_config_file(&mut pending.config_file, &text)
        {
            log::error!(
                "Failed to write client configuration for {}: {e}",
                pending.full_username
            );
            write_failed(pending);
            return;
        }
        if let Err(e) = pending.status_file.write_status(true) {
            log::error!(
                "Failed to write deferred status for {}: {e}",
                pending.full_username
            );
            return;
        }

        let (rebinding_time, lease_expiry) =
            match (lease.rebinding_timeout, lease.lease_timeout) {
                (Some(rebinding), Some(expiry)) => (rebinding, expiry),
                // Unreachable: has_lease_times() was checked.
                _ => return,
            };
        self.clients.create(
            &mut self.evl,
            Rc::clone(&pending.realm),
            pending.server,
            &pending.full_username,
            lease.ip_address,
            rebinding_time,
            Some(lease_expiry),
        );
    }

    fn handle_mgmt_readable(&mut self, server_id: ServerId) {
        let events = {
            let Self { evl, servers, .. } = self;
            match servers.get_mut(server_id.0) {
                Some(server) => server.handle_readable(evl),
                None => return,
            }
        };
        for event in events {
            match event {
                MgmtEvent::ClientList(entries) => {
                    let Self {
                        evl,
                        servers,
                        clients,
                        realms,
                        parser,
                        ..
                    } = self;
                    let mut ctx = SyncCtx {
                        evl,
                        servers,
                        realms,
                        parser,
                    };
                    clients.sync_with(server_id, &entries, &mut ctx);
                }
                MgmtEvent::KillResult {
                    common_name,
                    success,
                } => {
                    log::debug!(
                        "Kill of {common_name} completed: {}",
                        if success { "success" } else { "error" }
                    );
                }
                MgmtEvent::Disconnected => {
                    log::debug!(
                        "Management channel lost; supervisor will \
                         reconnect"
                    );
                }
            }
        }
    }

    fn handle_mgmt_reconnect(&mut self, server_id: ServerId) {
        {
            let Self { evl, servers, .. } = self;
            if let Some(server) = servers.get_mut(server_id.0) {
                if !server.connected() {
                    if let Err(e) = server.connect(evl) {
                        log::debug!("{e}");
                    }
                }
            }
        }
        self.evl
            .schedule_in(RECONNECT_INTERVAL, Dispatch::MgmtReconnect(server_id));
    }

    /// Rebind timer fired for a tracked client: refresh its lease, or
    /// give up on the client when the lease is already gone.
    fn handle_client_rebind(&mut self, username: &str, client: ClientId) {
        let now = wall_clock_now();
        let (realm, server, leased_ip, lease_expiry) = match self
            .clients
            .get_current_mut(username, client)
        {
            Some(record) => (
                Rc::clone(&record.realm),
                record.server,
                record.leased_ip,
                record.lease_expiry,
            ),
            None => return,
        };

        if let Some(expiry) = lease_expiry {
            if expiry <= now {
                log::warn!(
                    "Rebinding timeout for {username} called too late \
                     - lease has already expired on {expiry}. \
                     Disconnecting client.",
                );
                // The record itself stays; the concentrator sync reaps
                // it once the kill took effect.
                self.mgmt_disconnect(server, username);
                return;
            }
        }

        if let Err(e) = self.start_refresh_request(
            username,
            client,
            &realm,
            leased_ip,
            now,
        ) {
            log::error!(
                "Adding a new DHCP refresh request failed: {e}"
            );
            self.mgmt_disconnect(server, username);
        }
    }

    fn start_refresh_request(
        &mut self,
        username: &str,
        client: ClientId,
        realm: &Realm,
        leased_ip: std::net::Ipv4Addr,
        start_time: u64,
    ) -> Result<(), VleaseError> {
        let requestor_id = self
            .requestors
            .get_id(
                realm.dhcp_listen_device.as_deref(),
                realm.dhcp_listen_ip,
            )
            .ok_or_else(|| {
                VleaseError::new(
                    ErrorKind::Bug,
                    format!(
                        "No requestor for realm \"{}\"",
                        realm.name
                    ),
                )
            })?;
        let Self {
            evl, requestors, ..
        } = self;
        let requestor = requestors.get_mut(requestor_id).ok_or_else(|| {
            VleaseError::new(
                ErrorKind::Bug,
                "Requestor id without requestor".to_string(),
            )
        })?;
        let params = TxParams {
            xid: requestor.alloc_xid(),
            owner: TxOwner::Renewal {
                username: username.to_string(),
                client,
            },
            local_ip: realm.dhcp_listen_ip,
            server_ips: realm.dhcp_server_ips.clone(),
            client_identifier: username.as_bytes().to_vec(),
            target_addr: None,
            lease_time: realm.expected_dhcp_lease_time,
            start_time,
        };
        requestor.submit(
            DhcpTransaction::new_refresh(params, leased_ip),
            evl,
            requestor_id,
        )
    }

    fn finish_renewal(
        &mut self,
        username: &str,
        client: ClientId,
        result: Result<DhcpV4Lease, VleaseError>,
    ) {
        match result {
            Ok(lease) => match (lease.rebinding_timeout, lease.lease_timeout)
            {
                (Some(rebinding_time), Some(expiry)) => {
                    log::debug!(
                        "DHCP refresh request for {username} succeeded"
                    );
                    let Self { evl, clients, .. } = self;
                    clients.lease_refreshed(
                        evl,
                        username,
                        client,
                        lease.ip_address,
                        rebinding_time,
                        Some(expiry),
                    );
                }
                _ => {
                    log::warn!(
                        "DHCP refresh for {username} lacked lease \
                         times; disconnecting"
                    );
                    self.renewal_failed(username, client);
                }
            },
            Err(e) => {
                log::debug!(
                    "DHCP refresh request for {username} failed: {e}"
                );
                self.renewal_failed(username, client);
            }
        }
    }

    // The lease obviously has no chance of remaining established; the
    // record stays until the concentrator confirms the kill or the next
    // sync reaps it.
    fn renewal_failed(&mut self, username: &str, client: ClientId) {
        let server = match self.clients.get_current_mut(username, client)
        {
            Some(record) => record.server,
            None => return,
        };
        self.mgmt_disconnect(server, username);
    }

    fn mgmt_disconnect(&mut self, server: ServerId, username: &str) {
        let Self { evl, servers, .. } = self;
        if let Some(server) = servers.get_mut(server.0) {
            server.disconnect_client(username, evl);
        }
    }

    fn handle_sync_clients(&mut self) {
        log::debug!("Syncing client lists with all concentrators");
        {
            let Self { evl, servers, .. } = self;
            for server in servers.iter_mut() {
                server.poll_client_list(evl);
            }
        }
        self.evl
            .schedule_in(self.sync_interval, Dispatch::SyncClients);
    }
}

fn take_file(files: &mut [Option<File>], idx: &str) -> Option<File> {
    let idx: usize = idx.parse().ok()?;
    files.get_mut(idx)?.take()
}

fn write_config_file(
    file: &mut File,
    text: &str,
) -> Result<(), VleaseError> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn write_failed(pending: &mut PendingRequest) {
    if let Err(e) = pending.status_file.write_status(false) {
        log::debug!(
            "Failed to write deferred failure status for {}: {e}",
            pending.full_username
        );
    }
}
