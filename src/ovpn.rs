// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::{
    daemon::Dispatch, event::EventLoop, ErrorKind, VleaseError,
};

/// How often the supervisor retries a lost management connection.
pub(crate) const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub(crate) struct ServerId(pub(crate) usize);

/// One row of the concentrator's client list.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct ClientEntry {
    pub(crate) common_name: String,
    /// `None` while the connection is not fully established yet.
    pub(crate) virtual_address: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub(crate) enum MgmtEvent {
    ClientList(Vec<ClientEntry>),
    KillResult {
        common_name: String,
        success: bool,
    },
    Disconnected,
}

#[derive(Debug)]
enum MgmtCmd {
    ListClients,
    Kill(String),
}

// The channel runs strictly one command at a time; while a command's
// response is pending, every inbound line belongs to it.
#[derive(Debug)]
enum MgmtState {
    WaitHello,
    Idle,
    AwaitList(Vec<ClientEntry>),
    AwaitKill(String),
}

enum FeedOutcome {
    Nothing,
    Event(MgmtEvent),
    Close,
}

/// One VPN concentrator and its line-oriented management channel.
/// Connection loss is recoverable; all pending command state dies with
/// the connection.
#[derive(Debug)]
pub(crate) struct VpnServer {
    id: ServerId,
    name: String,
    socket_path: PathBuf,
    stream: Option<UnixStream>,
    rx: Vec<u8>,
    state: MgmtState,
    queue: VecDeque<MgmtCmd>,
}

impl VpnServer {
    pub(crate) fn new(
        id: ServerId,
        name: &str,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            socket_path,
            stream: None,
            rx: Vec::new(),
            state: MgmtState::Idle,
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn connected(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn connect(
        &mut self,
        evl: &mut EventLoop<Dispatch>,
    ) -> Result<(), VleaseError> {
        if self.connected() {
            log::debug!(
                "Replacing connection to management console of \"{}\"",
                self.name
            );
            self.disconnect(evl);
        }
        let stream =
            UnixStream::connect(&self.socket_path).map_err(|e| {
                VleaseError::new(
                    ErrorKind::NotConnected,
                    format!(
                        "Connection to VPN server \"{}\" at {} failed: {e}",
                        self.name,
                        self.socket_path.display()
                    ),
                )
            })?;
        self.attach(stream, evl)?;
        log::debug!(
            "Connected to VPN server \"{}\" at \"{}\"",
            self.name,
            self.socket_path.display()
        );
        Ok(())
    }

    fn attach(
        &mut self,
        stream: UnixStream,
        evl: &mut EventLoop<Dispatch>,
    ) -> Result<(), VleaseError> {
        stream.set_nonblocking(true)?;
        evl.register_fd(stream.as_raw_fd(), Dispatch::MgmtRead(self.id))?;
        self.stream = Some(stream);
        self.rx.clear();
        self.state = MgmtState::WaitHello;
        Ok(())
    }

    pub(crate) fn disconnect(&mut self, evl: &mut EventLoop<Dispatch>) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = evl.unregister_fd(stream.as_raw_fd()) {
                log::debug!(
                    "Failed to unregister management socket of \"{}\": {e}",
                    self.name
                );
            }
        }
        self.state = MgmtState::Idle;
        self.queue.clear();
        self.rx.clear();
    }

    /// Ask the concentrator for its authoritative client list. The reply
    /// arrives later as [MgmtEvent::ClientList].
    pub(crate) fn poll_client_list(
        &mut self,
        evl: &mut EventLoop<Dispatch>,
    ) {
        if !self.connected() {
            log::debug!(
                "Ignoring poll_client_list call, as \"{}\" has no \
                 active management connection",
                self.name
            );
            return;
        }
        log::debug!(
            "Polling user list from VPN server \"{}\"",
            self.name
        );
        self.queue.push_back(MgmtCmd::ListClients);
        self.pump(evl);
    }

    /// Disconnect the named client from the concentrator. Silently
    /// dropped while the management channel is down; the next sync
    /// sorts the registry out.
    pub(crate) fn disconnect_client(
        &mut self,
        common_name: &str,
        evl: &mut EventLoop<Dispatch>,
    ) {
        if !self.connected() {
            log::debug!(
                "Ignoring disconnect_client call, as \"{}\" has no \
                 active management connection",
                self.name
            );
            return;
        }
        log::debug!(
            "Disconnecting client {} from VPN server \"{}\"",
            common_name,
            self.name
        );
        self.queue
            .push_back(MgmtCmd::Kill(common_name.to_string()));
        self.pump(evl);
    }

    fn pump(&mut self, evl: &mut EventLoop<Dispatch>) {
        while matches!(self.state, MgmtState::Idle) {
            let cmd = match self.queue.pop_front() {
                Some(cmd) => cmd,
                None => return,
            };
            let (line, next_state) = match cmd {
                MgmtCmd::ListClients => (
                    "status 2".to_string(),
                    MgmtState::AwaitList(Vec::new()),
                ),
                MgmtCmd::Kill(name) => (
                    format!("kill \"{name}\""),
                    MgmtState::AwaitKill(name),
                ),
            };
            if self.send_line(&line) {
                self.state = next_state;
            } else {
                self.disconnect(evl);
                return;
            }
        }
    }

    fn send_line(&mut self, line: &str) -> bool {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false,
        };
        let wire = format!("{}\n", line.replace('\n', "\\n"));
        match stream.write_all(wire.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "Management socket of \"{}\" was unexpectedly \
                     closed: {e}",
                    self.name
                );
                false
            }
        }
    }

    pub(crate) fn handle_readable(
        &mut self,
        evl: &mut EventLoop<Dispatch>,
    ) -> Vec<MgmtEvent> {
        let mut events = Vec::new();
        let mut closed = false;
        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return events,
            };
            let mut buf = [0u8; 4096];
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::error!(
                        "Received EOF on management socket of \"{}\"",
                        self.name
                    );
                    closed = true;
                    break;
                }
                Ok(n) => self.rx.extend_from_slice(&buf[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(e) => {
                    log::error!(
                        "Read on management socket of \"{}\" failed: {e}",
                        self.name
                    );
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            self.disconnect(evl);
            events.push(MgmtEvent::Disconnected);
            return events;
        }

        while let Some(pos) = self.rx.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.rx.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            match self.feed_line(line) {
                FeedOutcome::Nothing => (),
                FeedOutcome::Event(event) => events.push(event),
                FeedOutcome::Close => {
                    self.disconnect(evl);
                    events.push(MgmtEvent::Disconnected);
                    return events;
                }
            }
        }
        self.pump(evl);
        events
    }

    fn feed_line(&mut self, line: &str) -> FeedOutcome {
        match &mut self.state {
            MgmtState::WaitHello => {
                if line.starts_with(">INFO:") {
                    log::debug!(
                        "Connected to VPN server \"{}\"",
                        self.name
                    );
                    self.state = MgmtState::Idle;
                    FeedOutcome::Nothing
                } else {
                    log::error!(
                        "Connection to VPN server \"{}\" failed: \
                         \"{line}\"",
                        self.name
                    );
                    FeedOutcome::Close
                }
            }
            // Unsolicited notifications outside a command are ignored.
            MgmtState::Idle => FeedOutcome::Nothing,
            MgmtState::AwaitList(entries) => {
                if line.starts_with("CLIENT_LIST,") {
                    if let Some(entry) = parse_client_line(line) {
                        entries.push(entry);
                    }
                    FeedOutcome::Nothing
                } else if line == "END" {
                    let entries = std::mem::take(entries);
                    self.state = MgmtState::Idle;
                    FeedOutcome::Event(MgmtEvent::ClientList(entries))
                } else {
                    FeedOutcome::Nothing
                }
            }
            MgmtState::AwaitKill(common_name) => {
                let success = if line.starts_with("SUCCESS:") {
                    Some(true)
                } else if line.starts_with("ERROR:") {
                    Some(false)
                } else {
                    None
                };
                match success {
                    Some(success) => {
                        let common_name = std::mem::take(common_name);
                        self.state = MgmtState::Idle;
                        FeedOutcome::Event(MgmtEvent::KillResult {
                            common_name,
                            success,
                        })
                    }
                    None => FeedOutcome::Nothing,
                }
            }
        }
    }
}

// CLIENT_LIST,<common_name>,<real_address>,<virtual_address>,...
fn parse_client_line(line: &str) -> Option<ClientEntry> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 4 {
        log::debug!("Ignoring malformed client list line: \"{line}\"");
        return None;
    }
    let virtual_address = if fields[3].is_empty() {
        None
    } else {
        match fields[3].parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                log::debug!(
                    "Ignoring non-IPv4 virtual address \"{}\" of \
                     client \"{}\"",
                    fields[3],
                    fields[1]
                );
                None
            }
        }
    };
    Some(ClientEntry {
        common_name: fields[1].to_string(),
        virtual_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRig {
        evl: EventLoop<Dispatch>,
        server: VpnServer,
        peer: UnixStream,
    }

    fn rig() -> TestRig {
        let mut evl = EventLoop::new().unwrap();
        let mut server = VpnServer::new(
            ServerId(0),
            "vpn1",
            PathBuf::from("/nonexistent.sock"),
        );
        let (ours, peer) = UnixStream::pair().unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        server.attach(ours, &mut evl).unwrap();
        TestRig { evl, server, peer }
    }

    fn feed(rig: &mut TestRig, data: &str) -> Vec<MgmtEvent> {
        rig.peer.write_all(data.as_bytes()).unwrap();
        rig.server.handle_readable(&mut rig.evl)
    }

    fn read_peer(rig: &mut TestRig) -> String {
        let mut buf = [0u8; 1024];
        let n = rig.peer.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[test]
    fn test_hello_then_client_list() {
        let mut rig = rig();
        assert!(feed(&mut rig, ">INFO:OpenVPN Management\n").is_empty());

        rig.server.poll_client_list(&mut rig.evl);
        assert_eq!(read_peer(&mut rig), "status 2\n");

        let events = feed(
            &mut rig,
            "TITLE,OpenVPN\n\
             CLIENT_LIST,alice@corp,192.0.2.9:4711,10.1.2.3,0,0\n\
             CLIENT_LIST,bob@corp,192.0.2.10:4712,,0,0\n\
             END\n",
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            MgmtEvent::ClientList(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].common_name, "alice@corp");
                assert_eq!(
                    entries[0].virtual_address,
                    Some(Ipv4Addr::new(10, 1, 2, 3))
                );
                assert_eq!(entries[1].common_name, "bob@corp");
                assert_eq!(entries[1].virtual_address, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_kill_flow_and_command_ordering() {
        let mut rig = rig();
        feed(&mut rig, ">INFO:hi\n");

        rig.server.disconnect_client("alice@corp", &mut rig.evl);
        rig.server.poll_client_list(&mut rig.evl);
        // Only the kill is on the wire; the list command waits for the
        // kill response.
        assert_eq!(read_peer(&mut rig), "kill \"alice@corp\"\n");

        let events = feed(&mut rig, "SUCCESS: killed\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            MgmtEvent::KillResult { success: true, .. }
        ));
        // Completing the kill unblocks the queued list command.
        assert_eq!(read_peer(&mut rig), "status 2\n");
    }

    #[test]
    fn test_kill_while_disconnected_is_swallowed() {
        let mut evl = EventLoop::new().unwrap();
        let mut server = VpnServer::new(
            ServerId(0),
            "vpn1",
            PathBuf::from("/nonexistent.sock"),
        );
        server.disconnect_client("alice@corp", &mut evl);
        assert!(server.queue.is_empty());
    }

    #[test]
    fn test_bad_hello_disconnects() {
        let mut rig = rig();
        let events = feed(&mut rig, "garbage\n");
        assert!(matches!(events[0], MgmtEvent::Disconnected));
        assert!(!rig.server.connected());
    }

    #[test]
    fn test_eof_discards_pending_state() {
        let mut rig = rig();
        feed(&mut rig, ">INFO:hi\n");
        rig.server.poll_client_list(&mut rig.evl);
        drop(std::mem::replace(&mut rig.peer, UnixStream::pair().unwrap().0));
        let events = rig.server.handle_readable(&mut rig.evl);
        assert!(matches!(events[0], MgmtEvent::Disconnected));
        assert!(rig.server.queue.is_empty());
        assert!(!rig.server.connected());
    }
}
