// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::ffi::CString;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use nix::errno::Errno;

use crate::{
    daemon::Dispatch,
    event::EventLoop,
    msg::DhcpV4Message,
    transaction::{DhcpTransaction, TxCtx, TxOutcome, TxStep},
    DhcpV4MessageType, ErrorKind, VleaseError,
};

// Large enough for any DHCP reply we are willing to look at.
const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub(crate) struct RequestorId(pub(crate) usize);

/// Where transactions put their packets. The production implementation
/// wraps the requestor's UDP socket; tests record instead of sending.
pub(crate) trait PacketSink {
    fn send_packet(
        &mut self,
        packet: &DhcpV4Message,
        dst: SocketAddrV4,
    ) -> Result<(), VleaseError>;
}

struct UdpSink<'a> {
    socket: &'a UdpSocket,
}

impl PacketSink for UdpSink<'_> {
    fn send_packet(
        &mut self,
        packet: &DhcpV4Message,
        dst: SocketAddrV4,
    ) -> Result<(), VleaseError> {
        self.socket.send_to(&packet.emit(), dst).map_err(|e| {
            VleaseError::new(
                ErrorKind::Bug,
                format!("Failed to send DHCP packet to {dst}: {e}"),
            )
        })?;
        Ok(())
    }
}

/// One UDP listener for DHCP replies on a (device?, local IP, port)
/// triple. Owns every live transaction started through it, keyed by XID;
/// inbound packets are matched on XID and handed to their transaction.
#[derive(Debug)]
pub(crate) struct DhcpRequestor {
    listen_device: Option<String>,
    listen_address: Ipv4Addr,
    listen_port: u16,
    socket: UdpSocket,
    requests: HashMap<u32, DhcpTransaction>,
}

impl AsRawFd for DhcpRequestor {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl DhcpRequestor {
    pub(crate) fn new(
        listen_device: Option<&str>,
        listen_address: Ipv4Addr,
        listen_port: u16,
    ) -> Result<Self, VleaseError> {
        let socket =
            create_udp_socket(listen_device, listen_address, listen_port)?;
        log::debug!(
            "Listening on {}:{}@{} for DHCP responses",
            listen_address,
            listen_port,
            listen_device.unwrap_or("*"),
        );
        Ok(Self {
            listen_device: listen_device.map(str::to_string),
            listen_address,
            listen_port,
            socket,
            requests: HashMap::new(),
        })
    }

    pub(crate) fn listen_device(&self) -> Option<&str> {
        self.listen_device.as_deref()
    }

    pub(crate) fn listen_address(&self) -> Ipv4Addr {
        self.listen_address
    }

    /// Allocate a transaction ID unique among this requestor's live
    /// transactions. Collisions are astronomically unlikely but cheap to
    /// rule out.
    pub(crate) fn alloc_xid(&self) -> u32 {
        loop {
            let xid: u32 = rand::random();
            if !self.requests.contains_key(&xid) {
                return xid;
            }
        }
    }

    /// Send the transaction's first packet and track it by XID.
    pub(crate) fn submit(
        &mut self,
        mut tx: DhcpTransaction,
        evl: &mut EventLoop<Dispatch>,
        id: RequestorId,
    ) -> Result<(), VleaseError> {
        let mut sink = UdpSink {
            socket: &self.socket,
        };
        let mut ctx = TxCtx {
            evl,
            requestor: id,
            sink: &mut sink,
        };
        tx.start(&mut ctx)?;
        log::debug!("Adding xid {}", tx.xid());
        self.requests.insert(tx.xid(), tx);
        Ok(())
    }

    /// Read one waiting datagram and route it to the transaction with the
    /// matching XID. A bad packet must never take the socket down, so all
    /// parse problems end here with a debug log.
    pub(crate) fn handle_readable(
        &mut self,
        evl: &mut EventLoop<Dispatch>,
        id: RequestorId,
    ) -> Option<TxOutcome> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, src) = match self.socket.recv_from(&mut buf) {
            Ok(ret) => ret,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return None;
            }
            Err(e) => {
                log::error!(
                    "Failed to receive on {}:{}: {e}",
                    self.listen_address,
                    self.listen_port
                );
                return None;
            }
        };
        let src = match src {
            SocketAddr::V4(src) => src,
            SocketAddr::V6(src) => {
                log::debug!("Ignoring packet from IPv6 source {src}");
                return None;
            }
        };
        let msg = match DhcpV4Message::parse(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Ignoring invalid packet from {src}: {e}");
                return None;
            }
        };
        let msg_type = match msg.message_type() {
            Some(t) => t,
            None => {
                log::debug!("Ignoring packet without DHCP message type");
                return None;
            }
        };
        if !matches!(
            msg_type,
            DhcpV4MessageType::Offer
                | DhcpV4MessageType::Ack
                | DhcpV4MessageType::Nack
        ) {
            log::debug!(
                "Ignoring packet of unexpected DHCP type {msg_type}"
            );
            return None;
        }
        let mut tx = match self.requests.remove(&msg.xid) {
            Some(tx) => tx,
            None => {
                log::debug!("Ignoring answer with xid {}", msg.xid);
                return None;
            }
        };
        let mut sink = UdpSink {
            socket: &self.socket,
        };
        let mut ctx = TxCtx {
            evl,
            requestor: id,
            sink: &mut sink,
        };
        let step = match msg_type {
            DhcpV4MessageType::Offer => {
                tx.handle_offer(&msg, src, &mut ctx)
            }
            DhcpV4MessageType::Ack => tx.handle_ack(&msg, src, &mut ctx),
            DhcpV4MessageType::Nack => tx.handle_nack(&msg, src, &mut ctx),
            _ => TxStep::Continue,
        };
        match step {
            TxStep::Continue => {
                self.requests.insert(tx.xid(), tx);
                None
            }
            TxStep::Done(outcome) => {
                log::debug!("Deleting xid {}", tx.xid());
                Some(outcome)
            }
        }
    }

    /// Retransmission timer for one transaction fired. An unknown XID
    /// means the transaction already terminated; the timer is stale.
    pub(crate) fn handle_timeout(
        &mut self,
        xid: u32,
        evl: &mut EventLoop<Dispatch>,
        id: RequestorId,
    ) -> Option<TxOutcome> {
        let mut tx = self.requests.remove(&xid)?;
        let mut sink = UdpSink {
            socket: &self.socket,
        };
        let mut ctx = TxCtx {
            evl,
            requestor: id,
            sink: &mut sink,
        };
        match tx.handle_timeout(&mut ctx) {
            TxStep::Continue => {
                self.requests.insert(tx.xid(), tx);
                None
            }
            TxStep::Done(outcome) => {
                log::debug!("Deleting xid {xid}");
                Some(outcome)
            }
        }
    }
}

/// All requestors, indexed by their listen pair. Realms sharing a
/// listener share the requestor.
#[derive(Debug, Default)]
pub(crate) struct RequestorRegistry {
    requestors: Vec<DhcpRequestor>,
    by_listen: HashMap<(Option<String>, Ipv4Addr), RequestorId>,
}

impl RequestorRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn has(
        &self,
        device: Option<&str>,
        local_ip: Ipv4Addr,
    ) -> bool {
        self.by_listen
            .contains_key(&(device.map(str::to_string), local_ip))
    }

    pub(crate) fn get_id(
        &self,
        device: Option<&str>,
        local_ip: Ipv4Addr,
    ) -> Option<RequestorId> {
        let ret = self
            .by_listen
            .get(&(device.map(str::to_string), local_ip))
            .copied();
        if ret.is_none() {
            log::error!(
                "Request for unsupported local IP {}@{}",
                local_ip,
                device.unwrap_or("*")
            );
        }
        ret
    }

    pub(crate) fn add(
        &mut self,
        requestor: DhcpRequestor,
    ) -> Result<RequestorId, VleaseError> {
        let key = (
            requestor.listen_device().map(str::to_string),
            requestor.listen_address(),
        );
        if self.by_listen.contains_key(&key) {
            let e = VleaseError::new(
                ErrorKind::InvalidArgument,
                format!(
                    "Attempt to listen on IP {}@{} multiple times",
                    requestor.listen_address(),
                    requestor.listen_device().unwrap_or("*")
                ),
            );
            log::error!("{e}");
            return Err(e);
        }
        let id = RequestorId(self.requestors.len());
        self.requestors.push(requestor);
        self.by_listen.insert(key, id);
        Ok(id)
    }

    pub(crate) fn get_mut(
        &mut self,
        id: RequestorId,
    ) -> Option<&mut DhcpRequestor> {
        self.requestors.get_mut(id.0)
    }

    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = (RequestorId, &DhcpRequestor)> {
        self.requestors
            .iter()
            .enumerate()
            .map(|(i, r)| (RequestorId(i), r))
    }
}

fn create_udp_socket(
    listen_device: Option<&str>,
    listen_address: Ipv4Addr,
    listen_port: u16,
) -> Result<UdpSocket, VleaseError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(VleaseError::new(
            ErrorKind::Bug,
            format!("Failed to create UDP socket: {}", Errno::last()),
        ));
    }
    // Takes ownership; closes the fd on every error path below.
    let socket = unsafe { UdpSocket::from_raw_fd(fd) };

    set_reuse_addr(fd)?;
    if let Some(device) = listen_device {
        bind_socket_to_iface(fd, device)?;
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = listen_port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(listen_address).to_be(),
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let errno = Errno::last();
        let kind = if errno == Errno::EADDRNOTAVAIL {
            ErrorKind::AddressNotAvailable
        } else {
            ErrorKind::BindFailed
        };
        return Err(VleaseError::new(
            kind,
            format!(
                "Could not bind to DHCP listening address {}:{}@{}: \
                 {errno}",
                listen_address,
                listen_port,
                listen_device.unwrap_or("*"),
            ),
        ));
    }
    Ok(socket)
}

fn set_reuse_addr(fd: RawFd) -> Result<(), VleaseError> {
    let flag: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &flag as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(VleaseError::new(
            ErrorKind::Bug,
            format!(
                "Failed to set SO_REUSEADDR on socket {fd}: {}",
                Errno::last()
            ),
        ));
    }
    Ok(())
}

fn bind_socket_to_iface(
    fd: RawFd,
    iface_name: &str,
) -> Result<(), VleaseError> {
    let iface_name_cstr = CString::new(iface_name)?;

    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            iface_name_cstr.as_ptr() as *const libc::c_void,
            iface_name_cstr.as_bytes_with_nul().len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(VleaseError::new(
            ErrorKind::Bug,
            format!(
                "Failed to bind socket to interface {iface_name}: {}",
                Errno::last(),
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxOwner, TxParams};
    use crate::command::ConnId;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn params(xid: u32) -> TxParams {
        TxParams {
            xid,
            owner: TxOwner::Connect { conn: ConnId(1) },
            local_ip: LOCALHOST,
            server_ips: vec![LOCALHOST],
            client_identifier: b"alice@corp".to_vec(),
            target_addr: None,
            lease_time: None,
            start_time: 1_580_000_000,
        }
    }

    #[test]
    fn test_unknown_xid_leaves_registry_unchanged() {
        let mut evl: EventLoop<Dispatch> = EventLoop::new().unwrap();
        let mut requestor =
            DhcpRequestor::new(None, LOCALHOST, 0).unwrap();
        let id = RequestorId(0);

        let xid = requestor.alloc_xid();
        let tx = DhcpTransaction::new_initial(params(xid));
        requestor.submit(tx, &mut evl, id).unwrap();
        assert_eq!(requestor.requests.len(), 1);

        // A reply carrying an unknown XID from the right server.
        let mut reply = DhcpV4Message {
            op: 2,
            xid: xid.wrapping_add(1),
            yiaddr: Ipv4Addr::new(10, 1, 2, 3),
            ..Default::default()
        };
        reply.options.insert(
            crate::option::OPT_MESSAGE_TYPE,
            vec![DhcpV4MessageType::Offer as u8],
        );
        let port = requestor.socket.local_addr().unwrap().port();
        let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        sender
            .send_to(&reply.emit(), (LOCALHOST, port))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert!(requestor.handle_readable(&mut evl, id).is_none());
        assert_eq!(requestor.requests.len(), 1);
        assert!(requestor.requests.contains_key(&xid));
    }

    #[test]
    fn test_stale_timeout_is_a_no_op() {
        let mut evl: EventLoop<Dispatch> = EventLoop::new().unwrap();
        let mut requestor =
            DhcpRequestor::new(None, LOCALHOST, 0).unwrap();
        assert!(requestor
            .handle_timeout(42, &mut evl, RequestorId(0))
            .is_none());
    }

    #[test]
    fn test_registry_rejects_duplicate_listen_pair() {
        let mut registry = RequestorRegistry::new();
        let first = DhcpRequestor::new(None, LOCALHOST, 0).unwrap();
        let second = DhcpRequestor::new(None, LOCALHOST, 0).unwrap();
        // Both are bound to an ephemeral port, but the registry keys on
        // the configured listen pair only.
        let id = registry.add(first).unwrap();
        assert!(registry.has(None, LOCALHOST));
        assert_eq!(registry.get_id(None, LOCALHOST), Some(id));
        assert!(registry.add(second).is_err());
        assert!(registry.get_id(Some("eth9"), LOCALHOST).is_none());
    }

    #[test]
    fn test_alloc_xid_avoids_live_transactions() {
        let mut evl: EventLoop<Dispatch> = EventLoop::new().unwrap();
        let mut requestor =
            DhcpRequestor::new(None, LOCALHOST, 0).unwrap();
        let xid = requestor.alloc_xid();
        let tx = DhcpTransaction::new_initial(params(xid));
        requestor.submit(tx, &mut evl, RequestorId(0)).unwrap();
        for _ in 0..32 {
            assert_ne!(requestor.alloc_xid(), xid);
        }
    }
}
