// SPDX-License-Identifier: Apache-2.0

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;

use crate::{
    clients::ClientId,
    command::ConnId,
    daemon::Dispatch,
    event::{EventLoop, TimerHandle},
    lease::DhcpV4Lease,
    option::{
        link_selection_suboption, OPT_CLASSLESS_STATIC_ROUTE,
        OPT_CLIENT_IDENTIFIER, OPT_DOMAIN_NAME, OPT_DOMAIN_NAME_SERVER,
        OPT_IP_ADDRESS_LEASE_TIME, OPT_MESSAGE_TYPE,
        OPT_PARAMETER_REQUEST_LIST, OPT_REBINDING_TIME, OPT_RENEWAL_TIME,
        OPT_REQUESTED_IP_ADDRESS, OPT_ROUTER, OPT_SERVER_IDENTIFIER,
        OPT_SUBNET_MASK,
    },
    requestor::{PacketSink, RequestorId},
    DhcpV4Message, DhcpV4MessageType, ErrorKind, VleaseError,
};

pub(crate) const DHCP_SERVER_PORT: u16 = 67;

const DEFAULT_TIMEOUT_SECONDS: u32 = 4;
const DEFAULT_MAX_RETRIES: u32 = 3;

// 'classless_static_route' must be requested before 'router', so servers
// honoring RFC 3442 know to suppress the router option.
const PARAMETER_REQUEST_LIST: [u8; 7] = [
    OPT_SUBNET_MASK,
    OPT_CLASSLESS_STATIC_ROUTE,
    OPT_ROUTER,
    OPT_DOMAIN_NAME_SERVER,
    OPT_DOMAIN_NAME,
    OPT_RENEWAL_TIME,
    OPT_REBINDING_TIME,
];

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum TxState {
    Discover,
    Request,
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "discover"),
            Self::Request => write!(f, "request"),
        }
    }
}

/// Who asked for this transaction; the terminal outcome is routed back to
/// it. A plain value rather than a callback so a terminated owner simply
/// fails the lookup (see the registry modules).
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum TxOwner {
    Connect { conn: ConnId },
    Renewal { username: String, client: ClientId },
}

#[derive(Debug)]
pub(crate) struct TxOutcome {
    pub(crate) owner: TxOwner,
    pub(crate) result: Result<DhcpV4Lease, VleaseError>,
}

#[derive(Debug)]
pub(crate) enum TxStep {
    Continue,
    Done(TxOutcome),
}

/// Everything a transaction needs from its surroundings to make progress:
/// the timer queue, the owning requestor's identity for timer routing, and
/// a way to put packets on the wire.
pub(crate) struct TxCtx<'a> {
    pub(crate) evl: &'a mut EventLoop<Dispatch>,
    pub(crate) requestor: RequestorId,
    pub(crate) sink: &'a mut dyn PacketSink,
}

#[derive(Debug, Clone)]
pub(crate) struct TxParams {
    pub(crate) xid: u32,
    pub(crate) owner: TxOwner,
    pub(crate) local_ip: Ipv4Addr,
    pub(crate) server_ips: Vec<Ipv4Addr>,
    pub(crate) client_identifier: Vec<u8>,
    pub(crate) target_addr: Option<Ipv4Addr>,
    pub(crate) lease_time: Option<u32>,
    pub(crate) start_time: u64,
}

/// One in-flight DHCP address acquisition, impersonating a relay.
/// Initial transactions walk DISCOVER, OFFER, REQUEST, ACK/NACK;
/// refresh transactions start directly at REQUEST carrying the
/// currently leased address.
#[derive(Debug)]
pub(crate) struct DhcpTransaction {
    xid: u32,
    state: TxState,
    server_ips: Vec<Ipv4Addr>,
    local_ip: Ipv4Addr,
    target_addr: Option<Ipv4Addr>,
    client_identifier: Vec<u8>,
    lease_time: Option<u32>,
    start_time: u64,
    timeout: u32,
    retries: u32,
    max_retries: u32,
    last_packet: Option<DhcpV4Message>,
    timer: Option<TimerHandle>,
    owner: TxOwner,
}

impl DhcpTransaction {
    fn new(params: TxParams, state: TxState) -> Self {
        Self {
            xid: params.xid,
            state,
            server_ips: params.server_ips,
            local_ip: params.local_ip,
            target_addr: params.target_addr,
            client_identifier: params.client_identifier,
            lease_time: params.lease_time,
            start_time: params.start_time,
            timeout: DEFAULT_TIMEOUT_SECONDS,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_packet: None,
            timer: None,
            owner: params.owner,
        }
    }

    pub(crate) fn new_initial(params: TxParams) -> Self {
        let ret = Self::new(params, TxState::Discover);
        log::debug!("Initial request with xid {} created", ret.xid);
        ret
    }

    pub(crate) fn new_refresh(
        params: TxParams,
        client_ip: Ipv4Addr,
    ) -> Self {
        let mut ret = Self::new(params, TxState::Request);
        log::debug!("Refresh request with xid {} created", ret.xid);
        ret.last_packet = Some(ret.build_refresh_request(client_ip));
        ret
    }

    pub(crate) fn xid(&self) -> u32 {
        self.xid
    }

    /// Send the first packet and arm the retransmission timer.
    pub(crate) fn start(
        &mut self,
        ctx: &mut TxCtx,
    ) -> Result<(), VleaseError> {
        let packet = match self.state {
            TxState::Discover => self.build_discover(),
            // Refresh transactions had their REQUEST prepared at
            // construction time.
            TxState::Request => match self.last_packet.take() {
                Some(p) => p,
                None => {
                    return Err(VleaseError::new(
                        ErrorKind::Bug,
                        "Transaction started in request state without \
                         a prepared packet"
                            .to_string(),
                    ));
                }
            },
        };
        self.send_packet(packet, ctx);
        Ok(())
    }

    fn base_packet(&self) -> DhcpV4Message {
        let mut msg = DhcpV4Message {
            xid: self.xid,
            // We pretend to be a relay: hop count over zero and giaddr
            // set to the address the server should answer to.
            hops: 1,
            giaddr: self.local_ip,
            ..Default::default()
        };
        msg.options
            .insert(OPT_CLIENT_IDENTIFIER, self.client_identifier.clone());
        if let Some(target) = self.target_addr {
            msg.options.insert(
                crate::option::OPT_RELAY_AGENT_INFORMATION,
                link_selection_suboption(target),
            );
        }
        msg.options.insert(
            OPT_PARAMETER_REQUEST_LIST,
            PARAMETER_REQUEST_LIST.to_vec(),
        );
        if let Some(lease_time) = self.lease_time {
            msg.options.insert(
                OPT_IP_ADDRESS_LEASE_TIME,
                lease_time.to_be_bytes().to_vec(),
            );
        }
        msg
    }

    fn build_discover(&self) -> DhcpV4Message {
        let mut msg = self.base_packet();
        msg.options.insert(
            OPT_MESSAGE_TYPE,
            vec![DhcpV4MessageType::Discover as u8],
        );
        msg
    }

    fn build_request_from_offer(
        &self,
        offer: &DhcpV4Message,
    ) -> DhcpV4Message {
        let mut msg = self.base_packet();
        msg.options.insert(
            OPT_MESSAGE_TYPE,
            vec![DhcpV4MessageType::Request as u8],
        );
        if let Some(server_id) = offer.options.get(OPT_SERVER_IDENTIFIER) {
            msg.options
                .insert(OPT_SERVER_IDENTIFIER, server_id.to_vec());
        } else {
            log::debug!(
                "Offer for xid {} carries no server identifier",
                self.xid
            );
        }
        msg.options.insert(
            OPT_REQUESTED_IP_ADDRESS,
            offer.yiaddr.octets().to_vec(),
        );
        msg
    }

    fn build_refresh_request(&self, client_ip: Ipv4Addr) -> DhcpV4Message {
        let mut msg = self.base_packet();
        msg.options.insert(
            OPT_MESSAGE_TYPE,
            vec![DhcpV4MessageType::Request as u8],
        );
        msg.options
            .insert(OPT_REQUESTED_IP_ADDRESS, client_ip.octets().to_vec());
        msg
    }

    /// First send of a fresh packet: reset the retry budget.
    fn send_packet(&mut self, packet: DhcpV4Message, ctx: &mut TxCtx) {
        self.last_packet = Some(packet);
        self.retries = 0;
        self.timeout = DEFAULT_TIMEOUT_SECONDS;
        self.send_to_servers(ctx);
    }

    fn resend_packet(&mut self, ctx: &mut TxCtx) {
        self.retries += 1;
        self.timeout *= 2;
        self.send_to_servers(ctx);
    }

    fn send_to_servers(&mut self, ctx: &mut TxCtx) {
        let jitter: f64 = rand::rng().random_range(-1.0..=1.0);
        let randomized_timeout =
            (f64::from(self.timeout) + jitter).max(0.0);
        log::debug!(
            "Timeout for xid {} is {:.1}s",
            self.xid,
            randomized_timeout
        );
        self.timer = Some(ctx.evl.schedule_in(
            Duration::from_secs_f64(randomized_timeout),
            Dispatch::TransactionTimeout {
                requestor: ctx.requestor,
                xid: self.xid,
            },
        ));
        let packet = match self.last_packet.as_ref() {
            Some(p) => p,
            None => {
                log::error!(
                    "BUG: no packet to send for xid {} in state {}",
                    self.xid,
                    self.state
                );
                return;
            }
        };
        for server_ip in &self.server_ips {
            log::debug!(
                "Sending packet in state {} to {} [{}/{}]",
                self.state,
                server_ip,
                self.retries + 1,
                self.max_retries + 1,
            );
            if let Err(e) = ctx.sink.send_packet(
                packet,
                SocketAddrV4::new(*server_ip, DHCP_SERVER_PORT),
            ) {
                log::warn!("Failed to send packet to {server_ip}: {e}");
            }
        }
    }

    fn cancel_timer(&mut self, ctx: &mut TxCtx) {
        if let Some(timer) = self.timer.take() {
            ctx.evl.cancel(timer);
        }
    }

    fn valid_source(&self, src: SocketAddrV4) -> bool {
        if src.port() != DHCP_SERVER_PORT {
            log::debug!("Dropping packet from wrong port: {src}");
            return false;
        }
        if !self.server_ips.contains(src.ip()) {
            log::debug!("Dropping packet from wrong IP address: {src}");
            return false;
        }
        true
    }

    /// Narrow a multi-server request to the single server that answered,
    /// so retransmissions stop bothering the others.
    fn retrieve_server_ip(&mut self, offer: &DhcpV4Message) {
        if self.server_ips.len() <= 1 {
            return;
        }
        match offer.options.get_ipv4(OPT_SERVER_IDENTIFIER) {
            Some(server_ip) => {
                log::debug!("Found server ip {server_ip}");
                self.server_ips = vec![server_ip];
            }
            None => {
                log::warn!(
                    "Invalid server identifier in offer for xid {}",
                    self.xid
                );
            }
        }
    }

    pub(crate) fn handle_offer(
        &mut self,
        offer: &DhcpV4Message,
        src: SocketAddrV4,
        ctx: &mut TxCtx,
    ) -> TxStep {
        if self.state != TxState::Discover {
            log::debug!("Received unsolicited offer for xid {}", self.xid);
            return TxStep::Continue;
        }
        if !self.valid_source(src) {
            return TxStep::Continue;
        }
        log::debug!("Received offer for xid {}", self.xid);
        self.cancel_timer(ctx);
        let request = self.build_request_from_offer(offer);
        self.retrieve_server_ip(offer);
        self.state = TxState::Request;
        self.send_packet(request, ctx);
        TxStep::Continue
    }

    pub(crate) fn handle_ack(
        &mut self,
        ack: &DhcpV4Message,
        src: SocketAddrV4,
        ctx: &mut TxCtx,
    ) -> TxStep {
        if self.state != TxState::Request {
            log::debug!("Received unsolicited ACK for xid {}", self.xid);
            return TxStep::Continue;
        }
        if !self.valid_source(src) {
            return TxStep::Continue;
        }
        log::debug!("Received ACK for xid {}", self.xid);
        self.cancel_timer(ctx);
        let lease = DhcpV4Lease::parse_from_ack(ack, self.start_time);
        TxStep::Done(TxOutcome {
            owner: self.owner.clone(),
            result: Ok(lease),
        })
    }

    pub(crate) fn handle_nack(
        &mut self,
        _nack: &DhcpV4Message,
        src: SocketAddrV4,
        ctx: &mut TxCtx,
    ) -> TxStep {
        if self.state != TxState::Request {
            log::debug!("Received unsolicited NACK for xid {}", self.xid);
            return TxStep::Continue;
        }
        if !self.valid_source(src) {
            return TxStep::Continue;
        }
        log::debug!("Received NACK for xid {}", self.xid);
        self.cancel_timer(ctx);
        TxStep::Done(TxOutcome {
            owner: self.owner.clone(),
            result: Err(VleaseError::new(
                ErrorKind::InvalidArgument,
                format!("DHCP server {} refused the request", src.ip()),
            )),
        })
    }

    pub(crate) fn handle_timeout(&mut self, ctx: &mut TxCtx) -> TxStep {
        log::debug!("Handling timeout for xid {}", self.xid);
        self.timer = None;
        if self.retries >= self.max_retries {
            log::debug!(
                "Timeout for reply to packet in state {}",
                self.state
            );
            TxStep::Done(TxOutcome {
                owner: self.owner.clone(),
                result: Err(VleaseError::new(
                    ErrorKind::Timeout,
                    format!(
                        "No DHCP response for xid {} after {} tries",
                        self.xid,
                        self.retries + 1
                    ),
                )),
            })
        } else {
            self.resend_packet(ctx);
            TxStep::Continue
        }
    }
}
