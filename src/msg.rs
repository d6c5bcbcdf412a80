// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use crate::{
    option::{DhcpV4Options, OPT_MESSAGE_TYPE},
    Buffer, BufferMut, ErrorContext, ErrorKind, VleaseError,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum DhcpV4MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nack = 6,
    Release = 7,
    Inform = 8,
}

impl std::fmt::Display for DhcpV4MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nack => write!(f, "NACK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

impl std::convert::TryFrom<u8> for DhcpV4MessageType {
    type Error = VleaseError;

    fn try_from(d: u8) -> Result<Self, VleaseError> {
        match d {
            d if d == Self::Discover as u8 => Ok(Self::Discover),
            d if d == Self::Offer as u8 => Ok(Self::Offer),
            d if d == Self::Request as u8 => Ok(Self::Request),
            d if d == Self::Decline as u8 => Ok(Self::Decline),
            d if d == Self::Ack as u8 => Ok(Self::Ack),
            d if d == Self::Nack as u8 => Ok(Self::Nack),
            d if d == Self::Release as u8 => Ok(Self::Release),
            d if d == Self::Inform as u8 => Ok(Self::Inform),
            _ => Err(VleaseError::new(
                ErrorKind::InvalidDhcpMessage,
                format!("DHCPv4 message type {d} is not supported"),
            )),
        }
    }
}

const MAX_CHADDR_LEN: usize = 16;
const MAX_SNAME_LEN: usize = 64;
const MAX_FILE_LEN: usize = 128;

pub(crate) const BOOTREQUEST: u8 = 1;
pub(crate) const ARP_HW_TYPE_ETHERNET: u8 = 1;
const DHCPV4_MAGIC_COOKIE: [u8; 4] = [99u8, 130, 83, 99];

/// A BOOTP framed DHCPv4 message: fixed header plus TLV options behind
/// the magic cookie.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct DhcpV4Message {
    /// Message op code. 1 = BOOTREQUEST, 2 = BOOTREPLY
    pub(crate) op: u8,
    /// Hardware address type
    pub(crate) htype: u8,
    /// Hardware address length
    pub(crate) hlen: u8,
    /// Incremented when booting via a relay agent.
    pub(crate) hops: u8,
    /// Transaction ID
    pub(crate) xid: u32,
    /// Seconds elapsed since the client began address acquisition.
    pub(crate) secs: u16,
    pub(crate) flags: u16,
    /// Client IP address, only filled in when the client can already
    /// respond to ARP requests.
    pub(crate) ciaddr: Ipv4Addr,
    /// 'your' (client) IP address.
    pub(crate) yiaddr: Ipv4Addr,
    /// IP address of next server to use in bootstrap.
    pub(crate) siaddr: Ipv4Addr,
    /// Relay agent IP address.
    pub(crate) giaddr: Ipv4Addr,
    /// Client hardware address.
    pub(crate) chaddr: [u8; MAX_CHADDR_LEN],
    /// Optional server host name, null terminated string.
    pub(crate) sname: String,
    /// Boot file name, null terminated string.
    pub(crate) file: String,
    /// DHCP options
    pub(crate) options: DhcpV4Options,
}

impl Default for DhcpV4Message {
    fn default() -> Self {
        Self {
            op: BOOTREQUEST,
            htype: ARP_HW_TYPE_ETHERNET,
            hlen: 0,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0u8; MAX_CHADDR_LEN],
            sname: String::new(),
            file: String::new(),
            options: DhcpV4Options::default(),
        }
    }
}

impl DhcpV4Message {
    // The header is 236 bytes, plus 4 bytes magic cookie and 3 bytes for
    // the mandatory option `DHCP Message Type(53)`.
    const MIN_LEN: usize = 243;

    /// Parse from a raw DHCP message with UDP and lower layer headers
    /// already removed.
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, VleaseError> {
        if raw.len() < Self::MIN_LEN {
            return Err(VleaseError::new(
                ErrorKind::InvalidDhcpMessage,
                format!(
                    "RAW data length({}) is less than minimum DHCP \
                     message size {}",
                    raw.len(),
                    Self::MIN_LEN
                ),
            ));
        }
        let mut buf = Buffer::new(raw);

        let mut ret = Self {
            op: buf.get_u8().context("Invalid DHCPv4 header field 'op'")?,
            htype: buf
                .get_u8()
                .context("Invalid DHCPv4 header field 'htype'")?,
            hlen: buf
                .get_u8()
                .context("Invalid DHCPv4 header field 'hlen'")?,
            hops: buf
                .get_u8()
                .context("Invalid DHCPv4 header field 'hops'")?,
            xid: buf
                .get_u32_be()
                .context("Invalid DHCPv4 header field 'xid'")?,
            secs: buf
                .get_u16_be()
                .context("Invalid DHCPv4 header field 'secs'")?,
            flags: buf
                .get_u16_be()
                .context("Invalid DHCPv4 header field 'flags'")?,
            ciaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'ciaddr'")?,
            yiaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'yiaddr'")?,
            siaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'siaddr'")?,
            giaddr: buf
                .get_ipv4()
                .context("Invalid DHCPv4 header field 'giaddr'")?,
            chaddr: {
                let mut chaddr = [0u8; MAX_CHADDR_LEN];
                chaddr.copy_from_slice(
                    buf.get_bytes(MAX_CHADDR_LEN)
                        .context("Invalid DHCPv4 header field 'chaddr'")?,
                );
                chaddr
            },
            sname: buf
                .get_string_with_null(MAX_SNAME_LEN)
                .context("Invalid DHCPv4 header field 'sname'")?,
            file: buf
                .get_string_with_null(MAX_FILE_LEN)
                .context("Invalid DHCPv4 header field 'file'")?,
            options: DhcpV4Options::new(),
        };

        let magic_cookie =
            buf.get_bytes(4).context("Invalid DHCP magic cookie")?;
        if magic_cookie != DHCPV4_MAGIC_COOKIE {
            return Err(VleaseError::new(
                ErrorKind::InvalidDhcpMessage,
                format!(
                    "DHCPv4 magic cookie not match, expected {:?}, got {:?}",
                    DHCPV4_MAGIC_COOKIE, magic_cookie
                ),
            ));
        }
        ret.options = DhcpV4Options::parse(buf.get_remains())?;

        log::trace!("Parsed DHCP message {ret:?}");
        Ok(ret)
    }

    pub(crate) fn emit(&self) -> Vec<u8> {
        let mut buf = BufferMut::new(Self::MIN_LEN);
        buf.write_u8(self.op);
        buf.write_u8(self.htype);
        buf.write_u8(self.hlen);
        buf.write_u8(self.hops);
        buf.write_u32_be(self.xid);
        buf.write_u16_be(self.secs);
        buf.write_u16_be(self.flags);
        buf.write_ipv4(self.ciaddr);
        buf.write_ipv4(self.yiaddr);
        buf.write_ipv4(self.siaddr);
        buf.write_ipv4(self.giaddr);
        buf.write_bytes(&self.chaddr);
        buf.write_string_with_null(&self.sname, MAX_SNAME_LEN);
        buf.write_string_with_null(&self.file, MAX_FILE_LEN);
        buf.write_bytes(&DHCPV4_MAGIC_COOKIE);
        self.options.emit(&mut buf);
        buf.data
    }

    pub(crate) fn message_type(&self) -> Option<DhcpV4MessageType> {
        self.options
            .get(OPT_MESSAGE_TYPE)
            .and_then(|data| data.first())
            .and_then(|d| DhcpV4MessageType::try_from(*d).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{OPT_SERVER_IDENTIFIER, OPT_SUBNET_MASK};

    fn sample_reply() -> DhcpV4Message {
        let mut msg = DhcpV4Message {
            op: 2,
            hops: 0,
            xid: 0xdeadbeef,
            yiaddr: Ipv4Addr::new(10, 1, 2, 3),
            siaddr: Ipv4Addr::new(10, 0, 0, 1),
            ..Default::default()
        };
        msg.options.insert(
            OPT_MESSAGE_TYPE,
            vec![DhcpV4MessageType::Offer as u8],
        );
        msg.options
            .insert(OPT_SERVER_IDENTIFIER, vec![10, 0, 0, 1]);
        msg.options
            .insert(OPT_SUBNET_MASK, vec![255, 255, 255, 0]);
        msg
    }

    #[test]
    fn test_message_round_trip() {
        let msg = sample_reply();
        let raw = msg.emit();
        let parsed = DhcpV4Message::parse(&raw).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.message_type(), Some(DhcpV4MessageType::Offer));
        assert_eq!(parsed.xid, 0xdeadbeef);
    }

    #[test]
    fn test_short_message_is_rejected() {
        let raw = sample_reply().emit();
        assert!(DhcpV4Message::parse(&raw[..100]).is_err());
    }

    #[test]
    fn test_bad_magic_cookie_is_rejected() {
        let mut raw = sample_reply().emit();
        raw[236] = 0;
        assert!(DhcpV4Message::parse(&raw).is_err());
    }
}
