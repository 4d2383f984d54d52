//! ICMP (Internet Control Message Protocol)
//!
//! Echo handling plus the error messages the stack has to route back to the
//! transport layer (RFC 1122 3.2.2).

use byteorder::{BigEndian, ByteOrder};

use crate::network::checksum;
use crate::network::ipv4::Ipv4Header;
use crate::network::packet::Packet;

const ICMP_HEADER_LEN: usize = 8;

/// Bytes of the offending datagram's payload quoted in an error message
const QUOTED_PAYLOAD_LEN: usize = 8;

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;
pub const ICMP_TYPE_PARAMETER_PROBLEM: u8 = 12;

/// Destination unreachable codes
pub mod unreachable {
    pub const NET: u8 = 0;
    pub const HOST: u8 = 1;
    pub const PROTOCOL: u8 = 2;
    pub const PORT: u8 = 3;
    pub const FRAGMENTATION_NEEDED: u8 = 4;
}

/// The 8-byte ICMP header (RFC 792)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,
    pub msg_code: u8,
    pub checksum: u16,
    pub rest: [u8; 4],
}

impl IcmpHeader {
    /// Returns None if the data is too short to contain an ICMP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest: [data[4], data[5], data[6], data[7]],
        })
    }

    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    pub fn is_error(&self) -> bool {
        IcmpErrorKind::from_type(self.msg_type).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpErrorKind {
    DestUnreachable,
    SourceQuench,
    TimeExceeded,
    ParameterProblem,
}

impl IcmpErrorKind {
    pub fn from_type(msg_type: u8) -> Option<Self> {
        match msg_type {
            ICMP_TYPE_DEST_UNREACHABLE => Some(IcmpErrorKind::DestUnreachable),
            ICMP_TYPE_SOURCE_QUENCH => Some(IcmpErrorKind::SourceQuench),
            ICMP_TYPE_TIME_EXCEEDED => Some(IcmpErrorKind::TimeExceeded),
            ICMP_TYPE_PARAMETER_PROBLEM => Some(IcmpErrorKind::ParameterProblem),
            _ => None,
        }
    }

    pub fn msg_type(self) -> u8 {
        match self {
            IcmpErrorKind::DestUnreachable => ICMP_TYPE_DEST_UNREACHABLE,
            IcmpErrorKind::SourceQuench => ICMP_TYPE_SOURCE_QUENCH,
            IcmpErrorKind::TimeExceeded => ICMP_TYPE_TIME_EXCEEDED,
            IcmpErrorKind::ParameterProblem => ICMP_TYPE_PARAMETER_PROBLEM,
        }
    }
}

/// An ICMP error referring to a datagram we sent earlier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpError {
    pub kind: IcmpErrorKind,
    pub code: u8,
    /// Next-hop MTU carried by "fragmentation needed"
    pub mtu: Option<u16>,
}

impl IcmpError {
    pub fn new(kind: IcmpErrorKind, code: u8) -> Self {
        IcmpError { kind, code, mtu: None }
    }

    /// Errors after which the flow cannot succeed (RFC 1122 4.2.3.9)
    pub fn is_hard(&self) -> bool {
        self.kind == IcmpErrorKind::DestUnreachable
            && matches!(
                self.code,
                unreachable::PROTOCOL | unreachable::PORT | unreachable::FRAGMENTATION_NEEDED
            )
    }

    pub fn is_too_big(&self) -> bool {
        self.kind == IcmpErrorKind::DestUnreachable && self.code == unreachable::FRAGMENTATION_NEEDED
    }
}

/// Build an echo reply from an echo request's ICMP bytes
pub fn echo_reply(request: &[u8]) -> Option<Vec<u8>> {
    let header = IcmpHeader::from_bytes(request)?;
    if !header.is_echo_request() {
        return None;
    }

    let mut reply = request.to_vec();
    reply[0] = ICMP_TYPE_ECHO_REPLY;
    set_checksum(&mut reply);
    Some(reply)
}

/// Build the ICMP bytes of an error quoting `orig`
pub fn error_message(err: IcmpError, orig: &Packet) -> Vec<u8> {
    let mut header = IcmpHeader {
        msg_type: err.kind.msg_type(),
        msg_code: err.code,
        checksum: 0,
        rest: [0; 4],
    };
    if let Some(mtu) = err.mtu {
        BigEndian::write_u16(&mut header.rest[2..4], mtu);
    }

    let quoted_len = orig
        .ip_header()
        .map(|h| h.header_len() + QUOTED_PAYLOAD_LEN)
        .unwrap_or(0)
        .min(orig.len());

    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + quoted_len);
    msg.extend_from_slice(&header.to_bytes());
    msg.extend_from_slice(&orig.data()[..quoted_len]);
    set_checksum(&mut msg);
    msg
}

/// Split an ICMP error message into the error and the quoted original datagram.
///
/// Returns None for non-error messages or when the quote is unreadable.
pub fn parse_error(icmp: &[u8]) -> Option<(IcmpError, Packet)> {
    let header = IcmpHeader::from_bytes(icmp)?;
    let kind = IcmpErrorKind::from_type(header.msg_type)?;

    let quoted = &icmp[ICMP_HEADER_LEN..];
    Ipv4Header::from_bytes(quoted)?;

    let mut err = IcmpError::new(kind, header.msg_code);
    if err.is_too_big() {
        err.mtu = Some(BigEndian::read_u16(&header.rest[2..4]));
    }
    Some((err, Packet::from_ip_bytes(quoted)))
}

fn set_checksum(msg: &mut [u8]) {
    msg[2..4].copy_from_slice(&[0, 0]);
    let sum = checksum(msg);
    BigEndian::write_u16(&mut msg[2..4], sum);
}
