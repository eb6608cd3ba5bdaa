use std::net::Ipv4Addr;

use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use super::{MessageError, AS_TRANS, BGP_VERSION};

const PARAM_CAPABILITIES: u8 = 2;

const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_ROUTE_REFRESH: u8 = 2;
const CAP_FOUR_OCTET_ASN: u8 = 65;

#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    Multiprotocol { afi: u16, safi: u8 },
    RouteRefresh,
    FourOctetAsn(u32),
    Unknown { code: u8, value: Vec<u8> },
}

impl Capability {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Capability::Multiprotocol { afi, safi } => {
                buf.put_u8(CAP_MULTIPROTOCOL);
                buf.put_u8(4);
                buf.put_u16(*afi);
                buf.put_u8(0);
                buf.put_u8(*safi);
            }
            Capability::RouteRefresh => {
                buf.put_u8(CAP_ROUTE_REFRESH);
                buf.put_u8(0);
            }
            Capability::FourOctetAsn(asn) => {
                buf.put_u8(CAP_FOUR_OCTET_ASN);
                buf.put_u8(4);
                buf.put_u32(*asn);
            }
            Capability::Unknown { code, value } => {
                buf.put_u8(*code);
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
            }
        }
    }

    fn decode(code: u8, mut value: &[u8]) -> Result<Self, MessageError> {
        let truncated = |_| MessageError::Truncated("capability");
        let capability = match (code, value.len()) {
            (CAP_MULTIPROTOCOL, 4) => {
                let afi = value.read_u16::<NetworkEndian>().map_err(truncated)?;
                let _reserved = value.read_u8().map_err(truncated)?;
                let safi = value.read_u8().map_err(truncated)?;
                Capability::Multiprotocol { afi, safi }
            }
            (CAP_ROUTE_REFRESH, 0) => Capability::RouteRefresh,
            (CAP_FOUR_OCTET_ASN, 4) => {
                Capability::FourOctetAsn(value.read_u32::<NetworkEndian>().map_err(truncated)?)
            }
            _ => Capability::Unknown {
                code,
                value: value.to_vec(),
            },
        };
        Ok(capability)
    }
}

/// OPEN message
///
/// `asn` always holds the true (possibly four octet) AS number of the speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub version: u8,
    pub asn: u32,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
    pub capabilities: Vec<Capability>,
}

impl Open {
    /// OPEN advertising IPv4 unicast, route refresh and four octet AS support
    pub fn new(asn: u32, hold_time: u16, router_id: Ipv4Addr) -> Self {
        Self {
            version: BGP_VERSION,
            asn,
            hold_time,
            router_id,
            capabilities: vec![
                Capability::Multiprotocol { afi: 1, safi: 1 },
                Capability::RouteRefresh,
                Capability::FourOctetAsn(asn),
            ],
        }
    }

    pub fn supports_four_octet_asn(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| matches!(c, Capability::FourOctetAsn(_)))
    }

    pub(super) fn encode(&self, buf: &mut BytesMut) {
        let two_byte_asn = if self.asn <= u32::from(u16::MAX) {
            self.asn as u16
        } else {
            AS_TRANS
        };
        buf.put_u8(self.version);
        buf.put_u16(two_byte_asn);
        buf.put_u16(self.hold_time);
        buf.put_slice(&self.router_id.octets());

        let mut capabilities = BytesMut::new();
        for capability in &self.capabilities {
            capability.encode(&mut capabilities);
        }
        if capabilities.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_u8(capabilities.len() as u8 + 2);
            buf.put_u8(PARAM_CAPABILITIES);
            buf.put_u8(capabilities.len() as u8);
            buf.put_slice(&capabilities);
        }
    }

    pub(super) fn decode(mut body: &[u8]) -> Result<Self, MessageError> {
        let version = body.read_u8().map_err(|_| MessageError::Truncated("version"))?;
        if version != BGP_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let my_asn = body
            .read_u16::<NetworkEndian>()
            .map_err(|_| MessageError::Truncated("my autonomous system"))?;
        let hold_time = body
            .read_u16::<NetworkEndian>()
            .map_err(|_| MessageError::Truncated("hold time"))?;
        if hold_time == 1 || hold_time == 2 {
            return Err(MessageError::UnacceptableHoldTime(hold_time));
        }
        let identifier = body
            .read_u32::<NetworkEndian>()
            .map_err(|_| MessageError::Truncated("bgp identifier"))?;
        if identifier == 0 {
            return Err(MessageError::BadIdentifier);
        }
        let params_len = body
            .read_u8()
            .map_err(|_| MessageError::Truncated("optional parameters length"))?;
        if params_len as usize != body.len() {
            return Err(MessageError::Truncated("optional parameters"));
        }

        let mut capabilities = vec![];
        while !body.is_empty() {
            let param_type = body.read_u8().map_err(|_| MessageError::Truncated("parameter"))?;
            let param_len = body.read_u8().map_err(|_| MessageError::Truncated("parameter"))? as usize;
            if param_len > body.len() {
                return Err(MessageError::Truncated("parameter"));
            }
            let (mut value, rest) = body.split_at(param_len);
            body = rest;
            // Other parameter types are deprecated (RFC 5492)
            if param_type != PARAM_CAPABILITIES {
                continue;
            }
            while !value.is_empty() {
                let code = value.read_u8().map_err(|_| MessageError::Truncated("capability"))?;
                let len = value.read_u8().map_err(|_| MessageError::Truncated("capability"))? as usize;
                if len > value.len() {
                    return Err(MessageError::Truncated("capability"));
                }
                let (cap_value, rest) = value.split_at(len);
                value = rest;
                capabilities.push(Capability::decode(code, cap_value)?);
            }
        }

        let asn = capabilities
            .iter()
            .find_map(|c| match c {
                Capability::FourOctetAsn(asn) => Some(*asn),
                _ => None,
            })
            .unwrap_or_else(|| u32::from(my_asn));

        Ok(Self {
            version,
            asn,
            hold_time,
            router_id: Ipv4Addr::from(identifier),
            capabilities,
        })
    }
}
