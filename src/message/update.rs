use std::fmt;
use std::net::Ipv4Addr;

use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use ipnetwork::Ipv4Network;

use super::{MessageError, AS_TRANS};

const FLAG_OPTIONAL: u8 = 0x80;
const FLAG_TRANSITIVE: u8 = 0x40;
const FLAG_EXTENDED_LENGTH: u8 = 0x10;

pub const ATTR_ORIGIN: u8 = 1;
pub const ATTR_AS_PATH: u8 = 2;
pub const ATTR_NEXT_HOP: u8 = 3;
pub const ATTR_MED: u8 = 4;
pub const ATTR_LOCAL_PREF: u8 = 5;
pub const ATTR_COMMUNITIES: u8 = 8;
pub const ATTR_AS4_PATH: u8 = 17;

const AS_SET: u8 = 1;
const AS_SEQUENCE: u8 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            Origin::Igp => "IGP",
            Origin::Egp => "EGP",
            Origin::Incomplete => "Incomplete",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathAttribute {
    Origin(Origin),
    /// AS_PATH flattened to its member ASNs (AS_SETs included in order)
    AsPath(Vec<u32>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    Communities(Vec<u32>),
    Unknown { flags: u8, code: u8, value: Vec<u8> },
}

impl PathAttribute {
    pub fn code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => ATTR_ORIGIN,
            PathAttribute::AsPath(_) => ATTR_AS_PATH,
            PathAttribute::NextHop(_) => ATTR_NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => ATTR_MED,
            PathAttribute::LocalPref(_) => ATTR_LOCAL_PREF,
            PathAttribute::Communities(_) => ATTR_COMMUNITIES,
            PathAttribute::Unknown { code, .. } => *code,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            PathAttribute::MultiExitDisc(_) => FLAG_OPTIONAL,
            PathAttribute::Communities(_) => FLAG_OPTIONAL | FLAG_TRANSITIVE,
            PathAttribute::Unknown { flags, .. } => *flags & !FLAG_EXTENDED_LENGTH,
            _ => FLAG_TRANSITIVE,
        }
    }

    fn encode(&self, buf: &mut BytesMut, four_octet_asn: bool) {
        let mut value = BytesMut::new();
        match self {
            PathAttribute::Origin(origin) => value.put_u8(*origin as u8),
            PathAttribute::AsPath(path) => encode_as_path(path, &mut value, four_octet_asn),
            PathAttribute::NextHop(addr) => value.put_slice(&addr.octets()),
            PathAttribute::MultiExitDisc(med) => value.put_u32(*med),
            PathAttribute::LocalPref(pref) => value.put_u32(*pref),
            PathAttribute::Communities(communities) => {
                for community in communities {
                    value.put_u32(*community);
                }
            }
            PathAttribute::Unknown { value: raw, .. } => value.put_slice(raw),
        }
        if value.len() > usize::from(u8::MAX) {
            buf.put_u8(self.flags() | FLAG_EXTENDED_LENGTH);
            buf.put_u8(self.code());
            buf.put_u16(value.len() as u16);
        } else {
            buf.put_u8(self.flags());
            buf.put_u8(self.code());
            buf.put_u8(value.len() as u8);
        }
        buf.put_slice(&value);
    }

    fn decode(flags: u8, code: u8, mut value: &[u8], four_octet_asn: bool) -> Result<Self, MessageError> {
        let malformed = |reason: &str| MessageError::MalformedAttributes(format!("{} (type {})", reason, code));
        let attribute = match code {
            ATTR_ORIGIN => match value {
                [0] => PathAttribute::Origin(Origin::Igp),
                [1] => PathAttribute::Origin(Origin::Egp),
                [2] => PathAttribute::Origin(Origin::Incomplete),
                _ => return Err(malformed("invalid ORIGIN")),
            },
            ATTR_AS_PATH => PathAttribute::AsPath(decode_as_path(value, four_octet_asn).map_err(malformed)?),
            ATTR_NEXT_HOP => {
                if value.len() != 4 {
                    return Err(malformed("invalid NEXT_HOP length"));
                }
                PathAttribute::NextHop(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
            }
            ATTR_MED | ATTR_LOCAL_PREF => {
                if value.len() != 4 {
                    return Err(malformed("invalid attribute length"));
                }
                let number = value
                    .read_u32::<NetworkEndian>()
                    .map_err(|_| malformed("invalid attribute length"))?;
                if code == ATTR_MED {
                    PathAttribute::MultiExitDisc(number)
                } else {
                    PathAttribute::LocalPref(number)
                }
            }
            ATTR_COMMUNITIES => {
                if value.len() % 4 != 0 {
                    return Err(malformed("invalid COMMUNITIES length"));
                }
                let mut communities = Vec::with_capacity(value.len() / 4);
                while !value.is_empty() {
                    communities.push(
                        value
                            .read_u32::<NetworkEndian>()
                            .map_err(|_| malformed("invalid COMMUNITIES length"))?,
                    );
                }
                PathAttribute::Communities(communities)
            }
            _ => PathAttribute::Unknown {
                flags,
                code,
                value: value.to_vec(),
            },
        };
        Ok(attribute)
    }
}

/// UPDATE message for IPv4 unicast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub withdrawn: Vec<Ipv4Network>,
    pub attributes: Vec<PathAttribute>,
    pub announced: Vec<Ipv4Network>,
}

impl Update {
    pub fn withdraw(withdrawn: Vec<Ipv4Network>) -> Self {
        Self {
            withdrawn,
            ..Default::default()
        }
    }

    pub fn announce(attributes: Vec<PathAttribute>, announced: Vec<Ipv4Network>) -> Self {
        Self {
            withdrawn: vec![],
            attributes,
            announced,
        }
    }

    pub fn is_end_of_rib(&self) -> bool {
        self.withdrawn.is_empty() && self.attributes.is_empty() && self.announced.is_empty()
    }

    pub fn origin(&self) -> Option<Origin> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::Origin(origin) => Some(*origin),
            _ => None,
        })
    }

    pub fn as_path(&self) -> Option<&[u32]> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::AsPath(path) => Some(path.as_slice()),
            _ => None,
        })
    }

    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::NextHop(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn communities(&self) -> Option<&[u32]> {
        self.attributes.iter().find_map(|a| match a {
            PathAttribute::Communities(communities) => Some(communities.as_slice()),
            _ => None,
        })
    }

    /// Check that announced prefixes come with ORIGIN, AS_PATH and NEXT_HOP
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.announced.is_empty() {
            return Ok(());
        }
        if self.origin().is_none() {
            return Err(MessageError::MissingAttribute(ATTR_ORIGIN));
        }
        if self.as_path().is_none() {
            return Err(MessageError::MissingAttribute(ATTR_AS_PATH));
        }
        if self.next_hop().is_none() {
            return Err(MessageError::MissingAttribute(ATTR_NEXT_HOP));
        }
        Ok(())
    }

    /// Encoded size of an attribute list, for whichever AS_PATH width is larger
    pub fn attributes_len(attributes: &[PathAttribute]) -> usize {
        let mut wide = BytesMut::new();
        encode_attributes(attributes, &mut wide, true);
        let mut narrow = BytesMut::new();
        encode_attributes(attributes, &mut narrow, false);
        wide.len().max(narrow.len())
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, four_octet_asn: bool) {
        let mut withdrawn = BytesMut::new();
        for prefix in &self.withdrawn {
            encode_prefix(prefix, &mut withdrawn);
        }
        buf.put_u16(withdrawn.len() as u16);
        buf.put_slice(&withdrawn);

        let mut attributes = BytesMut::new();
        encode_attributes(&self.attributes, &mut attributes, four_octet_asn);
        buf.put_u16(attributes.len() as u16);
        buf.put_slice(&attributes);

        for prefix in &self.announced {
            encode_prefix(prefix, buf);
        }
    }

    pub(super) fn decode(mut body: &[u8], four_octet_asn: bool) -> Result<Self, MessageError> {
        let withdrawn_len = body
            .read_u16::<NetworkEndian>()
            .map_err(|_| MessageError::Truncated("withdrawn routes length"))? as usize;
        if withdrawn_len > body.len() {
            return Err(MessageError::MalformedAttributes(
                "withdrawn routes length exceeds message".to_string(),
            ));
        }
        let (withdrawn, rest) = body.split_at(withdrawn_len);
        body = rest;
        let withdrawn = decode_prefixes(withdrawn)?;

        let attributes_len = body
            .read_u16::<NetworkEndian>()
            .map_err(|_| MessageError::Truncated("path attributes length"))? as usize;
        if attributes_len > body.len() {
            return Err(MessageError::MalformedAttributes(
                "path attributes length exceeds message".to_string(),
            ));
        }
        let (mut raw_attributes, announced) = body.split_at(attributes_len);
        let mut attributes = vec![];
        let mut as4_path = None;
        while !raw_attributes.is_empty() {
            let flags = raw_attributes
                .read_u8()
                .map_err(|_| MessageError::Truncated("attribute flags"))?;
            let code = raw_attributes
                .read_u8()
                .map_err(|_| MessageError::Truncated("attribute type"))?;
            let len = if flags & FLAG_EXTENDED_LENGTH != 0 {
                raw_attributes.read_u16::<NetworkEndian>().map(usize::from)
            } else {
                raw_attributes.read_u8().map(usize::from)
            }
            .map_err(|_| MessageError::Truncated("attribute length"))?;
            if len > raw_attributes.len() {
                return Err(MessageError::MalformedAttributes(format!(
                    "attribute {} length {} exceeds attribute list",
                    code, len
                )));
            }
            let (value, rest) = raw_attributes.split_at(len);
            raw_attributes = rest;
            if code == ATTR_AS4_PATH {
                // Only meaningful from a 2-octet speaker, and a broken one is ignored (RFC 6793 [6])
                if !four_octet_asn {
                    as4_path = decode_as_path(value, true).ok();
                }
                continue;
            }
            attributes.push(PathAttribute::decode(flags, code, value, four_octet_asn)?);
        }
        if let Some(as4_path) = as4_path {
            merge_as4_path(&mut attributes, as4_path);
        }

        Ok(Self {
            withdrawn,
            attributes,
            announced: decode_prefixes(announced)?,
        })
    }
}

// 2-octet peers get AS_TRANS in AS_PATH plus the real path in AS4_PATH (RFC 6793 [4.2.2])
fn encode_attributes(attributes: &[PathAttribute], buf: &mut BytesMut, four_octet_asn: bool) {
    for attribute in attributes {
        attribute.encode(buf, four_octet_asn);
        if four_octet_asn {
            continue;
        }
        if let PathAttribute::AsPath(path) = attribute {
            if path.iter().any(|asn| *asn > u32::from(u16::MAX)) {
                let mut value = BytesMut::new();
                encode_as_path(path, &mut value, true);
                let as4_path = PathAttribute::Unknown {
                    flags: FLAG_OPTIONAL | FLAG_TRANSITIVE,
                    code: ATTR_AS4_PATH,
                    value: value.to_vec(),
                };
                as4_path.encode(buf, true);
            }
        }
    }
}

fn encode_as_path(path: &[u32], buf: &mut BytesMut, four_octet_asn: bool) {
    // Segments hold at most 255 ASNs
    for segment in path.chunks(255) {
        buf.put_u8(AS_SEQUENCE);
        buf.put_u8(segment.len() as u8);
        for asn in segment {
            if four_octet_asn {
                buf.put_u32(*asn);
            } else if *asn <= u32::from(u16::MAX) {
                buf.put_u16(*asn as u16);
            } else {
                buf.put_u16(AS_TRANS);
            }
        }
    }
}

fn decode_as_path(mut value: &[u8], four_octet_asn: bool) -> Result<Vec<u32>, &'static str> {
    let mut path = vec![];
    while !value.is_empty() {
        let segment_type = value.read_u8().map_err(|_| "truncated segment")?;
        if segment_type != AS_SET && segment_type != AS_SEQUENCE {
            return Err("invalid segment type");
        }
        let count = value.read_u8().map_err(|_| "truncated segment")?;
        for _ in 0..count {
            let asn = if four_octet_asn {
                value.read_u32::<NetworkEndian>()
            } else {
                value.read_u16::<NetworkEndian>().map(u32::from)
            };
            path.push(asn.map_err(|_| "truncated segment")?);
        }
    }
    Ok(path)
}

// Leading ASNs added by 2-octet speakers are kept, the rest comes from AS4_PATH (RFC 6793 [4.2.3])
fn merge_as4_path(attributes: &mut [PathAttribute], as4_path: Vec<u32>) {
    for attribute in attributes.iter_mut() {
        if let PathAttribute::AsPath(path) = attribute {
            if as4_path.len() <= path.len() {
                path.truncate(path.len() - as4_path.len());
                path.extend_from_slice(&as4_path);
            }
            return;
        }
    }
}

/// Bytes a prefix takes in the withdrawn routes or NLRI fields
pub fn prefix_len(prefix: &Ipv4Network) -> usize {
    1 + (usize::from(prefix.prefix()) + 7) / 8
}

fn encode_prefix(prefix: &Ipv4Network, buf: &mut BytesMut) {
    let length = prefix.prefix();
    let octets = (usize::from(length) + 7) / 8;
    buf.put_u8(length);
    buf.put_slice(&prefix.network().octets()[..octets]);
}

fn decode_prefixes(mut buf: &[u8]) -> Result<Vec<Ipv4Network>, MessageError> {
    let mut prefixes = vec![];
    while !buf.is_empty() {
        let length = buf.read_u8().map_err(|_| MessageError::Truncated("prefix"))?;
        if length > 32 {
            return Err(MessageError::InvalidPrefix(length));
        }
        let octets = (usize::from(length) + 7) / 8;
        if octets > buf.len() {
            return Err(MessageError::Truncated("prefix"));
        }
        let mut addr = [0u8; 4];
        addr[..octets].copy_from_slice(&buf[..octets]);
        buf = &buf[octets..];
        let network = Ipv4Network::new(Ipv4Addr::from(addr), length)
            .map_err(|_| MessageError::InvalidPrefix(length))?;
        // Drop any host bits set past the prefix length
        let network = Ipv4Network::new(network.network(), length)
            .map_err(|_| MessageError::InvalidPrefix(length))?;
        prefixes.push(network);
    }
    Ok(prefixes)
}
