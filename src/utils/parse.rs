use std::error::Error;
use std::fmt;
use std::io;

use crate::message::Origin;

#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: String) -> Self {
        ParseError { reason }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError: {}", self.reason)
    }
}

impl Error for ParseError {
    fn description(&self) -> &str {
        "Error parsing config or API input"
    }
}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::new(error.to_string())
    }
}

/// Convert an ASN string to a u32
/// E.g. "65000.100" -> 4259840100
pub fn asn_from_dotted(value: &str) -> Result<u32, ParseError> {
    // Parse to list of u32, since we should support 4 byte ASN as a single int
    // (E.g. "4259840100")
    let mut chunks = [0; 2];
    let check_for_overflow = value.contains('.');
    // Iterate through chunks in reverse, so if there's no dot (only one number),
    // it will be in the least significant position
    for (i, chunk) in value
        .splitn(2, '.')
        .collect::<Vec<&str>>()
        .into_iter()
        .rev()
        .enumerate()
    {
        let chunk: u32 = chunk
            .parse()
            .map_err(|err| ParseError::new(format!("{} '{}'", err, value)))?;
        if check_for_overflow && chunk > u32::from(u16::MAX) {
            return Err(ParseError::new(format!("Unsupported ASN '{}'", value)));
        }
        chunks[i] = chunk;
    }
    Ok((chunks[1] * 65536) + chunks[0])
}

/// Parse a space separated AS path, E.g. "100 200 65000.100"
pub fn as_path_from_str(value: &str) -> Result<Vec<u32>, ParseError> {
    value.split_whitespace().map(asn_from_dotted).collect()
}

/// Parse a standard community, E.g. "65000:100"
pub fn community_from_str(value: &str) -> Result<u32, ParseError> {
    let invalid = || ParseError::new(format!("Not a valid community: '{}'", value));
    let (high, low) = value.split_once(':').ok_or_else(invalid)?;
    let high: u16 = high.parse().map_err(|_| invalid())?;
    let low: u16 = low.parse().map_err(|_| invalid())?;
    Ok((u32::from(high) << 16) | u32::from(low))
}

pub fn origin_from_str(value: &str) -> Result<Origin, ParseError> {
    match value.to_lowercase().as_str() {
        "igp" | "i" => Ok(Origin::Igp),
        "egp" | "e" => Ok(Origin::Egp),
        "incomplete" | "?" => Ok(Origin::Incomplete),
        _ => Err(ParseError::new(format!("Not a valid origin: '{}'", value))),
    }
}
