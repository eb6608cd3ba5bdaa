use std::fmt;

use bytes::{BufMut, BytesMut};

use super::MessageError;

pub const MESSAGE_HEADER_ERROR: u8 = 1;
pub const OPEN_MESSAGE_ERROR: u8 = 2;
pub const UPDATE_MESSAGE_ERROR: u8 = 3;
pub const HOLD_TIMER_EXPIRED: u8 = 4;
pub const FSM_ERROR: u8 = 5;
pub const CEASE: u8 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, subcode: u8) -> Self {
        Self {
            code,
            subcode,
            data: vec![],
        }
    }

    pub fn cease(subcode: u8) -> Self {
        Self::new(CEASE, subcode)
    }

    pub(super) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code);
        buf.put_u8(self.subcode);
        buf.put_slice(&self.data);
    }

    pub(super) fn decode(body: &[u8]) -> Result<Self, MessageError> {
        if body.len() < 2 {
            return Err(MessageError::Truncated("notification"));
        }
        Ok(Self {
            code: body[0],
            subcode: body[1],
            data: body[2..].to_vec(),
        })
    }

    fn code_name(&self) -> &'static str {
        match self.code {
            MESSAGE_HEADER_ERROR => "Message Header Error",
            OPEN_MESSAGE_ERROR => "OPEN Message Error",
            UPDATE_MESSAGE_ERROR => "UPDATE Message Error",
            HOLD_TIMER_EXPIRED => "Hold Timer Expired",
            FSM_ERROR => "Finite State Machine Error",
            CEASE => "Cease",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}/{}]", self.code_name(), self.code, self.subcode)
    }
}
