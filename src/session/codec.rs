use std::error;
use std::fmt;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::message::{Header, Message, MessageError, HEADER_LEN};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    Malformed(MessageError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Io(err) => write!(f, "{}", err),
            CodecError::Malformed(err) => write!(f, "{}", err),
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(error: io::Error) -> Self {
        CodecError::Io(error)
    }
}

impl From<MessageError> for CodecError {
    fn from(error: MessageError) -> Self {
        CodecError::Malformed(error)
    }
}

impl error::Error for CodecError {}

/// Frames BGP messages on a byte stream
///
/// `four_octet_asn` starts out enabled and is narrowed by the session once
/// the peer's capabilities are known.
#[derive(Debug)]
pub struct MessageCodec {
    pub(crate) four_octet_asn: bool,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            four_octet_asn: true,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    // Wait for a full header, then for the full message it announces
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&buf[..HEADER_LEN])?;
        let length = usize::from(header.length);
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        let frame = buf.split_to(length);
        let message = Message::decode(&header, &frame[HEADER_LEN..], self.four_octet_asn)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        message.encode(buf, self.four_octet_asn)?;
        Ok(())
    }
}

/// Read exactly one message from a raw stream
///
/// Only the bytes of that message are consumed, so the stream is left at the
/// next message boundary and can be framed afterwards without loss.
pub async fn read_message<R>(stream: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let header = Header::parse(&header)?;
    let mut body = vec![0u8; header.body_len()];
    stream.read_exact(&mut body).await?;
    Ok(Message::decode(&header, &body, true)?)
}
