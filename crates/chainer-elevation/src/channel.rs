//! Length-prefixed duplex message channel.
//!
//! Every frame is `type: u32 LE`, `length: u32 LE`, then `length` payload
//! bytes. The length is always read before the payload.

use std::io::{self, Read, Write};

use tracing::trace;

use crate::messages::{COMPLETE_MESSAGE, TERMINATE_MESSAGE};

pub const FRAME_HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("channel closed mid-frame while reading {0}")]
    Truncated(&'static str),

    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),

    #[error("elevation token mismatch")]
    TokenMismatch,

    #[error("unexpected message type {0:#010x}")]
    UnexpectedMessage(u32),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_type: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(message_type: u32, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Result code carried by a `Complete` reply.
    pub fn result_code(&self) -> Result<u32, ChannelError> {
        if self.message_type != COMPLETE_MESSAGE {
            return Err(ChannelError::UnexpectedMessage(self.message_type));
        }
        let raw: [u8; 4] = self
            .payload
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| ChannelError::Protocol("completion without result code".to_string()))?;
        Ok(u32::from_le_bytes(raw))
    }
}

/// Outcome of a receive: a message, or the peer went away between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(RawMessage),
    Closed,
}

pub fn frame_message(message_type: u32, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let length = frame_length(payload)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&message_type.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn frame_length(payload: &[u8]) -> Result<u32, ChannelError> {
    let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if length > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(length));
    }
    Ok(length)
}

pub fn write_frame<W: Write>(
    writer: &mut W,
    message_type: u32,
    payload: &[u8],
) -> Result<(), ChannelError> {
    let length = frame_length(payload)?;
    let mut header = [0_u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&message_type.to_le_bytes());
    header[4..].copy_from_slice(&length.to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Received, ChannelError> {
    let mut header = [0_u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(Received::Closed),
            Ok(0) => return Err(ChannelError::Truncated("frame header")),
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if filled == 0 && is_disconnect(&err) => return Ok(Received::Closed),
            Err(err) => return Err(err.into()),
        }
    }

    let message_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(length));
    }

    let mut payload = vec![0_u8; length as usize];
    reader.read_exact(&mut payload).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ChannelError::Truncated("frame payload")
        } else {
            ChannelError::Io(err)
        }
    })?;
    Ok(Received::Message(RawMessage::new(message_type, payload)))
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

pub struct MessageChannel<S> {
    stream: S,
}

impl<S: Read + Write> MessageChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn send(&mut self, message_type: u32, payload: &[u8]) -> Result<(), ChannelError> {
        trace!(message_type = format_args!("{message_type:#010x}"), bytes = payload.len(), "send");
        write_frame(&mut self.stream, message_type, payload)
    }

    pub fn receive(&mut self) -> Result<Received, ChannelError> {
        let received = read_frame(&mut self.stream)?;
        if let Received::Message(message) = &received {
            trace!(
                message_type = format_args!("{:#010x}", message.message_type),
                bytes = message.payload.len(),
                "receive"
            );
        }
        Ok(received)
    }

    pub fn send_complete(&mut self, result: u32) -> Result<(), ChannelError> {
        self.send(COMPLETE_MESSAGE, &result.to_le_bytes())
    }

    pub fn send_terminate(&mut self) -> Result<(), ChannelError> {
        self.send(TERMINATE_MESSAGE, &[])
    }

    /// Sends one request and blocks for its `Complete` reply. Any other
    /// message arriving first is a protocol error.
    pub fn transact(&mut self, message_type: u32, payload: &[u8]) -> Result<RawMessage, ChannelError> {
        self.transact_with(message_type, payload, |message| {
            Err(ChannelError::UnexpectedMessage(message.message_type))
        })
    }

    /// Sends one request and blocks for its `Complete` reply, answering any
    /// notification the peer sends in the meantime with the result code
    /// `on_message` returns.
    pub fn transact_with<F>(
        &mut self,
        message_type: u32,
        payload: &[u8],
        mut on_message: F,
    ) -> Result<RawMessage, ChannelError>
    where
        F: FnMut(&RawMessage) -> Result<u32, ChannelError>,
    {
        self.send(message_type, payload)?;
        loop {
            match self.receive()? {
                Received::Closed => {
                    return Err(ChannelError::Protocol(format!(
                        "channel closed while awaiting reply to {message_type:#010x}"
                    )));
                }
                Received::Message(reply) if reply.message_type == COMPLETE_MESSAGE => {
                    return Ok(reply);
                }
                Received::Message(notice) => {
                    let result = on_message(&notice)?;
                    self.send_complete(result)?;
                }
            }
        }
    }

    /// Like [`transact`](Self::transact) but yields only the result code.
    pub fn transact_status(&mut self, message_type: u32, payload: &[u8]) -> Result<u32, ChannelError> {
        self.transact(message_type, payload)?.result_code()
    }
}
