//! Block-exchange wire protocol: message types and their payload layouts.

use crate::wire::Frame;

/// Size of the big-endian block index prefix in REQUEST_BLOCK and BLOCK_DATA payloads.
pub const BLOCK_INDEX_LEN: usize = 4;

/// Closed set of message type codes carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    GetMetadata = 1,
    MetadataResponse = 2,
    RequestBlock = 3,
    BlockData = 4,
    Error = 5,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::GetMetadata),
            2 => Some(Self::MetadataResponse),
            3 => Some(Self::RequestBlock),
            4 => Some(Self::BlockData),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// All wire messages. One request and one response per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask a neighbor for the metadata it holds.
    GetMetadata,
    /// Serialized metadata record (UTF-8).
    MetadataResponse(String),
    /// Ask for one block by zero-based index.
    RequestBlock { index: u32 },
    /// Block bytes, prefixed on the wire by their index.
    BlockData { index: u32, data: Vec<u8> },
    /// Human-readable failure reason (UTF-8).
    Error(String),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::GetMetadata => MessageType::GetMetadata,
            Message::MetadataResponse(_) => MessageType::MetadataResponse,
            Message::RequestBlock { .. } => MessageType::RequestBlock,
            Message::BlockData { .. } => MessageType::BlockData,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Lay the message out as a raw frame.
    pub fn into_frame(self) -> Frame {
        let type_code = self.message_type().code();
        let payload = match self {
            Message::GetMetadata => Vec::new(),
            Message::MetadataResponse(text) | Message::Error(text) => text.into_bytes(),
            Message::RequestBlock { index } => index.to_be_bytes().to_vec(),
            Message::BlockData { index, data } => {
                let mut out = Vec::with_capacity(BLOCK_INDEX_LEN + data.len());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&data);
                out
            }
        };
        Frame::new(type_code, payload)
    }

    /// Interpret a raw frame. Unknown type codes and payloads too short for their type are errors.
    pub fn from_frame(frame: Frame) -> Result<Self, MessageError> {
        let Frame { type_code, payload } = frame;
        let kind = MessageType::from_code(type_code).ok_or(MessageError::UnknownType(type_code))?;
        match kind {
            // Any payload on GET_METADATA is ignored.
            MessageType::GetMetadata => Ok(Message::GetMetadata),
            MessageType::MetadataResponse => String::from_utf8(payload)
                .map(Message::MetadataResponse)
                .map_err(|_| MessageError::InvalidText { kind }),
            MessageType::RequestBlock => {
                let index = read_index(kind, &payload)?;
                Ok(Message::RequestBlock { index })
            }
            MessageType::BlockData => {
                let index = read_index(kind, &payload)?;
                let mut data = payload;
                data.drain(..BLOCK_INDEX_LEN);
                Ok(Message::BlockData { index, data })
            }
            MessageType::Error => Ok(Message::Error(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
        }
    }
}

fn read_index(kind: MessageType, payload: &[u8]) -> Result<u32, MessageError> {
    let bytes = payload
        .first_chunk::<BLOCK_INDEX_LEN>()
        .ok_or(MessageError::Truncated {
            kind,
            len: payload.len(),
        })?;
    Ok(u32::from_be_bytes(*bytes))
}

/// Error interpreting a frame as a message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{kind:?} payload too short ({len} bytes)")]
    Truncated { kind: MessageType, len: usize },
    #[error("{kind:?} payload is not valid UTF-8")]
    InvalidText { kind: MessageType },
}
