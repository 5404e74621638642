//! Framing: 1 byte message type + 4 bytes BE payload length + payload.

/// Header size: type byte plus big-endian u32 payload length.
pub const HEADER_LEN: usize = 5;

/// One framed message as it travels on the wire. The type code is kept raw so
/// receivers can log and skip codes they do not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(type_code: u8, payload: Vec<u8>) -> Self {
        Self { type_code, payload }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub type_code: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Header for a payload of `len` bytes. Fails if the length does not fit the 4-byte field.
    pub fn for_payload(type_code: u8, len: usize) -> Result<Self, FrameEncodeError> {
        let payload_len = u32::try_from(len).map_err(|_| FrameEncodeError::TooLarge(len))?;
        Ok(Self {
            type_code,
            payload_len,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.type_code;
        out[1..].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            type_code: bytes[0],
            payload_len: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        }
    }
}

/// Encode a frame into a single buffer: header followed by the payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let header = FrameHeader::for_payload(frame.type_code, frame.payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes does not fit a 32-bit length field")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
/// The protocol itself has no size limit; pass `max_payload` to bound what the caller is willing to buffer.
pub fn decode_frame(
    bytes: &[u8],
    max_payload: Option<u32>,
) -> Result<(Frame, usize), FrameDecodeError> {
    let Some(head) = bytes.first_chunk::<HEADER_LEN>() else {
        return Err(FrameDecodeError::NeedMore);
    };
    let header = FrameHeader::decode(head);
    check_payload_len(header.payload_len, max_payload)?;
    let len = header.payload_len as usize;
    if bytes.len() < HEADER_LEN + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = Frame::new(
        header.type_code,
        bytes[HEADER_LEN..HEADER_LEN + len].to_vec(),
    );
    Ok((frame, HEADER_LEN + len))
}

/// Reject a declared payload length above the caller's limit.
pub fn check_payload_len(len: u32, max_payload: Option<u32>) -> Result<(), FrameDecodeError> {
    match max_payload {
        Some(max) if len > max => Err(FrameDecodeError::TooLarge { len, max }),
        _ => Ok(()),
    }
}

/// Error decoding a frame (need more bytes or payload over the caller's limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: u32, max: u32 },
}
