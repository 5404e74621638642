//! Framed message transport over TCP: one request and one response per connection.

use std::io;
use std::time::Duration;

use blockshare_core::wire::{check_payload_len, FrameHeader, HEADER_LEN};
use blockshare_core::{Frame, FrameDecodeError, FrameEncodeError, Message, MessageError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::Neighbor;

/// Write one frame: header, then the payload in full.
/// After an error the stream is in an unknown state and should be dropped.
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader::for_payload(frame.type_code, frame.payload.len())?;
    writer.write_all(&header.encode()).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn send_message<W>(writer: &mut W, msg: Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    send_frame(writer, &msg.into_frame()).await
}

/// Read exactly one frame. EOF before the frame is complete (even before the header) is `Closed`.
pub async fn recv_frame<R>(reader: &mut R, max_payload: u32) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    read_exact(reader, &mut head).await?;
    let header = FrameHeader::decode(&head);
    check_payload_len(header.payload_len, Some(max_payload))?;
    let mut payload = vec![0u8; header.payload_len as usize];
    read_exact(reader, &mut payload).await?;
    Ok(Frame::new(header.type_code, payload))
}

pub async fn recv_message<R>(reader: &mut R, max_payload: u32) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let frame = recv_frame(reader, max_payload).await?;
    Ok(Message::from_frame(frame)?)
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(TransportError::Io(e)),
    }
}

/// Open a fresh connection to a neighbor.
pub async fn connect(neighbor: &Neighbor, limit: Duration) -> Result<TcpStream, TransportError> {
    let stream = timeout(limit, TcpStream::connect((neighbor.host.as_str(), neighbor.port)))
        .await
        .map_err(|_| TransportError::Timeout(limit))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Connect, send one request, await one response, close.
pub async fn request(
    neighbor: &Neighbor,
    msg: Message,
    limit: Duration,
    max_payload: u32,
) -> Result<Message, TransportError> {
    let mut stream = connect(neighbor, limit).await?;
    let response = timeout(limit, async {
        send_message(&mut stream, msg).await?;
        recv_message(&mut stream, max_payload).await
    })
    .await
    .map_err(|_| TransportError::Timeout(limit))?;
    let _ = stream.shutdown().await;
    response
}

/// Transport failure. Always local to one connection; the caller logs and moves on.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: u32, max: u32 },
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl From<FrameDecodeError> for TransportError {
    fn from(e: FrameDecodeError) -> Self {
        match e {
            FrameDecodeError::TooLarge { len, max } => TransportError::TooLarge { len, max },
            FrameDecodeError::NeedMore => TransportError::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockshare_core::MessageType;

    #[tokio::test]
    async fn duplex_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let msg = Message::BlockData {
            index: 7,
            data: vec![9u8; 3000],
        };
        let sent = msg.clone();
        let writer = tokio::spawn(async move { send_message(&mut a, sent).await });
        let got = recv_message(&mut b, 1 << 20).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn eof_before_header_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            recv_frame(&mut b, 1024).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn eof_mid_payload_is_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[MessageType::BlockData.code(), 0, 0, 0, 10, 1, 2])
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            recv_frame(&mut b, 1024).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_payload_rejected_from_header() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[MessageType::BlockData.code(), 0, 0x10, 0, 0])
            .await
            .unwrap();
        assert!(matches!(
            recv_frame(&mut b, 1024).await,
            Err(TransportError::TooLarge { len: 0x100000, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn unknown_type_surfaces_as_message_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        send_frame(&mut a, &Frame::new(99, vec![1])).await.unwrap();
        assert!(matches!(
            recv_message(&mut b, 1024).await,
            Err(TransportError::Message(MessageError::UnknownType(99)))
        ));
    }
}
