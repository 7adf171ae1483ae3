//! Length-prefixed MessagePack framing
//!
//! Format: `[length: u32 big-endian][payload: MessagePack value]`

use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Peer closed the stream before sending any byte of a frame
    #[error("End of stream")]
    EndOfStream,

    #[error("Stream closed mid-frame ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the peer went away, cleanly or mid-frame
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, CodecError::EndOfStream | CodecError::Truncated { .. })
    }

    /// Underlying I/O error, if any
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            CodecError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Encode a message into a single frame
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> Result<Bytes, CodecError> {
    let payload = rmp_serde::to_vec_named(msg)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Message framer over a byte stream.
///
/// Reads are unbuffered: exactly the bytes of each frame are consumed, so the
/// wrapped stream can be taken back with [`MessageStream::into_inner`] and
/// used for raw application traffic.
#[derive(Debug)]
pub struct MessageStream<S> {
    inner: S,
}

impl<S> MessageStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive one frame and decode it as `T`
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let payload = self.recv_payload().await?;
        Ok(rmp_serde::from_slice(&payload)?)
    }

    /// Receive one frame as a dynamic MessagePack value
    pub async fn recv_value(&mut self) -> Result<rmpv::Value, CodecError> {
        self.recv().await
    }

    /// Encode `msg` and write it as one frame
    pub async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), CodecError> {
        let frame = encode_frame(msg)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        trace!("Sent frame ({} bytes)", frame.len() - FRAME_HEADER_SIZE);
        Ok(())
    }

    async fn recv_payload(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;

        while filled < FRAME_HEADER_SIZE {
            let n = match self.inner.read(&mut header[filled..]).await {
                Ok(n) => n,
                // TLS peers that vanish without close_notify surface as UnexpectedEof
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(if filled == 0 {
                    CodecError::EndOfStream
                } else {
                    CodecError::Truncated {
                        received: filled,
                        expected: FRAME_HEADER_SIZE,
                    }
                });
            }
            filled += n;
        }

        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        let mut received = 0;
        while received < length {
            let n = match self.inner.read(&mut payload[received..]).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(CodecError::Truncated {
                    received,
                    expected: length,
                });
            }
            received += n;
        }

        trace!("Received frame ({} bytes)", length);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionInfo, ConnectionType, ControlRequest};
    use rmpv::Value;

    #[test]
    fn test_encode_prefix_matches_payload_length() {
        let msg = ControlRequest::new(ConnectionType::Tcp, "4444");
        let encoded = encode_frame(&msg).unwrap();
        let payload = rmp_serde::to_vec_named(&msg).unwrap();

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + payload.len());
        assert_eq!(&encoded[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&encoded[4..], &payload[..]);
    }

    #[tokio::test]
    async fn test_recv_rejects_oversized_length() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();

        let mut server = MessageStream::new(server);
        let err = server.recv_value().await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(n) if n == MAX_FRAME_SIZE + 1));
        assert!(!err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_stream_send_recv() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = MessageStream::new(client);
        let mut server = MessageStream::new(server);

        let info = ConnectionInfo::new("10.0.0.1", 4444, "8.8.8.8", 53);
        client.send(&info).await.unwrap();
        client.send(&Value::Binary(b"payload".to_vec())).await.unwrap();

        let received: ConnectionInfo = server.recv().await.unwrap();
        assert_eq!(received, info);
        assert_eq!(
            server.recv_value().await.unwrap(),
            Value::Binary(b"payload".to_vec())
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_before_prefix() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut server = MessageStream::new(server);
        let err = server.recv_value().await.unwrap_err();
        assert!(matches!(err, CodecError::EndOfStream));
        assert!(err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let encoded = encode_frame(&Value::from("hello world")).unwrap();
        client.write_all(&encoded[..6]).await.unwrap();
        drop(client);

        let mut server = MessageStream::new(server);
        let err = server.recv_value().await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                received: 2,
                expected: 12
            }
        ));
        assert!(err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let (mut client, server) = tokio::io::duplex(64);
        // 0xc1 is reserved in MessagePack and never valid
        client.write_all(&[0, 0, 0, 1, 0xc1]).await.unwrap();

        let mut server = MessageStream::new(server);
        let err = server.recv::<ConnectionInfo>().await.unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(!err.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_into_inner_keeps_trailing_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let encoded = encode_frame(&Value::from(1)).unwrap();
        client.write_all(&encoded).await.unwrap();
        client.write_all(b"raw traffic").await.unwrap();
        drop(client);

        let mut framed = MessageStream::new(server);
        assert_eq!(framed.recv_value().await.unwrap(), Value::from(1));

        let mut inner = framed.into_inner();
        let mut rest = Vec::new();
        inner.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw traffic");
    }
}
