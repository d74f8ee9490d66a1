//! Length-delimited protobuf framing.
//!
//! Wire format: `[unsigned varint length][protobuf body]`
//!
//! [`ControlCodec`] plugs into `tokio_util::codec::Framed`. Decoding keeps
//! partial frames in the framed read buffer, so a frame split across many
//! socket reads is parsed exactly once, when its last byte arrives.

use bytes::{Bytes, BytesMut};
use prost::Message;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame body size (4 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A varint encoding a `u64` never exceeds 10 bytes.
const MAX_VARINT_LEN: usize = 10;

/// Errors from the framing layer. All of them are fatal for the connection.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed length prefix")]
    InvalidLength,
    #[error("Message too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("Malformed message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Codec that decodes frames into `D` and encodes any protobuf message.
///
/// The daemon decodes [`Request`](crate::Request)s and writes both
/// [`Response`](crate::Response)s and raw [`DhtResponse`](crate::DhtResponse)
/// elements through the same codec.
#[derive(Debug)]
pub struct ControlCodec<D> {
    max_frame_len: usize,
    _decodes: PhantomData<fn() -> D>,
}

impl<D> ControlCodec<D> {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            _decodes: PhantomData,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl<D> Default for ControlCodec<D> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl<D> Clone for ControlCodec<D> {
    fn clone(&self) -> Self {
        Self::new(self.max_frame_len)
    }
}

/// Parse the length prefix at the start of `src`.
///
/// Returns `(prefix_len, body_len)`, or `None` when the prefix itself is
/// still incomplete.
fn frame_header(src: &[u8]) -> Result<Option<(usize, usize)>, FramingError> {
    let terminator = src
        .iter()
        .take(MAX_VARINT_LEN)
        .position(|byte| byte & 0x80 == 0);
    match terminator {
        None if src.len() >= MAX_VARINT_LEN => Err(FramingError::InvalidLength),
        None => Ok(None),
        Some(idx) => {
            let body_len =
                prost::decode_length_delimiter(&src[..=idx]).map_err(|_| FramingError::InvalidLength)?;
            Ok(Some((idx + 1, body_len)))
        }
    }
}

impl<D: Message + Default> Decoder for ControlCodec<D> {
    type Item = D;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, FramingError> {
        let Some((prefix_len, body_len)) = frame_header(src)? else {
            return Ok(None);
        };
        if body_len > self.max_frame_len {
            return Err(FramingError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_len,
            });
        }

        let frame_len = prefix_len + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let body = frame.split_off(prefix_len).freeze();
        Ok(Some(D::decode(body)?))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<D>, FramingError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FramingError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl<D, M: Message> Encoder<M> for ControlCodec<D> {
    type Error = FramingError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), FramingError> {
        let body_len = item.encoded_len();
        dst.reserve(prost::length_delimiter_len(body_len) + body_len);
        item.encode_length_delimited(dst)?;
        Ok(())
    }
}

/// Encode a single message as a standalone frame.
///
/// Used where a frame is written straight onto a raw stream, such as the
/// stream-info header sent to a local protocol handler.
pub fn encode_frame<M: Message>(msg: &M) -> Bytes {
    msg.encode_length_delimited_to_vec().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{request, ConnectRequest, Request, Response};
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn connect_request() -> Request {
        Request {
            r#type: request::Type::Connect as i32,
            connect: Some(ConnectRequest {
                peer: vec![0x00, 0x24, 0x08, 0x01],
                addrs: vec![vec![0x04, 127, 0, 0, 1, 0x06, 0x0f, 0xa1]],
                timeout: Some(5),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let frame = encode_frame(&connect_request());
        let mut codec = ControlCodec::<Request>::default();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the final byte completes the frame.
        for (i, byte) in frame.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(decoded.is_none(), "frame decoded early at byte {i}");
            } else {
                assert_eq!(decoded, Some(connect_request()));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_pipelined_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&connect_request()));
        buf.extend_from_slice(&encode_frame(&Request::default()));

        let mut codec = ControlCodec::<Request>::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(connect_request()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Request::default()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut codec = ControlCodec::<Request>::new(16);
        let mut buf = BytesMut::new();
        // Declares a 1000 byte body but sends none of it.
        buf.extend_from_slice(&[0xe8, 0x07]);
        match codec.decode(&mut buf) {
            Err(FramingError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 1000);
                assert_eq!(max, 16);
            }
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let mut codec = ControlCodec::<Request>::default();
        let mut buf = BytesMut::from(&[0xff_u8; 11][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::InvalidLength)
        ));
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let mut codec = ControlCodec::<Request>::default();
        // Length 2, then a field key with an invalid wire type (7).
        let mut buf = BytesMut::from(&[0x02_u8, 0x0f, 0x00][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FramingError::Decode(_))));
    }

    #[test]
    fn test_eof_mid_frame_is_truncated() {
        let frame = encode_frame(&connect_request());
        let mut codec = ControlCodec::<Request>::default();
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FramingError::Truncated { .. })
        ));
    }

    #[test]
    fn test_eof_on_boundary_is_clean() {
        let mut codec = ControlCodec::<Request>::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framed_roundtrip_over_split_writes() {
        let (client, server) = tokio::io::duplex(64);
        let frame = encode_frame(&connect_request());

        let writer = tokio::spawn(async move {
            let mut client = client;
            for chunk in frame.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = FramedRead::new(server, ControlCodec::<Request>::default());
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first, connect_request());
        writer.await.unwrap();
        // Writer dropped its end: clean EOF on a frame boundary.
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_framed_read_truncated_stream() {
        let frame = encode_frame(&connect_request());
        // A whole frame, then half of the next one before EOF.
        let mock = tokio_test::io::Builder::new()
            .read(&frame)
            .read(&frame[..frame.len() / 2])
            .build();

        let mut reader = FramedRead::new(mock, ControlCodec::<Request>::default());
        assert_eq!(reader.next().await.unwrap().unwrap(), connect_request());
        assert!(matches!(
            reader.next().await,
            Some(Err(FramingError::Truncated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_encoder_writes_any_message() {
        let (client, server) = tokio::io::duplex(256);
        let mut sink = FramedWrite::new(client, ControlCodec::<Request>::default());
        sink.send(Response::error("boom")).await.unwrap();
        drop(sink);

        let mut reader = FramedRead::new(server, ControlCodec::<Response>::default());
        let resp = reader.next().await.unwrap().unwrap();
        assert_eq!(resp.error_message(), Some("boom"));
    }
}
