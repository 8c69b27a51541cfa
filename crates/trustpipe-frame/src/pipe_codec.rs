use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::codec::{decode_frame, encode_frame, truncation, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Async codec for length-prefixed frames.
///
/// Use with `tokio_util::codec::FramedRead` / `FramedWrite`. A stream that ends
/// on a frame boundary yields `None` (clean close); a stream that ends inside a
/// frame yields [`FrameError::TruncatedFrame`].
#[derive(Debug, Clone, Default)]
pub struct PipeCodec {
    config: FrameConfig,
}

impl PipeCodec {
    /// Create a codec with the given configuration.
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for PipeCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = decode_frame(src, self.config.max_payload_size)?;
        if let Some(frame) = &frame {
            trace!(size = frame.payload.len(), "decoded frame");
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match truncation(src) {
            None => Ok(None),
            Some(err) => {
                src.clear();
                Err(err)
            }
        }
    }
}

impl Encoder<Bytes> for PipeCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(&payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::codec::HEADER_SIZE;

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut writer = FramedWrite::new(client, PipeCodec::default());
        let mut reader = FramedRead::new(server, PipeCodec::default());

        let large = vec![0xAB; 70 * 1024];
        writer.send(Bytes::from_static(b"x")).await.unwrap();
        writer.send(Bytes::from(large.clone())).await.unwrap();
        writer.send(Bytes::new()).await.unwrap();
        drop(writer);

        let first = reader.next().await.unwrap().unwrap();
        let second = reader.next().await.unwrap().unwrap();
        let third = reader.next().await.unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"x");
        assert_eq!(second.payload.as_ref(), large.as_slice());
        assert!(third.is_close_sentinel());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = FramedRead::new(server, PipeCodec::default());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn eof_inside_payload_is_truncated_not_closed() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut wire = BytesMut::new();
        encode_frame(b"0123456789", &mut wire).unwrap();
        client.write_all(&wire[..HEADER_SIZE + 3]).await.unwrap();
        drop(client);

        let mut reader = FramedRead::new(server, PipeCodec::default());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedFrame {
                expected: 10,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn eof_inside_header_is_truncated() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x10, 0x00]).await.unwrap();
        drop(client);

        let mut reader = FramedRead::new(server, PipeCodec::default());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedFrame {
                expected: HEADER_SIZE,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn encoder_enforces_configured_limit() {
        let (client, _server) = tokio::io::duplex(64);
        let codec = PipeCodec::new(FrameConfig {
            max_payload_size: 4,
        });
        let mut writer = FramedWrite::new(client, codec);

        let err = writer
            .send(Bytes::from_static(b"oversized"))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 4 }));
    }

    #[test]
    fn byte_at_a_time_decoding() {
        let mut wire = BytesMut::new();
        encode_frame(b"slow", &mut wire).unwrap();

        let mut codec = PipeCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded.unwrap().payload.as_ref(), b"slow");
    }
}
