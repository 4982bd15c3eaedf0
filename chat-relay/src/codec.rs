//! Length-prefixed text frames.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by that many
//! bytes of UTF-8. Framing is delegated to [`LengthDelimitedCodec`], which keeps
//! partial frames buffered across reads, so a message split over several TCP
//! segments (or several messages packed into one) decodes the same way. This
//! module adds the UTF-8 step and maps codec failures onto [`FrameError`].

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{
    Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError,
};

use crate::error::FrameError;

/// Size of the big-endian length prefix.
pub const LEN_PREFIX: usize = 4;

/// Inbound frame limit used when nothing else is configured.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Outbound frame limit used when nothing else is configured. Relayed frames
/// carry `"<username>: "` on top of an inbound payload, so this sits well above
/// [`DEFAULT_MAX_FRAME_LEN`].
pub const DEFAULT_MAX_OUTBOUND_FRAME_LEN: usize = 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, FrameCodec>;
pub type FrameWriter<W> = FramedWrite<W, FrameCodec>;

/// UTF-8 frames with a payload limit that applies in both directions. Readers
/// and writers each get their own instance, so the limits can differ.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_len: usize,
    // The inner codec consumes the length prefix before the payload is
    // complete; this tracks whether it is part way through a frame.
    mid_frame: bool,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(LEN_PREFIX)
            .max_frame_length(max_frame_len)
            .new_codec();
        Self {
            inner,
            max_frame_len,
            mid_frame: false,
        }
    }

    fn map_error(&self, err: io::Error) -> FrameError {
        let too_large = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_large {
            FrameError::FrameTooLarge {
                max: self.max_frame_len,
            }
        } else {
            FrameError::Transport(err)
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        let buffered = src.len();
        match self.inner.decode(src) {
            Ok(Some(payload)) => {
                self.mid_frame = false;
                Ok(Some(String::from_utf8(payload.to_vec())?))
            }
            Ok(None) => {
                if src.len() < buffered {
                    self.mid_frame = true;
                }
                Ok(None)
            }
            Err(err) => Err(self.map_error(err)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && !self.mid_frame => Ok(None),
            None => Err(FrameError::TransportClosed),
        }
    }
}

impl<T> Encoder<T> for FrameCodec
where
    T: AsRef<str>,
{
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = item.as_ref().as_bytes();
        if payload.len() > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                max: self.max_frame_len,
            });
        }
        self.inner
            .encode(Bytes::copy_from_slice(payload), dst)
            .map_err(|err| self.map_error(err))
    }
}

/// Reads the next message. `Ok(None)` means the peer closed the stream on a
/// frame boundary.
pub async fn read_message<R>(reader: &mut FrameReader<R>) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

/// Encodes and flushes one message. Nothing is written when the message is
/// over the writer's frame limit.
pub async fn write_message<W>(writer: &mut FrameWriter<W>, message: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.send(message).await
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn encoded(message: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default()
            .encode(message, &mut buf)
            .expect("encode frame");
        buf
    }

    #[test]
    fn frame_layout_is_big_endian_length_then_utf8() {
        let buf = encoded("héllo");
        assert_eq!(&buf[..LEN_PREFIX], &[0, 0, 0, 6]);
        assert_eq!(&buf[LEN_PREFIX..], "héllo".as_bytes());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let full = encoded("split across reads");
        let mut src = BytesMut::new();

        for chunk in full.chunks(3) {
            assert_eq!(codec.decode(&mut src).expect("decode partial"), None);
            src.extend_from_slice(chunk);
        }

        let frame = codec.decode(&mut src).expect("decode full");
        assert_eq!(frame.as_deref(), Some("split across reads"));
        assert!(src.is_empty());
    }

    #[test]
    fn several_frames_in_one_read_decode_separately() {
        let mut codec = FrameCodec::default();
        let mut src = encoded("first");
        src.extend_from_slice(&encoded(""));
        src.extend_from_slice(&encoded("third"));

        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some(""));
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("third"));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn oversized_length_is_rejected_before_payload_arrives() {
        let mut codec = FrameCodec::new(8);
        let mut src = BytesMut::from(&[0u8, 0, 0, 9][..]);

        let err = codec.decode(&mut src).expect_err("frame should be too large");
        assert!(matches!(err, FrameError::FrameTooLarge { max: 8 }));
    }

    #[test]
    fn frame_at_the_limit_is_accepted() {
        let mut codec = FrameCodec::new(4);
        let mut src = encoded("four");
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("four"));
    }

    #[test]
    fn oversized_outbound_frame_is_refused_without_writing() {
        let mut codec = FrameCodec::new(8);
        let mut dst = BytesMut::new();

        codec.encode("12345678", &mut dst).expect("at the limit");
        assert_eq!(dst.len(), LEN_PREFIX + 8);

        dst.clear();
        let err = codec.encode("123456789", &mut dst).expect_err("over the limit");
        assert!(matches!(err, FrameError::FrameTooLarge { max: 8 }));
        assert!(dst.is_empty());
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::from(&[0u8, 0, 0, 2, 0xff, 0xfe][..]);

        let err = codec.decode(&mut src).expect_err("payload is not utf-8");
        assert!(matches!(err, FrameError::InvalidUtf8(_)));
    }

    #[test]
    fn eof_mid_frame_is_a_closed_transport() {
        let mut codec = FrameCodec::default();
        let mut src = encoded("truncated");
        src.truncate(LEN_PREFIX + 3);

        let err = codec.decode_eof(&mut src).expect_err("frame is incomplete");
        assert!(matches!(err, FrameError::TransportClosed));
        assert!(err.is_disconnect());
    }

    #[test]
    fn eof_after_a_bare_length_prefix_is_a_closed_transport() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::from(&[0u8, 0, 0, 5][..]);

        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert!(src.is_empty());
        let err = codec.decode_eof(&mut src).expect_err("payload never arrived");
        assert!(matches!(err, FrameError::TransportClosed));
    }

    #[test]
    fn eof_on_boundary_ends_the_stream() {
        let mut codec = FrameCodec::default();
        let mut src = encoded("whole");
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("whole"));
        assert_eq!(codec.decode_eof(&mut src).unwrap(), None);
    }

    #[tokio::test]
    async fn roundtrip_over_duplex_stream() {
        let (client, server) = tokio::io::duplex(16);
        let mut writer = FrameWriter::new(client, FrameCodec::default());
        let mut reader = FrameReader::new(server, FrameCodec::default());
        let long = "x".repeat(1000);

        let sender = tokio::spawn(async move {
            write_message(&mut writer, "USERLIST:alice,bob")
                .await
                .expect("write roster");
            write_message(&mut writer, &long).await.expect("write long");
            writer.into_inner().shutdown().await.expect("shutdown");
        });

        let roster = read_message(&mut reader).await.expect("read roster");
        assert_eq!(roster.as_deref(), Some("USERLIST:alice,bob"));
        let long = read_message(&mut reader).await.expect("read long");
        assert_eq!(long.map(|text| text.len()), Some(1000));
        assert_eq!(read_message(&mut reader).await.expect("read eof"), None);

        sender.await.expect("sender task");
    }
}
