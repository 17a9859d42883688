//! Framing: 4-byte big-endian length prefix followed by the JSON payload.
//!
//! A single `read` on a stream socket may return half a message or several
//! messages at once, so frames are reassembled from an internal buffer.

use crate::proto::Envelope;
use crate::{Error, Result, MAX_FRAME_LEN};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_SIZE: usize = 4;

/// Encode an envelope into one frame: length prefix + JSON payload
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = envelope.to_bytes()?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Write one envelope as a single frame.
///
/// The frame is assembled before writing so it goes out in one `write_all`.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered reader yielding whole frame payloads.
///
/// `next_frame` is cancel-safe: bytes already read stay in the buffer when
/// the future is dropped (e.g. by a timeout in `select!`), so the next call
/// resumes the same frame.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next frame payload.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames; EOF in the middle of
    /// a frame is an `UnexpectedEof` IO error.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {} bytes of a partial frame", self.buf.len()),
                )));
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LEN_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < LEN_SIZE + len {
            self.buf.reserve(LEN_SIZE + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LEN_SIZE);
        Ok(Some(self.buf.split_to(len).to_vec()))
    }
}
