//! Interleaved RTSP framing.
//!
//! A single TCP stream multiplexes text messages with binary RTP frames.
//! The reader peeks one byte: `0x24` introduces a binary frame
//! (`0x24 <channel:u8> <length:u16-be> <payload>`); anything else starts a
//! text message read line by line until the blank line, then continued by
//! `Content-Length` body bytes.
//!
//! Parsing never buffers unbounded input: the header block is capped at
//! [`MAX_HEADER_BYTES`] and the body at a configured limit.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Request, Response};

/// First byte of an interleaved binary frame (`$`).
pub const INTERLEAVED_MAGIC: u8 = 0x24;

/// Upper bound on a text message's header block.
pub const MAX_HEADER_BYTES: usize = 32 * 1024;

/// One unit read off the wire.
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    Rtp { channel: u8, payload: Bytes },
}

/// Buffered frame reader for one connection.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    body_limit: usize,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, buffer_size: usize, body_limit: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, inner),
            body_limit,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed off the wire so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read the next frame, text or binary. Stray CRLF bytes between
    /// messages (some clients use them as keep-alives) are skipped.
    pub async fn read_frame(&mut self) -> Result<Incoming> {
        let first = loop {
            let byte = self.reader.read_u8().await?;
            self.bytes_read += 1;
            if byte != b'\r' && byte != b'\n' {
                break byte;
            }
        };
        if first == INTERLEAVED_MAGIC {
            return self.read_interleaved().await;
        }
        self.read_request(first).await
    }

    async fn read_interleaved(&mut self) -> Result<Incoming> {
        let channel = self.reader.read_u8().await?;
        let len = self.reader.read_u16().await? as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        self.bytes_read += len as u64 + 3;
        Ok(Incoming::Rtp {
            channel,
            payload: Bytes::from(payload),
        })
    }

    async fn read_request(&mut self, first: u8) -> Result<Incoming> {
        let mut head = Vec::with_capacity(256);
        head.push(first);
        loop {
            let line_start = head.len();
            let n = self.reader.read_until(b'\n', &mut head).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-request",
                )
                .into());
            }
            if head.len() > MAX_HEADER_BYTES {
                return Err(ProtocolError::HeaderTooLarge(MAX_HEADER_BYTES).into());
            }
            let line = &head[line_start..];
            if line == b"\r\n" || line == b"\n" {
                break;
            }
        }
        // the first byte was already counted by read_frame
        self.bytes_read += head.len() as u64 - 1;

        let text = String::from_utf8_lossy(&head);
        let mut request = Request::parse(&text).map_err(crate::error::Error::Protocol)?;

        let len = request.content_length();
        if len > self.body_limit {
            return Err(ProtocolError::BodyTooLarge {
                got: len,
                limit: self.body_limit,
            }
            .into());
        }
        if len > 0 {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).await?;
            self.bytes_read += len as u64;
            request.body = String::from_utf8_lossy(&body).into_owned();
        }
        Ok(Incoming::Request(request))
    }
}

/// Buffered frame writer. One per connection, shared behind a mutex so
/// responses and media frames never interleave mid-frame.
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
    bytes_written: u64,
}

/// The session-facing writer type: the transport is erased so tests can
/// substitute in-memory pipes for a TCP write half.
pub type SessionWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, buffer_size: usize) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, inner),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Serialize and send a response.
    pub async fn write_response(&mut self, response: &Response) -> std::io::Result<usize> {
        let text = response.serialize();
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        self.bytes_written += text.len() as u64;
        Ok(text.len())
    }

    /// Frame and send one RTP packet. The length field always equals the
    /// payload length; payloads longer than a u16 cannot occur because both
    /// ingress paths produce datagram-sized packets.
    pub async fn write_interleaved(&mut self, channel: u8, payload: &[u8]) -> std::io::Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let len = payload.len() as u16;
        let header = [INTERLEAVED_MAGIC, channel, (len >> 8) as u8, len as u8];
        self.writer.write_all(&header).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        self.bytes_written += payload.len() as u64 + 4;
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}
