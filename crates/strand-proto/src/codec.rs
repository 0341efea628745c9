//! Length-prefixed packet framing for async byte streams
//!
//! Each frame is `varint(length) || packet_bytes` where `packet_bytes` is the
//! protobuf encoding of a [`Packet`]. The reader buffers partial frames until
//! a whole packet is available.

use bytes::{Buf, BytesMut};
use prost::encoding::{decode_varint, encode_varint};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Packet, ProtocolError};

/// Maximum packet size accepted by default (4 MiB).
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

// A length prefix is at most ten varint bytes.
const MAX_PREFIX_LEN: usize = 10;

/// Codec for framing packets over async byte streams.
pub struct PacketCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum packet size allowed
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Create a new packet codec with default settings.
    pub fn new() -> Self {
        Self::with_max_packet_size(MAX_PACKET_SIZE)
    }

    /// Create a new packet codec with a custom max packet size.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_packet_size,
        }
    }

    /// Encode a packet to bytes with its varint length prefix.
    pub fn encode_packet(&self, pkt: &Packet) -> Result<bytes::Bytes, ProtocolError> {
        let len = pkt.encoded_len();
        if len > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }

        let mut buf = BytesMut::with_capacity(MAX_PREFIX_LEN + len);
        encode_varint(len as u64, &mut buf);
        pkt.encode(&mut buf)
            .map_err(|e| ProtocolError::InvalidPacket(e.to_string()))?;
        Ok(buf.freeze())
    }

    /// Write one framed packet to an async writer.
    pub async fn write_packet<W>(&self, writer: &mut W, pkt: &Packet) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_packet(pkt)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one framed packet from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in the
    /// middle of a frame is an error.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> Result<Option<Packet>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(pkt) = self.try_decode_packet()? {
                return Ok(Some(pkt));
            }

            let mut chunk = [0u8; 8192];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::InvalidPacket(
                    "transport closed mid-frame".into(),
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Try to decode one packet from the internal buffer.
    pub fn try_decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        // peek the length prefix without consuming it
        let mut peek: &[u8] = &self.read_buf;
        let available = peek.len();
        let len = match decode_varint(&mut peek) {
            Ok(len) => len as usize,
            Err(e) => {
                if available >= MAX_PREFIX_LEN {
                    return Err(ProtocolError::Decode(e));
                }
                // prefix is still incomplete
                return Ok(None);
            }
        };
        let prefix_len = available - peek.len();

        if len > self.max_packet_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }

        if self.read_buf.len() < prefix_len + len {
            return Ok(None);
        }

        self.read_buf.advance(prefix_len);
        let frame = self.read_buf.split_to(len).freeze();
        let pkt = Packet::decode(frame)?;
        Ok(Some(pkt))
    }
}
