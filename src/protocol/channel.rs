//! Framed channel: type-ID header plus dispatch to the packet decoders.

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::codec::{WireReader, WireWriter};
use crate::protocol::packet::{Packet, PacketType};
use crate::tree::StagingArea;

/// Inbound half of a connection.
pub struct FrameReader<R> {
    wire: WireReader<R>,
    staging: Option<StagingArea>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, timeout: std::time::Duration) -> Self {
        Self {
            wire: WireReader::new(inner, timeout),
            staging: None,
        }
    }

    /// Where incoming file content is staged. Until this is set, a SendFile
    /// carrying content is a protocol fault.
    pub fn stage_into(&mut self, staging: StagingArea) {
        self.staging = Some(staging);
    }

    /// Receive the next packet. `None` means the peer closed the stream
    /// between frames.
    pub async fn receive(&mut self) -> Result<Option<Packet>> {
        let Some(id) = self.wire.read_header().await? else {
            return Ok(None);
        };
        let packet_type = PacketType::from_u8(id).ok_or(ProtocolError::UnknownPacketType(id))?;
        debug!("<- {}", packet_type.name());

        let packet = Packet::decode(packet_type, &mut self.wire, self.staging.as_ref()).await?;
        Ok(Some(packet))
    }
}

/// Outbound half of a connection.
pub struct FrameWriter<W: AsyncWrite> {
    wire: WireWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, timeout: std::time::Duration) -> Self {
        Self {
            wire: WireWriter::new(inner, timeout),
        }
    }

    /// Write the type ID, then the body, then flush.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let packet_type = packet.packet_type();
        debug!("-> {}", packet_type.name());
        self.wire.write_all(&[packet_type as u8]).await?;
        packet.send_body(&mut self.wire).await?;
        self.wire.flush().await
    }

    /// Send every queued packet in order until the queue closes, then close
    /// the write direction.
    pub async fn drain(mut self, mut rx: UnboundedReceiver<Packet>) -> Result<()> {
        while let Some(packet) = rx.recv().await {
            self.send(&packet).await?;
        }
        self.wire.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.wire.into_inner()
    }
}

/// Both halves of one session's connection.
pub struct FramedChannel<R, W: AsyncWrite> {
    pub reader: FrameReader<R>,
    pub writer: FrameWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> FramedChannel<R, W> {
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.writer.send(packet).await
    }

    pub async fn receive(&mut self) -> Result<Option<Packet>> {
        self.reader.receive().await
    }

    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

impl<S: AsyncRead + AsyncWrite> FramedChannel<ReadHalf<S>, WriteHalf<S>> {
    /// Split a bidirectional stream, applying the configured deadlines.
    pub fn from_stream(stream: S, config: &SyncConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half, config.read_timeout()),
            writer: FrameWriter::new(write_half, config.write_timeout()),
        }
    }
}
