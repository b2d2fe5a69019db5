use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::protocol::{MAX_PACKET_SIZE, Packet, PacketError, frame_len};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),
}

/// Receiving half of a control connection.
///
/// Packets carry no length prefix. A packet must arrive within a single
/// `read` of the underlying stream; a read holding several packets is split
/// by kind, with an `Init` always taking the remainder.
pub struct PacketReader<R> {
    inner: R,
    buf: Box<[u8; MAX_PACKET_SIZE]>,
    pending: Bytes,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Box::new([0u8; MAX_PACKET_SIZE]),
            pending: Bytes::new(),
        }
    }

    /// Reads one raw packet. `Ok(None)` means the peer closed the connection.
    ///
    /// Cancel safe: a single `read` call is the only await point.
    pub async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        if self.pending.is_empty() {
            let n = self.inner.read(&mut self.buf[..]).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending = Bytes::copy_from_slice(&self.buf[..n]);
        }
        let len = frame_len(&self.pending);
        Ok(Some(self.pending.split_to(len)))
    }

    pub async fn read_packet(&mut self) -> Result<Option<Packet>, ConnectionError> {
        match self.read_frame().await? {
            Some(raw) => Ok(Some(Packet::decode_bytes(&raw)?)),
            None => Ok(None),
        }
    }
}

pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_raw(&mut self, raw: &[u8]) -> io::Result<()> {
        self.inner.write_all(raw).await?;
        self.inner.flush().await
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let raw = packet.encode()?;
        self.write_raw(&raw).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

pub struct PacketConn<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite> PacketConn<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn split(self) -> (PacketReader<ReadHalf<S>>, PacketWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (PacketReader::new(read), PacketWriter::new(write))
    }
}
