use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::protocol::constants::{MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};

/// Transport under the packet framing: plain TCP, Unix socket, or a TLS
/// session established during the handshake.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Stream {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_read_timeout(timeout),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.sock.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.sock.shutdown(std::net::Shutdown::Both),
        }
    }

    /// True when the transport itself is confidential (TLS or a local
    /// socket); gates clear-password authentication.
    pub fn is_confidential(&self) -> bool {
        match self {
            Stream::Tcp(_) => false,
            #[cfg(unix)]
            Stream::Unix(_) => true,
            #[cfg(feature = "tls")]
            Stream::Tls(_) => true,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// Packet framing over a blocking stream. Payload writes accumulate in a
/// buffer; `end_packet` frames and sends, splitting at MAX_PAYLOAD_LEN.
/// `read_packet` reassembles multi-frame payloads and tracks the sequence
/// id so that a reply can continue the exchange.
pub struct PacketIo {
    stream: Stream,
    buf: Vec<u8>,
    seq: u8,
    packet_debug: bool,
}

impl Write for PacketIo {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PacketIo {
    pub fn new(stream: Stream, packet_debug: bool) -> Self {
        PacketIo {
            stream,
            buf: Vec::new(),
            seq: 0,
            packet_debug,
        }
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    /// Every command starts a fresh exchange at sequence 0.
    pub fn start_command(&mut self) {
        self.seq = 0;
        self.buf.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Rewrap the transport, keeping framing state (TLS upgrade during the
    /// handshake).
    pub fn map_stream(
        self,
        f: impl FnOnce(Stream) -> io::Result<Stream>,
    ) -> io::Result<PacketIo> {
        let PacketIo {
            stream,
            buf,
            seq,
            packet_debug,
        } = self;
        Ok(PacketIo {
            stream: f(stream)?,
            buf,
            seq,
            packet_debug,
        })
    }

    /// Read one logical packet, reassembling 16MB continuation frames.
    pub fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_LEN];
            self.stream.read_exact(&mut header)?;
            let len = LittleEndian::read_u24(&header) as usize;
            self.seq = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..])?;

            if len < MAX_PAYLOAD_LEN {
                break;
            }
        }
        if self.packet_debug {
            let shown = payload.len().min(1024);
            trace!(
                "read packet len={} seq={} data={}",
                payload.len(),
                self.seq.wrapping_sub(1),
                hex::encode(&payload[..shown])
            );
        }
        Ok(payload)
    }

    /// Frame and send the buffered payload. A payload landing exactly on a
    /// frame boundary is terminated by an empty frame so the peer knows the
    /// packet ended.
    pub fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0u8; PACKET_HEADER_LEN];
        let raw_packet = std::mem::take(&mut self.buf);
        if self.packet_debug {
            let shown = raw_packet.len().min(1024);
            trace!(
                "send packet len={} seq={} data={}",
                raw_packet.len(),
                self.seq,
                hex::encode(&raw_packet[..shown])
            );
        }

        if raw_packet.is_empty() {
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq;
            self.increase_seq();
            return self.stream.write_all(&header);
        }

        let mut chunks = raw_packet.chunks(MAX_PAYLOAD_LEN).peekable();
        let mut last_len = 0;
        while let Some(chunk) = chunks.next() {
            LittleEndian::write_u24(&mut header, chunk.len() as u32);
            header[3] = self.seq;
            self.increase_seq();
            self.stream.write_all(&header)?;
            self.stream.write_all(chunk)?;
            if chunks.peek().is_none() {
                last_len = chunk.len();
            }
        }
        if last_len == MAX_PAYLOAD_LEN {
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq;
            self.increase_seq();
            self.stream.write_all(&header)?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown();
    }
}
