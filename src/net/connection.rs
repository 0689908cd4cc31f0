//! Instrumented connections.
//!
//! # Responsibilities
//! - Wrap a live socket and measure every completed read, write and close
//! - Roll byte counts up into the owning `Emitter`
//! - Optionally copy the transferred bytes into the measurement
//!
//! # Design Decisions
//! - The connection ID is fixed at dial time and never changes
//! - Close is measured exactly once: on shutdown, or on drop otherwise
//! - Payloads are copied so a measurement never aliases a caller buffer

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use crate::measurement::{CloseEvent, ConnId, Emitter, IoEvent, Measurement};
use crate::net::Network;

/// A connected TCP stream or connected UDP socket.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Socket {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.local_addr(),
            Socket::Udp(s) => s.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.peer_addr(),
            Socket::Udp(s) => s.peer_addr(),
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Udp(s) => s.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Udp(s) => s.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            Socket::Udp(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Udp(_) => Poll::Ready(Ok(())),
        }
    }
}

/// A connection whose I/O is measured and tagged with its `ConnId`.
#[derive(Debug)]
pub struct MeasuringConn<S = Socket> {
    inner: S,
    id: ConnId,
    network: Network,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    emitter: Arc<Emitter>,
    read_started: Option<Instant>,
    write_started: Option<Instant>,
    close_started: Option<Instant>,
    closed: bool,
}

impl MeasuringConn<Socket> {
    /// Wrap a freshly connected socket.
    pub fn from_socket(socket: Socket, id: ConnId, network: Network, emitter: Arc<Emitter>) -> Self {
        let local_addr = socket.local_addr().ok();
        let peer_addr = socket.peer_addr().ok();
        Self::new(socket, id, network, emitter).with_addrs(local_addr, peer_addr)
    }

    /// Receive one datagram and its sender.
    pub async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let start = Instant::now();
        let result = match &self.inner {
            Socket::Udp(s) => s.recv_from(buf).await,
            Socket::Tcp(_) => Err(not_a_packet_conn("recv_from")),
        };
        let (n, peer) = match &result {
            Ok((n, peer)) => (*n, Some(*peer)),
            Err(_) => (0, None),
        };
        self.record_read(start, &buf[..n], result.as_ref().err(), peer);
        result
    }

    /// Send one datagram to `target`.
    pub async fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let start = Instant::now();
        let result = match &self.inner {
            Socket::Udp(s) => s.send_to(buf, target).await,
            Socket::Tcp(_) => Err(not_a_packet_conn("send_to")),
        };
        let n = *result.as_ref().unwrap_or(&0);
        self.record_write(start, &buf[..n], result.as_ref().err(), Some(target));
        result
    }
}

fn not_a_packet_conn(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("{op} requires a datagram connection"))
}

impl<S> MeasuringConn<S> {
    pub fn new(inner: S, id: ConnId, network: Network, emitter: Arc<Emitter>) -> Self {
        Self {
            inner,
            id,
            network,
            local_addr: None,
            peer_addr: None,
            emitter,
            read_started: None,
            write_started: None,
            close_started: None,
            closed: false,
        }
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn payload(&self, data: &[u8]) -> Option<Bytes> {
        (self.emitter.captures_payload() && !data.is_empty()).then(|| Bytes::copy_from_slice(data))
    }

    fn record_read(&self, start: Instant, data: &[u8], err: Option<&io::Error>, peer: Option<SocketAddr>) {
        let stop = Instant::now();
        let n = data.len();
        self.emitter.add_read(n);
        tracing::trace!(conn_id = %self.id, bytes = n, "read");
        if let Some(e) = err {
            tracing::debug!(conn_id = %self.id, error = %e, "read failed");
        }
        self.emitter.emit(Measurement::Read(IoEvent {
            conn_id: self.id,
            num_bytes: n as u64,
            peer,
            data: self.payload(data),
            duration: stop.duration_since(start),
            error: err.map(ToString::to_string),
            time: self.emitter.since_beginning(stop),
        }));
    }

    fn record_write(&self, start: Instant, data: &[u8], err: Option<&io::Error>, peer: Option<SocketAddr>) {
        let stop = Instant::now();
        let n = data.len();
        self.emitter.add_written(n);
        tracing::trace!(conn_id = %self.id, bytes = n, "write");
        if let Some(e) = err {
            tracing::debug!(conn_id = %self.id, error = %e, "write failed");
        }
        self.emitter.emit(Measurement::Write(IoEvent {
            conn_id: self.id,
            num_bytes: n as u64,
            peer,
            data: self.payload(data),
            duration: stop.duration_since(start),
            error: err.map(ToString::to_string),
            time: self.emitter.since_beginning(stop),
        }));
    }

    fn record_close(&mut self, start: Instant, err: Option<&io::Error>) {
        if self.closed {
            return;
        }
        self.closed = true;
        let stop = Instant::now();
        tracing::debug!(conn_id = %self.id, "close");
        self.emitter.emit(Measurement::Close(CloseEvent {
            conn_id: self.id,
            duration: stop.duration_since(start),
            error: err.map(ToString::to_string),
            time: self.emitter.since_beginning(stop),
        }));
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeasuringConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = *this.read_started.get_or_insert_with(Instant::now);
        let before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        this.read_started = None;
        this.record_read(start, &buf.filled()[before..], result.as_ref().err(), None);
        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeasuringConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let start = *this.write_started.get_or_insert_with(Instant::now);
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        this.write_started = None;
        let n = *result.as_ref().unwrap_or(&0);
        this.record_write(start, &buf[..n], result.as_ref().err(), None);
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = *this.close_started.get_or_insert_with(Instant::now);
        let result = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        this.record_close(start, result.as_ref().err());
        Poll::Ready(result)
    }
}

impl<S> Drop for MeasuringConn<S> {
    fn drop(&mut self) {
        let start = self.close_started.unwrap_or_else(Instant::now);
        self.record_close(start, None);
    }
}
