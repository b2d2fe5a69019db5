//! Single-port connection multiplexer.
//!
//! Every accepted connection is classified by its first byte: the control
//! sentinel routes it to the control listener, anything else (an HTTP request
//! in practice) routes it to the stream listener with that byte replayed.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const CONTROL_BYTE: u8 = b'@';

const ROUTE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("listener closed")]
pub struct ListenerClosed;

/// An accepted connection, with the sniffed byte replayed for stream
/// connections.
#[derive(Debug)]
pub struct MuxStream {
    inner: TcpStream,
    prefix: Option<u8>,
    peer_addr: SocketAddr,
}

impl MuxStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if let Some(byte) = this.prefix.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// One side of the multiplexer. Clones share the same queue and close state.
#[derive(Clone)]
pub struct VirtualListener {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
    closed: CancellationToken,
    local_addr: SocketAddr,
}

impl VirtualListener {
    pub async fn accept(&self) -> Result<MuxStream, ListenerClosed> {
        if self.closed.is_cancelled() {
            return Err(ListenerClosed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ListenerClosed),
            conn = rx.recv() => conn.ok_or(ListenerClosed),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the listener is closed.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl axum::serve::Listener for VirtualListener {
    type Io = MuxStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match VirtualListener::accept(self).await {
            Ok(conn) => {
                let addr = conn.peer_addr();
                (conn, addr)
            }
            // axum cannot be told the listener is gone; the server is shut
            // down through `closed()` instead.
            Err(ListenerClosed) => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[derive(Clone)]
struct Route {
    tx: mpsc::Sender<MuxStream>,
    closed: CancellationToken,
}

impl Route {
    fn new(parent: &CancellationToken, local_addr: SocketAddr) -> (Self, VirtualListener) {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        let closed = parent.child_token();
        let listener = VirtualListener {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closed: closed.clone(),
            local_addr,
        };
        (Self { tx, closed }, listener)
    }

    async fn deliver(&self, conn: MuxStream) {
        let peer = conn.peer_addr();
        tokio::select! {
            _ = self.closed.cancelled() => {
                log::debug!("Dropping connection from {}: listener closed", peer);
            }
            result = self.tx.send(conn) => {
                if result.is_err() {
                    log::debug!("Dropping connection from {}: listener gone", peer);
                }
            }
        }
    }
}

pub struct Cmux {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    control: Route,
    control_listener: VirtualListener,
    stream: Mutex<(Route, VirtualListener)>,
}

impl Cmux {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let (control, control_listener) = Route::new(&shutdown, local_addr);
        let stream = Route::new(&shutdown, local_addr);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown,
            control,
            control_listener,
            stream: Mutex::new(stream),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn control(&self) -> VirtualListener {
        self.control_listener.clone()
    }

    pub fn stream(&self) -> VirtualListener {
        self.stream.lock().1.clone()
    }

    /// Closes the current stream listener and installs a fresh one.
    /// Connections already accepted from the old listener are unaffected.
    pub fn rearm_stream(&self) -> VirtualListener {
        let (route, listener) = Route::new(&self.shutdown, self.local_addr);
        let mut stream = self.stream.lock();
        stream.1.close();
        *stream = (route, listener.clone());
        listener
    }

    /// Accepts and classifies connections until [`Cmux::close`] is called.
    /// Returns immediately if the raw listener was already taken.
    pub async fn serve(self: Arc<Self>) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer_addr)) => {
                    let cmux = Arc::clone(&self);
                    tokio::spawn(async move { cmux.classify(conn, peer_addr).await });
                }
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                }
            }
        }

        log::debug!("Multiplexer on {} stopped", self.local_addr);
    }

    async fn classify(&self, mut conn: TcpStream, peer_addr: SocketAddr) {
        let mut first = [0u8; 1];
        let read = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            read = conn.read(&mut first) => read,
        };

        match read {
            Ok(0) => {
                log::debug!("Connection from {} closed before the decisive read", peer_addr);
            }
            Ok(_) if first[0] == CONTROL_BYTE => {
                let conn = MuxStream {
                    inner: conn,
                    prefix: None,
                    peer_addr,
                };
                self.control.deliver(conn).await;
            }
            Ok(_) => {
                let conn = MuxStream {
                    inner: conn,
                    prefix: Some(first[0]),
                    peer_addr,
                };
                let route = self.stream.lock().0.clone();
                route.deliver(conn).await;
            }
            Err(e) => {
                log::debug!("Decisive read from {} failed: {}", peer_addr, e);
            }
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        self.control_listener.close();
        self.stream.lock().1.close();
        drop(self.listener.lock().take());
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Opens a control connection: connects and writes the sentinel byte.
pub async fn dial_control<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    stream.write_all(&[CONTROL_BYTE]).await?;
    stream.flush().await?;
    Ok(stream)
}
