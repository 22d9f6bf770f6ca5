use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use bytes::{Buf, BytesMut};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};
use crate::config::StreamConfig;
use crate::transport::byte_stream::{ByteStream, ReadOutcome, TransportParams, WriteOutcome};

/// Outcome of an asynchronous connection attempt. `attempt` identifies the attempt, so that
///  outcomes of superseded attempts can be discarded.
#[derive(Debug)]
pub enum StreamEvent {
    Connected { attempt: u64, socket: TcpStream },
    ConnectRefused { attempt: u64 },
    ConnectFailed { attempt: u64, error: io::Error },
}

impl StreamEvent {
    pub fn attempt(&self) -> u64 {
        match self {
            StreamEvent::Connected { attempt, .. } => *attempt,
            StreamEvent::ConnectRefused { attempt } => *attempt,
            StreamEvent::ConnectFailed { attempt, .. } => *attempt,
        }
    }
}

#[derive(Debug, Default)]
struct SlotInner {
    socket: RefCell<Option<Rc<TcpStream>>>,
    attempt: Cell<u64>,
}

/// The connected socket of a [TcpByteStream], shared with the event loop that waits for the
///  socket's readiness
#[derive(Debug, Clone, Default)]
pub struct SocketSlot {
    inner: Rc<SlotInner>,
}

impl SocketSlot {
    pub fn socket(&self) -> Option<Rc<TcpStream>> {
        self.inner.socket.borrow().clone()
    }

    pub fn attach(&self, socket: TcpStream) {
        *self.inner.socket.borrow_mut() = Some(Rc::new(socket));
    }

    pub fn clear(&self) {
        self.inner.socket.borrow_mut().take();
    }

    /// the id of the most recent connection attempt
    pub fn attempt(&self) -> u64 {
        self.inner.attempt.get()
    }

    fn next_attempt(&self) -> u64 {
        let attempt = self.inner.attempt.get().wrapping_add(1);
        self.inner.attempt.set(attempt);
        attempt
    }
}

/// A [ByteStream] over a tokio TCP socket.
///
/// Outbound frames are appended to a transmit buffer that is written opportunistically. While
///  the buffer is above its high-water mark, writes are rejected as 'would block', which is
///  how socket backpressure reaches the scheduler.
pub struct TcpByteStream {
    config: StreamConfig,
    slot: SocketSlot,
    events: mpsc::UnboundedSender<StreamEvent>,
    connect_task: Option<JoinHandle<()>>,
    tx_buf: BytesMut,
}

impl TcpByteStream {
    pub fn new(config: StreamConfig, events: mpsc::UnboundedSender<StreamEvent>) -> TcpByteStream {
        TcpByteStream {
            config,
            slot: SocketSlot::default(),
            events,
            connect_task: None,
            tx_buf: BytesMut::new(),
        }
    }

    /// wraps a passively accepted socket
    pub fn accepted(config: StreamConfig, socket: TcpStream, events: mpsc::UnboundedSender<StreamEvent>) -> TcpByteStream {
        let result = TcpByteStream::new(config, events);
        result.slot.attach(socket);
        result
    }

    pub fn slot(&self) -> SocketSlot {
        self.slot.clone()
    }

    fn connected_socket(&self) -> io::Result<Rc<TcpStream>> {
        self.slot.socket()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    fn abort_connect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }
}

async fn connect_socket(params: TransportParams) -> io::Result<TcpStream> {
    match params.local_addr {
        None => TcpStream::connect(params.remote_addr).await,
        Some(local_addr) => {
            let socket = match params.remote_addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.bind(local_addr)?;
            socket.connect(params.remote_addr).await
        }
    }
}

impl ByteStream for TcpByteStream {
    fn connect(&mut self, params: &TransportParams) -> io::Result<()> {
        self.abort_connect();
        self.slot.clear();
        self.tx_buf.clear();

        let attempt = self.slot.next_attempt();
        let connect_timeout = self.config.connect_timeout;
        let events = self.events.clone();
        let params = *params;

        self.connect_task = Some(tokio::spawn(async move {
            let event = match timeout(connect_timeout, connect_socket(params)).await {
                Ok(Ok(socket)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("could not disable Nagle's algorithm: {}", e);
                    }
                    StreamEvent::Connected { attempt, socket }
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => StreamEvent::ConnectRefused { attempt },
                Ok(Err(error)) => StreamEvent::ConnectFailed { attempt, error },
                Err(_) => StreamEvent::ConnectFailed { attempt, error: io::ErrorKind::TimedOut.into() },
            };
            // the receiver is gone if the event loop terminated in the meantime
            let _ = events.send(event);
        }));
        Ok(())
    }

    fn close(&mut self) {
        self.abort_connect();
        self.slot.clear();
        self.tx_buf.clear();
    }

    fn is_established(&self) -> bool {
        self.slot.socket().is_some()
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let socket = self.connected_socket()?;
        match socket.try_read(buf) {
            Ok(0) if !buf.is_empty() => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<WriteOutcome> {
        if self.tx_buf.len() > self.config.tx_high_water_mark {
            self.flush()?;
            if self.tx_buf.len() > self.config.tx_high_water_mark {
                return Ok(WriteOutcome::WouldBlock);
            }
        }

        self.tx_buf.extend_from_slice(data);
        self.flush()?;
        Ok(WriteOutcome::Accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.tx_buf.is_empty() {
            return Ok(());
        }

        let socket = self.connected_socket()?;
        while !self.tx_buf.is_empty() {
            match socket.try_write(&self.tx_buf) {
                Ok(n) => {
                    trace!("wrote {} bytes to socket", n);
                    self.tx_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        !self.tx_buf.is_empty()
    }
}
