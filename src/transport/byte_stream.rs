use std::io;
use std::net::SocketAddr;
#[cfg(test)] use mockall::automock;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TransportParams {
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReadOutcome {
    /// this many bytes were copied into the buffer, always at least one
    Data(usize),
    WouldBlock,
    /// orderly shutdown by the peer
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WriteOutcome {
    /// all bytes were taken over by the stream
    Accepted,
    /// nothing was taken over, the stream is congested
    WouldBlock,
}

/// A non-blocking ordered byte channel to a single peer.
///
/// None of the methods ever block. Connection establishment is asynchronous: `connect` only
///  starts an attempt, and its outcome is reported to the session as an event.
#[cfg_attr(test, automock)]
pub trait ByteStream {
    fn connect(&mut self, params: &TransportParams) -> io::Result<()>;

    fn close(&mut self);

    fn is_established(&self) -> bool;

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Writes are all-or-nothing: a frame is either accepted completely or not at all
    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<WriteOutcome>;

    /// pushes buffered outbound data to the peer as far as possible without blocking
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        false
    }
}
