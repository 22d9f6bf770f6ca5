use std::net::SocketAddr;
use std::time::Duration;
use anyhow::anyhow;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};
use crate::config::SessionConfig;
use crate::error::{CodecError, SendError, TransportError};
use crate::protocol::codec::MessageCodec;
use crate::protocol::message::{error_code, Message};
use crate::protocol::version::Version;
use crate::transport::byte_stream::{ByteStream, TransportParams};
use crate::transport::frame_reader::{FrameReader, ReadResult};
use crate::transport::scheduler::{DrainOutcome, PriorityScheduler};
use crate::transport::timer::{Timer, TimerHandle, TimerId};

/// The owner's view of a session. Callbacks are invoked synchronously from the session's
///  event methods.
#[cfg_attr(test, automock)]
pub trait SessionHandler {
    fn on_connected(&mut self);

    /// called exactly once when an established (or connecting) session is torn down
    fn on_closed(&mut self);

    fn on_connect_refused(&mut self);

    fn on_connect_failed(&mut self);

    /// one call per decoded frame, in arrival order
    fn on_message(&mut self, message: Message);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Established,
    Closing,
    Closed,
}

/// One control channel connection: a byte stream with its frame reader and outbound
///  scheduler, driven by single-threaded events.
///
/// The session never blocks. Callers feed it readiness, connection and timer events, and it
///  calls back into its [SessionHandler].
///
/// Once the session is closed, all events are ignored until it is revived by `connect`,
///  `reconnect` or `accept_from`.
pub struct Session {
    config: SessionConfig,
    peer: Option<SocketAddr>,
    params: Option<TransportParams>,
    state: SessionState,
    stream: Box<dyn ByteStream>,
    timer: Box<dyn Timer>,
    codec: Box<dyn MessageCodec>,
    handler: Box<dyn SessionHandler>,
    reader: FrameReader,
    scheduler: PriorityScheduler,
    pending_timers: FxHashMap<TimerId, TimerHandle>,
    closed_notified: bool,
    next_xid: u32,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        stream: Box<dyn ByteStream>,
        timer: Box<dyn Timer>,
        codec: Box<dyn MessageCodec>,
        handler: Box<dyn SessionHandler>,
    ) -> anyhow::Result<Session> {
        config.validate()?;

        let scheduler = PriorityScheduler::new(&config.scheduler);
        Ok(Session {
            config,
            peer: None,
            params: None,
            state: SessionState::Disconnected,
            stream,
            timer,
            codec,
            handler,
            reader: FrameReader::new(),
            scheduler,
            pending_timers: FxHashMap::default(),
            closed_notified: false,
            next_xid: rand::random(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// number of queued outbound messages
    pub fn queued(&self) -> usize {
        self.scheduler.len()
    }

    /// true if there are bytes the stream has accepted but not yet written
    pub fn has_pending_output(&self) -> bool {
        self.stream.has_pending_output()
    }

    pub fn buffered_input(&self) -> usize {
        self.reader.buffered()
    }

    pub fn next_xid(&mut self) -> u32 {
        let result = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        result
    }

    /// Starts connecting. A connection that is live or being set up is torn down first,
    ///  discarding its queued messages and notifying the handler.
    pub fn connect(&mut self, params: TransportParams) {
        if matches!(self.state, SessionState::Connecting | SessionState::Established) {
            info!("replacing connection to {:?}", self.peer);
            self.teardown();
        }
        self.cancel_all_timers();
        self.reader.reset();

        self.params = Some(params);
        self.peer = Some(params.remote_addr);
        self.closed_notified = false;
        self.state = SessionState::Connecting;

        info!("connecting to {}", params.remote_addr);
        if let Err(e) = self.stream.connect(&params) {
            warn!("failed to start connecting to {}: {}", params.remote_addr, e);
            self.state = SessionState::Disconnected;
            self.handler.on_connect_failed();
        }
    }

    /// Attaches a stream from a passively accepted connection, replacing the current one. The
    ///  session is established immediately.
    pub fn accept_from(&mut self, stream: Box<dyn ByteStream>, peer: SocketAddr) {
        self.cancel_all_timers();
        self.reader.reset();
        self.scheduler.clear();
        self.stream.close();

        self.stream = stream;
        self.params = None;
        self.peer = Some(peer);
        self.closed_notified = false;
        self.state = SessionState::Established;

        info!("accepted connection from {}", peer);
        self.handler.on_connected();
    }

    /// Drops the current connection including all queued messages, and connects again with
    ///  the previous parameters. Sessions created from an accepted connection have no
    ///  parameters and cannot reconnect.
    pub fn reconnect(&mut self) -> anyhow::Result<()> {
        let params = self.params
            .ok_or_else(|| anyhow!("session has no transport parameters to reconnect with"))?;

        self.cancel_all_timers();
        let num_dropped = self.scheduler.clear();
        if num_dropped > 0 {
            debug!("reconnecting to {} - discarding {} queued messages", params.remote_addr, num_dropped);
        }
        self.reader.reset();
        self.stream.close();
        self.state = SessionState::Disconnected;

        self.connect(params);
        Ok(())
    }

    /// Closes the connection without flushing queued messages. The handler is notified
    ///  unless it was notified of this connection's closing before.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        info!("closing connection to {:?}", self.peer);
        self.teardown();
    }

    pub fn send(&mut self, message: Message) -> Result<usize, SendError> {
        if self.state != SessionState::Established {
            debug!("session to {:?} is not established - dropping message of type {}", self.peer, message.msg_type);
            return Err(SendError::NotEstablished);
        }

        let remaining = self.scheduler.enqueue(message)?;
        self.request_wakeup();
        Ok(remaining)
    }

    pub fn on_connected(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("connected event in state {:?} - ignoring", self.state);
            return;
        }

        info!("connection to {:?} established", self.peer);
        self.state = SessionState::Established;
        self.handler.on_connected();
    }

    pub fn on_connect_refused(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("connect refused event in state {:?} - ignoring", self.state);
            return;
        }

        info!("connection to {:?} refused", self.peer);
        self.abort_connect();
        self.handler.on_connect_refused();
    }

    pub fn on_connect_failed(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("connect failed event in state {:?} - ignoring", self.state);
            return;
        }

        info!("connecting to {:?} failed", self.peer);
        self.abort_connect();
        self.handler.on_connect_failed();
    }

    /// the stream was closed or failed outside of a read or write
    pub fn on_stream_closed(&mut self) {
        if matches!(self.state, SessionState::Closed | SessionState::Disconnected) {
            return;
        }
        info!("connection to {:?} closed", self.peer);
        self.teardown();
    }

    pub fn on_read_ready(&mut self) {
        if self.state != SessionState::Established {
            trace!("read ready in state {:?} - ignoring", self.state);
            return;
        }

        let mut num_frames = 0;
        while num_frames < self.config.max_frames_per_read {
            match self.reader.read_frame(self.stream.as_mut(), self.codec.as_ref(), self.config.error_preview_len) {
                ReadResult::Complete(message) => {
                    num_frames += 1;
                    trace!("received message of type {} with xid {:#010x}", message.msg_type, message.xid);
                    self.handler.on_message(message);
                }
                ReadResult::Unsupported { error, version, xid, preview } => {
                    num_frames += 1;
                    self.reply_unsupported(error, version, xid, &preview);
                }
                ReadResult::Incomplete { bytes_needed } => {
                    trace!("waiting for {} more bytes", bytes_needed);
                    return;
                }
                ReadResult::Closed => {
                    info!("connection closed by {:?}", self.peer);
                    self.teardown();
                    return;
                }
                ReadResult::Fatal(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        trace!("frame budget of {} used up - resuming later", num_frames);
        self.schedule_once(Duration::ZERO, TimerId::ReadResume);
    }

    pub fn on_write_ready(&mut self) {
        if self.state != SessionState::Established {
            trace!("write ready in state {:?} - ignoring", self.state);
            return;
        }

        if let Err(e) = self.stream.flush() {
            self.fail(TransportError::Io(e));
            return;
        }
        self.drain();
    }

    pub fn on_timer(&mut self, id: TimerId) {
        self.pending_timers.remove(&id);

        match id {
            TimerId::Wakeup | TimerId::DrainRetry => {
                if self.state == SessionState::Established {
                    self.drain();
                }
            }
            TimerId::ReadResume => self.on_read_ready(),
            other => {
                debug!("timer {:?} routed to session - ignoring", other);
            }
        }
    }

    fn drain(&mut self) {
        match self.scheduler.drain(self.stream.as_mut(), self.codec.as_ref()) {
            DrainOutcome::Idle => {}
            DrainOutcome::MoreQueued => self.request_wakeup(),
            DrainOutcome::Congested => {
                let delay = self.config.congestion_retry_delay;
                self.schedule_once(delay, TimerId::DrainRetry);
            }
            DrainOutcome::Failed(e) => self.fail(TransportError::Io(e)),
        }
    }

    fn reply_unsupported(&mut self, error: CodecError, version: u8, xid: u32, preview: &[u8]) {
        warn!("received unsupported frame from {:?}: {} - dropping", self.peer, error);

        let (reply_version, code) = match Version::from_wire(version) {
            Some(v) => (v, error_code::BAD_TYPE),
            None => (Version::V1_3, error_code::BAD_VERSION),
        };
        let reply = Message::bad_request_error(reply_version, xid, code, preview);
        if let Err(e) = self.send(reply) {
            debug!("could not queue error reply: {}", e);
        }
    }

    fn request_wakeup(&mut self) {
        if self.pending_timers.contains_key(&TimerId::DrainRetry) {
            // the stream is congested, draining before the retry is pointless
            return;
        }
        self.schedule_once(Duration::ZERO, TimerId::Wakeup);
    }

    fn schedule_once(&mut self, delay: Duration, id: TimerId) {
        if self.pending_timers.contains_key(&id) {
            return;
        }
        let handle = self.timer.schedule(delay, id);
        self.pending_timers.insert(id, handle);
    }

    fn cancel_all_timers(&mut self) {
        for (_, handle) in self.pending_timers.drain() {
            self.timer.cancel(handle);
        }
    }

    fn abort_connect(&mut self) {
        self.cancel_all_timers();
        self.stream.close();
        self.state = SessionState::Disconnected;
    }

    fn fail(&mut self, error: TransportError) {
        warn!("connection to {:?} failed: {} - closing", self.peer, error);
        self.teardown();
    }

    fn teardown(&mut self) {
        self.state = SessionState::Closing;

        self.cancel_all_timers();
        self.reader.reset();
        let num_dropped = self.scheduler.clear();
        if num_dropped > 0 {
            debug!("discarding {} queued messages", num_dropped);
        }
        self.stream.close();

        self.state = SessionState::Closed;
        if !self.closed_notified {
            self.closed_notified = true;
            self.handler.on_closed();
        }
    }
}
