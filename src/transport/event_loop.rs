//! Drives a [Session] over a TCP connection on a tokio runtime.
//!
//! The session itself is a synchronous state machine. The [SessionDriver] owns it and feeds it
//!  events from a single `select!` loop: outcomes of connection attempts, socket readiness,
//!  expired timers and commands from the application. Since the session and its handler are
//!  not `Send`, the driver runs on a current-thread runtime or inside a `LocalSet`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::pending;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use crate::config::{SessionConfig, StreamConfig};
use crate::error::SendError;
use crate::protocol::codec::WireCodec;
use crate::protocol::message::Message;
use crate::reassembly::segment_reassembler::SegmentReassembler;
use crate::transport::byte_stream::TransportParams;
use crate::transport::session::{Session, SessionHandler, SessionState};
use crate::transport::tcp::{SocketSlot, StreamEvent, TcpByteStream};
use crate::transport::timer::{Timer, TimerHandle, TimerId};

#[derive(Debug, Default)]
struct LoopTimerState {
    next_handle: u64,
    deadlines: BTreeMap<(Instant, TimerHandle), TimerId>,
    by_handle: FxHashMap<TimerHandle, Instant>,
}

/// A [Timer] backed by a deadline queue that the event loop sleeps on. Clones share the
///  same queue, so a session and a reassembler can schedule on the same loop.
#[derive(Debug, Clone, Default)]
pub struct LoopTimer {
    state: Rc<RefCell<LoopTimerState>>,
}

impl LoopTimer {
    pub fn new() -> LoopTimer {
        Default::default()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.borrow().deadlines.keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    pub fn num_pending(&self) -> usize {
        self.state.borrow().by_handle.len()
    }

    /// Removes and returns the timers due at `now`, ordered by deadline
    pub fn take_due(&self, now: Instant) -> Vec<TimerId> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        let mut result = Vec::new();
        while let Some(entry) = state.deadlines.first_entry() {
            let (deadline, handle) = *entry.key();
            if deadline > now {
                break;
            }
            result.push(entry.remove());
            state.by_handle.remove(&handle);
        }
        result
    }
}

impl Timer for LoopTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&mut self, delay: Duration, id: TimerId) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        let handle = TimerHandle(state.next_handle);
        state.next_handle += 1;

        let deadline = Instant::now() + delay;
        state.deadlines.insert((deadline, handle), id);
        state.by_handle.insert(handle, deadline);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(deadline) = state.by_handle.remove(&handle) {
            state.deadlines.remove(&(deadline, handle));
        }
    }
}

#[derive(Debug)]
pub enum DriverCommand {
    Send {
        message: Message,
        reply: Option<oneshot::Sender<Result<usize, SendError>>>,
    },
    Close,
    Reconnect,
    Shutdown,
}

/// The application's side of a [SessionDriver]. Handles are cheap to clone, and a session
///  handler can keep one to send replies from inside its callbacks.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverHandle {
    fn submit(&self, command: DriverCommand) -> anyhow::Result<()> {
        self.commands.send(command)
            .map_err(|_| anyhow!("session driver terminated"))
    }

    /// Submits a message without waiting for the outcome. Rejected messages are logged by
    ///  the driver.
    pub fn send(&self, message: Message) -> anyhow::Result<()> {
        self.submit(DriverCommand::Send { message, reply: None })
    }

    /// Submits a message and returns the remaining capacity of its traffic class's queue
    pub async fn try_send(&self, message: Message) -> anyhow::Result<usize> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(DriverCommand::Send { message, reply: Some(reply) })?;
        let remaining = reply_rx.await
            .map_err(|_| anyhow!("session driver terminated"))??;
        Ok(remaining)
    }

    pub fn close(&self) -> anyhow::Result<()> {
        self.submit(DriverCommand::Close)
    }

    pub fn reconnect(&self) -> anyhow::Result<()> {
        self.submit(DriverCommand::Reconnect)
    }

    /// closes the session and terminates the driver
    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.submit(DriverCommand::Shutdown)
    }
}

pub struct SessionDriver {
    session: Session,
    stream_config: StreamConfig,
    timer: LoopTimer,
    slot: SocketSlot,
    stream_events_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    reassembler: Option<Rc<RefCell<SegmentReassembler>>>,
}

impl SessionDriver {
    pub fn new(
        config: SessionConfig,
        stream_config: StreamConfig,
        timer: LoopTimer,
        handler: Box<dyn SessionHandler>,
    ) -> anyhow::Result<(SessionDriver, DriverHandle)> {
        stream_config.validate()?;

        let (stream_events_tx, stream_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let stream = TcpByteStream::new(stream_config, stream_events_tx.clone());
        let slot = stream.slot();
        let session = Session::new(config, Box::new(stream), Box::new(timer.clone()), Box::new(WireCodec), handler)?;

        let driver = SessionDriver {
            session,
            stream_config,
            timer,
            slot,
            stream_events_tx,
            stream_events,
            commands,
            reassembler: None,
        };
        Ok((driver, DriverHandle { commands: commands_tx }))
    }

    /// Routes reassembly sweeps to a reassembler and starts its sweep. The reassembler must
    ///  schedule on this driver's [LoopTimer].
    pub fn with_reassembler(mut self, reassembler: Rc<RefCell<SegmentReassembler>>) -> SessionDriver {
        reassembler.borrow_mut().start();
        self.reassembler = Some(reassembler);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connect(&mut self, params: TransportParams) {
        self.session.connect(params);
    }

    /// attaches a passively accepted connection, replacing the current one
    pub fn accept(&mut self, socket: TcpStream) -> io::Result<()> {
        let peer = socket.peer_addr()?;
        socket.set_nodelay(true)?;

        let stream = TcpByteStream::accepted(self.stream_config, socket, self.stream_events_tx.clone());
        self.slot = stream.slot();
        self.session.accept_from(Box::new(stream), peer);
        Ok(())
    }

    /// Runs the event loop until a shutdown command arrives or all handles are dropped. The
    ///  session is closed on termination.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let socket = self.slot.socket();
            let interest = if self.session.has_pending_output() {
                Interest::READABLE | Interest::WRITABLE
            }
            else {
                Interest::READABLE
            };
            let deadline = self.timer.next_deadline();

            select! {
                cmd = self.commands.recv() => match cmd {
                    Some(DriverCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(event) = self.stream_events.recv() => self.on_stream_event(event),
                ready = socket_ready(socket, interest) => self.on_socket_ready(ready),
                _ = deadline_reached(deadline) => self.on_deadline(),
            }
        }

        info!("shutting down session driver for {:?}", self.session.peer());
        self.session.close();
        if let Some(reassembler) = &self.reassembler {
            reassembler.borrow_mut().shutdown();
        }
        Ok(())
    }

    fn on_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::Send { message, reply } => {
                let msg_type = message.msg_type;
                let result = self.session.send(message);
                match reply {
                    Some(reply) => {
                        // the application stopped waiting
                        let _ = reply.send(result);
                    }
                    None => if let Err(e) = result {
                        debug!("message of type {} not sent: {}", msg_type, e);
                    }
                }
            }
            DriverCommand::Close => self.session.close(),
            DriverCommand::Reconnect => if let Err(e) = self.session.reconnect() {
                warn!("reconnect failed: {}", e);
            },
            DriverCommand::Shutdown => {}
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        if event.attempt() != self.slot.attempt() {
            debug!("outcome of superseded connection attempt - ignoring");
            return;
        }

        match event {
            StreamEvent::Connected { socket, .. } => {
                if self.session.state() != SessionState::Connecting {
                    debug!("connection established in state {:?} - dropping", self.session.state());
                    return;
                }
                self.slot.attach(socket);
                self.session.on_connected();
            }
            StreamEvent::ConnectRefused { .. } => self.session.on_connect_refused(),
            StreamEvent::ConnectFailed { error, .. } => {
                warn!(error = ?error, "connection attempt failed");
                self.session.on_connect_failed();
            }
        }
    }

    fn on_socket_ready(&mut self, ready: io::Result<Ready>) {
        match ready {
            Ok(ready) => {
                trace!("socket ready: {:?}", ready);
                if ready.is_readable() {
                    self.session.on_read_ready();
                }
                if ready.is_writable() {
                    self.session.on_write_ready();
                }
            }
            Err(e) => {
                warn!(error = ?e, "error polling socket readiness");
                self.session.on_stream_closed();
            }
        }
    }

    fn on_deadline(&mut self) {
        for id in self.timer.take_due(Instant::now()) {
            match id {
                TimerId::ReassemblySweep => match &self.reassembler {
                    Some(reassembler) => reassembler.borrow_mut().on_timer(id),
                    None => debug!("reassembly sweep without reassembler - ignoring"),
                },
                _ => self.session.on_timer(id),
            }
        }
    }
}

async fn socket_ready(socket: Option<Rc<TcpStream>>, interest: Interest) -> io::Result<Ready> {
    match socket {
        Some(socket) => socket.ready(interest).await,
        None => pending().await,
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
