use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};
use crate::config::ConnectionConfig;
use crate::error::SendError;
use crate::protocol::codec::{MessageCodec, WireCodec};
use crate::protocol::hello::VersionBitmap;
use crate::protocol::kind::MessageKind;
use crate::protocol::message::{error_code, Message};
use crate::protocol::version::Version;
use crate::transport::byte_stream::{ByteStream, TransportParams};
use crate::transport::session::{Session, SessionHandler};
use crate::transport::timer::{Timer, TimerHandle, TimerId};

/// fixed part of a features reply: datapath id, buffers, tables, auxiliary id / padding,
///  capabilities and a reserved / actions word
const FEATURES_REPLY_MIN_LEN: usize = 24;
const AUXILIARY_ID_OFFSET: usize = 13;

/// The owner's view of a [Connection]
#[cfg_attr(test, automock)]
pub trait ConnectionHandler {
    /// the hello exchange (and for accepted connections the features request) completed
    fn on_established(&mut self, version: Version);

    /// called once when a connection that got past connecting is closed
    fn on_closed(&mut self);

    fn on_connect_refused(&mut self);

    fn on_connect_failed(&mut self);

    /// messages of an established connection, except for hello and keep-alive traffic
    fn on_message(&mut self, message: Message);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    ConnectPending,
    WaitForHello,
    WaitForFeatures,
    Established,
}

/// identity reported by the peer in its features reply
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DatapathInfo {
    pub datapath_id: u64,
    pub auxiliary_id: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum SessionEvent {
    Connected,
    Closed,
    ConnectRefused,
    ConnectFailed,
    Message(Message),
}

/// Collects the session's callbacks so that the connection can process them after the
///  session call returned
#[derive(Debug, Clone, Default)]
struct SessionEvents {
    queue: Rc<RefCell<VecDeque<SessionEvent>>>,
}

impl SessionEvents {
    fn pop(&self) -> Option<SessionEvent> {
        self.queue.borrow_mut().pop_front()
    }

    fn push(&self, event: SessionEvent) {
        self.queue.borrow_mut().push_back(event);
    }
}

impl SessionHandler for SessionEvents {
    fn on_connected(&mut self) {
        self.push(SessionEvent::Connected);
    }

    fn on_closed(&mut self) {
        self.push(SessionEvent::Closed);
    }

    fn on_connect_refused(&mut self) {
        self.push(SessionEvent::ConnectRefused);
    }

    fn on_connect_failed(&mut self) {
        self.push(SessionEvent::ConnectFailed);
    }

    fn on_message(&mut self, message: Message) {
        self.push(SessionEvent::Message(message));
    }
}

/// A control channel connection on top of a [Session]: it exchanges hellos to agree on a
///  protocol version, requests the peer's features for accepted connections, and keeps
///  the connection alive with echo requests.
///
/// The connection is driven like a session. Its own timers use the same [Timer] as the
///  session, and all fired timers are passed to [Connection::on_timer], which forwards the
///  session's timers.
pub struct Connection {
    config: ConnectionConfig,
    session: Session,
    events: SessionEvents,
    timer: Box<dyn Timer>,
    handler: Box<dyn ConnectionHandler>,
    state: ConnectionState,
    passive: bool,
    version: Option<Version>,
    datapath: Option<DatapathInfo>,
    echo_xid: Option<u32>,
    pending_timers: FxHashMap<TimerId, TimerHandle>,
}

impl Connection {
    /// `new_session` creates the underlying session for a given session handler
    pub fn new(
        config: ConnectionConfig,
        timer: Box<dyn Timer>,
        handler: Box<dyn ConnectionHandler>,
        new_session: impl FnOnce(Box<dyn SessionHandler>) -> anyhow::Result<Session>,
    ) -> anyhow::Result<Connection> {
        config.validate()?;

        let events = SessionEvents::default();
        let session = new_session(Box::new(events.clone()))?;
        Ok(Connection {
            config,
            session,
            events,
            timer,
            handler,
            state: ConnectionState::Disconnected,
            passive: false,
            version: None,
            datapath: None,
            echo_xid: None,
            pending_timers: FxHashMap::default(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// the negotiated protocol version
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// the peer's identity, for accepted connections
    pub fn datapath(&self) -> Option<DatapathInfo> {
        self.datapath
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn next_xid(&mut self) -> u32 {
        self.session.next_xid()
    }

    /// Connects actively. A current connection is closed first.
    pub fn connect(&mut self, params: TransportParams) {
        self.close();

        self.passive = false;
        self.state = ConnectionState::ConnectPending;
        self.session.connect(params);
        self.process_events();
    }

    /// Takes over a passively accepted stream. A current connection is closed first.
    pub fn accept_from(&mut self, stream: Box<dyn ByteStream>, peer: SocketAddr) {
        self.close();

        self.passive = true;
        self.state = ConnectionState::ConnectPending;
        self.session.accept_from(stream, peer);
        self.process_events();
    }

    /// Starts over with the previous transport parameters. An established connection is
    ///  busy and must be closed explicitly first.
    pub fn reconnect(&mut self) -> anyhow::Result<()> {
        if self.state == ConnectionState::Established {
            bail!("connection to {:?} is established - close it before reconnecting", self.session.peer());
        }

        self.cancel_all_timers();
        self.version = None;
        self.state = ConnectionState::ConnectPending;
        let result = self.session.reconnect();
        if result.is_err() {
            self.state = ConnectionState::Disconnected;
        }
        self.process_events();
        result
    }

    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.session.close();
        self.process_events();
        self.cancel_all_timers();
        self.state = ConnectionState::Disconnected;
    }

    pub fn send(&mut self, message: Message) -> Result<usize, SendError> {
        if self.state != ConnectionState::Established {
            debug!("connection to {:?} is not established - dropping message of type {}", self.session.peer(), message.msg_type);
            return Err(SendError::NotEstablished);
        }
        self.session.send(message)
    }

    pub fn on_connected(&mut self) {
        self.session.on_connected();
        self.process_events();
    }

    pub fn on_connect_refused(&mut self) {
        self.session.on_connect_refused();
        self.process_events();
    }

    pub fn on_connect_failed(&mut self) {
        self.session.on_connect_failed();
        self.process_events();
    }

    pub fn on_stream_closed(&mut self) {
        self.session.on_stream_closed();
        self.process_events();
    }

    pub fn on_read_ready(&mut self) {
        self.session.on_read_ready();
        self.process_events();
    }

    pub fn on_write_ready(&mut self) {
        self.session.on_write_ready();
        self.process_events();
    }

    pub fn on_timer(&mut self, id: TimerId) {
        match id {
            TimerId::HelloTimeout | TimerId::FeaturesTimeout | TimerId::EchoInterval | TimerId::EchoTimeout => {
                self.pending_timers.remove(&id);
                self.on_own_timer(id);
            }
            _ => self.session.on_timer(id),
        }
        self.process_events();
    }

    fn process_events(&mut self) {
        while let Some(event) = self.events.pop() {
            match event {
                SessionEvent::Connected => self.on_session_connected(),
                SessionEvent::Closed => self.on_session_closed(),
                SessionEvent::ConnectRefused => {
                    if self.state == ConnectionState::ConnectPending {
                        self.state = ConnectionState::Disconnected;
                        self.handler.on_connect_refused();
                    }
                }
                SessionEvent::ConnectFailed => {
                    if self.state == ConnectionState::ConnectPending {
                        self.state = ConnectionState::Disconnected;
                        self.handler.on_connect_failed();
                    }
                }
                SessionEvent::Message(message) => self.on_message(message),
            }
        }
    }

    fn on_session_connected(&mut self) {
        if self.state != ConnectionState::ConnectPending {
            debug!("connected event in state {:?} - ignoring", self.state);
            return;
        }

        self.state = ConnectionState::WaitForHello;
        self.version = None;
        self.datapath = None;
        self.echo_xid = None;

        let bitmap = VersionBitmap::of(&self.config.versions);
        let hello_version = bitmap.highest().unwrap_or(Version::V1_3);
        let xid = self.session.next_xid();
        trace!("sending hello with versions {:#x}", bitmap.0);
        self.send_internal(Message::new(hello_version, 0, xid, bitmap.hello_body()));
        self.schedule(self.config.hello_timeout, TimerId::HelloTimeout);
    }

    fn on_session_closed(&mut self) {
        self.cancel_all_timers();
        let previous = self.state;
        self.state = ConnectionState::Disconnected;

        match previous {
            ConnectionState::Disconnected | ConnectionState::ConnectPending => {}
            ConnectionState::WaitForHello | ConnectionState::WaitForFeatures | ConnectionState::Established => {
                info!("connection to {:?} closed in state {:?}", self.session.peer(), previous);
                self.handler.on_closed();
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        match message.kind() {
            Some(MessageKind::Hello) => self.on_hello(message),
            Some(MessageKind::Error) if message.error_type_code().map(|(t, _)| t) == Some(error_code::HELLO_FAILED) => {
                warn!("peer {:?} reported failed hello exchange - closing", self.session.peer());
                self.disconnect();
            }
            Some(MessageKind::EchoRequest) if self.state == ConnectionState::Established => {
                let reply = Message::of_kind(message.version, MessageKind::EchoReply, message.xid, message.payload().cloned().unwrap_or_default());
                match reply {
                    Some(reply) => self.send_internal(reply),
                    None => debug!("no echo reply in {:?}", message.version),
                }
            }
            Some(MessageKind::EchoReply) if self.state == ConnectionState::Established && self.echo_xid == Some(message.xid) => {
                trace!("echo reply {:#010x} received", message.xid);
                self.echo_xid = None;
                self.cancel(TimerId::EchoTimeout);
                self.schedule(self.config.echo_interval, TimerId::EchoInterval);
            }
            Some(MessageKind::FeaturesReply) if self.state == ConnectionState::WaitForFeatures => self.on_features_reply(message),
            _ if self.state == ConnectionState::Established => self.handler.on_message(message),
            _ => warn!("received message of type {} in state {:?} - dropping", message.msg_type, self.state),
        }
    }

    fn on_hello(&mut self, hello: Message) {
        if self.state != ConnectionState::WaitForHello {
            debug!("hello in state {:?} - ignoring", self.state);
            return;
        }

        let offered = match VersionBitmap::from_hello(&hello) {
            Ok(offered) => offered,
            Err(e) => {
                warn!("malformed hello from {:?}: {} - closing", self.session.peer(), e);
                self.disconnect();
                return;
            }
        };

        let local = VersionBitmap::of(&self.config.versions);
        let version = match local.intersect(offered).highest() {
            Some(version) => version,
            None => {
                warn!("no common protocol version with {:?}: offered {:#x}, supported {:#x} - closing", self.session.peer(), offered.0, local.0);
                self.reject_hello(&hello);
                return;
            }
        };

        debug!("negotiated version {:?} with {:?}", version, self.session.peer());
        self.cancel(TimerId::HelloTimeout);
        self.version = Some(version);

        if !self.passive {
            self.establish(version);
            return;
        }

        self.state = ConnectionState::WaitForFeatures;
        let xid = self.session.next_xid();
        match Message::of_kind(version, MessageKind::FeaturesRequest, xid, Bytes::new()) {
            Some(request) => self.send_internal(request),
            None => debug!("no features request in {:?}", version),
        }
        self.schedule(self.config.features_timeout, TimerId::FeaturesTimeout);
    }

    /// answers the hello with an 'incompatible' error, sent before the connection is closed
    fn reject_hello(&mut self, hello: &Message) {
        let mut data = BytesMut::new();
        if let Err(e) = WireCodec.encode(hello, &mut data) {
            debug!("could not encode rejected hello: {}", e);
            data.clear();
        }
        let error = Message::error(hello.version, hello.xid, error_code::HELLO_FAILED, error_code::INCOMPATIBLE, &data);
        self.send_internal(error);
        self.session.on_write_ready();
        self.disconnect();
    }

    fn on_features_reply(&mut self, reply: Message) {
        let payload = reply.payload().cloned().unwrap_or_default();
        if payload.len() < FEATURES_REPLY_MIN_LEN {
            warn!("features reply from {:?} is too short: {} bytes - closing", self.session.peer(), payload.len());
            self.disconnect();
            return;
        }

        let datapath_id = (&payload[..]).get_u64();
        let auxiliary_id = match reply.version {
            Version::V1_3 => payload[AUXILIARY_ID_OFFSET],
            Version::V1_0 | Version::V1_2 => 0,
        };
        info!("peer {:?} is datapath {:#018x}, auxiliary id {}", self.session.peer(), datapath_id, auxiliary_id);

        self.cancel(TimerId::FeaturesTimeout);
        self.datapath = Some(DatapathInfo { datapath_id, auxiliary_id });
        self.establish(reply.version);
    }

    fn establish(&mut self, version: Version) {
        info!("connection to {:?} established with version {:?}", self.session.peer(), version);
        self.state = ConnectionState::Established;
        self.schedule(self.config.echo_interval, TimerId::EchoInterval);
        self.handler.on_established(version);
    }

    fn on_own_timer(&mut self, id: TimerId) {
        match (id, self.state) {
            (TimerId::HelloTimeout, ConnectionState::WaitForHello) => {
                warn!("no hello from {:?} within {:?} - closing", self.session.peer(), self.config.hello_timeout);
                self.disconnect();
            }
            (TimerId::FeaturesTimeout, ConnectionState::WaitForFeatures) => {
                warn!("no features reply from {:?} within {:?} - closing", self.session.peer(), self.config.features_timeout);
                self.disconnect();
            }
            (TimerId::EchoInterval, ConnectionState::Established) => self.send_echo(),
            (TimerId::EchoTimeout, ConnectionState::Established) => {
                warn!("echo request to {:?} not answered within {:?} - closing", self.session.peer(), self.config.echo_timeout);
                self.disconnect();
            }
            (id, state) => debug!("timer {:?} in state {:?} - ignoring", id, state),
        }
    }

    fn send_echo(&mut self) {
        let Some(version) = self.version else {
            return;
        };
        let xid = self.session.next_xid();
        match Message::of_kind(version, MessageKind::EchoRequest, xid, Bytes::new()) {
            Some(request) => {
                trace!("sending echo request {:#010x}", xid);
                self.echo_xid = Some(xid);
                self.send_internal(request);
                self.schedule(self.config.echo_timeout, TimerId::EchoTimeout);
            }
            None => debug!("no echo request in {:?}", version),
        }
    }

    fn send_internal(&mut self, message: Message) {
        if let Err(e) = self.session.send(message) {
            warn!("could not queue control message to {:?}: {}", self.session.peer(), e);
        }
    }

    fn disconnect(&mut self) {
        self.cancel_all_timers();
        self.session.close();
    }

    fn schedule(&mut self, delay: Duration, id: TimerId) {
        self.cancel(id);
        let handle = self.timer.schedule(delay, id);
        self.pending_timers.insert(id, handle);
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.pending_timers.remove(&id) {
            self.timer.cancel(handle);
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, handle) in self.pending_timers.drain() {
            self.timer.cancel(handle);
        }
    }
}
