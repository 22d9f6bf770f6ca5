use std::cell::RefCell;
use std::rc::Rc;
use crate::protocol::message::Message;
use crate::protocol::version::Version;
use crate::transport::connection::ConnectionHandler;
use crate::transport::session::SessionHandler;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandlerEvent {
    Connected,
    Established(Version),
    Closed,
    ConnectRefused,
    ConnectFailed,
    Message(Message),
}

/// A [SessionHandler] and [ConnectionHandler] that records all callbacks in order
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Rc<RefCell<Vec<HandlerEvent>>>,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        Default::default()
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.borrow().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.events.borrow().iter()
            .filter_map(|e| match e {
                HandlerEvent::Message(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &HandlerEvent) -> usize {
        self.events.borrow().iter()
            .filter(|e| *e == event)
            .count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl SessionHandler for RecordingHandler {
    fn on_connected(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::Connected);
    }

    fn on_closed(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::Closed);
    }

    fn on_connect_refused(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::ConnectRefused);
    }

    fn on_connect_failed(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::ConnectFailed);
    }

    fn on_message(&mut self, message: Message) {
        self.events.borrow_mut().push(HandlerEvent::Message(message));
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_established(&mut self, version: Version) {
        self.events.borrow_mut().push(HandlerEvent::Established(version));
    }

    fn on_closed(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::Closed);
    }

    fn on_connect_refused(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::ConnectRefused);
    }

    fn on_connect_failed(&mut self) {
        self.events.borrow_mut().push(HandlerEvent::ConnectFailed);
    }

    fn on_message(&mut self, message: Message) {
        self.events.borrow_mut().push(HandlerEvent::Message(message));
    }
}
