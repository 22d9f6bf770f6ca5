use std::cell::RefCell;
use std::rc::Rc;
use tracing::{trace, warn};
use crate::protocol::message::Message;
use crate::reassembly::segment_reassembler::SegmentReassembler;
use crate::transport::session::SessionHandler;

/// Wraps an application's [SessionHandler], passing multipart fragments through a peer's
///  [SegmentReassembler] so the application sees each multipart message once, complete.
///
/// The reassembler is shared rather than owned: it belongs to the peer, and it outlives any
///  single session (and handler) for that peer.
pub struct ReassemblingHandler<H: SessionHandler> {
    inner: H,
    reassembler: Rc<RefCell<SegmentReassembler>>,
}

impl <H: SessionHandler> ReassemblingHandler<H> {
    pub fn new(inner: H, reassembler: Rc<RefCell<SegmentReassembler>>) -> ReassemblingHandler<H> {
        ReassemblingHandler {
            inner,
            reassembler,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl <H: SessionHandler> SessionHandler for ReassemblingHandler<H> {
    fn on_connected(&mut self) {
        self.inner.on_connected();
    }

    fn on_closed(&mut self) {
        self.inner.on_closed();
    }

    fn on_connect_refused(&mut self) {
        self.inner.on_connect_refused();
    }

    fn on_connect_failed(&mut self) {
        self.inner.on_connect_failed();
    }

    fn on_message(&mut self, message: Message) {
        if message.multipart_body().is_none() {
            self.inner.on_message(message);
            return;
        }

        let xid = message.xid;
        let result = self.reassembler.borrow_mut().on_fragment(message);
        match result {
            Ok(Some(complete)) => self.inner.on_message(complete),
            Ok(None) => trace!("buffered fragment for xid {:#010x}", xid),
            Err(e) => warn!("dropping multipart fragment: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReassemblyConfig;
    use crate::protocol::multipart::subtype;
    use crate::protocol::version::Version;
    use crate::test_util::manual_timer::ManualTimer;
    use crate::test_util::messages::{barrier_request, element, multipart_reply};
    use crate::test_util::recording_handler::{HandlerEvent, RecordingHandler};

    fn handler() -> (ReassemblingHandler<RecordingHandler>, RecordingHandler, Rc<RefCell<SegmentReassembler>>) {
        let recorder = RecordingHandler::new();
        let reassembler = Rc::new(RefCell::new(
            SegmentReassembler::new("peer", ReassemblyConfig::default(), Box::new(ManualTimer::new())).unwrap()
        ));
        (ReassemblingHandler::new(recorder.clone(), reassembler.clone()), recorder, reassembler)
    }

    #[test]
    fn test_fragments_are_merged() {
        let (mut handler, recorder, reassembler) = handler();

        handler.on_message(multipart_reply(Version::V1_3, 1, subtype::FLOW, true, vec![element(&[1])]));
        handler.on_message(barrier_request(Version::V1_3, 2));
        handler.on_message(multipart_reply(Version::V1_3, 1, subtype::FLOW, true, vec![element(&[2])]));
        assert!(reassembler.borrow().has(1));
        handler.on_message(multipart_reply(Version::V1_3, 1, subtype::FLOW, false, vec![element(&[3])]));

        assert_eq!(recorder.messages(), vec![
            barrier_request(Version::V1_3, 2),
            multipart_reply(Version::V1_3, 1, subtype::FLOW, false, vec![element(&[1]), element(&[2]), element(&[3])]),
        ]);
        assert!(reassembler.borrow().is_empty());
    }

    #[test]
    fn test_invalid_fragment_is_dropped() {
        let (mut handler, recorder, reassembler) = handler();

        handler.on_message(multipart_reply(Version::V1_3, 1, subtype::FLOW, true, vec![element(&[1])]));
        handler.on_message(multipart_reply(Version::V1_3, 1, subtype::TABLE, false, vec![]));
        assert!(recorder.messages().is_empty());
        assert!(reassembler.borrow().has(1));
    }

    #[test]
    fn test_lifecycle_passes_through() {
        let (mut handler, recorder, _) = handler();
        handler.on_connected();
        handler.on_closed();
        handler.on_connect_refused();
        handler.on_connect_failed();
        assert_eq!(recorder.events(), vec![
            HandlerEvent::Connected,
            HandlerEvent::Closed,
            HandlerEvent::ConnectRefused,
            HandlerEvent::ConnectFailed,
        ]);
    }
}
