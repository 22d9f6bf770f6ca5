use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use bytes::Bytes;
use crate::protocol::codec::{MessageCodec, WireCodec};
use crate::protocol::header::FrameHeader;
use crate::protocol::message::Message;
use crate::transport::byte_stream::{ByteStream, ReadOutcome, TransportParams, WriteOutcome};
use crate::util::safe_converter::SafeCast;

#[derive(Debug)]
enum ReadStep {
    Data(VecDeque<u8>),
    WouldBlock,
    Closed,
    Error(io::ErrorKind),
}

#[derive(Debug, Default)]
struct ScriptedState {
    reads: VecDeque<ReadStep>,
    written: Vec<u8>,
    write_budget: Option<usize>,
    write_error: Option<io::ErrorKind>,
    connect_error: Option<io::ErrorKind>,
    connect_calls: Vec<TransportParams>,
    num_closes: usize,
    established: bool,
}

/// A [ByteStream] that replays scripted read steps and records everything written to it.
///
/// Data chunks are handed out in order, a chunk that does not fit into a read buffer is
///  continued by the next read. When the script is exhausted, reads report 'would block'.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    state: Rc<RefCell<ScriptedState>>,
}

impl ScriptedStream {
    pub fn new() -> ScriptedStream {
        Default::default()
    }

    pub fn established() -> ScriptedStream {
        let result = ScriptedStream::new();
        result.state.borrow_mut().established = true;
        result
    }

    pub fn push_chunk(&self, data: &[u8]) {
        if !data.is_empty() {
            self.state.borrow_mut().reads.push_back(ReadStep::Data(data.iter().copied().collect()));
        }
    }

    pub fn push_would_block(&self) {
        self.state.borrow_mut().reads.push_back(ReadStep::WouldBlock);
    }

    pub fn push_closed(&self) {
        self.state.borrow_mut().reads.push_back(ReadStep::Closed);
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().reads.push_back(ReadStep::Error(kind));
    }

    /// scripted data bytes that were not read yet
    pub fn buffered_input(&self) -> usize {
        self.state.borrow().reads.iter()
            .map(|step| match step {
                ReadStep::Data(data) => data.len(),
                _ => 0,
            })
            .sum()
    }

    /// `Some(n)`: accept n more writes, then report 'would block'. `None`: accept all writes.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().write_error = Some(kind);
    }

    pub fn fail_connect(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().connect_error = Some(kind);
    }

    pub fn set_established(&self, established: bool) {
        self.state.borrow_mut().established = established;
    }

    pub fn connect_calls(&self) -> Vec<TransportParams> {
        self.state.borrow().connect_calls.clone()
    }

    pub fn num_closes(&self) -> usize {
        self.state.borrow().num_closes
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// splits the written bytes into frames and decodes them
    pub fn written_messages(&self) -> Vec<Message> {
        let written = Bytes::from(self.written_bytes());
        let mut result = Vec::new();
        let mut offset = 0;
        while offset < written.len() {
            let frame_len: usize = FrameHeader::peek_length(&written[offset..])
                .unwrap_or_else(|e| panic!("written data is not framed at offset {}: {}", offset, e))
                .safe_cast();
            let frame = written.slice(offset..offset + frame_len);
            match WireCodec.decode(frame[0], frame) {
                Ok(msg) => result.push(msg),
                Err(e) => panic!("written frame at offset {} does not decode: {}", offset, e),
            }
            offset += frame_len;
        }
        result
    }

    pub fn clear_written(&self) {
        self.state.borrow_mut().written.clear();
    }
}

impl ByteStream for ScriptedStream {
    fn connect(&mut self, params: &TransportParams) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.connect_calls.push(*params);
        match state.connect_error {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        state.num_closes += 1;
        state.established = false;
    }

    fn is_established(&self) -> bool {
        self.state.borrow().established
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut state = self.state.borrow_mut();
        match state.reads.pop_front() {
            None => Ok(ReadOutcome::WouldBlock),
            Some(ReadStep::WouldBlock) => Ok(ReadOutcome::WouldBlock),
            Some(ReadStep::Closed) => Ok(ReadOutcome::Closed),
            Some(ReadStep::Error(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = buf.len().min(data.len());
                for (dst, src) in buf.iter_mut().zip(data.drain(..n)) {
                    *dst = src;
                }
                if !data.is_empty() {
                    state.reads.push_front(ReadStep::Data(data));
                }
                Ok(ReadOutcome::Data(n))
            }
        }
    }

    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<WriteOutcome> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        match state.write_budget {
            Some(0) => return Ok(WriteOutcome::WouldBlock),
            Some(n) => state.write_budget = Some(n - 1),
            None => {}
        }
        state.written.extend_from_slice(data);
        Ok(WriteOutcome::Accepted)
    }
}
