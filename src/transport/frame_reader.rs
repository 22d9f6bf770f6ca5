use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::error::{CodecError, TransportError};
use crate::protocol::codec::MessageCodec;
use crate::protocol::header::FrameHeader;
use crate::protocol::message::Message;
use crate::transport::byte_stream::{ByteStream, ReadOutcome};
use crate::util::safe_converter::SafeCast;

#[derive(Debug)]
pub enum ReadResult {
    Complete(Message),
    /// A complete frame was read but its version or type is not supported. The frame is
    ///  consumed, and the stream is in sync for the next frame.
    Unsupported {
        error: CodecError,
        version: u8,
        xid: u32,
        /// the start of the offending frame, for an error reply
        preview: Bytes,
    },
    /// No more data is available right now, the partial frame is kept for the next call
    Incomplete {
        bytes_needed: usize,
    },
    /// orderly shutdown by the peer; any partial frame is discarded
    Closed,
    Fatal(TransportError),
}

/// Reassembles frames from a non-blocking byte stream.
///
/// The reader never requests more bytes than the current frame needs, so the stream's
///  buffered data always starts at a frame boundary between calls. The accumulator is
///  allocated at header size and grown to the declared frame length once the header is in.
#[derive(Debug, Default)]
pub struct FrameReader {
    accumulator: Option<BytesMut>,
    bytes_read: usize,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        Default::default()
    }

    /// number of bytes of a partial frame that are buffered
    pub fn buffered(&self) -> usize {
        self.bytes_read
    }

    pub fn has_partial_frame(&self) -> bool {
        self.accumulator.is_some()
    }

    pub fn reset(&mut self) {
        self.accumulator = None;
        self.bytes_read = 0;
    }

    /// Reads from the stream until a frame is complete or no more data is available, and
    ///  decodes the frame. Reads at most one frame per call.
    pub fn read_frame(&mut self, stream: &mut dyn ByteStream, codec: &dyn MessageCodec, preview_len: usize) -> ReadResult {
        loop {
            let acc = self.accumulator
                .get_or_insert_with(|| BytesMut::zeroed(FrameHeader::SERIALIZED_LEN));
            let target = acc.len();

            match stream.read_nonblocking(&mut acc[self.bytes_read..target]) {
                Ok(ReadOutcome::Data(0)) | Ok(ReadOutcome::WouldBlock) => {
                    return ReadResult::Incomplete {
                        bytes_needed: target - self.bytes_read,
                    };
                }
                Ok(ReadOutcome::Data(n)) => {
                    trace!("read {} bytes into frame accumulator", n);
                    self.bytes_read += n;

                    if self.bytes_read == FrameHeader::SERIALIZED_LEN && target == FrameHeader::SERIALIZED_LEN {
                        match FrameHeader::peek_length(acc) {
                            Ok(declared) if declared < FrameHeader::SERIALIZED_LEN_U16 => {
                                debug!("declared frame length {} is below the header size - closing", declared);
                                self.reset();
                                return ReadResult::Fatal(TransportError::InvalidLength(declared));
                            }
                            Ok(declared) => {
                                acc.resize(declared.safe_cast(), 0);
                            }
                            Err(e) => {
                                self.reset();
                                return ReadResult::Fatal(TransportError::Decode(e));
                            }
                        }
                    }

                    if self.bytes_read == acc.len() {
                        return self.complete_frame(codec, preview_len);
                    }
                }
                Ok(ReadOutcome::Closed) => {
                    if self.bytes_read > 0 {
                        debug!("stream closed with a partial frame of {} bytes - discarding", self.bytes_read);
                    }
                    self.reset();
                    return ReadResult::Closed;
                }
                Err(e) => {
                    self.reset();
                    return ReadResult::Fatal(TransportError::Io(e));
                }
            }
        }
    }

    fn complete_frame(&mut self, codec: &dyn MessageCodec, preview_len: usize) -> ReadResult {
        let frame = self.accumulator.take()
            .map(BytesMut::freeze)
            .unwrap_or_default();
        self.bytes_read = 0;

        let header = match FrameHeader::deser(&mut frame.as_ref()) {
            Ok(header) => header,
            Err(e) => return ReadResult::Fatal(TransportError::Decode(e)),
        };

        match codec.decode(header.version, frame.clone()) {
            Ok(message) => ReadResult::Complete(message),
            Err(e) if e.is_recoverable() => ReadResult::Unsupported {
                error: e,
                version: header.version,
                xid: header.xid,
                preview: frame.slice(..preview_len.min(frame.len())),
            },
            Err(e) => ReadResult::Fatal(TransportError::Decode(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{MockMessageCodec, WireCodec};
    use crate::protocol::version::Version;
    use crate::test_util::frames::{echo_request_frame, hello_frame, raw_frame};
    use crate::test_util::scripted_stream::ScriptedStream;
    use rstest::rstest;
    use std::io;

    fn read_all(reader: &mut FrameReader, stream: &mut ScriptedStream) -> Vec<Message> {
        let mut result = Vec::new();
        loop {
            match reader.read_frame(stream, &WireCodec, 64) {
                ReadResult::Complete(msg) => result.push(msg),
                ReadResult::Incomplete { .. } => {
                    if stream.buffered_input() == 0 {
                        return result;
                    }
                }
                other => panic!("unexpected read result {:?}", other),
            }
        }
    }

    fn three_frames() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&hello_frame(4, 1));
        data.extend_from_slice(&echo_request_frame(4, 2, &[9; 20]));
        data.extend_from_slice(&raw_frame(1, 14, 3, &[5; 7]));
        data
    }

    #[rstest]
    #[case::single_read(vec![51])]
    #[case::bytewise(vec![1; 51])]
    #[case::split_header(vec![3, 5, 43])]
    #[case::header_boundaries(vec![8, 8, 20, 15])]
    #[case::across_frames(vec![10, 30, 11])]
    #[case::uneven(vec![2, 13, 1, 1, 33, 1])]
    fn test_chunking_invariance(#[case] partition: Vec<usize>) {
        let data = three_frames();
        assert_eq!(partition.iter().sum::<usize>(), data.len());

        let mut stream = ScriptedStream::new();
        stream.push_chunk(&data);
        let expected = read_all(&mut FrameReader::new(), &mut stream);
        assert_eq!(expected.len(), 3);

        let mut stream = ScriptedStream::new();
        let mut offset = 0;
        for len in partition {
            stream.push_chunk(&data[offset..offset + len]);
            stream.push_would_block();
            offset += len;
        }
        let actual = read_all(&mut FrameReader::new(), &mut stream);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_consumes_exactly_one_frame() {
        let first = echo_request_frame(4, 7, &[1, 2, 3]);
        let second = hello_frame(4, 8);

        let mut stream = ScriptedStream::new();
        let mut data = first.clone();
        data.extend_from_slice(&second);
        stream.push_chunk(&data);

        let mut codec = MockMessageCodec::new();
        let expected_frame = Bytes::from(first.clone());
        codec.expect_decode()
            .once()
            .withf(move |version, frame| *version == 4 && *frame == expected_frame)
            .returning(|_, frame| WireCodec.decode(4, frame));

        let mut reader = FrameReader::new();
        match reader.read_frame(&mut stream, &codec, 64) {
            ReadResult::Complete(msg) => assert_eq!(msg.xid, 7),
            other => panic!("unexpected read result {:?}", other),
        }
        assert_eq!(stream.buffered_input(), second.len());
        assert!(!reader.has_partial_frame());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_incomplete_keeps_partial_frame() {
        let frame = echo_request_frame(4, 7, &[1; 12]);
        let mut stream = ScriptedStream::new();
        stream.push_chunk(&frame[..5]);

        let mut reader = FrameReader::new();
        match reader.read_frame(&mut stream, &WireCodec, 64) {
            ReadResult::Incomplete { bytes_needed } => assert_eq!(bytes_needed, 3),
            other => panic!("unexpected read result {:?}", other),
        }
        assert_eq!(reader.buffered(), 5);

        stream.push_chunk(&frame[5..10]);
        match reader.read_frame(&mut stream, &WireCodec, 64) {
            ReadResult::Incomplete { bytes_needed } => assert_eq!(bytes_needed, 10),
            other => panic!("unexpected read result {:?}", other),
        }

        stream.push_chunk(&frame[10..]);
        match reader.read_frame(&mut stream, &WireCodec, 64) {
            ReadResult::Complete(msg) => assert_eq!(msg.xid, 7),
            other => panic!("unexpected read result {:?}", other),
        }
    }

    #[rstest]
    #[case::zero(0)]
    #[case::below_header(7)]
    fn test_invalid_length_is_fatal(#[case] declared: u16) {
        let mut stream = ScriptedStream::new();
        let [hi, lo] = declared.to_be_bytes();
        stream.push_chunk(&[4, 0, hi, lo, 0, 0, 0, 1, 0, 0]);

        let mut reader = FrameReader::new();
        match reader.read_frame(&mut stream, &WireCodec, 64) {
            ReadResult::Fatal(TransportError::InvalidLength(len)) => assert_eq!(len, declared),
            other => panic!("unexpected read result {:?}", other),
        }
        assert!(!reader.has_partial_frame());
    }

    #[rstest]
    #[case::unknown_type(raw_frame(4, 99, 0x0a0b0c0d, &[1, 2, 3]), 64, 11)]
    #[case::unknown_version(raw_frame(2, 0, 0x0a0b0c0d, &[]), 64, 8)]
    #[case::truncated_preview(raw_frame(4, 99, 0x0a0b0c0d, &[7; 100]), 64, 64)]
    fn test_unsupported_frame(#[case] frame: Vec<u8>, #[case] preview_len: usize, #[case] expected_preview_len: usize) {
        let mut stream = ScriptedStream::new();
        stream.push_chunk(&frame);
        stream.push_chunk(&hello_frame(4, 1));

        let mut reader = FrameReader::new();
        match reader.read_frame(&mut stream, &WireCodec, preview_len) {
            ReadResult::Unsupported { error, version, xid, preview } => {
                assert!(error.is_recoverable());
                assert_eq!(version, frame[0]);
                assert_eq!(xid, 0x0a0b0c0d);
                assert_eq!(preview.as_ref(), &frame[..expected_preview_len]);
            }
            other => panic!("unexpected read result {:?}", other),
        }

        // the stream is still in sync
        match reader.read_frame(&mut stream, &WireCodec, preview_len) {
            ReadResult::Complete(msg) => assert_eq!(msg, Message::hello(Version::V1_3, 1)),
            other => panic!("unexpected read result {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_is_fatal() {
        let mut stream = ScriptedStream::new();
        stream.push_chunk(&raw_frame(4, 1, 1, &[0, 1]));

        match FrameReader::new().read_frame(&mut stream, &WireCodec, 64) {
            ReadResult::Fatal(TransportError::Decode(CodecError::Malformed(_))) => {}
            other => panic!("unexpected read result {:?}", other),
        }
    }

    #[test]
    fn test_closed_discards_partial_frame() {
        let mut stream = ScriptedStream::new();
        stream.push_chunk(&[4, 0, 0]);
        stream.push_closed();

        let mut reader = FrameReader::new();
        assert!(matches!(reader.read_frame(&mut stream, &WireCodec, 64), ReadResult::Closed));
        assert!(!reader.has_partial_frame());
    }

    #[test]
    fn test_io_error_is_fatal() {
        let mut stream = ScriptedStream::new();
        stream.push_chunk(&[4, 0, 0, 20, 0]);
        stream.push_error(io::ErrorKind::ConnectionReset);

        let mut reader = FrameReader::new();
        match reader.read_frame(&mut stream, &WireCodec, 64) {
            ReadResult::Fatal(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected read result {:?}", other),
        }
        assert_eq!(reader.buffered(), 0);
    }
}
