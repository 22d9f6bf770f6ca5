use std::collections::VecDeque;
use std::io;
use bytes::BytesMut;
use tracing::{trace, warn};
use crate::config::{QueueConfig, SchedulerConfig};
use crate::error::SendError;
use crate::protocol::codec::MessageCodec;
use crate::protocol::kind::MessageKind;
use crate::protocol::message::Message;
use crate::transport::byte_stream::{ByteStream, WriteOutcome};

/// Outbound traffic classes, in the order they are drained
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TrafficClass {
    /// keep-alive: hello and echo
    Oam,
    Management,
    /// flow, group, meter, port and table modifications
    TableMutation,
    /// packet I/O
    Bulk,
}

impl TrafficClass {
    pub const COUNT: usize = 4;
    pub const ALL: [TrafficClass; Self::COUNT] = [
        TrafficClass::Oam,
        TrafficClass::Management,
        TrafficClass::TableMutation,
        TrafficClass::Bulk,
    ];

    pub fn index(self) -> usize {
        match self {
            TrafficClass::Oam => 0,
            TrafficClass::Management => 1,
            TrafficClass::TableMutation => 2,
            TrafficClass::Bulk => 3,
        }
    }

    /// Classification is by kind rather than opcode since opcodes differ between protocol
    ///  revisions. Messages of unknown kind are management traffic.
    pub fn classify(message: &Message) -> TrafficClass {
        use MessageKind::*;

        match message.kind() {
            Some(Hello | EchoRequest | EchoReply) => TrafficClass::Oam,
            Some(FlowMod | GroupMod | MeterMod | PortMod | TableMod | FlowRemoved) => TrafficClass::TableMutation,
            Some(PacketIn | PacketOut) => TrafficClass::Bulk,
            _ => TrafficClass::Management,
        }
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<Message>,
    weight: usize,
    max_depth: usize,
}

impl OutboundQueue {
    pub fn new(config: &QueueConfig) -> OutboundQueue {
        OutboundQueue {
            messages: VecDeque::new(),
            weight: config.weight,
            max_depth: config.max_depth,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.max_depth.saturating_sub(self.messages.len())
    }

    fn push(&mut self, message: Message) -> Result<usize, SendError> {
        if self.messages.len() >= self.max_depth {
            return Err(SendError::Congested);
        }
        self.messages.push_back(message);
        Ok(self.remaining_capacity())
    }
}

#[derive(Debug)]
pub enum DrainOutcome {
    /// all queues are empty
    Idle,
    /// the round's budget is used up but messages remain queued
    MoreQueued,
    /// the stream stopped accepting data, messages remain queued
    Congested,
    Failed(io::Error),
}

/// Four FIFO queues, one per [TrafficClass], drained in priority order with a per-class
///  budget per round.
///
/// A message stays at the head of its queue until the stream has accepted it, so transient
///  congestion never loses messages.
pub struct PriorityScheduler {
    queues: [OutboundQueue; TrafficClass::COUNT],
    encode_buf: BytesMut,
}

impl PriorityScheduler {
    pub fn new(config: &SchedulerConfig) -> PriorityScheduler {
        PriorityScheduler {
            queues: TrafficClass::ALL.map(|class| OutboundQueue::new(config.queue(class))),
            encode_buf: BytesMut::new(),
        }
    }

    pub fn queue(&self, class: TrafficClass) -> &OutboundQueue {
        &self.queues[class.index()]
    }

    pub fn len(&self) -> usize {
        self.queues.iter()
            .map(|q| q.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter()
            .all(|q| q.is_empty())
    }

    /// Returns the remaining capacity of the message's class, or [SendError::Congested]
    ///  without changing anything if the class is full.
    pub fn enqueue(&mut self, message: Message) -> Result<usize, SendError> {
        let class = TrafficClass::classify(&message);
        let result = self.queues[class.index()].push(message);
        match result {
            Ok(remaining) => trace!("queued message in class {:?}, remaining capacity {}", class, remaining),
            Err(_) => warn!("outbound queue for class {:?} is full - rejecting message", class),
        }
        result
    }

    /// discards all queued messages, returning their number
    pub fn clear(&mut self) -> usize {
        let mut num_dropped = 0;
        for queue in &mut self.queues {
            num_dropped += queue.messages.len();
            queue.messages.clear();
        }
        num_dropped
    }

    /// One scheduling round: each class in priority order may send up to its weight.
    ///
    /// All classes share one stream, so a 'would block' ends the whole round rather than
    ///  only the current class. The blocked message stays at the head of its queue.
    pub fn drain(&mut self, stream: &mut dyn ByteStream, codec: &dyn MessageCodec) -> DrainOutcome {
        for class in TrafficClass::ALL {
            let queue = &mut self.queues[class.index()];

            let mut num_sent = 0;
            while num_sent < queue.weight {
                let Some(message) = queue.messages.front() else {
                    break;
                };

                self.encode_buf.clear();
                if let Err(e) = codec.encode(message, &mut self.encode_buf) {
                    warn!("dropping unencodable message of type {} with xid {:#010x}: {}", message.msg_type, message.xid, e);
                    queue.messages.pop_front();
                    continue;
                }

                match stream.write_nonblocking(&self.encode_buf) {
                    Ok(WriteOutcome::Accepted) => {
                        trace!("sent {} bytes from class {:?}", self.encode_buf.len(), class);
                        queue.messages.pop_front();
                        num_sent += 1;
                    }
                    Ok(WriteOutcome::WouldBlock) => {
                        trace!("stream congested while draining class {:?}", class);
                        return DrainOutcome::Congested;
                    }
                    Err(e) => return DrainOutcome::Failed(e),
                }
            }
        }

        if self.is_empty() {
            DrainOutcome::Idle
        }
        else {
            DrainOutcome::MoreQueued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::WireCodec;
    use crate::protocol::version::Version;
    use crate::test_util::messages::{echo_request, flow_mod, packet_out, barrier_request};
    use crate::test_util::scripted_stream::ScriptedStream;
    use bytes::Bytes;
    use rstest::rstest;

    fn config(weights: [usize; 4], depths: [usize; 4]) -> SchedulerConfig {
        SchedulerConfig {
            queues: [0, 1, 2, 3].map(|i| QueueConfig { weight: weights[i], max_depth: depths[i] }),
        }
    }

    #[rstest]
    #[case::hello(Message::hello(Version::V1_0, 1), TrafficClass::Oam)]
    #[case::echo(echo_request(Version::V1_3, 1), TrafficClass::Oam)]
    #[case::echo_reply(Message::new(Version::V1_2, 3, 1, Bytes::new()), TrafficClass::Oam)]
    #[case::barrier(barrier_request(Version::V1_3, 1), TrafficClass::Management)]
    #[case::flow_mod_10(flow_mod(Version::V1_0, 1), TrafficClass::TableMutation)]
    #[case::flow_mod_13(flow_mod(Version::V1_3, 1), TrafficClass::TableMutation)]
    #[case::meter_mod(Message::new(Version::V1_3, 29, 1, Bytes::new()), TrafficClass::TableMutation)]
    #[case::port_mod_10(Message::new(Version::V1_0, 15, 1, Bytes::new()), TrafficClass::TableMutation)]
    #[case::packet_out(packet_out(Version::V1_2, 1), TrafficClass::Bulk)]
    #[case::packet_in(Message::new(Version::V1_0, 10, 1, Bytes::new()), TrafficClass::Bulk)]
    #[case::unknown(Message::new(Version::V1_0, 200, 1, Bytes::new()), TrafficClass::Management)]
    fn test_classify(#[case] message: Message, #[case] expected: TrafficClass) {
        assert_eq!(TrafficClass::classify(&message), expected);
    }

    #[test]
    fn test_congestion_boundary() {
        let mut scheduler = PriorityScheduler::new(&config([1, 1, 1, 1], [1, 1, 3, 1]));

        assert_eq!(scheduler.enqueue(flow_mod(Version::V1_3, 1)), Ok(2));
        assert_eq!(scheduler.enqueue(flow_mod(Version::V1_3, 2)), Ok(1));
        assert_eq!(scheduler.enqueue(flow_mod(Version::V1_3, 3)), Ok(0));
        assert_eq!(scheduler.enqueue(flow_mod(Version::V1_3, 4)), Err(SendError::Congested));
        assert_eq!(scheduler.queue(TrafficClass::TableMutation).len(), 3);

        // other classes are unaffected
        assert_eq!(scheduler.enqueue(packet_out(Version::V1_3, 5)), Ok(0));

        let mut stream = ScriptedStream::established();
        match scheduler.drain(&mut stream, &WireCodec) {
            DrainOutcome::MoreQueued => {}
            other => panic!("unexpected drain outcome {:?}", other),
        }
        assert_eq!(stream.written_messages().iter().map(|m| m.xid).collect::<Vec<_>>(), vec![1, 5]);

        assert_eq!(scheduler.enqueue(flow_mod(Version::V1_3, 6)), Ok(0));
        assert_eq!(scheduler.enqueue(flow_mod(Version::V1_3, 7)), Err(SendError::Congested));
    }

    #[rstest]
    #[case::weights_below_depth([2, 3, 1, 2], [5, 5, 5, 5], [2, 3, 1, 2], false)]
    #[case::depth_below_weight([8, 8, 8, 8], [1, 4, 2, 3], [1, 4, 2, 3], true)]
    #[case::depth_equals_weight([2, 3, 1, 2], [2, 3, 1, 2], [2, 3, 1, 2], true)]
    #[case::mixed([1, 10, 3, 2], [4, 2, 3, 6], [1, 2, 3, 2], false)]
    fn test_weighted_drain(#[case] weights: [usize; 4], #[case] depths: [usize; 4], #[case] expected_sent: [usize; 4], #[case] expected_idle: bool) {
        let mut scheduler = PriorityScheduler::new(&config(weights, [100; 4]));

        // xid encodes class and position: 100 * class + n
        let builders: [fn(Version, u32) -> Message; 4] = [echo_request, barrier_request, flow_mod, packet_out];
        // enqueue in reverse priority order, the drain order must not depend on it
        for class in (0..4).rev() {
            for n in 0..depths[class] {
                scheduler.enqueue(builders[class](Version::V1_3, (100 * class + n) as u32)).unwrap();
            }
        }

        let mut stream = ScriptedStream::established();
        match (scheduler.drain(&mut stream, &WireCodec), expected_idle) {
            (DrainOutcome::Idle, true) | (DrainOutcome::MoreQueued, false) => {}
            (other, _) => panic!("unexpected drain outcome {:?}", other),
        }

        let expected_xids = (0..4)
            .flat_map(|class| (0..expected_sent[class]).map(move |n| (100 * class + n) as u32))
            .collect::<Vec<_>>();
        let actual_xids = stream.written_messages().iter().map(|m| m.xid).collect::<Vec<_>>();
        assert_eq!(actual_xids, expected_xids);

        for class in TrafficClass::ALL {
            let i = class.index();
            assert_eq!(scheduler.queue(class).len(), depths[i] - expected_sent[i]);
        }
    }

    #[test]
    fn test_drain_keeps_messages_on_congestion() {
        let mut scheduler = PriorityScheduler::new(&SchedulerConfig::default());
        for xid in 1..=5 {
            scheduler.enqueue(barrier_request(Version::V1_3, xid)).unwrap();
        }

        let mut stream = ScriptedStream::established();
        stream.set_write_budget(Some(2));
        match scheduler.drain(&mut stream, &WireCodec) {
            DrainOutcome::Congested => {}
            other => panic!("unexpected drain outcome {:?}", other),
        }
        assert_eq!(scheduler.len(), 3);

        stream.set_write_budget(None);
        match scheduler.drain(&mut stream, &WireCodec) {
            DrainOutcome::Idle => {}
            other => panic!("unexpected drain outcome {:?}", other),
        }
        assert_eq!(stream.written_messages().iter().map(|m| m.xid).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_drain_drops_unencodable_message() {
        let mut scheduler = PriorityScheduler::new(&SchedulerConfig::default());
        scheduler.enqueue(Message::new(Version::V1_3, 20, 1, Bytes::from(vec![0u8; 70000]))).unwrap();
        scheduler.enqueue(barrier_request(Version::V1_3, 2)).unwrap();

        let mut stream = ScriptedStream::established();
        match scheduler.drain(&mut stream, &WireCodec) {
            DrainOutcome::Idle => {}
            other => panic!("unexpected drain outcome {:?}", other),
        }
        assert_eq!(stream.written_messages().iter().map(|m| m.xid).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_drain_write_failure() {
        let mut scheduler = PriorityScheduler::new(&SchedulerConfig::default());
        scheduler.enqueue(barrier_request(Version::V1_3, 1)).unwrap();

        let mut stream = ScriptedStream::established();
        stream.fail_writes(io::ErrorKind::BrokenPipe);
        match scheduler.drain(&mut stream, &WireCodec) {
            DrainOutcome::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected drain outcome {:?}", other),
        }
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut scheduler = PriorityScheduler::new(&SchedulerConfig::default());
        scheduler.enqueue(barrier_request(Version::V1_3, 1)).unwrap();
        scheduler.enqueue(packet_out(Version::V1_3, 2)).unwrap();
        assert_eq!(scheduler.clear(), 2);
        assert!(scheduler.is_empty());
    }
}
