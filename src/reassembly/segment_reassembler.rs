use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::ReassemblyConfig;
use crate::error::ReassemblyError;
use crate::protocol::message::{Element, ElementKey, Message, MessageBody};
use crate::protocol::multipart::FLAG_MORE;
use crate::transport::timer::{Timer, TimerHandle, TimerId};

#[derive(Debug)]
pub struct ReassemblyEntry {
    pub xid: u32,
    /// fixed when the entry is created, merging does not extend it
    pub expires: Instant,
    message: Option<Message>,
}

impl ReassemblyEntry {
    /// the message accumulated so far, `None` before the first fragment
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }
}

/// Merges multipart fragments that share a transaction id into a single message.
///
/// A reassembler belongs to one peer rather than to one session, so replies survive a
///  reconnect of the session that received their first fragments. Unfinished entries are
///  removed by a periodic sweep once their TTL is over.
///
/// Merging appends each fragment's elements to the accumulated ones. Elements with a key
///  (e.g. a port number) replace an accumulated element with the same key instead.
pub struct SegmentReassembler {
    peer: String,
    config: ReassemblyConfig,
    timer: Box<dyn Timer>,
    entries: FxHashMap<u32, ReassemblyEntry>,
    sweep_timer: Option<TimerHandle>,
    running: bool,
}

impl SegmentReassembler {
    pub fn new(peer: impl Into<String>, config: ReassemblyConfig, timer: Box<dyn Timer>) -> anyhow::Result<SegmentReassembler> {
        config.validate()?;

        Ok(SegmentReassembler {
            peer: peer.into(),
            config,
            timer,
            entries: FxHashMap::default(),
            sweep_timer: None,
            running: false,
        })
    }

    /// starts the periodic expiration sweep
    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            self.schedule_sweep();
        }
    }

    /// stops the sweep and drops all pending entries
    pub fn shutdown(&mut self) {
        self.running = false;
        if let Some(handle) = self.sweep_timer.take() {
            self.timer.cancel(handle);
        }
        if !self.entries.is_empty() {
            debug!("[{}] shutting down reassembly with {} pending entries", self.peer, self.entries.len());
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has(&self, xid: u32) -> bool {
        self.entries.contains_key(&xid)
    }

    pub fn get_or_create(&mut self, xid: u32) -> &mut ReassemblyEntry {
        let expires = self.timer.now() + self.config.ttl;
        self.entries.entry(xid)
            .or_insert_with(|| {
                trace!("new reassembly entry for xid {:#010x}", xid);
                ReassemblyEntry {
                    xid,
                    expires,
                    message: None,
                }
            })
    }

    /// Merges a fragment into the entry for `xid`, creating the entry if necessary. A fragment
    ///  that does not match the accumulated message's type and subtype is rejected, leaving the
    ///  entry unchanged.
    pub fn merge_fragment(&mut self, xid: u32, fragment: Message) -> Result<(), ReassemblyError> {
        let MessageBody::Multipart(mut fragment_body) = fragment.body else {
            return Err(ReassemblyError::NotMultipart(xid));
        };

        let entry = self.get_or_create(xid);
        match &mut entry.message {
            None => {
                fragment_body.flags &= !FLAG_MORE;
                let elements = std::mem::take(&mut fragment_body.elements);
                merge_elements(&mut fragment_body.elements, elements);
                entry.message = Some(Message {
                    body: MessageBody::Multipart(fragment_body),
                    ..fragment
                });
            }
            Some(accumulated) => {
                let MessageBody::Multipart(accumulated_body) = &mut accumulated.body else {
                    // entries only ever hold multipart messages
                    return Err(ReassemblyError::NotMultipart(xid));
                };

                if accumulated.version != fragment.version
                    || accumulated.msg_type != fragment.msg_type
                    || accumulated_body.subtype != fragment_body.subtype
                {
                    return Err(ReassemblyError::InvalidMerge {
                        xid,
                        expected_version: accumulated.version.wire(),
                        actual_version: fragment.version.wire(),
                        expected_type: accumulated.msg_type,
                        expected_subtype: accumulated_body.subtype,
                        actual_type: fragment.msg_type,
                        actual_subtype: fragment_body.subtype,
                    });
                }

                merge_elements(&mut accumulated_body.elements, fragment_body.elements);
            }
        }
        Ok(())
    }

    /// Removes the entry for `xid`, returning its accumulated message
    pub fn detach(&mut self, xid: u32) -> Result<Message, ReassemblyError> {
        self.entries.remove(&xid)
            .and_then(|entry| entry.message)
            .ok_or(ReassemblyError::NotFound(xid))
    }

    /// Merges a fragment, and returns the complete message once a fragment without the 'more'
    ///  flag arrives
    pub fn on_fragment(&mut self, fragment: Message) -> Result<Option<Message>, ReassemblyError> {
        let xid = fragment.xid;
        if fragment.multipart_body().is_none() {
            return Err(ReassemblyError::NotMultipart(xid));
        }

        let more = fragment.more_follows();
        if !more && !self.has(xid) {
            // single-frame reply
            return Ok(Some(fragment));
        }

        self.merge_fragment(xid, fragment)?;
        if more {
            Ok(None)
        }
        else {
            self.detach(xid).map(Some)
        }
    }

    /// Removes all entries that are expired, and reschedules the sweep if it is running.
    ///  Returns the number of removed entries.
    pub fn sweep_expired(&mut self) -> usize {
        let now = self.timer.now();
        let peer = &self.peer;

        let num_before = self.entries.len();
        self.entries.retain(|xid, entry| {
            if entry.expires <= now {
                warn!("[{}] reassembly of xid {:#010x} timed out - dropping", peer, xid);
                false
            }
            else {
                true
            }
        });
        let num_removed = num_before - self.entries.len();

        if self.running {
            if let Some(handle) = self.sweep_timer.take() {
                self.timer.cancel(handle);
            }
            self.schedule_sweep();
        }
        num_removed
    }

    pub fn on_timer(&mut self, id: TimerId) {
        match id {
            TimerId::ReassemblySweep => {
                self.sweep_timer = None;
                self.sweep_expired();
            }
            other => debug!("[{}] unexpected timer {:?} - ignoring", self.peer, other),
        }
    }

    fn schedule_sweep(&mut self) {
        self.sweep_timer = Some(self.timer.schedule(self.config.sweep_interval, TimerId::ReassemblySweep));
    }
}

/// appends `incoming`, except that a keyed element replaces an existing one with the same key
fn merge_elements(target: &mut Vec<Element>, incoming: Vec<Element>) {
    let mut index_by_key: FxHashMap<ElementKey, usize> = target.iter()
        .enumerate()
        .filter_map(|(idx, e)| e.key.map(|key| (key, idx)))
        .collect();

    for element in incoming {
        match element.key.and_then(|key| index_by_key.get(&key).copied()) {
            Some(idx) => target[idx] = element,
            None => {
                if let Some(key) = element.key {
                    index_by_key.insert(key, target.len());
                }
                target.push(element);
            }
        }
    }
}
