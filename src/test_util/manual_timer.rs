use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;
use crate::transport::timer::{Timer, TimerHandle, TimerId};

#[derive(Debug)]
struct ManualTimerState {
    now: Instant,
    next_handle: u64,
    scheduled: BTreeMap<TimerHandle, (Instant, TimerId)>,
}

/// A [Timer] with a clock that only moves when the test advances it. Due timers are not
///  fired automatically: the test takes them and passes them to the code under test.
#[derive(Debug, Clone)]
pub struct ManualTimer {
    state: Rc<RefCell<ManualTimerState>>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        ManualTimer {
            state: Rc::new(RefCell::new(ManualTimerState {
                now: Instant::now(),
                next_handle: 0,
                scheduled: BTreeMap::new(),
            })),
        }
    }
}

impl ManualTimer {
    pub fn new() -> ManualTimer {
        Default::default()
    }

    pub fn advance(&self, by: Duration) {
        self.state.borrow_mut().now += by;
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.state.borrow().scheduled.values()
            .any(|(_, scheduled_id)| *scheduled_id == id)
    }

    pub fn num_pending(&self) -> usize {
        self.state.borrow().scheduled.len()
    }

    /// the deadline of the earliest pending timer with a given id
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.state.borrow().scheduled.values()
            .filter(|(_, scheduled_id)| *scheduled_id == id)
            .map(|(deadline, _)| *deadline)
            .min()
    }

    /// Removes and returns all timers that are due, ordered by deadline (and by scheduling
    ///  order for equal deadlines)
    pub fn take_due(&self) -> Vec<TimerId> {
        let mut state = self.state.borrow_mut();
        let now = state.now;

        let mut due = state.scheduled.iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(handle, (deadline, id))| (*deadline, *handle, *id))
            .collect::<Vec<_>>();
        due.sort();

        for (_, handle, _) in &due {
            state.scheduled.remove(handle);
        }
        due.into_iter()
            .map(|(_, _, id)| id)
            .collect()
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> Instant {
        self.state.borrow().now
    }

    fn schedule(&mut self, delay: Duration, id: TimerId) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        let handle = TimerHandle(state.next_handle);
        state.next_handle += 1;
        let deadline = state.now + delay;
        state.scheduled.insert(handle, (deadline, id));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.state.borrow_mut().scheduled.remove(&handle);
    }
}
