use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

pub(crate) type Thunk = Box<dyn FnOnce() + 'static>;

/// Lifecycle of a scheduled timer. Exactly one of cancellation and firing
/// takes effect; the loser observes a non-`Armed` state and does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerState {
    Armed,
    Fired,
    Cancelled,
}

/// Shared between the heap entry and the cancellation handle.
#[derive(Debug)]
pub(crate) struct TimerFlag {
    state: Cell<TimerState>,
}

impl TimerFlag {
    pub(crate) fn armed() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(TimerState::Armed),
        })
    }

    pub(crate) fn get(&self) -> TimerState {
        self.state.get()
    }

    pub(crate) fn set(&self, state: TimerState) {
        self.state.set(state);
    }
}

pub(crate) enum TimerTask {
    Once(Option<Thunk>),
    Interval {
        period: Duration,
        callback: Rc<RefCell<dyn FnMut()>>,
    },
}

pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
    pub(crate) flag: Rc<TimerFlag>,
    pub(crate) task: TimerTask,
}

// BinaryHeap is a max-heap; the ordering is inverted so the earliest deadline
// sits on top, with the sequence number as a stable insertion-order tie-break.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Deadline-ordered timer store. Cancelled entries stay in the heap as
/// tombstones and are dropped, without running, whenever they surface.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, flag: Rc<TimerFlag>, task: TimerTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            flag,
            task,
        });
    }

    /// Sequence number the next insertion will get. Firing phases use it to
    /// avoid running timers armed while the phase itself was executing.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Earliest live deadline, draining tombstones off the top.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let top = self.heap.peek()?;
            if top.flag.get() == TimerState::Cancelled {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline);
        }
    }

    /// Pops the next entry due at `now`, skipping tombstones. Entries armed at
    /// or after `before_seq` are left for the next iteration.
    pub(crate) fn pop_due(&mut self, now: Instant, before_seq: u64) -> Option<TimerEntry> {
        loop {
            let top = self.heap.peek()?;
            if top.flag.get() == TimerState::Cancelled {
                self.heap.pop();
                continue;
            }
            if top.deadline > now || top.seq >= before_seq {
                return None;
            }
            return self.heap.pop();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
