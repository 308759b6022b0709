//! The virtual clock and the cancellable event queue.
//!
//! The whole data plane is single-threaded and cooperative: packet handlers
//! and timer callbacks run to completion, and time only advances between
//! events. Handlers never read a wall clock; they ask the queue for `now()`
//! and request future work with `schedule_in()`. Events scheduled for the
//! same instant fire in the order they were scheduled.
//!
//! A scheduled entry carries only the identity of its target (switch id plus
//! the timer kind, which may embed a flow key), never a reference into switch
//! state. A handler whose target has since been deleted detects that and
//! no-ops, so cancellation is optional where deletion is visible.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Simulation timestamps and durations, in nanoseconds.
pub type Nanos = u64;

/// The kinds of timed work the engines schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timer {
    /// CONGA: decay every egress DRE counter.
    CongaDre,
    /// CONGA: age the leaf tables and the flowlet table.
    CongaAging,
    /// LETFLOW: age the flowlet table.
    LetflowAging,
    /// CONWEAVE: age the per-flow source/destination tables.
    ConweaveAging,
    /// CONWEAVE: flush the VOQ owned by this flow.
    VoqFlush { flowkey: u64 },
}

/// A timer due at some switch.
#[derive(Clone, Debug)]
pub struct Firing {
    pub switch: u32,
    pub timer: Timer,
}

/// Token for a scheduled entry, used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

#[derive(Clone, Debug)]
struct Scheduled {
    at: Nanos,
    seq: u64,
    firing: Firing,
}

// heap ordering: earliest deadline first, FIFO within a deadline
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Single-threaded event queue with a virtual clock.
#[derive(Default)]
pub struct EventQueue {
    now: Nanos,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Scheduled>>,
    cancelled: HashSet<u64>,
    pending: HashSet<u64>,
}

impl EventQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Nanos {
        self.now
    }

    /// Move the clock forward without firing anything. Used by embeddings to
    /// place packet arrivals between timer deadlines; never moves backwards.
    pub fn advance_to(&mut self, t: Nanos) {
        assert!(t >= self.now, "virtual clock cannot run backwards");
        self.now = t;
    }

    /// Schedule `timer` at `switch`, `delay` from now.
    pub fn schedule_in(&mut self, delay: Nanos, switch: u32, timer: Timer) -> EventHandle {
        self.schedule_at(self.now + delay, switch, timer)
    }

    /// Schedule `timer` at `switch` at absolute time `at`.
    pub fn schedule_at(&mut self, at: Nanos, switch: u32, timer: Timer) -> EventHandle {
        assert!(at >= self.now, "cannot schedule into the past");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq);
        self.heap.push(Reverse(Scheduled {
            at,
            seq,
            firing: Firing { switch, timer },
        }));
        EventHandle(seq)
    }

    /// Cancel a scheduled entry. Returns whether it was still pending.
    pub fn cancel(&mut self, h: EventHandle) -> bool {
        if self.pending.remove(&h.0) {
            self.cancelled.insert(h.0);
            true
        } else {
            false
        }
    }

    /// Whether the entry behind `h` has neither fired nor been cancelled.
    pub fn is_pending(&self, h: EventHandle) -> bool {
        self.pending.contains(&h.0)
    }

    /// Deadline of the next live entry, if any.
    pub fn next_deadline(&mut self) -> Option<Nanos> {
        self.skip_cancelled();
        self.heap.peek().map(|Reverse(s)| s.at)
    }

    /// Pop the next live entry, advancing the clock to its deadline.
    pub fn pop(&mut self) -> Option<Firing> {
        self.skip_cancelled();
        let Reverse(s) = self.heap.pop()?;
        self.pending.remove(&s.seq);
        debug_assert!(s.at >= self.now);
        self.now = s.at;
        Some(s.firing)
    }

    /// Pop the next live entry due at or before `t`. If none is due, the
    /// clock advances to `t`.
    pub fn pop_due(&mut self, t: Nanos) -> Option<Firing> {
        match self.next_deadline() {
            Some(at) if at <= t => self.pop(),
            _ => {
                if t > self.now {
                    self.now = t;
                }
                None
            }
        }
    }

    fn skip_cancelled(&mut self) {
        while let Some(Reverse(s)) = self.heap.peek() {
            if self.cancelled.remove(&s.seq) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{EventQueue, Timer};

    #[test]
    fn fifo_at_equal_time() {
        let mut q = EventQueue::new();
        q.schedule_in(100, 1, Timer::CongaDre);
        q.schedule_in(100, 2, Timer::CongaAging);
        q.schedule_in(50, 3, Timer::LetflowAging);

        let f = q.pop().unwrap();
        assert_eq!((f.switch, q.now()), (3, 50));
        let f = q.pop().unwrap();
        assert_eq!((f.switch, f.timer), (1, Timer::CongaDre));
        let f = q.pop().unwrap();
        assert_eq!((f.switch, f.timer), (2, Timer::CongaAging));
        assert_eq!(q.now(), 100);
        assert!(q.pop().is_none());
    }

    #[test]
    fn cancel_suppresses_firing() {
        let mut q = EventQueue::new();
        let h = q.schedule_in(10, 0, Timer::VoqFlush { flowkey: 7 });
        q.schedule_in(20, 0, Timer::CongaDre);
        assert!(q.is_pending(h));
        assert!(q.cancel(h));
        assert!(!q.is_pending(h));
        assert!(!q.cancel(h));

        let f = q.pop().unwrap();
        assert_eq!(f.timer, Timer::CongaDre);
        assert_eq!(q.now(), 20);
    }

    #[test]
    fn pop_due_advances_clock() {
        let mut q = EventQueue::new();
        q.schedule_in(500, 0, Timer::CongaDre);
        assert!(q.pop_due(300).is_none());
        assert_eq!(q.now(), 300);
        assert!(q.pop_due(500).is_some());
        assert_eq!(q.now(), 500);
    }
}
