//! Ordered storage for microtasks, one-shot timers and periodic timers.
//!
//! # Ordering
//!
//! - Microtasks are FIFO.
//! - Timers are ordered by `(deadline_ms, seq)`; `seq` is shared by both timer
//!   kinds, so equal deadlines fire in registration order regardless of kind.
//! - Cancellation is lazy in the heap but immediate in the timer table: a heap
//!   entry whose timer is gone (or was re-armed under a newer seq) is skipped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Callback queued as a microtask.
pub type MicrotaskFn = Box<dyn FnOnce()>;
/// Callback of a one-shot timer; receives the timer's arguments.
pub type OneShotFn = Box<dyn FnOnce(&[Value])>;
/// Callback of a periodic timer; receives the timer's arguments on every firing.
pub type PeriodicFn = Box<dyn FnMut(&[Value])>;

/// Handle returned when a timer is scheduled; used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

/// Monotonically increasing registration counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    timer_id: TimerId,
    deadline_ms: u64,
    seq: Seq,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the smallest (deadline, seq) first.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A queued microtask.
pub struct Microtask {
    callback: MicrotaskFn,
}

impl Microtask {
    pub fn run(self) {
        (self.callback)();
    }
}

impl fmt::Debug for Microtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microtask").finish_non_exhaustive()
    }
}

enum TimerCallback {
    OneShot(OneShotFn),
    /// `callback` is `None` while the timer is executing.
    Periodic {
        callback: Option<PeriodicFn>,
        interval_ms: u64,
    },
}

/// A registered timer. Returned by [`TaskQueue::cancel`] and
/// [`TaskQueue::clear_periodic`] so the caller controls where its captured
/// state is dropped.
pub struct PendingTimer {
    deadline_ms: u64,
    seq: Seq,
    args: Rc<[Value]>,
    callback: TimerCallback,
}

impl PendingTimer {
    #[must_use]
    pub const fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        matches!(self.callback, TimerCallback::Periodic { .. })
    }
}

impl fmt::Debug for PendingTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTimer")
            .field("deadline_ms", &self.deadline_ms)
            .field("seq", &self.seq)
            .field("periodic", &self.is_periodic())
            .finish_non_exhaustive()
    }
}

/// The work carried by a timer that has come due.
pub enum DueTask {
    OneShot(OneShotFn),
    Periodic {
        callback: PeriodicFn,
        interval_ms: u64,
    },
}

/// A timer removed from the queue for execution.
pub struct DueTimer {
    pub id: TimerId,
    pub deadline_ms: u64,
    pub args: Rc<[Value]>,
    pub task: DueTask,
}

impl DueTimer {
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        matches!(self.task, DueTask::Periodic { .. })
    }
}

impl fmt::Debug for DueTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DueTimer")
            .field("id", &self.id)
            .field("deadline_ms", &self.deadline_ms)
            .field("periodic", &self.is_periodic())
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Queue of deferred work owned by a single scheduler.
pub struct TaskQueue {
    seq: Seq,
    next_timer_id: u64,
    microtasks: VecDeque<Microtask>,
    timer_heap: BinaryHeap<TimerEntry>,
    timers: HashMap<TimerId, PendingTimer>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seq: Seq::zero(),
            next_timer_id: 1,
            microtasks: VecDeque::new(),
            timer_heap: BinaryHeap::new(),
            timers: HashMap::new(),
        }
    }

    const fn next_seq(&mut self) -> Seq {
        let current = self.seq;
        self.seq = self.seq.next();
        current
    }

    const fn next_id(&mut self) -> TimerId {
        let id = TimerId::new(self.next_timer_id);
        self.next_timer_id = self.next_timer_id.saturating_add(1);
        id
    }

    /// Append a microtask. Never fails.
    pub fn enqueue_microtask(&mut self, callback: MicrotaskFn) {
        self.microtasks.push_back(Microtask { callback });
        tracing::trace!(
            event = "fake_async.microtask.enqueue",
            depth = self.microtasks.len(),
            "Microtask enqueued"
        );
    }

    /// Schedule a one-shot timer due at `now_ms + delay_ms`.
    pub fn schedule_one_shot(
        &mut self,
        now_ms: u64,
        delay_ms: i64,
        callback: OneShotFn,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        let delay = u64::try_from(delay_ms).map_err(|_| {
            Error::invalid_argument(format!("timer delay must not be negative (got {delay_ms})"))
        })?;
        Ok(self.insert(
            now_ms.saturating_add(delay),
            args,
            TimerCallback::OneShot(callback),
        ))
    }

    /// Schedule a periodic timer first due at `now_ms + interval_ms`.
    pub fn schedule_periodic(
        &mut self,
        now_ms: u64,
        interval_ms: i64,
        callback: PeriodicFn,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        let interval = u64::try_from(interval_ms)
            .ok()
            .filter(|interval| *interval > 0)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "periodic interval must be positive (got {interval_ms})"
                ))
            })?;
        Ok(self.insert(
            now_ms.saturating_add(interval),
            args,
            TimerCallback::Periodic {
                callback: Some(callback),
                interval_ms: interval,
            },
        ))
    }

    fn insert(&mut self, deadline_ms: u64, args: Vec<Value>, callback: TimerCallback) -> TimerId {
        let timer_id = self.next_id();
        let seq = self.next_seq();
        let periodic = matches!(callback, TimerCallback::Periodic { .. });
        self.timers.insert(
            timer_id,
            PendingTimer {
                deadline_ms,
                seq,
                args: args.into(),
                callback,
            },
        );
        self.timer_heap.push(TimerEntry {
            timer_id,
            deadline_ms,
            seq,
        });

        tracing::trace!(
            event = "fake_async.timer.set",
            %timer_id,
            deadline_ms,
            periodic,
            %seq,
            "Timer scheduled"
        );

        timer_id
    }

    /// Remove a pending timer. Unknown or already-fired ids are a no-op.
    ///
    /// Returns the removed timer, if any.
    pub fn cancel(&mut self, timer_id: TimerId) -> Option<PendingTimer> {
        let removed = self.timers.remove(&timer_id);
        tracing::trace!(
            event = "fake_async.timer.cancel",
            %timer_id,
            cancelled = removed.is_some(),
            "Timer cancelled"
        );
        removed
    }

    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.timers.get(&entry.timer_id).is_some_and(|timer| {
            timer.seq == entry.seq
                && !matches!(timer.callback, TimerCallback::Periodic { callback: None, .. })
        })
    }

    /// Take the earliest timer due at or before `limit_ms`.
    ///
    /// One-shot timers leave the queue. Periodic timers stay registered (so they
    /// can still be cancelled from inside their own callback) until handed back
    /// through [`TaskQueue::rearm`].
    pub fn next_due_macrotask(&mut self, limit_ms: u64) -> Option<DueTimer> {
        while let Some(entry) = self.timer_heap.peek().copied() {
            if !self.is_live(&entry) {
                self.timer_heap.pop();
                continue;
            }
            if entry.deadline_ms > limit_ms {
                return None;
            }
            self.timer_heap.pop();
            return self.take_due(entry);
        }
        None
    }

    fn take_due(&mut self, entry: TimerEntry) -> Option<DueTimer> {
        let timer_id = entry.timer_id;
        if self.timers.get(&timer_id)?.is_periodic() {
            let timer = self.timers.get_mut(&timer_id)?;
            let TimerCallback::Periodic {
                callback,
                interval_ms,
            } = &mut timer.callback
            else {
                return None;
            };
            let task = DueTask::Periodic {
                callback: callback.take()?,
                interval_ms: *interval_ms,
            };
            return Some(DueTimer {
                id: timer_id,
                deadline_ms: entry.deadline_ms,
                args: Rc::clone(&timer.args),
                task,
            });
        }

        let timer = self.timers.remove(&timer_id)?;
        let TimerCallback::OneShot(callback) = timer.callback else {
            return None;
        };
        Some(DueTimer {
            id: timer_id,
            deadline_ms: entry.deadline_ms,
            args: timer.args,
            task: DueTask::OneShot(callback),
        })
    }

    /// Return a periodic callback after it ran, scheduling its next firing at
    /// `deadline_ms + interval_ms`, or at `now_ms` if the callback moved the
    /// clock past that point.
    ///
    /// Returns the next deadline, or hands the callback back if the timer was
    /// cancelled meanwhile.
    pub fn rearm(
        &mut self,
        timer_id: TimerId,
        callback: PeriodicFn,
        now_ms: u64,
    ) -> Result<u64, PeriodicFn> {
        let seq = self.next_seq();
        let Some(timer) = self.timers.get_mut(&timer_id) else {
            return Err(callback);
        };
        let TimerCallback::Periodic {
            callback: slot,
            interval_ms,
        } = &mut timer.callback
        else {
            return Err(callback);
        };
        *slot = Some(callback);
        timer.deadline_ms = timer.deadline_ms.saturating_add(*interval_ms).max(now_ms);
        timer.seq = seq;
        let deadline_ms = timer.deadline_ms;
        self.timer_heap.push(TimerEntry {
            timer_id,
            deadline_ms,
            seq,
        });
        tracing::trace!(
            event = "fake_async.timer.rearm",
            %timer_id,
            deadline_ms,
            %seq,
            "Periodic timer re-armed"
        );
        Ok(deadline_ms)
    }

    /// Pop the oldest microtask.
    pub fn pop_microtask(&mut self) -> Option<Microtask> {
        self.microtasks.pop_front()
    }

    /// Remove and return every microtask queued right now, in FIFO order.
    ///
    /// Microtasks enqueued while running the returned batch are not included;
    /// callers that need a fixed point loop until this returns empty.
    pub fn drain_microtasks(&mut self) -> Vec<Microtask> {
        self.microtasks.drain(..).collect()
    }

    /// Remove all periodic timers without running them.
    pub fn clear_periodic(&mut self) -> Vec<PendingTimer> {
        let periodic: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.is_periodic())
            .map(|(id, _)| *id)
            .collect();
        periodic
            .into_iter()
            .filter_map(|id| self.timers.remove(&id))
            .collect()
    }

    /// Drop everything and restart id and seq counters.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    #[must_use]
    pub fn pending_one_shot(&self) -> usize {
        self.timers.values().filter(|t| !t.is_periodic()).count()
    }

    #[must_use]
    pub fn pending_periodic(&self) -> usize {
        self.timers.values().filter(|t| t.is_periodic()).count()
    }

    #[must_use]
    pub fn microtask_count(&self) -> usize {
        self.microtasks.len()
    }

    #[must_use]
    pub fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Deadline of the latest timer that can still fire.
    #[must_use]
    pub fn last_deadline(&self) -> Option<u64> {
        self.timer_heap
            .iter()
            .filter(|entry| self.is_live(entry))
            .map(|entry| entry.deadline_ms)
            .max()
    }

    /// Whether every live timer is periodic (vacuously true when none are pending).
    #[must_use]
    pub fn only_periodic_pending(&self) -> bool {
        self.timers.values().all(PendingTimer::is_periodic)
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("seq", &self.seq)
            .field("microtasks", &self.microtasks.len())
            .field("one_shot", &self.pending_one_shot())
            .field("periodic", &self.pending_periodic())
            .field("heap_entries", &self.timer_heap.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn noop_once() -> OneShotFn {
        Box::new(|_| {})
    }

    fn noop_periodic() -> PeriodicFn {
        Box::new(|_| {})
    }

    fn fire_all(queue: &mut TaskQueue, limit_ms: u64) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(due) = queue.next_due_macrotask(limit_ms) {
            fired.push(due.id);
            if let DueTask::Periodic { callback, .. } = due.task {
                // Leave periodic timers registered but idle for inspection.
                let _ = queue.rearm(due.id, callback, due.deadline_ms);
                break;
            }
        }
        fired
    }

    #[test]
    fn seq_ordering_and_display() {
        let a = Seq::zero();
        let b = a.next();
        assert!(a < b);
        assert_eq!(b.value(), 1);
        assert_eq!(format!("{b}"), "seq:1");
    }

    #[test]
    fn timer_entry_min_heap_ordering() {
        let early = TimerEntry {
            timer_id: TimerId(1),
            deadline_ms: 100,
            seq: Seq(5),
        };
        let late = TimerEntry {
            timer_id: TimerId(2),
            deadline_ms: 200,
            seq: Seq(0),
        };
        let tie_later_seq = TimerEntry {
            timer_id: TimerId(3),
            deadline_ms: 100,
            seq: Seq(9),
        };
        // Reversed for the max-heap.
        assert!(early > late);
        assert!(early > tie_later_seq);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut queue = TaskQueue::new();
        let t300 = queue.schedule_one_shot(0, 300, noop_once(), vec![]).unwrap();
        let t100 = queue.schedule_one_shot(0, 100, noop_once(), vec![]).unwrap();
        let t200 = queue.schedule_one_shot(0, 200, noop_once(), vec![]).unwrap();

        assert_eq!(fire_all(&mut queue, 1_000), vec![t100, t200, t300]);
        assert_eq!(queue.pending_one_shot(), 0);
    }

    #[test]
    fn equal_deadlines_break_ties_by_registration_across_kinds() {
        let mut queue = TaskQueue::new();
        let periodic = queue
            .schedule_periodic(0, 50, noop_periodic(), vec![])
            .unwrap();
        let once = queue.schedule_one_shot(0, 50, noop_once(), vec![]).unwrap();

        let first = queue.next_due_macrotask(50).expect("periodic due");
        assert_eq!(first.id, periodic);
        assert!(first.is_periodic());
        let second = queue.next_due_macrotask(50).expect("one-shot due");
        assert_eq!(second.id, once);
    }

    #[test]
    fn nothing_returned_before_deadline() {
        let mut queue = TaskQueue::new();
        queue.schedule_one_shot(10, 5, noop_once(), vec![]).unwrap();
        assert!(queue.next_due_macrotask(14).is_none());
        assert!(queue.next_due_macrotask(15).is_some());
    }

    #[test]
    fn cancelled_timer_is_skipped_and_cancel_is_idempotent() {
        let mut queue = TaskQueue::new();
        let t1 = queue.schedule_one_shot(0, 100, noop_once(), vec![]).unwrap();
        let t2 = queue.schedule_one_shot(0, 200, noop_once(), vec![]).unwrap();

        let removed = queue.cancel(t1).expect("pending timer");
        assert_eq!(removed.deadline_ms(), 100);
        assert!(queue.cancel(t1).is_none());
        assert!(queue.cancel(TimerId(999)).is_none());

        assert_eq!(queue.last_deadline(), Some(200));
        assert_eq!(fire_all(&mut queue, 1_000), vec![t2]);
    }

    #[test]
    fn negative_delay_and_non_positive_interval_are_rejected() {
        let mut queue = TaskQueue::new();
        assert!(matches!(
            queue.schedule_one_shot(0, -1, noop_once(), vec![]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.schedule_periodic(0, 0, noop_periodic(), vec![]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.schedule_periodic(0, -10, noop_periodic(), vec![]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!queue.has_pending_timers());
    }

    #[test]
    fn zero_delay_is_due_immediately() {
        let mut queue = TaskQueue::new();
        let id = queue.schedule_one_shot(7, 0, noop_once(), vec![]).unwrap();
        let due = queue.next_due_macrotask(7).expect("due now");
        assert_eq!(due.id, id);
        assert_eq!(due.deadline_ms, 7);
    }

    #[test]
    fn periodic_rearm_advances_from_previous_deadline() {
        let mut queue = TaskQueue::new();
        let id = queue
            .schedule_periodic(0, 30, noop_periodic(), vec![])
            .unwrap();

        let due = queue.next_due_macrotask(100).expect("first firing");
        assert_eq!(due.deadline_ms, 30);
        // Still registered while running.
        assert_eq!(queue.pending_periodic(), 1);
        assert!(queue.next_due_macrotask(100).is_none(), "running timer is not due twice");

        let DueTask::Periodic { callback, interval_ms } = due.task else {
            unreachable!("expected periodic task");
        };
        assert_eq!(interval_ms, 30);
        assert_eq!(queue.rearm(id, callback, 30).ok(), Some(60));
        assert_eq!(queue.last_deadline(), Some(60));
    }

    #[test]
    fn periodic_rearm_never_lands_behind_the_clock() {
        let mut queue = TaskQueue::new();
        let id = queue
            .schedule_periodic(0, 10, noop_periodic(), vec![])
            .unwrap();
        let due = queue.next_due_macrotask(10).expect("due");
        let DueTask::Periodic { callback, .. } = due.task else {
            unreachable!("expected periodic task");
        };
        // The callback advanced the clock to 110 before handing back.
        assert_eq!(queue.rearm(id, callback, 110).ok(), Some(110));
        assert!(queue.next_due_macrotask(109).is_none());
        assert_eq!(queue.next_due_macrotask(110).map(|due| due.id), Some(id));
    }

    #[test]
    fn periodic_cancelled_while_running_is_not_rearmed() {
        let mut queue = TaskQueue::new();
        let id = queue
            .schedule_periodic(0, 10, noop_periodic(), vec![])
            .unwrap();
        let due = queue.next_due_macrotask(10).expect("due");
        assert!(queue.cancel(id).is_some_and(|timer| timer.is_periodic()));
        let DueTask::Periodic { callback, .. } = due.task else {
            unreachable!("expected periodic task");
        };
        assert!(queue.rearm(id, callback, 10).is_err());
        assert_eq!(queue.pending_periodic(), 0);
        assert!(queue.next_due_macrotask(u64::MAX).is_none());
    }

    #[test]
    fn args_travel_with_the_timer() {
        let mut queue = TaskQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        queue
            .schedule_one_shot(
                0,
                1,
                Box::new(move |args| sink.borrow_mut().extend_from_slice(args)),
                vec![json!("a"), json!(2)],
            )
            .unwrap();

        let due = queue.next_due_macrotask(1).expect("due");
        let DueTask::OneShot(callback) = due.task else {
            unreachable!("expected one-shot task");
        };
        callback(&due.args[..]);
        assert_eq!(*seen.borrow(), vec![json!("a"), json!(2)]);
    }

    #[test]
    fn drain_microtasks_returns_a_fifo_snapshot() {
        let mut queue = TaskQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let order = Rc::clone(&order);
            queue.enqueue_microtask(Box::new(move || order.borrow_mut().push(n)));
        }
        let batch = queue.drain_microtasks();
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.microtask_count(), 0);
        for task in batch {
            task.run();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn clear_periodic_leaves_one_shot_timers() {
        let mut queue = TaskQueue::new();
        queue
            .schedule_periodic(0, 10, noop_periodic(), vec![])
            .unwrap();
        queue
            .schedule_periodic(0, 20, noop_periodic(), vec![])
            .unwrap();
        let once = queue.schedule_one_shot(0, 15, noop_once(), vec![]).unwrap();

        let removed = queue.clear_periodic();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(PendingTimer::is_periodic));
        assert_eq!(queue.pending_periodic(), 0);
        assert_eq!(queue.pending_one_shot(), 1);
        assert!(!queue.only_periodic_pending());
        assert_eq!(fire_all(&mut queue, 100), vec![once]);
        assert!(queue.only_periodic_pending());
    }

    #[test]
    fn last_deadline_tracks_latest_live_timer() {
        let mut queue = TaskQueue::new();
        assert_eq!(queue.last_deadline(), None);
        queue.schedule_one_shot(0, 40, noop_once(), vec![]).unwrap();
        let late = queue.schedule_one_shot(0, 90, noop_once(), vec![]).unwrap();
        assert_eq!(queue.last_deadline(), Some(90));
        queue.cancel(late);
        assert_eq!(queue.last_deadline(), Some(40));
    }

    #[test]
    fn timer_ids_are_unique_and_clear_resets_state() {
        let mut queue = TaskQueue::new();
        let a = queue.schedule_one_shot(0, 1, noop_once(), vec![]).unwrap();
        let b = queue.schedule_one_shot(0, 1, noop_once(), vec![]).unwrap();
        assert_ne!(a, b);
        queue.enqueue_microtask(Box::new(|| {}));

        queue.clear();
        assert_eq!(queue.microtask_count(), 0);
        assert!(!queue.has_pending_timers());
        let debug = format!("{queue:?}");
        assert!(debug.contains("TaskQueue"));
    }
}
