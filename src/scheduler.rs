//! Virtual-time scheduler for deterministic tests.
//!
//! A [`Scheduler`] captures every timer and microtask scheduled while one of its
//! runs is active and executes them only when the test asks for it through
//! [`Scheduler::tick`], [`Scheduler::flush_microtasks`] or [`Scheduler::flush`].
//!
//! # Invariants
//!
//! - **Microtask fixpoint:** after every macrotask, microtasks drain to empty
//!   before the next macrotask is selected.
//! - **Stable timers:** equal deadlines fire in registration order, whatever the
//!   timer kind.
//! - **No nesting:** at most one scheduler is active per thread; a nested `run`
//!   fails before its body executes.
//! - **Guaranteed release:** interception is uninstalled when a run exits, on
//!   success, on error and on unwind.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::clock::{Clock, VirtualClock};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::hooks::{self, HooksGuard, SchedulingHooks};
use crate::task_queue::{
    DueTask, DueTimer, MicrotaskFn, OneShotFn, PeriodicFn, TaskQueue, TimerId,
};

thread_local! {
    static THREAD_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

struct State {
    config: SchedulerConfig,
    clock: VirtualClock,
    queue: TaskQueue,
    active: bool,
}

/// Handle to a virtual-time scheduler. Clones share the same clock and queues.
#[derive(Clone)]
pub struct Scheduler {
    state: Rc<RefCell<State>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Scheduler configured from `FAKE_ASYNC_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_config(SchedulerConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                config,
                clock: VirtualClock::new(),
                queue: TaskQueue::new(),
                active: false,
            })),
        }
    }

    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.state.borrow().config
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Run `body` with interception active, then drain microtasks and verify
    /// that no timers were leaked.
    pub fn run<T>(&self, body: impl FnOnce(&Self) -> T) -> Result<T> {
        self.try_run(|scheduler| Ok(body(scheduler)))
    }

    /// Like [`Scheduler::run`] for a fallible body.
    ///
    /// An error returned by `body` is propagated unchanged and skips the leaked
    /// timer check.
    pub fn try_run<T, E>(&self, body: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        let _activation = self.activate()?;
        let value = body(self)?;
        self.flush_microtasks()?;

        let (periodic, one_shot) = {
            let state = self.state.borrow();
            (state.queue.pending_periodic(), state.queue.pending_one_shot())
        };
        if periodic > 0 || one_shot > 0 {
            tracing::debug!(
                event = "fake_async.run.unflushed",
                periodic,
                one_shot,
                "Run finished with pending timers"
            );
            return Err(Error::UnflushedTimers { periodic, one_shot }.into());
        }
        Ok(value)
    }

    fn activate(&self) -> Result<Activation<'_>> {
        if THREAD_ACTIVE.get() || self.state.borrow().active {
            tracing::debug!(event = "fake_async.run.nested", "Rejected nested run");
            return Err(Error::Reentrancy);
        }
        {
            let mut state = self.state.borrow_mut();
            state.active = true;
            state.clock.reset();
            state.queue.clear();
        }
        THREAD_ACTIVE.set(true);
        let hooks = hooks::install(Rc::new(self.clone()));
        tracing::debug!(event = "fake_async.run.enter", "Fake-async run started");
        Ok(Activation {
            scheduler: self,
            _hooks: hooks,
        })
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state.borrow().active {
            Ok(())
        } else {
            Err(Error::NotInScope)
        }
    }

    // ── time control ─────────────────────────────────────────────────

    /// Advance virtual time by `millis`, firing every timer that comes due.
    ///
    /// Pending microtasks are flushed first, and again after each timer.
    pub fn tick(&self, millis: u64) -> Result<()> {
        self.tick_with(millis, |_| {})
    }

    /// Like [`Scheduler::tick`], calling `on_advance` with the virtual time that
    /// elapsed before each timer fires and once more at the end.
    ///
    /// A callback that ticks further than `millis` leaves the clock where it
    /// moved it.
    pub fn tick_with(&self, millis: u64, mut on_advance: impl FnMut(u64)) -> Result<()> {
        self.ensure_active()?;
        self.flush_microtasks()?;

        let start = self.now_ms();
        let target = start.saturating_add(millis);
        tracing::debug!(event = "fake_async.tick", start, target, "Advancing virtual time");

        let mut last = start;
        let mut fired = 0_usize;
        while let Some(due) = self.take_due(target) {
            let now = self.now_ms();
            on_advance(now - last);
            last = now;
            self.execute(due);
            fired += 1;
            self.flush_microtasks()?;
        }

        let now = self.catch_up_to(target);
        on_advance(now - last);
        tracing::trace!(event = "fake_async.tick.done", now, fired, "Tick finished");
        Ok(())
    }

    /// Advance the clock to `target_ms` unless it is already past it.
    fn catch_up_to(&self, target_ms: u64) -> u64 {
        let mut state = self.state.borrow_mut();
        let behind = target_ms.saturating_sub(state.clock.now_ms());
        state.clock.advance_by(behind)
    }

    /// Drain microtasks to a fixed point. Does not touch the clock or timers.
    pub fn flush_microtasks(&self) -> Result<()> {
        self.ensure_active()?;
        let mut ran = 0_usize;
        loop {
            // Borrow released before the task runs; it may enqueue more work.
            let next = self.state.borrow_mut().queue.pop_microtask();
            let Some(task) = next else {
                break;
            };
            task.run();
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(event = "fake_async.microtask.drain", ran, "Microtasks drained");
        }
        Ok(())
    }

    /// Drop all periodic timers without running them. One-shot timers stay.
    pub fn discard_periodic_tasks(&self) -> Result<()> {
        self.ensure_active()?;
        let discarded = self.state.borrow_mut().queue.clear_periodic();
        tracing::debug!(
            event = "fake_async.periodic.discard",
            discarded = discarded.len(),
            "Periodic timers discarded"
        );
        // Captured values may cancel or schedule on drop; release them unborrowed.
        drop(discarded);
        Ok(())
    }

    /// Flush microtasks and run pending timers using the configured limits.
    ///
    /// Returns the virtual milliseconds that elapsed.
    pub fn flush(&self) -> Result<u64> {
        let config = self.config();
        self.flush_with(config.max_flush_turns, config.flush_periodic)
    }

    /// Flush pending timers.
    ///
    /// Without `flush_periodic`, timers fire in order until only periodic ones
    /// remain; firing more than `limit` timers fails with [`Error::FlushLimit`].
    /// With `flush_periodic`, time advances to the latest pending deadline.
    pub fn flush_with(&self, limit: usize, flush_periodic: bool) -> Result<u64> {
        self.ensure_active()?;
        self.flush_microtasks()?;
        let start = self.now_ms();

        if flush_periodic {
            let last_deadline = self.state.borrow().queue.last_deadline();
            if let Some(deadline) = last_deadline {
                self.tick(deadline.saturating_sub(start))?;
            }
            return Ok(self.now_ms() - start);
        }

        let mut turns = 0_usize;
        loop {
            let done = {
                let state = self.state.borrow();
                !state.queue.has_pending_timers() || state.queue.only_periodic_pending()
            };
            if done {
                break;
            }
            turns += 1;
            if turns > limit {
                return Err(Error::FlushLimit { limit });
            }
            let Some(due) = self.take_due(u64::MAX) else {
                break;
            };
            self.execute(due);
            self.flush_microtasks()?;
        }
        Ok(self.now_ms() - start)
    }

    fn take_due(&self, limit_ms: u64) -> Option<DueTimer> {
        let due = self.state.borrow_mut().queue.next_due_macrotask(limit_ms)?;
        // A nested tick may already have carried the clock past the deadline.
        self.catch_up_to(due.deadline_ms);
        Some(due)
    }

    fn execute(&self, due: DueTimer) {
        tracing::trace!(
            event = "fake_async.timer.fire",
            timer_id = %due.id,
            deadline_ms = due.deadline_ms,
            periodic = due.is_periodic(),
            "Timer fired"
        );
        let DueTimer { id, args, task, .. } = due;
        match task {
            DueTask::OneShot(callback) => callback(&args[..]),
            DueTask::Periodic { mut callback, .. } => {
                callback(&args[..]);
                let rearmed = {
                    let mut state = self.state.borrow_mut();
                    let now = state.clock.now_ms();
                    state.queue.rearm(id, callback, now)
                };
                // Cancelled while running: the callback comes back to be dropped here.
                drop(rearmed);
            }
        }
    }

    // ── scheduling surface ───────────────────────────────────────────

    pub fn queue_microtask(&self, callback: impl FnOnce() + 'static) -> Result<()> {
        self.schedule_microtask(Box::new(callback))
    }

    pub fn set_timeout(&self, callback: impl FnOnce() + 'static, delay_ms: i64) -> Result<TimerId> {
        self.set_timeout_with_args(move |_| callback(), delay_ms, Vec::new())
    }

    pub fn set_timeout_with_args(
        &self,
        callback: impl FnOnce(&[Value]) + 'static,
        delay_ms: i64,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        self.schedule_timer(delay_ms, Box::new(callback), args)
    }

    pub fn set_immediate(&self, callback: impl FnOnce() + 'static) -> Result<TimerId> {
        self.set_timeout(callback, 0)
    }

    pub fn set_interval(
        &self,
        mut callback: impl FnMut() + 'static,
        interval_ms: i64,
    ) -> Result<TimerId> {
        self.set_interval_with_args(move |_| callback(), interval_ms, Vec::new())
    }

    pub fn set_interval_with_args(
        &self,
        callback: impl FnMut(&[Value]) + 'static,
        interval_ms: i64,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        self.schedule_periodic(interval_ms, Box::new(callback), args)
    }

    /// Cancel a timer. Returns false if it was unknown, already fired, or the
    /// scheduler is not active.
    pub fn clear_timer(&self, timer_id: TimerId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            if !state.active {
                return false;
            }
            state.queue.cancel(timer_id)
        };
        removed.is_some()
    }

    // ── introspection ────────────────────────────────────────────────

    /// Current virtual time in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.state.borrow().clock.now_ms()
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.state.borrow().queue.pending_one_shot()
    }

    #[must_use]
    pub fn pending_periodic_timers(&self) -> usize {
        self.state.borrow().queue.pending_periodic()
    }

    #[must_use]
    pub fn pending_microtasks(&self) -> usize {
        self.state.borrow().queue.microtask_count()
    }
}

impl SchedulingHooks for Scheduler {
    fn schedule_microtask(&self, callback: MicrotaskFn) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.active {
            return Err(Error::NotInScope);
        }
        state.queue.enqueue_microtask(callback);
        Ok(())
    }

    fn schedule_timer(
        &self,
        delay_ms: i64,
        callback: OneShotFn,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        let mut state = self.state.borrow_mut();
        if !state.active {
            return Err(Error::NotInScope);
        }
        let now = state.clock.now_ms();
        state.queue.schedule_one_shot(now, delay_ms, callback, args)
    }

    fn schedule_periodic(
        &self,
        interval_ms: i64,
        callback: PeriodicFn,
        args: Vec<Value>,
    ) -> Result<TimerId> {
        let mut state = self.state.borrow_mut();
        if !state.active {
            return Err(Error::NotInScope);
        }
        let now = state.clock.now_ms();
        state.queue.schedule_periodic(now, interval_ms, callback, args)
    }

    fn cancel_timer(&self, timer_id: TimerId) {
        self.clear_timer(timer_id);
    }
}

impl Clock for Scheduler {
    fn now_ms(&self) -> u64 {
        Self::now_ms(self)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Scheduler")
            .field("active", &state.active)
            .field("now_ms", &state.clock.now_ms())
            .field("queue", &state.queue)
            .field("config", &state.config)
            .finish()
    }
}

/// Active window of a run. Dropping it deactivates the scheduler.
struct Activation<'a> {
    scheduler: &'a Scheduler,
    _hooks: HooksGuard,
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        let leftover = {
            let mut state = self.scheduler.state.borrow_mut();
            state.active = false;
            std::mem::take(&mut state.queue)
        };
        THREAD_ACTIVE.set(false);
        tracing::debug!(event = "fake_async.run.exit", "Fake-async run finished");
        // Captured values may hold scheduler handles; drop them unborrowed.
        drop(leftover);
    }
}

/// Wrap `body` so that each call performs a full [`Scheduler::run`] on a fresh
/// scheduler configured from the environment.
pub fn fake_async<A, T, F>(body: F) -> impl FnOnce(A) -> Result<T>
where
    F: FnOnce(&Scheduler, A) -> T,
{
    move |args| Scheduler::from_env().run(|scheduler| body(scheduler, args))
}

/// Fallible counterpart of [`fake_async`].
pub fn try_fake_async<A, T, E, F>(body: F) -> impl FnOnce(A) -> Result<T, E>
where
    F: FnOnce(&Scheduler, A) -> Result<T, E>,
    E: From<Error>,
{
    move |args| Scheduler::from_env().try_run(|scheduler| body(scheduler, args))
}
