//! Ambient scheduling hook points.
//!
//! Code under test schedules deferred work through the free functions in this
//! module (`set_timeout`, `set_interval`, `queue_microtask`, ...). Each call is
//! routed to the innermost [`SchedulingHooks`] installed on the current thread.
//! Installing returns a [`HooksGuard`]; dropping it restores whatever was
//! installed before, including on unwind.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::task_queue::{MicrotaskFn, OneShotFn, PeriodicFn, TimerId};

/// The scheduling primitives an event loop exposes.
pub trait SchedulingHooks {
    fn schedule_microtask(&self, callback: MicrotaskFn) -> Result<()>;

    fn schedule_timer(&self, delay_ms: i64, callback: OneShotFn, args: Vec<Value>)
    -> Result<TimerId>;

    fn schedule_periodic(
        &self,
        interval_ms: i64,
        callback: PeriodicFn,
        args: Vec<Value>,
    ) -> Result<TimerId>;

    fn cancel_timer(&self, timer_id: TimerId);
}

thread_local! {
    static INSTALLED: RefCell<Vec<Rc<dyn SchedulingHooks>>> = const { RefCell::new(Vec::new()) };
}

/// Restores the previously installed hooks when dropped.
#[must_use = "hooks are uninstalled as soon as the guard is dropped"]
pub struct HooksGuard {
    depth: usize,
    // Tied to the installing thread.
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for HooksGuard {
    fn drop(&mut self) {
        let removed = INSTALLED.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Guards normally drop in LIFO order; splitting also covers leaked
            // inner guards.
            let start = self.depth.saturating_sub(1).min(stack.len());
            stack.split_off(start)
        });
        tracing::trace!(
            event = "fake_async.hooks.uninstall",
            depth = self.depth,
            removed = removed.len(),
            "Scheduling hooks restored"
        );
        drop(removed);
    }
}

/// Install `hooks` as the innermost scheduling hooks for the current thread.
pub fn install(hooks: Rc<dyn SchedulingHooks>) -> HooksGuard {
    let depth = INSTALLED.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(hooks);
        stack.len()
    });
    tracing::trace!(
        event = "fake_async.hooks.install",
        depth,
        "Scheduling hooks installed"
    );
    HooksGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// Whether any hooks are installed on the current thread.
#[must_use]
pub fn is_installed() -> bool {
    INSTALLED.with(|stack| !stack.borrow().is_empty())
}

fn current() -> Option<Rc<dyn SchedulingHooks>> {
    // Cloned out so the thread-local is not borrowed while the hooks run.
    INSTALLED.with(|stack| stack.borrow().last().cloned())
}

fn with_current<T>(f: impl FnOnce(&dyn SchedulingHooks) -> Result<T>) -> Result<T> {
    let hooks = current().ok_or(Error::NoHooks)?;
    f(hooks.as_ref())
}

pub fn queue_microtask(callback: impl FnOnce() + 'static) -> Result<()> {
    with_current(|hooks| hooks.schedule_microtask(Box::new(callback)))
}

pub fn set_timeout(callback: impl FnOnce() + 'static, delay_ms: i64) -> Result<TimerId> {
    set_timeout_with_args(move |_| callback(), delay_ms, Vec::new())
}

pub fn set_timeout_with_args(
    callback: impl FnOnce(&[Value]) + 'static,
    delay_ms: i64,
    args: Vec<Value>,
) -> Result<TimerId> {
    with_current(|hooks| hooks.schedule_timer(delay_ms, Box::new(callback), args))
}

/// A one-shot timer with zero delay.
pub fn set_immediate(callback: impl FnOnce() + 'static) -> Result<TimerId> {
    set_timeout(callback, 0)
}

pub fn set_interval(callback: impl FnMut() + 'static, interval_ms: i64) -> Result<TimerId> {
    let mut callback = callback;
    set_interval_with_args(move |_| callback(), interval_ms, Vec::new())
}

pub fn set_interval_with_args(
    callback: impl FnMut(&[Value]) + 'static,
    interval_ms: i64,
    args: Vec<Value>,
) -> Result<TimerId> {
    with_current(|hooks| hooks.schedule_periodic(interval_ms, Box::new(callback), args))
}

/// Cancel a timer. A no-op when no hooks are installed.
pub fn clear_timeout(timer_id: TimerId) {
    if let Some(hooks) = current() {
        hooks.cancel_timer(timer_id);
    }
}

pub fn clear_interval(timer_id: TimerId) {
    clear_timeout(timer_id);
}
