//! Deterministic virtual-time scheduling for tests.
//!
//! Test code wraps a unit of work in [`Scheduler::run`] (or [`fake_async`]).
//! While the run is active, timers and microtasks scheduled through
//! [`hooks`] or the scheduler handle are captured instead of reaching a real
//! event loop. The test then drives them explicitly:
//!
//! ```
//! use fake_async::{Scheduler, hooks};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let fired = Rc::new(Cell::new(false));
//! let flag = Rc::clone(&fired);
//! Scheduler::new()
//!     .run(|scheduler| {
//!         hooks::set_timeout(move || flag.set(true), 100).unwrap();
//!         scheduler.tick(100).unwrap();
//!     })
//!     .unwrap();
//! assert!(fired.get());
//! ```
#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod scenario;
pub mod scheduler;
pub mod task_queue;

pub use clock::{Clock, VirtualClock};
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use scheduler::{Scheduler, fake_async, try_fake_async};
pub use task_queue::TimerId;
