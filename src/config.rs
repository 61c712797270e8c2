//! Scheduler configuration.
//!
//! Defaults can be overridden per process through environment variables:
//! - `FAKE_ASYNC_MAX_FLUSH_TURNS`: timer budget for a single `flush` call.
//! - `FAKE_ASYNC_FLUSH_PERIODIC`: whether `flush` also runs periodic timers.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_FLUSH_TURNS: usize = 20;

const MAX_FLUSH_TURNS_ENV: &str = "FAKE_ASYNC_MAX_FLUSH_TURNS";
const FLUSH_PERIODIC_ENV: &str = "FAKE_ASYNC_FLUSH_PERIODIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Maximum number of timers a single `flush` may fire.
    pub max_flush_turns: usize,
    /// When set, `flush` ticks through periodic timers too.
    pub flush_periodic: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_flush_turns: DEFAULT_MAX_FLUSH_TURNS,
            flush_periodic: false,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by any recognised environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_flush_turns: lookup(MAX_FLUSH_TURNS_ENV)
                .as_deref()
                .and_then(parse_turns)
                .unwrap_or(defaults.max_flush_turns),
            flush_periodic: lookup(FLUSH_PERIODIC_ENV)
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(defaults.flush_periodic),
        }
    }

    #[must_use]
    pub const fn with_max_flush_turns(mut self, turns: usize) -> Self {
        self.max_flush_turns = turns;
        self
    }

    #[must_use]
    pub const fn with_flush_periodic(mut self, flush_periodic: bool) -> Self {
        self.flush_periodic = flush_periodic;
        self
    }
}

fn parse_turns(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|turns| *turns > 0)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
