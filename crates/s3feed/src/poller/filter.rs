//! Filters deciding which listed objects a scan dispatches.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::state::ObjectState;

pub trait ObjectFilter: Send + Sync {
    /// `first_scan` is true only during the first scan of the process.
    fn is_valid(&self, state: &ObjectState, now: DateTime<Utc>, first_scan: bool) -> bool;
}

/// Rejects objects last modified more than `max_age` ago.
#[derive(Debug, Clone)]
pub struct IgnoreOlder {
    max_age: chrono::Duration,
}

impl IgnoreOlder {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age: chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX),
        }
    }
}

impl ObjectFilter for IgnoreOlder {
    fn is_valid(&self, state: &ObjectState, now: DateTime<Utc>, _first_scan: bool) -> bool {
        now.signed_duration_since(state.last_modified) <= self.max_age
    }
}

/// Rejects objects modified before a fixed time, on the first scan only.
#[derive(Debug, Clone)]
pub struct StartTimestamp {
    start: DateTime<Utc>,
}

impl StartTimestamp {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { start }
    }
}

impl ObjectFilter for StartTimestamp {
    fn is_valid(&self, state: &ObjectState, _now: DateTime<Utc>, first_scan: bool) -> bool {
        !first_scan || state.last_modified >= self.start
    }
}

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn ObjectFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl ObjectFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn is_valid(&self, state: &ObjectState, now: DateTime<Utc>, first_scan: bool) -> bool {
        self.filters
            .iter()
            .all(|f| f.is_valid(state, now, first_scan))
    }
}
