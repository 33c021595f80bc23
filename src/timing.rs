//! Named phase timing
//!
//! Phases are started and ended by name. Ending a phase that is not running
//! is an error; restarting a running phase resets its start time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// One completed phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub duration_ms: f64,
}

/// Records wall-clock durations of named phases in completion order
#[derive(Debug, Default)]
pub struct PhaseTimer {
    running: HashMap<String, Instant>,
    completed: Vec<PhaseRecord>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, phase: &str) {
        self.running.insert(phase.to_string(), Instant::now());
    }

    /// Stop `phase` and return its duration
    pub fn end(&mut self, phase: &str) -> Result<Duration> {
        let started = self
            .running
            .remove(phase)
            .ok_or_else(|| Error::PhaseNotStarted(phase.to_string()))?;
        let elapsed = started.elapsed();
        debug!(phase, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "phase complete");
        self.completed.push(PhaseRecord {
            name: phase.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
        });
        Ok(elapsed)
    }

    /// Run `f` as phase `phase`
    pub fn time<T>(&mut self, phase: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.start(phase);
        let out = f();
        self.end(phase)?;
        out
    }

    pub fn is_running(&self, phase: &str) -> bool {
        self.running.contains_key(phase)
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.completed
    }

    /// Sum of all completed phase durations, in milliseconds
    pub fn total_ms(&self) -> f64 {
        self.completed.iter().map(|r| r.duration_ms).sum()
    }

    pub fn into_records(self) -> Vec<PhaseRecord> {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_without_start() {
        let mut timer = PhaseTimer::new();
        let err = timer.end("compile").unwrap_err();
        assert!(matches!(err, Error::PhaseNotStarted(ref p) if p == "compile"));
        assert_eq!(err.to_string(), "phase 'compile' was not started");
    }

    #[test]
    fn test_phases_recorded_in_completion_order() {
        let mut timer = PhaseTimer::new();
        timer.start("outer");
        timer.start("inner");
        timer.end("inner").unwrap();
        assert!(timer.is_running("outer"));
        timer.end("outer").unwrap();

        let names: Vec<&str> = timer.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer"]);
        assert!(timer.total_ms() >= 0.0);
    }

    #[test]
    fn test_double_end_fails() {
        let mut timer = PhaseTimer::new();
        timer.start("save");
        timer.end("save").unwrap();
        assert!(timer.end("save").is_err());
    }

    #[test]
    fn test_time_closure_records_failures_too() {
        let mut timer = PhaseTimer::new();
        let res: Result<()> = timer.time("load", || Err(Error::InvalidLayer("x".into())));
        assert!(res.is_err());
        assert_eq!(timer.records().len(), 1);

        let json = serde_json::to_string(timer.records()).unwrap();
        assert!(json.contains("\"name\":\"load\""));
    }
}
