//! # Run Summary
//!
//! Aggregated counts, failures and timings of a finished run, plus the
//! variable scopes as they were when the run ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::VariableList;

/// How the run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    #[default]
    Completed,
    /// Ended early by `stop_on_error` or `stop_on_failure`.
    Stopped,
    Aborted,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Aborted => "aborted",
            RunStatus::TimedOut => "timedOut",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatCount {
    pub total: u64,
    pub failed: u64,
}

impl StatCount {
    pub fn record(&mut self, failed: bool) {
        self.total += 1;
        if failed {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub iterations: StatCount,
    pub items: StatCount,
    pub skipped_items: u64,
    pub requests: StatCount,
    pub prerequest_scripts: StatCount,
    pub test_scripts: StatCount,
    pub assertions: StatCount,
}

/// Response time aggregate in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimings {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureSource {
    Prerequest,
    Request,
    Test,
    Assertion,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    pub source: FailureSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub collection_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: RunStats,
    pub timings: ResponseTimings,
    /// Response bytes received.
    pub transfer_bytes: u64,
    pub failures: Vec<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub environment: VariableList,
    pub globals: VariableList,
    pub collection_variables: VariableList,
    #[serde(skip)]
    response_stats: RunningStats,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, collection_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            collection_name: collection_name.into(),
            status: RunStatus::Completed,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            stats: RunStats::default(),
            timings: ResponseTimings::default(),
            transfer_bytes: 0,
            failures: Vec::new(),
            error: None,
            environment: VariableList::new(),
            globals: VariableList::new(),
            collection_variables: VariableList::new(),
            response_stats: RunningStats::default(),
        }
    }

    pub fn record_response(&mut self, time_ms: u64, bytes: u64) {
        self.response_stats.add(time_ms as f64);
        self.transfer_bytes += bytes;
    }

    pub fn record_failure(&mut self, failure: RunFailure) {
        self.failures.push(failure);
    }

    /// Stamp completion time and freeze the timing aggregate.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.timings = self.response_stats.timings();
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || self.error.is_some()
    }
}

/// Welford accumulator so timings never need the full sample list.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count as f64 - 1.0)).sqrt()
    }

    fn timings(&self) -> ResponseTimings {
        ResponseTimings {
            count: self.count,
            min: self.min,
            max: self.max,
            average: self.mean,
            stddev: self.stddev(),
        }
    }
}
