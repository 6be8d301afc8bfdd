//! # Execution History
//!
//! Every HTTP exchange made on behalf of one collection request: the first
//! send, each redirect hop and each authentication round trip.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::http::method::HttpMethod;
use crate::http::request::KeyValue;

/// Maximum number of exchanges retained per request.
const MAX_HISTORY_ENTRIES: usize = 64;

/// Why an exchange was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangeKind {
    Initial,
    Redirect,
    Auth,
}

/// A single exchange recording the request sent and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub kind: ExchangeKind,
    pub method: HttpMethod,
    pub url: String,
    pub request_headers: Vec<KeyValue>,
    pub status: Option<u16>,
    pub duration_ms: u64,
}

/// Exchanges in the order they happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    entries: VecDeque<HistoryEntry>,
    dropped: usize,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Append an entry, evicting the oldest one if the list exceeds the
    /// maximum size.
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= MAX_HISTORY_ENTRIES {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> &VecDeque<HistoryEntry> {
        &self.entries
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries evicted because the history was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn count(&self, kind: ExchangeKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}
